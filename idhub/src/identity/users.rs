use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{public, IdentityService, UserType};
use crate::error::{Error, Result};
use crate::query::{FilterSpec, ListQuery};
use crate::value::Record;

static USERNAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_]+$").unwrap());

const USERNAME_MIN: usize = 4;
const USERNAME_MAX: usize = 20;

/// Fields accepted when registering a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub password: String,
    #[serde(rename = "type")]
    pub user_type: UserType,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl NewUser {
    pub fn new(username: impl Into<String>, password: impl Into<String>, user_type: UserType) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            user_type,
            phone: None,
            email: None,
            description: None,
        }
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Profile fields a user may change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserUpdate {
    pub phone: Option<String>,
    pub email: Option<String>,
    pub description: Option<String>,
}

impl UserUpdate {
    fn into_record(self) -> Record {
        let mut row = Record::new();
        for (column, value) in [
            ("phone", self.phone),
            ("email", self.email),
            ("description", self.description),
        ] {
            if let Some(value) = value {
                row.set(column, value);
            }
        }
        row
    }
}

/// A user row without its password hash, plus role names
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserProfile {
    #[serde(flatten)]
    pub user: Record,
    pub roles: Vec<String>,
}

fn validate_username(username: &str) -> Result<()> {
    let len = username.chars().count();
    if !(USERNAME_MIN..=USERNAME_MAX).contains(&len) {
        return Err(Error::InvalidInput(format!(
            "username must be {} to {} characters",
            USERNAME_MIN, USERNAME_MAX
        )));
    }
    if !USERNAME.is_match(username) {
        return Err(Error::InvalidInput(
            "username must start with a letter and contain only letters, digits and '_'"
                .to_string(),
        ));
    }
    Ok(())
}

impl IdentityService {
    /// Register a user; the password is stored as an Argon2id hash
    pub async fn create_user(&self, user: NewUser) -> Result<Record> {
        validate_username(&user.username)?;
        let hash = self.hasher.hash(&user.password)?;

        let mut row = Record::new()
            .with("username", user.username)
            .with("password", hash)
            .with("type", user.user_type.as_str());
        if let Some(phone) = user.phone {
            row.set("phone", phone);
        }
        if let Some(email) = user.email {
            row.set("email", email);
        }
        if let Some(description) = user.description {
            row.set("description", description);
        }

        self.repos.users.create(row).await.map(public)
    }

    /// User with the names of their roles
    pub async fn get_user(&self, id: i64) -> Result<UserProfile> {
        let user = self.repos.users.get(id).await.map(public)?;
        let roles = self.user_role_names(id).await?;
        Ok(UserProfile { user, roles })
    }

    pub async fn get_user_by_name(&self, username: &str) -> Result<Record> {
        self.repos
            .users
            .get_by_exact_filter(&FilterSpec::new().with("username", username))
            .await
            .map(public)
    }

    pub async fn list_users(&self, query: &ListQuery) -> Result<Vec<Record>> {
        if query.filters.get("password").is_some() {
            return Err(Error::InvalidFilterField("password".to_string()));
        }
        // ordering by the hash would leak it one comparison at a time
        let orders_by_password = query
            .sort_keys
            .iter()
            .flatten()
            .chain(query.window.distinct_on.as_ref())
            .any(|key| key == "password");
        if orders_by_password {
            return Err(Error::InvalidSortKey("users cannot be ordered by password".to_string()));
        }
        let rows = self.repos.users.list(query).await?;
        Ok(rows.into_iter().map(public).collect())
    }

    pub async fn count_users(&self, filters: &FilterSpec) -> Result<u64> {
        if filters.get("password").is_some() {
            return Err(Error::InvalidFilterField("password".to_string()));
        }
        self.repos.users.count(filters).await
    }

    pub async fn update_user(&self, id: i64, update: UserUpdate) -> Result<Record> {
        let changes = update.into_record();
        if changes.is_empty() {
            return Err(Error::InvalidInput("nothing to update".to_string()));
        }
        self.repos.users.update(id, changes).await.map(public)
    }

    /// Replace a password after checking the current one
    pub async fn change_password(&self, id: i64, current: &str, new_password: &str) -> Result<()> {
        let user = self.repos.users.get(id).await?;
        let stored = user.get_str("password").unwrap_or_default();
        if !self.hasher.verify(current, stored)? {
            return Err(Error::IncorrectCredentials);
        }
        let hash = self.hasher.hash(new_password)?;
        self.repos
            .users
            .update(id, Record::new().with("password", hash))
            .await?;
        info!(user_id = id, "Password changed");
        Ok(())
    }

    /// Set the account status, e.g. to lock a user out of sign-in
    pub async fn set_user_status(&self, id: i64, status: &str) -> Result<Record> {
        self.repos
            .users
            .update(id, Record::new().with("status", status))
            .await
            .map(public)
    }

    /// Soft-delete a user
    pub async fn delete_user(&self, id: i64) -> Result<()> {
        self.repos.users.delete(id, true).await?;
        Ok(())
    }

    /// Stamp the last sign-in time
    pub async fn record_login(&self, id: i64) -> Result<()> {
        self.repos
            .users
            .update(id, Record::new().with("last_login_time", Utc::now()))
            .await?;
        Ok(())
    }
}
