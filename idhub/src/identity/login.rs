use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use super::{IdentityService, ACTIVE_STATUS};
use crate::error::{Error, Result};
use crate::query::FilterSpec;
use crate::repository::ResourceRepository;
use crate::session::{ActivityRecorder, SessionPayload};
use crate::value::Record;

/// Result of a successful sign-in
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoginOutcome {
    pub token: String,
    #[serde(flatten)]
    pub payload: SessionPayload,
}

/// Stamps `last_login_time` whenever a session is created
#[derive(Clone)]
pub struct LastLoginRecorder {
    users: ResourceRepository,
}

impl LastLoginRecorder {
    pub fn new(users: ResourceRepository) -> Self {
        Self { users }
    }
}

#[async_trait]
impl ActivityRecorder for LastLoginRecorder {
    async fn record_activity(&self, user_id: i64) -> Result<()> {
        self.users
            .update(user_id, Record::new().with("last_login_time", Utc::now()))
            .await?;
        Ok(())
    }
}

impl IdentityService {
    /// Verify credentials and open a session
    ///
    /// Unknown users and wrong passwords both fail with
    /// [`Error::IncorrectCredentials`]; a user whose status is not
    /// `ACTIVE` fails with [`Error::PermissionDenied`].
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginOutcome> {
        let user = match self
            .repos
            .users
            .get_by_exact_filter(&FilterSpec::new().with("username", username))
            .await
        {
            Ok(user) => user,
            Err(Error::NotFound(_)) => {
                warn!(username, "Login for unknown user");
                return Err(Error::IncorrectCredentials);
            }
            Err(e) => return Err(e),
        };
        let id = user
            .id()
            .ok_or_else(|| Error::Internal("user row without id".to_string()))?;

        let status = user.get_str("status").unwrap_or_default();
        if status != ACTIVE_STATUS {
            warn!(user_id = id, status, "Login for inactive user");
            return Err(Error::PermissionDenied(format!("{} is {}", username, status)));
        }

        if !self
            .hasher
            .verify(password, user.get_str("password").unwrap_or_default())?
        {
            warn!(user_id = id, "Login with wrong password");
            return Err(Error::IncorrectCredentials);
        }

        let roles = self.user_role_names(id).await?;
        let mut payload = SessionPayload::new(id, username, user.get_str("type").unwrap_or_default())
            .with_roles(roles);
        if let Some(email) = user.get_str("email") {
            payload = payload.with_email(email);
        }
        if let Some(description) = user.get_str("description") {
            payload = payload.with_description(description);
        }

        let token = self.tokens.create(&payload).await?;
        info!(user_id = id, "Login succeeded");
        Ok(LoginOutcome { token, payload })
    }

    /// Session behind a token, extending its lifetime
    pub async fn check(&self, token: &str) -> Result<SessionPayload> {
        self.tokens.check(token).await
    }

    pub async fn logout(&self, token: &str) -> Result<()> {
        self.tokens.revoke(token).await?;
        Ok(())
    }

    /// Session behind a token if it holds any of `roles`
    pub async fn authorize<S: AsRef<str>>(&self, token: &str, roles: &[S]) -> Result<SessionPayload> {
        let payload = self.tokens.check(token).await?;
        payload.require_any_role(roles)?;
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::testing::{alice, service};

    #[tokio::test]
    async fn test_login_check_logout() {
        let svc = service();
        let id = svc
            .create_user(alice().with_email("alice@example.com"))
            .await
            .unwrap()
            .id()
            .unwrap();
        svc.create_role("admin", None).await.unwrap();
        svc.grant_role(id, "admin").await.unwrap();

        let outcome = svc.login("alice01", "s3cret-pass").await.unwrap();
        assert_eq!(outcome.token.len(), 32);
        assert_eq!(outcome.payload.id, id);
        assert_eq!(outcome.payload.user_type, "p2p");
        assert_eq!(outcome.payload.roles, ["admin"]);
        assert_eq!(outcome.payload.email.as_deref(), Some("alice@example.com"));

        let user = svc.repositories().users.get(id).await.unwrap();
        assert!(user.get_timestamp("last_login_time").is_some());

        assert_eq!(svc.check(&outcome.token).await.unwrap(), outcome.payload);
        svc.authorize(&outcome.token, &["admin"]).await.unwrap();
        assert!(matches!(
            svc.authorize(&outcome.token, &["auditor"]).await,
            Err(Error::PermissionDenied(_))
        ));

        svc.logout(&outcome.token).await.unwrap();
        assert!(matches!(svc.check(&outcome.token).await, Err(Error::Expired)));
        assert!(matches!(svc.logout(&outcome.token).await, Err(Error::Expired)));
    }

    #[tokio::test]
    async fn test_login_rejections() {
        let svc = service();
        let id = svc.create_user(alice()).await.unwrap().id().unwrap();

        assert!(matches!(
            svc.login("nobody", "s3cret-pass").await,
            Err(Error::IncorrectCredentials)
        ));
        assert!(matches!(
            svc.login("alice01", "wrong-pass").await,
            Err(Error::IncorrectCredentials)
        ));

        svc.set_user_status(id, "LOCKED").await.unwrap();
        assert!(matches!(
            svc.login("alice01", "s3cret-pass").await,
            Err(Error::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_deleted_user_cannot_login() {
        let svc = service();
        let id = svc.create_user(alice()).await.unwrap().id().unwrap();
        svc.delete_user(id).await.unwrap();
        assert!(matches!(
            svc.login("alice01", "s3cret-pass").await,
            Err(Error::IncorrectCredentials)
        ));
    }
}
