//! Users, groups, roles and sign-in
//!
//! [`IdentityService`] is the façade request handlers call. It validates
//! identity-specific rules (username shape, user type, password policy),
//! hashes passwords, resolves role names, and delegates storage to one
//! [`ResourceRepository`] per resource kind and sessions to a
//! [`TokenStore`]. Password hashes never leave this module.

mod groups;
mod login;
mod password;
mod roles;
mod users;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::repository::ResourceRepository;
use crate::schema::{ResourceKind, SchemaRegistry, DELETED_COLUMN, VISIBLE_SENTINEL};
use crate::session::TokenStore;
use crate::store::RowStore;
use crate::value::Record;

pub use groups::{GroupUpdate, NewGroup};
pub use login::{LastLoginRecorder, LoginOutcome};
pub use password::PasswordHasher;
pub use users::{NewUser, UserProfile, UserUpdate};

/// Status a user must hold to sign in
pub const ACTIVE_STATUS: &str = "ACTIVE";

/// Kind of account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    P2p,
    Bank,
    Supervisor,
}

impl UserType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::P2p => "p2p",
            Self::Bank => "bank",
            Self::Supervisor => "supervisor",
        }
    }
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "p2p" => Ok(Self::P2p),
            "bank" => Ok(Self::Bank),
            "supervisor" => Ok(Self::Supervisor),
            other => Err(Error::InvalidInput(format!("unknown user type '{}'", other))),
        }
    }
}

/// One repository per resource kind over a shared store
#[derive(Clone)]
pub struct Repositories {
    pub users: ResourceRepository,
    pub groups: ResourceRepository,
    pub roles: ResourceRepository,
    pub user_roles: ResourceRepository,
    pub group_users: ResourceRepository,
}

impl Repositories {
    pub fn new(registry: Arc<SchemaRegistry>, store: Arc<dyn RowStore>) -> Result<Self> {
        let repo = |kind| ResourceRepository::new(kind, registry.clone(), store.clone());
        Ok(Self {
            users: repo(ResourceKind::User)?,
            groups: repo(ResourceKind::Group)?,
            roles: repo(ResourceKind::Role)?,
            user_roles: repo(ResourceKind::UserRole)?,
            group_users: repo(ResourceKind::GroupUser)?,
        })
    }
}

/// Identity administration and session façade
#[derive(Clone)]
pub struct IdentityService {
    repos: Repositories,
    hasher: PasswordHasher,
    tokens: TokenStore,
}

impl IdentityService {
    pub fn new(repos: Repositories, hasher: PasswordHasher, tokens: TokenStore) -> Self {
        Self {
            repos,
            hasher,
            tokens,
        }
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }
}

/// Strip the password hash from a user row
fn public(mut row: Record) -> Record {
    row.remove("password");
    row
}

/// Related row attached by eager loading, if it is still visible
fn visible_related<'a>(row: &'a Record, relation: &str) -> Option<&'a Record> {
    row.related(relation)
        .filter(|r| r.get_i64(DELETED_COLUMN) == Some(VISIBLE_SENTINEL))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::cache::{CacheNamespace, MemoryCache};
    use crate::config::PasswordConfig;
    use crate::store::MemoryStore;
    use std::time::Duration;

    /// Service over in-process backends with cheap hashing
    pub(crate) fn service() -> IdentityService {
        let registry = Arc::new(SchemaRegistry::builtin().unwrap());
        let store: Arc<dyn RowStore> = Arc::new(MemoryStore::new(registry.clone()));
        let repos = Repositories::new(registry, store).unwrap();
        let tokens = TokenStore::new(
            Arc::new(MemoryCache::new()),
            CacheNamespace::new("IdHub.UserTokenKey", Duration::from_secs(600)),
        )
        .with_activity_recorder(Arc::new(LastLoginRecorder::new(repos.users.clone())));
        let hasher = PasswordHasher::new(&PasswordConfig {
            memory_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
            min_length: 8,
        })
        .unwrap();
        IdentityService::new(repos, hasher, tokens)
    }

    pub(crate) fn alice() -> NewUser {
        NewUser::new("alice01", "s3cret-pass", UserType::P2p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_type_parse() {
        assert_eq!("bank".parse::<UserType>().unwrap(), UserType::Bank);
        assert_eq!(UserType::Supervisor.to_string(), "supervisor");
        assert!(matches!(
            "admin".parse::<UserType>(),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_public_strips_password() {
        let row = Record::new().with("username", "alice01").with("password", "hash");
        let row = public(row);
        assert!(!row.contains("password"));
        assert_eq!(row.get_str("username"), Some("alice01"));
    }
}
