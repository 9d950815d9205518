//! # idhub
//!
//! Identity and access administration backend: users, groups, roles and
//! their memberships over a soft-delete aware row store, with a generic
//! filtered and paginated query engine and sliding-expiry session tokens.
//!
//! ## Features
//!
//! - **Query engine**: exact, membership, comparison and regex filters, multi-key
//!   sorting, offset or keyset pagination, `DISTINCT ON`, eager relations
//! - **Soft delete**: unique constraints stay valid across deleted rows
//! - **Sessions**: opaque tokens in a TTL cache, renewed on every check
//! - **Backends**: PostgreSQL (`database`) and Redis (`cache`), with in-process
//!   fallbacks for single-node deployments and tests
//!
//! ## Example
//!
//! ```rust,no_run
//! use idhub::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!
//!     let state = AppState::builder().config(config).build().await?;
//!     let identity = state.identity();
//!
//!     let user = identity
//!         .create_user(NewUser::new("alice01", "s3cret-pass", UserType::P2p))
//!         .await?;
//!     let session = identity.login("alice01", "s3cret-pass").await?;
//!     assert_eq!(identity.check(&session.token).await?.id, user.id().unwrap_or_default());
//!
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod identity;
pub mod observability;
pub mod query;
pub mod repository;
pub mod schema;
pub mod session;
pub mod state;
pub mod store;
pub mod value;

#[cfg(feature = "database")]
pub mod database;

pub use error::{Error, ErrorKind, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::{CacheBackend, CacheNamespace, MemoryCache};
    #[cfg(feature = "cache")]
    pub use crate::cache::RedisCache;
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorKind, ErrorResponse, Result};
    pub use crate::identity::{
        GroupUpdate, IdentityService, LoginOutcome, NewGroup, NewUser, UserProfile, UserType,
        UserUpdate,
    };
    pub use crate::observability::init_tracing;
    pub use crate::query::{
        ComparisonOp, DeletedMode, FilterSpec, FilterValue, ListQuery, Marker, SortDirection,
    };
    pub use crate::repository::{DeleteTarget, ResourceRepository};
    pub use crate::schema::{ResourceKind, SchemaRegistry};
    pub use crate::session::{SessionPayload, TokenStore};
    pub use crate::state::{AppState, AppStateBuilder};
    pub use crate::store::{MemoryStore, RowStore};
    #[cfg(feature = "database")]
    pub use crate::store::PgStore;
    pub use crate::value::{Record, Value};
}
