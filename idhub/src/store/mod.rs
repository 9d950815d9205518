//! Constraint-checked row storage
//!
//! [`RowStore`] is the seam between the repositories and a relational
//! backend. Stores enforce unique and foreign-key constraints, apply column
//! defaults, and execute [`QueryPlan`]s; they know nothing about filter
//! classification or domain errors.

mod error;
mod memory;
#[cfg(feature = "database")]
mod postgres;

use async_trait::async_trait;

use crate::query::{Predicate, QueryPlan};
use crate::schema::ResourceSchema;
use crate::value::Record;

pub use error::{sanitize_url, StoreError, StoreErrorKind, StoreOperation};
pub use memory::MemoryStore;
#[cfg(feature = "database")]
pub use postgres::PgStore;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Row storage backend
///
/// Implementations must be cheap to share behind an `Arc`; every call
/// borrows a pooled connection for its own duration only.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Insert a row and return it as stored, including its assigned id
    async fn insert(&self, schema: &ResourceSchema, row: Record) -> StoreResult<Record>;

    /// Rows matching a plan, in plan order
    async fn select(&self, schema: &ResourceSchema, plan: &QueryPlan) -> StoreResult<Vec<Record>>;

    /// Number of rows a plan would return
    async fn count(&self, schema: &ResourceSchema, plan: &QueryPlan) -> StoreResult<u64>;

    /// Overwrite the given columns of one row; `None` if the id is absent
    async fn update(
        &self,
        schema: &ResourceSchema,
        id: i64,
        row: Record,
    ) -> StoreResult<Option<Record>>;

    /// Set the deletion marker on matching rows; returns rows affected
    async fn soft_delete(&self, schema: &ResourceSchema, predicate: &Predicate) -> StoreResult<u64>;

    /// Remove matching rows; returns rows affected
    async fn delete(&self, schema: &ResourceSchema, predicate: &Predicate) -> StoreResult<u64>;

    /// Short backend name for logs
    fn backend(&self) -> &'static str;
}
