//! Generic CRUD over one resource schema
//!
//! [`ResourceRepository`] validates field mappings against its schema,
//! composes the query pipeline for reads and calls the row store directly
//! for writes. Storage failures leave here as domain errors: unique
//! violations become [`Error::AlreadyExists`], foreign-key violations
//! [`Error::ReferenceFailure`], everything else [`Error::Internal`].
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use idhub::query::{FilterSpec, ListQuery};
//! use idhub::repository::{DeleteTarget, ResourceRepository};
//! use idhub::schema::{ResourceKind, SchemaRegistry};
//! use idhub::store::MemoryStore;
//! use idhub::value::Record;
//!
//! # async fn example() -> idhub::Result<()> {
//! let registry = Arc::new(SchemaRegistry::builtin()?);
//! let store = Arc::new(MemoryStore::new(registry.clone()));
//! let roles = ResourceRepository::new(ResourceKind::Role, registry, store)?;
//!
//! let admin = roles.create(Record::new().with("name", "admin")).await?;
//! let found = roles
//!     .get_by_exact_filter(&FilterSpec::new().with("name", "admin"))
//!     .await?;
//! assert_eq!(found.id(), admin.id());
//!
//! let listed = roles.list(&ListQuery::default()).await?;
//! assert_eq!(listed.len(), 1);
//!
//! roles.delete(DeleteTarget::Id(found.id().unwrap_or_default()), true).await?;
//! assert!(roles.get_by_exact_filter(&FilterSpec::new().with("name", "admin")).await.is_err());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::query::{
    visibility_clause, DeletedMode, Execution, FilterCompiler, FilterSpec, ListQuery, MatchClause,
    PageWindow, PaginatedQueryExecutor, Predicate, SortDirection, SortNormalizer, SortSpec,
};
use crate::schema::{
    ResourceKind, ResourceSchema, SchemaRegistry, DELETED_AT_COLUMN, DELETED_COLUMN,
};
use crate::store::{RowStore, StoreOperation};
use crate::value::{ColumnType, Record, Value};

/// Columns maintained by the repository, never accepted from callers
const MANAGED_COLUMNS: [&str; 5] = [
    "id",
    "created_at",
    "updated_at",
    DELETED_COLUMN,
    DELETED_AT_COLUMN,
];

/// Rows a delete applies to
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteTarget {
    Id(i64),
    /// Every row matching these exact-match filters
    Filter(FilterSpec),
}

impl From<i64> for DeleteTarget {
    fn from(id: i64) -> Self {
        Self::Id(id)
    }
}

impl From<FilterSpec> for DeleteTarget {
    fn from(filters: FilterSpec) -> Self {
        Self::Filter(filters)
    }
}

/// CRUD operations for one resource kind
#[derive(Clone)]
pub struct ResourceRepository {
    schema: Arc<ResourceSchema>,
    store: Arc<dyn RowStore>,
    executor: PaginatedQueryExecutor,
}

impl ResourceRepository {
    pub fn new(
        kind: ResourceKind,
        registry: Arc<SchemaRegistry>,
        store: Arc<dyn RowStore>,
    ) -> Result<Self> {
        let schema = registry.get(kind)?;
        Ok(Self {
            schema,
            executor: PaginatedQueryExecutor::new(store.clone(), registry),
            store,
        })
    }

    pub fn schema(&self) -> &ResourceSchema {
        &self.schema
    }

    pub fn kind(&self) -> ResourceKind {
        self.schema.kind
    }

    /// Insert a row built from caller-supplied fields
    pub async fn create(&self, values: Record) -> Result<Record> {
        let mut row = self.prepare(values, true)?;
        row.set("created_at", Utc::now());

        let created = self
            .store
            .insert(&self.schema, row)
            .await
            .map_err(|e| self.translate(e.during(StoreOperation::Insert)))?;
        info!(resource = %self.schema.kind, id = ?created.id(), "Created");
        Ok(created)
    }

    /// The visible row with the lowest id matching every filter exactly
    pub async fn get_by_exact_filter(&self, filters: &FilterSpec) -> Result<Record> {
        self.find_one(filters, self.default_visibility()).await
    }

    pub async fn get(&self, id: i64) -> Result<Record> {
        self.get_by_exact_filter(&FilterSpec::new().with("id", id))
            .await
    }

    /// Like [`Self::get_by_exact_filter`] under an explicit visibility mode
    pub async fn find_one(&self, filters: &FilterSpec, read_deleted: DeletedMode) -> Result<Record> {
        let predicate = FilterCompiler::new(&self.schema).compile_exact(filters)?;
        let window = PageWindow {
            limit: Some(1),
            ..PageWindow::default()
        };
        let rows = self
            .executor
            .fetch(Execution {
                schema: &self.schema,
                predicate,
                sort: SortSpec::new([("id", SortDirection::Asc)]),
                window: &window,
                read_deleted,
                eager: &[],
                count_only: false,
            })
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(self.schema.kind.to_string()))
    }

    /// Filtered, sorted, paginated listing
    pub async fn list(&self, query: &ListQuery) -> Result<Vec<Record>> {
        let (predicate, sort) = self.compile(query)?;
        self.executor
            .fetch(Execution {
                schema: &self.schema,
                predicate,
                sort,
                window: &query.window,
                read_deleted: query.read_deleted,
                eager: &query.eager,
                count_only: false,
            })
            .await
    }

    /// Number of visible rows matching `filters`
    pub async fn count(&self, filters: &FilterSpec) -> Result<u64> {
        self.count_matching(&ListQuery::new(filters.clone()).with_deleted(self.default_visibility()))
            .await
    }

    /// Number of rows a list request would return
    pub async fn count_matching(&self, query: &ListQuery) -> Result<u64> {
        let (predicate, sort) = self.compile(query)?;
        self.executor
            .count(Execution {
                schema: &self.schema,
                predicate,
                sort,
                window: &query.window,
                read_deleted: query.read_deleted,
                eager: &[],
                count_only: true,
            })
            .await
    }

    /// Merge `values` into a visible row
    ///
    /// The read and the write are separate statements; concurrent updates
    /// to one row resolve last-write-wins per field.
    pub async fn update(&self, id: i64, values: Record) -> Result<Record> {
        let mut changes = self.prepare(values, false)?;
        self.get(id).await?;
        changes.set("updated_at", Utc::now());

        let updated = self
            .store
            .update(&self.schema, id, changes)
            .await
            .map_err(|e| self.translate(e.during(StoreOperation::Update)))?
            .ok_or_else(|| Error::NotFound(self.schema.kind.to_string()))?;
        info!(resource = %self.schema.kind, id, "Updated");
        Ok(updated)
    }

    /// Soft- or hard-delete rows; returns rows affected
    ///
    /// Soft deletion only touches visible rows, so repeating it fails with
    /// [`Error::NotFound`]. Hard deletion applies to every matching row and
    /// fails with [`Error::ReferenceFailure`] when another row still points
    /// at one of them.
    pub async fn delete(&self, target: impl Into<DeleteTarget>, soft: bool) -> Result<u64> {
        let mut predicate = match target.into() {
            DeleteTarget::Id(id) => Predicate::all().and(MatchClause::Exact {
                field: "id".into(),
                value: Value::Int(id),
            }),
            DeleteTarget::Filter(filters) => {
                FilterCompiler::new(&self.schema).compile_exact(&filters)?
            }
        };

        let affected = if soft {
            if !self.schema.soft_delete {
                return Err(Error::Configuration(format!(
                    "{} cannot be soft-deleted",
                    self.schema.table
                )));
            }
            if let Some(clause) = visibility_clause(&self.schema, DeletedMode::No)? {
                predicate.push(clause);
            }
            self.store
                .soft_delete(&self.schema, &predicate)
                .await
                .map_err(|e| self.translate(e.during(StoreOperation::SoftDelete)))?
        } else {
            self.store
                .delete(&self.schema, &predicate)
                .await
                .map_err(|e| self.translate(e.during(StoreOperation::Delete)))?
        };

        if affected == 0 {
            return Err(Error::NotFound(self.schema.kind.to_string()));
        }
        info!(resource = %self.schema.kind, affected, soft, "Deleted");
        Ok(affected)
    }

    fn default_visibility(&self) -> DeletedMode {
        if self.schema.soft_delete {
            DeletedMode::No
        } else {
            DeletedMode::Yes
        }
    }

    fn compile(&self, query: &ListQuery) -> Result<(Predicate, SortSpec)> {
        let predicate = FilterCompiler::new(&self.schema).compile(&query.filters)?;
        let sort = SortNormalizer::new(&self.schema.default_sort_keys, self.schema.default_sort_dir)
            .normalize(query.sort_keys.as_deref(), query.sort_dirs.as_deref())?;
        debug!(
            resource = %self.schema.kind,
            clauses = predicate.clauses().len(),
            sort = ?sort.keys(),
            "Compiled list request"
        );
        Ok((predicate, sort))
    }

    fn translate(&self, err: crate::store::StoreError) -> Error {
        Error::from(err.with_table(self.schema.kind.to_string()))
    }

    /// Validate caller fields and coerce them to column types
    fn prepare(&self, values: Record, creating: bool) -> Result<Record> {
        let mut row = Record::new();
        for (name, value) in values.columns() {
            if MANAGED_COLUMNS.contains(&name) {
                return Err(Error::InvalidInput(format!("'{}' cannot be set", name)));
            }
            let column = self.schema.get_column(name).ok_or_else(|| {
                Error::InvalidInput(format!("{} has no field '{}'", self.schema.kind, name))
            })?;

            if value.is_null() {
                if !column.nullable {
                    return Err(Error::InvalidInput(format!("'{}' is required", name)));
                }
                row.set(name, Value::Null);
                continue;
            }

            let coerced = value.coerce(column.ty).ok_or_else(|| {
                Error::InvalidInput(format!("'{}' is not a valid {}", name, column.ty))
            })?;
            if let (ColumnType::Text, Some(max), Some(text)) =
                (column.ty, column.max_len, coerced.as_str())
            {
                if text.chars().count() > max {
                    return Err(Error::InvalidInput(format!(
                        "'{}' exceeds {} characters",
                        name, max
                    )));
                }
            }
            row.set(name, coerced);
        }

        if creating {
            let missing = self.schema.columns.iter().find(|c| {
                !c.nullable
                    && c.default.is_none()
                    && !MANAGED_COLUMNS.contains(&c.name)
                    && !row.contains(c.name)
            });
            if let Some(column) = missing {
                return Err(Error::InvalidInput(format!("'{}' is required", column.name)));
            }
        }
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;
    use crate::store::MemoryStore;

    struct Fixture {
        users: ResourceRepository,
        roles: ResourceRepository,
        user_roles: ResourceRepository,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(SchemaRegistry::builtin().unwrap());
        let store: Arc<dyn RowStore> = Arc::new(MemoryStore::new(registry.clone()));
        let repo = |kind| ResourceRepository::new(kind, registry.clone(), store.clone()).unwrap();
        Fixture {
            users: repo(ResourceKind::User),
            roles: repo(ResourceKind::Role),
            user_roles: repo(ResourceKind::UserRole),
        }
    }

    fn user(name: &str) -> Record {
        Record::new()
            .with("username", name)
            .with("password", "hash")
            .with("type", "p2p")
    }

    #[tokio::test]
    async fn test_create_applies_defaults() {
        let f = fixture();
        let alice = f.users.create(user("alice01")).await.unwrap();
        assert_eq!(alice.get_str("status"), Some("ACTIVE"));
        assert_eq!(alice.get_i64("privilege"), Some(9));
        assert_eq!(alice.get_i64("deleted"), Some(0));
        assert!(alice.get_timestamp("created_at").is_some());
    }

    #[tokio::test]
    async fn test_create_validates_fields() {
        let f = fixture();
        assert!(matches!(
            f.users.create(user("alice01").with("shoe_size", 9)).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            f.users.create(user("alice01").with("id", 3)).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            f.users
                .create(Record::new().with("username", "bob01").with("type", "p2p"))
                .await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            f.users.create(user("abcdefghijklmnopqrstuvwxyz")).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            f.users.create(user("carol1").with("privilege", "high")).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_is_already_exists() {
        let f = fixture();
        f.users.create(user("alice01")).await.unwrap();
        assert!(matches!(
            f.users.create(user("alice01")).await,
            Err(Error::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_name_reusable_after_soft_delete() {
        let f = fixture();
        let first = f.users.create(user("alice01")).await.unwrap();
        f.users.delete(first.id().unwrap(), true).await.unwrap();
        let second = f.users.create(user("alice01")).await.unwrap();
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test]
    async fn test_get_by_exact_filter() {
        let f = fixture();
        let a = f.users.create(user("alice01")).await.unwrap();
        f.users.create(user("bob01")).await.unwrap();

        let found = f
            .users
            .get_by_exact_filter(&FilterSpec::new().with("type", "p2p"))
            .await
            .unwrap();
        assert_eq!(found.id(), a.id());

        assert!(matches!(
            f.users
                .get_by_exact_filter(&FilterSpec::new().with("username", "nobody"))
                .await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            f.users
                .get_by_exact_filter(&FilterSpec::new().with("shoe_size", 1))
                .await,
            Err(Error::InvalidFilterField(_))
        ));
    }

    #[tokio::test]
    async fn test_list_and_count() {
        let f = fixture();
        for name in ["alice01", "bob01", "carol01"] {
            f.users.create(user(name)).await.unwrap();
        }
        f.users
            .create(user("dave01").with("type", "bank"))
            .await
            .unwrap();

        let query = ListQuery::new(FilterSpec::new().with("type", "p2p"))
            .with_sort(["username"], ["desc"]);
        let rows = f.users.list(&query).await.unwrap();
        let names: Vec<_> = rows.iter().filter_map(|r| r.get_str("username")).collect();
        assert_eq!(names, ["carol01", "bob01", "alice01"]);

        assert_eq!(
            f.users.count(&FilterSpec::new().with("type", "p2p")).await.unwrap(),
            3
        );
        assert_eq!(f.users.count(&FilterSpec::new()).await.unwrap(), 4);
        assert_eq!(
            f.users
                .count_matching(&ListQuery::default().with_limit(2))
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_list_rejects_bad_sort() {
        let f = fixture();
        assert!(matches!(
            f.users
                .list(&ListQuery::default().with_sort(["username"], ["up"]))
                .await,
            Err(Error::InvalidSortDirection(_))
        ));
        assert!(matches!(
            f.users
                .list(&ListQuery::default().with_sort(["height"], ["asc"]))
                .await,
            Err(Error::InvalidSortKey(_))
        ));
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let f = fixture();
        let alice = f
            .users
            .create(user("alice01").with("email", "a@example.com"))
            .await
            .unwrap();
        let id = alice.id().unwrap();

        let updated = f
            .users
            .update(id, Record::new().with("description", "ops"))
            .await
            .unwrap();
        assert_eq!(updated.get_str("description"), Some("ops"));
        assert_eq!(updated.get_str("email"), Some("a@example.com"));
        assert!(updated.get_timestamp("updated_at").is_some());

        assert!(matches!(
            f.users.update(999, Record::new().with("description", "x")).await,
            Err(Error::NotFound(_))
        ));
        f.users.delete(id, true).await.unwrap();
        assert!(matches!(
            f.users.update(id, Record::new().with("description", "x")).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_soft_delete_is_not_idempotent() {
        let f = fixture();
        let alice = f.users.create(user("alice01")).await.unwrap();
        let id = alice.id().unwrap();

        assert_eq!(f.users.delete(id, true).await.unwrap(), 1);
        assert!(matches!(f.users.get(id).await, Err(Error::NotFound(_))));
        assert!(matches!(
            f.users.delete(id, true).await,
            Err(Error::NotFound(_))
        ));

        let deleted = f
            .users
            .find_one(&FilterSpec::new().with("id", id), DeletedMode::Only)
            .await
            .unwrap();
        assert_eq!(deleted.get_i64("deleted"), Some(id));
        assert!(deleted.get_timestamp("deleted_at").is_some());
    }

    #[tokio::test]
    async fn test_hard_delete_blocked_by_reference() {
        let f = fixture();
        let alice = f.users.create(user("alice01")).await.unwrap();
        let admin = f
            .roles
            .create(Record::new().with("name", "admin"))
            .await
            .unwrap();
        f.user_roles
            .create(
                Record::new()
                    .with("user_id", alice.id().unwrap())
                    .with("role_id", admin.id().unwrap()),
            )
            .await
            .unwrap();

        assert!(matches!(
            f.roles.delete(admin.id().unwrap(), false).await,
            Err(Error::ReferenceFailure(_))
        ));

        let removed = f
            .user_roles
            .delete(FilterSpec::new().with("role_id", admin.id().unwrap()), false)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(f.roles.delete(admin.id().unwrap(), false).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_reference_on_create() {
        let f = fixture();
        assert!(matches!(
            f.user_roles
                .create(Record::new().with("user_id", 41).with("role_id", 42))
                .await,
            Err(Error::ReferenceFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_soft_delete_without_marker_is_configuration_error() {
        let mut registry = SchemaRegistry::empty();
        registry
            .register(
                ResourceSchema::new(ResourceKind::Role, "plain_roles")
                    .column(Column::required("name", ColumnType::Text)),
            )
            .unwrap();
        let registry = Arc::new(registry);
        let store = Arc::new(MemoryStore::new(registry.clone()));
        let roles = ResourceRepository::new(ResourceKind::Role, registry, store).unwrap();

        let row = roles
            .create(Record::new().with("name", "admin"))
            .await
            .unwrap();
        assert!(matches!(
            roles.delete(row.id().unwrap(), true).await,
            Err(Error::Configuration(_))
        ));
        assert_eq!(roles.count(&FilterSpec::new()).await.unwrap(), 1);
        assert_eq!(roles.delete(row.id().unwrap(), false).await.unwrap(), 1);
    }
}
