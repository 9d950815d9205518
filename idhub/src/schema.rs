//! Resource schemas and the typed registry that resolves them
//!
//! Each [`ResourceKind`] maps to a [`ResourceSchema`] describing its table,
//! columns, constraints, filter classification and default ordering. The
//! registry is built once at startup and shared; nothing downstream looks a
//! schema up by name.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::query::SortDirection;
use crate::value::{ColumnType, Value};

/// Column holding the soft-delete marker
pub const DELETED_COLUMN: &str = "deleted";

/// Column holding the soft-delete timestamp
pub const DELETED_AT_COLUMN: &str = "deleted_at";

/// Marker value of a visible row
pub const VISIBLE_SENTINEL: i64 = 0;

/// Enumerated resource kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    User,
    Group,
    Role,
    UserRole,
    GroupUser,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        Self::User,
        Self::Group,
        Self::Role,
        Self::UserRole,
        Self::GroupUser,
    ];

    /// Built-in schema for this kind
    pub fn builtin_schema(self) -> ResourceSchema {
        match self {
            Self::User => users_schema(),
            Self::Group => groups_schema(),
            Self::Role => roles_schema(),
            Self::UserRole => user_roles_schema(),
            Self::GroupUser => group_users_schema(),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Group => write!(f, "group"),
            Self::Role => write!(f, "role"),
            Self::UserRole => write!(f, "user_role"),
            Self::GroupUser => write!(f, "group_user"),
        }
    }
}

/// Column default applied on insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnDefault {
    Int(i64),
    Text(&'static str),
}

impl From<ColumnDefault> for Value {
    fn from(default: ColumnDefault) -> Self {
        match default {
            ColumnDefault::Int(v) => Value::Int(v),
            ColumnDefault::Text(s) => Value::from(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
    pub default: Option<ColumnDefault>,
    /// Maximum text length, if bounded
    pub max_len: Option<usize>,
}

impl Column {
    pub const fn required(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: false,
            default: None,
            max_len: None,
        }
    }

    pub const fn optional(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: true,
            default: None,
            max_len: None,
        }
    }

    pub fn with_default(mut self, default: ColumnDefault) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }
}

/// Action taken on referencing rows when a referenced row is hard-deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
    Restrict,
    Cascade,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: &'static str,
    pub references: ResourceKind,
    /// Name the referenced row is attached under when eagerly loaded
    pub relation: &'static str,
    pub on_delete: OnDelete,
}

/// How filter keys are compiled for a resource
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterKeys {
    pub exact: Vec<&'static str>,
    pub comparison: Vec<&'static str>,
    pub regex_or: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSchema {
    pub kind: ResourceKind,
    pub table: &'static str,
    pub columns: Vec<Column>,
    /// Whether the table carries the `deleted` / `deleted_at` marker columns
    pub soft_delete: bool,
    pub unique_constraints: Vec<Vec<&'static str>>,
    pub foreign_keys: Vec<ForeignKey>,
    pub filter_keys: FilterKeys,
    pub default_sort_keys: Vec<&'static str>,
    pub default_sort_dir: SortDirection,
}

impl ResourceSchema {
    /// A schema with the standard id and timestamp columns
    pub fn new(kind: ResourceKind, table: &'static str) -> Self {
        Self {
            kind,
            table,
            columns: vec![
                Column::required("id", ColumnType::Integer),
                Column::required("created_at", ColumnType::Timestamp),
                Column::optional("updated_at", ColumnType::Timestamp),
            ],
            soft_delete: false,
            unique_constraints: Vec::new(),
            foreign_keys: Vec::new(),
            filter_keys: FilterKeys::default(),
            default_sort_keys: vec!["created_at", "id"],
            default_sort_dir: SortDirection::Desc,
        }
    }

    /// Add the soft-delete marker columns
    pub fn soft_deletable(mut self) -> Self {
        self.columns.push(Column::optional(DELETED_AT_COLUMN, ColumnType::Timestamp));
        self.columns.push(
            Column::required(DELETED_COLUMN, ColumnType::Integer)
                .with_default(ColumnDefault::Int(VISIBLE_SENTINEL)),
        );
        self.soft_delete = true;
        self
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn unique(mut self, columns: &[&'static str]) -> Self {
        self.unique_constraints.push(columns.to_vec());
        self
    }

    pub fn foreign_key(
        mut self,
        column: &'static str,
        references: ResourceKind,
        relation: &'static str,
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            column,
            references,
            relation,
            on_delete: OnDelete::Restrict,
        });
        self
    }

    pub fn filters(
        mut self,
        exact: &[&'static str],
        comparison: &[&'static str],
        regex_or: &[&'static str],
    ) -> Self {
        self.filter_keys = FilterKeys {
            exact: exact.to_vec(),
            comparison: comparison.to_vec(),
            regex_or: regex_or.to_vec(),
        };
        self
    }

    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.get_column(name).is_some()
    }

    /// Column lookup that reports an unknown field
    pub fn require_column(&self, name: &str) -> Result<&Column> {
        self.get_column(name).ok_or_else(|| {
            Error::InvalidFilterField(format!("{} has no field '{}'", self.kind, name))
        })
    }

    pub fn foreign_key_for_relation(&self, relation: &str) -> Option<&ForeignKey> {
        self.foreign_keys.iter().find(|fk| fk.relation == relation)
    }

    /// Check that every classified filter key and default sort key is a column
    pub fn validate(&self) -> Result<()> {
        let classified = self
            .filter_keys
            .exact
            .iter()
            .chain(&self.filter_keys.comparison)
            .chain(&self.filter_keys.regex_or)
            .chain(&self.default_sort_keys);
        for key in classified {
            if !self.has_column(key) {
                return Err(Error::Configuration(format!(
                    "{} classifies unknown column '{}'",
                    self.table, key
                )));
            }
        }
        if self.default_sort_keys.is_empty() {
            return Err(Error::Configuration(format!(
                "{} declares no default sort key",
                self.table
            )));
        }
        for fk in &self.foreign_keys {
            if !self.has_column(fk.column) {
                return Err(Error::Configuration(format!(
                    "{} foreign key on unknown column '{}'",
                    self.table, fk.column
                )));
            }
        }
        Ok(())
    }
}

fn users_schema() -> ResourceSchema {
    use ColumnType::*;
    ResourceSchema::new(ResourceKind::User, "users")
        .soft_deletable()
        .column(Column::required("username", Text).with_max_len(20))
        .column(Column::required("password", Text).with_max_len(255))
        .column(Column::required("type", Text).with_max_len(20))
        .column(Column::optional("phone", Text).with_max_len(20))
        .column(Column::optional("email", Text).with_max_len(255))
        .column(
            Column::required("status", Text)
                .with_max_len(20)
                .with_default(ColumnDefault::Text("ACTIVE")),
        )
        .column(Column::required("privilege", Integer).with_default(ColumnDefault::Int(9)))
        .column(Column::optional("last_login_time", Timestamp))
        .column(
            Column::optional("description", Text)
                .with_max_len(255)
                .with_default(ColumnDefault::Text("")),
        )
        .unique(&["username", DELETED_COLUMN])
        .filters(
            &["id", "username", "type", "status", "email"],
            &["privilege", "created_at", "updated_at", "last_login_time"],
            &["phone", "description"],
        )
}

fn groups_schema() -> ResourceSchema {
    use ColumnType::*;
    ResourceSchema::new(ResourceKind::Group, "groups")
        .soft_deletable()
        .column(Column::required("groupname", Text).with_max_len(64))
        .column(Column::required("type", Text).with_max_len(20))
        .column(
            Column::required("status", Text)
                .with_max_len(20)
                .with_default(ColumnDefault::Text("ACTIVE")),
        )
        .column(
            Column::optional("description", Text)
                .with_max_len(255)
                .with_default(ColumnDefault::Text("")),
        )
        .unique(&["groupname", DELETED_COLUMN])
        .filters(&["id", "type", "status"], &["created_at", "updated_at"], &[])
}

fn roles_schema() -> ResourceSchema {
    use ColumnType::*;
    ResourceSchema::new(ResourceKind::Role, "roles")
        .soft_deletable()
        .column(Column::required("name", Text).with_max_len(20))
        .column(
            Column::optional("description", Text)
                .with_max_len(255)
                .with_default(ColumnDefault::Text("")),
        )
        .unique(&["name", DELETED_COLUMN])
        .filters(&["id", "name"], &["created_at", "updated_at"], &[])
}

fn user_roles_schema() -> ResourceSchema {
    ResourceSchema::new(ResourceKind::UserRole, "user_roles")
        .soft_deletable()
        .column(Column::required("user_id", ColumnType::Integer))
        .column(Column::required("role_id", ColumnType::Integer))
        .unique(&["user_id", "role_id", DELETED_COLUMN])
        .foreign_key("user_id", ResourceKind::User, "user")
        .foreign_key("role_id", ResourceKind::Role, "role")
        .filters(&["id", "user_id", "role_id"], &["created_at"], &[])
}

fn group_users_schema() -> ResourceSchema {
    ResourceSchema::new(ResourceKind::GroupUser, "group_users")
        .soft_deletable()
        .column(Column::required("group_id", ColumnType::Integer))
        .column(Column::required("user_id", ColumnType::Integer))
        .unique(&["group_id", "user_id", DELETED_COLUMN])
        .foreign_key("group_id", ResourceKind::Group, "group")
        .foreign_key("user_id", ResourceKind::User, "user")
        .filters(&["id", "group_id", "user_id"], &["created_at"], &[])
}

/// Typed registry of resource schemas
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    schemas: HashMap<ResourceKind, Arc<ResourceSchema>>,
}

impl SchemaRegistry {
    /// Empty registry
    pub fn empty() -> Self {
        Self {
            schemas: HashMap::new(),
        }
    }

    /// Registry holding every built-in schema
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::empty();
        for kind in ResourceKind::ALL {
            registry.register(kind.builtin_schema())?;
        }
        Ok(registry)
    }

    /// Add or replace the schema for its kind
    pub fn register(&mut self, schema: ResourceSchema) -> Result<()> {
        schema.validate()?;
        self.schemas.insert(schema.kind, Arc::new(schema));
        Ok(())
    }

    pub fn get(&self, kind: ResourceKind) -> Result<Arc<ResourceSchema>> {
        self.schemas
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::Configuration(format!("no schema registered for {}", kind)))
    }

    pub fn schemas(&self) -> impl Iterator<Item = &Arc<ResourceSchema>> {
        self.schemas.values()
    }

    /// Foreign keys elsewhere in the registry that point at `kind`
    pub fn referencing(&self, kind: ResourceKind) -> Vec<(Arc<ResourceSchema>, ForeignKey)> {
        self.schemas
            .values()
            .flat_map(|schema| {
                schema
                    .foreign_keys
                    .iter()
                    .filter(move |fk| fk.references == kind)
                    .map(move |fk| (Arc::clone(schema), fk.clone()))
            })
            .collect()
    }
}
