//! Page windows, soft-delete visibility and list requests
//!
//! # Example
//!
//! ```rust
//! use idhub::query::{DeletedMode, ListQuery};
//!
//! let query = ListQuery::default()
//!     .with_sort(["username"], ["asc"])
//!     .with_limit(20)
//!     .with_page(3)
//!     .with_deleted(DeletedMode::Yes);
//!
//! assert_eq!(query.window.offset(), 40);
//! assert_eq!(query.read_deleted, DeletedMode::Yes);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::query::FilterSpec;
use crate::value::Record;

/// Default number of rows per page when a page number is given without a limit
pub const DEFAULT_PAGE_SIZE: u64 = 20;

/// Which rows soft deletion hides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletedMode {
    /// Visible rows only
    #[default]
    No,
    /// Soft-deleted rows only
    Only,
    /// Every row regardless of state
    Yes,
}

impl fmt::Display for DeletedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::No => write!(f, "no"),
            Self::Only => write!(f, "only"),
            Self::Yes => write!(f, "yes"),
        }
    }
}

impl FromStr for DeletedMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "no" => Ok(Self::No),
            "only" => Ok(Self::Only),
            "yes" => Ok(Self::Yes),
            other => Err(Error::InvalidInput(format!(
                "Unrecognized read_deleted value '{}'",
                other
            ))),
        }
    }
}

/// Position to resume a listing after
#[derive(Debug, Clone, PartialEq)]
pub enum Marker {
    /// The last row the caller saw
    Row(Record),
    /// Id of the last row the caller saw; resolved before the query runs
    Id(i64),
}

/// Limit, offset and keyset position of one page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageWindow {
    pub limit: Option<u64>,
    /// 1-based page number, used only when no marker is given
    pub page: Option<u64>,
    pub marker: Option<Marker>,
    pub distinct_on: Option<String>,
}

impl PageWindow {
    /// Rows to skip before the page starts
    pub fn offset(&self) -> u64 {
        if self.marker.is_some() {
            return 0;
        }
        match self.page {
            Some(page) if page > 1 => {
                (page - 1).saturating_mul(self.limit.unwrap_or(DEFAULT_PAGE_SIZE))
            }
            _ => 0,
        }
    }

    /// Effective limit; a page number without a limit uses the default size
    pub fn effective_limit(&self) -> Option<u64> {
        match (self.limit, self.page) {
            (Some(limit), _) => Some(limit),
            (None, Some(_)) => Some(DEFAULT_PAGE_SIZE),
            (None, None) => None,
        }
    }

    /// A zero limit never reaches storage
    pub fn is_empty(&self) -> bool {
        self.limit == Some(0)
    }
}

/// Parameters of a list request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListQuery {
    pub filters: FilterSpec,
    pub sort_keys: Option<Vec<String>>,
    pub sort_dirs: Option<Vec<String>>,
    pub window: PageWindow,
    pub read_deleted: DeletedMode,
    /// Relation names to attach to each row
    pub eager: Vec<String>,
}

impl ListQuery {
    pub fn new(filters: FilterSpec) -> Self {
        Self {
            filters,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_filters(mut self, filters: FilterSpec) -> Self {
        self.filters = filters;
        self
    }

    #[must_use]
    pub fn with_sort<K, D>(mut self, keys: K, dirs: D) -> Self
    where
        K: IntoIterator,
        K::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        self.sort_keys = Some(keys.into_iter().map(Into::into).collect());
        let dirs: Vec<String> = dirs.into_iter().map(Into::into).collect();
        self.sort_dirs = (!dirs.is_empty()).then_some(dirs);
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.window.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_page(mut self, page: u64) -> Self {
        self.window.page = Some(page);
        self
    }

    #[must_use]
    pub fn with_marker(mut self, marker: Marker) -> Self {
        self.window.marker = Some(marker);
        self
    }

    #[must_use]
    pub fn with_distinct_on(mut self, column: impl Into<String>) -> Self {
        self.window.distinct_on = Some(column.into());
        self
    }

    #[must_use]
    pub fn with_deleted(mut self, mode: DeletedMode) -> Self {
        self.read_deleted = mode;
        self
    }

    #[must_use]
    pub fn with_eager(mut self, relation: impl Into<String>) -> Self {
        self.eager.push(relation.into());
        self
    }
}
