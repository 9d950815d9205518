//! Sort normalization
//!
//! Reconciles a caller's requested sort keys and directions with the
//! resource defaults so that every listing has a total order.
//!
//! # Example
//!
//! ```rust
//! use idhub::query::{SortDirection, SortNormalizer};
//!
//! let normalizer = SortNormalizer::new(&["created_at", "id"], SortDirection::Desc);
//! let spec = normalizer
//!     .normalize(Some(&["username".to_string()]), Some(&["asc".to_string()]))
//!     .unwrap();
//!
//! assert_eq!(spec.keys(), vec!["username", "created_at", "id"]);
//! assert_eq!(spec.directions(), vec![SortDirection::Asc; 3]);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Ascending order (A-Z, 0-9, oldest first)
    #[default]
    Asc,
    /// Descending order (Z-A, 9-0, newest first)
    Desc,
}

impl SortDirection {
    /// SQL ORDER BY fragment
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asc => write!(f, "asc"),
            Self::Desc => write!(f, "desc"),
        }
    }
}

impl FromStr for SortDirection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => Err(Error::InvalidSortDirection(format!(
                "'{}', must be 'desc' or 'asc'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub column: String,
    pub direction: SortDirection,
}

/// Ordered list of sort keys, never empty once normalized
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortSpec {
    entries: Vec<SortKey>,
}

impl SortSpec {
    /// Build a spec directly, bypassing defaults
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, SortDirection)>,
        S: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(column, direction)| SortKey {
                    column: column.into(),
                    direction,
                })
                .collect(),
        }
    }

    pub fn entries(&self) -> &[SortKey] {
        &self.entries
    }

    pub fn keys(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.column.as_str()).collect()
    }

    pub fn directions(&self) -> Vec<SortDirection> {
        self.entries.iter().map(|e| e.direction).collect()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.entries.iter().any(|e| e.column == column)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Put `column` first, ascending, removing any later occurrence
    pub(crate) fn lead_with(&mut self, column: &str) {
        self.entries.retain(|e| e.column != column);
        self.entries.insert(
            0,
            SortKey {
                column: column.to_string(),
                direction: SortDirection::Asc,
            },
        );
    }
}

/// Applies resource sort defaults to a caller's request
#[derive(Debug, Clone)]
pub struct SortNormalizer {
    default_keys: Vec<String>,
    default_dir: SortDirection,
}

impl SortNormalizer {
    pub fn new(default_keys: &[&str], default_dir: SortDirection) -> Self {
        Self {
            default_keys: default_keys.iter().map(|k| k.to_string()).collect(),
            default_dir,
        }
    }

    pub fn normalize(
        &self,
        sort_keys: Option<&[String]>,
        sort_dirs: Option<&[String]>,
    ) -> Result<SortSpec> {
        let keys = sort_keys.unwrap_or_default();

        let requested_dirs = sort_dirs
            .unwrap_or_default()
            .iter()
            .map(|d| d.parse::<SortDirection>())
            .collect::<Result<Vec<_>>>()?;

        let default_to_use = requested_dirs.first().copied().unwrap_or(self.default_dir);

        if requested_dirs.len() > keys.len() {
            return Err(Error::InvalidInput(format!(
                "Sort direction size exceeds sort key size ({} > {})",
                requested_dirs.len(),
                keys.len()
            )));
        }

        let mut entries: Vec<SortKey> = keys
            .iter()
            .enumerate()
            .map(|(i, key)| SortKey {
                column: key.clone(),
                direction: requested_dirs.get(i).copied().unwrap_or(default_to_use),
            })
            .collect();

        for default_key in &self.default_keys {
            if !entries.iter().any(|e| &e.column == default_key) {
                entries.push(SortKey {
                    column: default_key.clone(),
                    direction: default_to_use,
                });
            }
        }

        Ok(SortSpec { entries })
    }
}
