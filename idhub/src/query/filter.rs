//! Filter specifications and their compilation into predicates
//!
//! A [`FilterSpec`] maps field names to [`FilterValue`]s. The
//! [`FilterCompiler`] classifies each field using the resource schema's
//! [`FilterKeys`](crate::schema::FilterKeys) and produces a backend-agnostic
//! [`Predicate`]: a conjunction of [`MatchClause`]s.
//!
//! # Example
//!
//! ```rust
//! use idhub::query::{FilterCompiler, FilterSpec, MatchClause};
//! use idhub::schema::ResourceKind;
//!
//! let schema = ResourceKind::User.builtin_schema();
//! let spec = FilterSpec::new()
//!     .with("username", "alice01")
//!     .with("privilege", 0)
//!     .with("email", "");
//!
//! let predicate = FilterCompiler::new(&schema).compile(&spec).unwrap();
//! // the blank email is dropped, the zero privilege is kept
//! assert_eq!(predicate.clauses().len(), 2);
//! assert!(matches!(predicate.clauses()[0], MatchClause::Exact { .. }));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::schema::{Column, ResourceSchema};
use crate::value::Value;

/// Leading element of a legacy sequence that asks for a negated membership test
pub const NEGATE_SENTINEL: &str = "NOT_IN";

/// Relational comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOp {
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "between")]
    Between,
}

impl ComparisonOp {
    /// SQL operator, `BETWEEN` rendered separately
    pub const fn as_sql(&self) -> &'static str {
        match self {
            Self::Ge => ">=",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Lt => "<",
            Self::Ne => "<>",
            Self::Between => "BETWEEN",
        }
    }
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ge => write!(f, ">="),
            Self::Gt => write!(f, ">"),
            Self::Le => write!(f, "<="),
            Self::Lt => write!(f, "<"),
            Self::Ne => write!(f, "!="),
            Self::Between => write!(f, "between"),
        }
    }
}

impl FromStr for ComparisonOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            ">=" => Ok(Self::Ge),
            ">" => Ok(Self::Gt),
            "<=" => Ok(Self::Le),
            "<" => Ok(Self::Lt),
            "!=" => Ok(Self::Ne),
            "between" => Ok(Self::Between),
            other => Err(Error::InvalidInput(format!(
                "unknown comparison operator '{}'",
                other
            ))),
        }
    }
}

/// Value supplied for one filter field
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    /// Equality, or contains-match for unclassified fields
    Scalar(Value),
    /// Untagged sequence. On exact keys this is a membership test (negated
    /// when led by [`NEGATE_SENTINEL`]); on comparison keys it is read as
    /// `[op, operand, operand2?]`.
    List(Vec<Value>),
    /// Explicit membership test
    In { values: Vec<Value>, negate: bool },
    /// Explicit relational comparison
    Compare {
        op: ComparisonOp,
        operand: Value,
        operand2: Option<Value>,
    },
}

impl FilterValue {
    /// Absent or blank values are dropped before compilation
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Scalar(v) => v.is_blank(),
            Self::List(values) | Self::In { values, .. } => values.is_empty(),
            Self::Compare { operand, .. } => operand.is_null(),
        }
    }
}

impl From<Value> for FilterValue {
    fn from(v: Value) -> Self {
        Self::Scalar(v)
    }
}

impl From<&str> for FilterValue {
    fn from(s: &str) -> Self {
        Self::Scalar(Value::from(s))
    }
}

impl From<String> for FilterValue {
    fn from(s: String) -> Self {
        Self::Scalar(Value::from(s))
    }
}

impl From<i64> for FilterValue {
    fn from(v: i64) -> Self {
        Self::Scalar(Value::Int(v))
    }
}

impl From<i32> for FilterValue {
    fn from(v: i32) -> Self {
        Self::Scalar(Value::from(v))
    }
}

impl From<bool> for FilterValue {
    fn from(b: bool) -> Self {
        Self::Scalar(Value::Bool(b))
    }
}

/// Field → value mapping supplied by a caller
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterSpec {
    entries: BTreeMap<String, FilterValue>,
}

impl FilterSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.entries.insert(field.into(), value.into());
        self
    }

    pub fn with_list<I, V>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.entries.insert(
            field.into(),
            FilterValue::List(values.into_iter().map(Into::into).collect()),
        );
        self
    }

    pub fn with_in<I, V>(mut self, field: impl Into<String>, values: I, negate: bool) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.entries.insert(
            field.into(),
            FilterValue::In {
                values: values.into_iter().map(Into::into).collect(),
                negate,
            },
        );
        self
    }

    pub fn with_comparison(
        mut self,
        field: impl Into<String>,
        op: ComparisonOp,
        operand: impl Into<Value>,
        operand2: Option<Value>,
    ) -> Self {
        self.entries.insert(
            field.into(),
            FilterValue::Compare {
                op,
                operand: operand.into(),
                operand2,
            },
        );
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<FilterValue>) {
        self.entries.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&FilterValue> {
        self.entries.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FilterValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Copy with blank entries removed
    pub fn without_blanks(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|(_, v)| !v.is_blank())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Build from a JSON object of query parameters. Arrays become
    /// [`FilterValue::List`]; nulls are kept and later dropped as blank.
    pub fn from_json(map: serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        let mut spec = Self::new();
        for (field, json) in map {
            let value = match json {
                serde_json::Value::Array(items) => FilterValue::List(
                    items
                        .into_iter()
                        .map(Value::try_from)
                        .collect::<Result<Vec<_>>>()?,
                ),
                other => FilterValue::Scalar(Value::try_from(other)?),
            };
            spec.entries.insert(field, value);
        }
        Ok(spec)
    }
}

impl FromIterator<(String, FilterValue)> for FilterSpec {
    fn from_iter<I: IntoIterator<Item = (String, FilterValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegexTerm {
    pub field: String,
    pub pattern: String,
}

/// One compiled condition
#[derive(Debug, Clone, PartialEq)]
pub enum MatchClause {
    Exact {
        field: String,
        value: Value,
    },
    ExactIn {
        field: String,
        values: Vec<Value>,
        negate: bool,
    },
    Comparison {
        field: String,
        op: ComparisonOp,
        operand: Value,
        operand2: Option<Value>,
    },
    RegexAnd {
        field: String,
        pattern: String,
    },
    /// Any one of the terms matches
    RegexOr {
        terms: Vec<RegexTerm>,
    },
}

/// Conjunction of match clauses
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    clauses: Vec<MatchClause>,
}

impl Predicate {
    pub fn new(clauses: Vec<MatchClause>) -> Self {
        Self { clauses }
    }

    /// Predicate matching every row
    pub fn all() -> Self {
        Self::default()
    }

    pub fn clauses(&self) -> &[MatchClause] {
        &self.clauses
    }

    pub fn push(&mut self, clause: MatchClause) {
        self.clauses.push(clause);
    }

    pub fn and(mut self, clause: MatchClause) -> Self {
        self.clauses.push(clause);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

/// Compiles [`FilterSpec`]s against one resource schema
pub struct FilterCompiler<'a> {
    schema: &'a ResourceSchema,
}

impl<'a> FilterCompiler<'a> {
    pub fn new(schema: &'a ResourceSchema) -> Self {
        Self { schema }
    }

    /// Compile using the schema's key classification
    pub fn compile(&self, spec: &FilterSpec) -> Result<Predicate> {
        let keys = &self.schema.filter_keys;
        let mut remaining = spec.without_blanks().entries;
        let mut clauses = Vec::with_capacity(remaining.len() + 1);

        for field in &keys.exact {
            if let Some(value) = remaining.remove(*field) {
                clauses.push(self.exact_clause(field, value)?);
            }
        }

        for field in &keys.comparison {
            if let Some(value) = remaining.remove(*field) {
                clauses.push(self.comparison_clause(field, value)?);
            }
        }

        let mut or_terms = Vec::new();
        for field in &keys.regex_or {
            if let Some(value) = remaining.remove(*field) {
                or_terms.push(RegexTerm {
                    field: field.to_string(),
                    pattern: pattern_of(field, value)?,
                });
            }
        }

        for (field, value) in remaining {
            self.schema.require_column(&field)?;
            let pattern = pattern_of(&field, value)?;
            clauses.push(MatchClause::RegexAnd { field, pattern });
        }

        if !or_terms.is_empty() {
            clauses.push(MatchClause::RegexOr { terms: or_terms });
        }

        Ok(Predicate { clauses })
    }

    /// Compile every field as an equality or membership test, ignoring the
    /// classification. Used for single-row lookups and deletes.
    pub fn compile_exact(&self, spec: &FilterSpec) -> Result<Predicate> {
        spec.without_blanks()
            .entries
            .into_iter()
            .map(|(field, value)| {
                self.schema.require_column(&field)?;
                self.exact_clause(&field, value)
            })
            .collect::<Result<Vec<_>>>()
            .map(Predicate::new)
    }

    fn column(&self, field: &str) -> Result<&Column> {
        self.schema.get_column(field).ok_or_else(|| {
            Error::Configuration(format!(
                "{} classifies unknown column '{}'",
                self.schema.table, field
            ))
        })
    }

    fn exact_clause(&self, field: &str, value: FilterValue) -> Result<MatchClause> {
        let column = self.column(field)?;
        match value {
            FilterValue::Scalar(v) => Ok(MatchClause::Exact {
                field: field.to_string(),
                value: coerce(column, v)?,
            }),
            FilterValue::List(values) | FilterValue::In { values, .. }
                if values.iter().any(Value::is_null) =>
            {
                // NOT IN over a set holding NULL matches nothing in SQL
                Err(Error::InvalidInput(format!(
                    "'{}' membership list cannot contain null",
                    field
                )))
            }
            FilterValue::List(values) => {
                let negate = values.first().and_then(Value::as_str) == Some(NEGATE_SENTINEL);
                // the sentinel stays in the set; it only matches a row holding it literally
                Ok(MatchClause::ExactIn {
                    field: field.to_string(),
                    values: values.into_iter().map(|v| coerce_lenient(column, v)).collect(),
                    negate,
                })
            }
            FilterValue::In { values, negate } => Ok(MatchClause::ExactIn {
                field: field.to_string(),
                values: values
                    .into_iter()
                    .map(|v| coerce(column, v))
                    .collect::<Result<Vec<_>>>()?,
                negate,
            }),
            FilterValue::Compare { .. } => Err(Error::InvalidInput(format!(
                "'{}' does not accept a comparison",
                field
            ))),
        }
    }

    fn comparison_clause(&self, field: &str, value: FilterValue) -> Result<MatchClause> {
        let column = self.column(field)?;
        let (op, operand, operand2) = match value {
            FilterValue::Compare {
                op,
                operand,
                operand2,
            } => (op, operand, operand2),
            FilterValue::List(values) => {
                let mut items = values.into_iter();
                let op = match items.next() {
                    Some(Value::Text(op)) => op.parse::<ComparisonOp>()?,
                    _ => {
                        return Err(Error::InvalidInput(format!(
                            "'{}' expects [operator, operand, operand2?]",
                            field
                        )))
                    }
                };
                let operand = items.next().unwrap_or(Value::Null);
                (op, operand, items.next())
            }
            other => return self.exact_clause(field, other),
        };

        if operand.is_null() {
            return Err(Error::InvalidInput(format!(
                "'{}' comparison is missing its operand",
                field
            )));
        }
        let operand2 = match (op, operand2) {
            (ComparisonOp::Between, Some(v)) if !v.is_null() => Some(coerce(column, v)?),
            (ComparisonOp::Between, _) => {
                return Err(Error::InvalidInput(format!(
                    "'{}' between needs two operands",
                    field
                )))
            }
            _ => None,
        };

        Ok(MatchClause::Comparison {
            field: field.to_string(),
            op,
            operand: coerce(column, operand)?,
            operand2,
        })
    }
}

fn coerce(column: &Column, value: Value) -> Result<Value> {
    value.coerce(column.ty).ok_or_else(|| {
        Error::InvalidInput(format!(
            "'{}' is not a valid {} for '{}'",
            value, column.ty, column.name
        ))
    })
}

fn coerce_lenient(column: &Column, value: Value) -> Value {
    value.coerce(column.ty).unwrap_or(value)
}

fn pattern_of(field: &str, value: FilterValue) -> Result<String> {
    let pattern = match value {
        FilterValue::Scalar(v) => v.render(),
        _ => {
            return Err(Error::InvalidInput(format!(
                "'{}' only accepts a single search value",
                field
            )))
        }
    };
    Regex::new(&pattern)
        .map_err(|e| Error::InvalidInput(format!("'{}' is not a valid pattern: {}", field, e)))?;
    Ok(pattern)
}
