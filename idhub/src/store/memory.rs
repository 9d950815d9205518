//! In-process row store
//!
//! Holds every table in one map behind a single lock so constraint checks
//! across tables see a consistent snapshot. Patterns are matched with the
//! `regex` crate, which accepts the same search syntax the PostgreSQL `~`
//! operator is given.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use tokio::sync::RwLock;

use super::{RowStore, StoreError, StoreErrorKind, StoreOperation, StoreResult};
use crate::query::{ComparisonOp, MatchClause, Predicate, QueryPlan, SortDirection, SortSpec};
use crate::schema::{
    OnDelete, ResourceSchema, SchemaRegistry, DELETED_AT_COLUMN, DELETED_COLUMN,
};
use crate::value::{Record, Value};

static NULL: Value = Value::Null;

fn cell<'r>(row: &'r Record, field: &str) -> &'r Value {
    row.get(field).unwrap_or(&NULL)
}

#[derive(Debug, Default)]
struct Table {
    last_id: i64,
    rows: BTreeMap<i64, Record>,
}

/// Row store kept entirely in memory
pub struct MemoryStore {
    registry: Arc<SchemaRegistry>,
    tables: RwLock<HashMap<&'static str, Table>>,
}

impl MemoryStore {
    /// The registry is consulted for foreign keys that point into a table
    /// being deleted from.
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            tables: RwLock::new(HashMap::new()),
        }
    }
}

enum Matcher<'p> {
    Exact(&'p str, &'p Value),
    In(&'p str, &'p [Value], bool),
    Compare(&'p str, ComparisonOp, &'p Value, Option<&'p Value>),
    Pattern(&'p str, Regex),
    AnyPattern(Vec<(&'p str, Regex)>),
}

impl Matcher<'_> {
    fn matches(&self, row: &Record) -> bool {
        match self {
            Self::Exact(field, value) => cell(row, field) == *value,
            Self::In(field, values, negate) => {
                let current = cell(row, field);
                if current.is_null() {
                    return false;
                }
                values.iter().any(|v| v == current) != *negate
            }
            Self::Compare(field, op, operand, operand2) => {
                let current = cell(row, field);
                let Some(ord) = current.partial_cmp_strict(operand) else {
                    return false;
                };
                match op {
                    ComparisonOp::Ge => ord != Ordering::Less,
                    ComparisonOp::Gt => ord == Ordering::Greater,
                    ComparisonOp::Le => ord != Ordering::Greater,
                    ComparisonOp::Lt => ord == Ordering::Less,
                    ComparisonOp::Ne => ord != Ordering::Equal,
                    ComparisonOp::Between => {
                        ord != Ordering::Less
                            && operand2
                                .and_then(|upper| current.partial_cmp_strict(upper))
                                .is_some_and(|o| o != Ordering::Greater)
                    }
                }
            }
            Self::Pattern(field, regex) => pattern_matches(cell(row, field), regex),
            Self::AnyPattern(terms) => terms
                .iter()
                .any(|(field, regex)| pattern_matches(cell(row, field), regex)),
        }
    }
}

fn pattern_matches(value: &Value, regex: &Regex) -> bool {
    !value.is_null() && regex.is_match(&value.render())
}

fn compile_regex(pattern: &str) -> StoreResult<Regex> {
    Regex::new(pattern).map_err(|e| {
        StoreError::new(
            StoreOperation::Select,
            StoreErrorKind::QueryFailed,
            format!("invalid pattern: {}", e),
        )
    })
}

fn matchers(predicate: &Predicate) -> StoreResult<Vec<Matcher<'_>>> {
    predicate
        .clauses()
        .iter()
        .map(|clause| {
            Ok(match clause {
                MatchClause::Exact { field, value } => Matcher::Exact(field, value),
                MatchClause::ExactIn {
                    field,
                    values,
                    negate,
                } => Matcher::In(field, values, *negate),
                MatchClause::Comparison {
                    field,
                    op,
                    operand,
                    operand2,
                } => Matcher::Compare(field, *op, operand, operand2.as_ref()),
                MatchClause::RegexAnd { field, pattern } => {
                    Matcher::Pattern(field, compile_regex(pattern)?)
                }
                MatchClause::RegexOr { terms } => Matcher::AnyPattern(
                    terms
                        .iter()
                        .map(|t| Ok((t.field.as_str(), compile_regex(&t.pattern)?)))
                        .collect::<StoreResult<Vec<_>>>()?,
                ),
            })
        })
        .collect()
}

fn matches_all(matchers: &[Matcher<'_>], row: &Record) -> bool {
    matchers.iter().all(|m| m.matches(row))
}

fn compare_rows(a: &Record, b: &Record, sort: &SortSpec) -> Ordering {
    for key in sort.entries() {
        let left = cell(a, &key.column);
        let right = cell(b, &key.column);
        let ord = match key.direction {
            SortDirection::Asc => left.sort_cmp(right),
            SortDirection::Desc => right.sort_cmp(left),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn plan_rows(table: Option<&Table>, plan: &QueryPlan) -> StoreResult<Vec<Record>> {
    let Some(table) = table else {
        return Ok(Vec::new());
    };
    let matchers = matchers(&plan.predicate)?;

    let mut rows: Vec<&Record> = table
        .rows
        .values()
        .filter(|row| matches_all(&matchers, row))
        .filter(|row| {
            plan.marker
                .as_ref()
                .map_or(true, |marker| compare_rows(row, marker, &plan.sort) == Ordering::Greater)
        })
        .collect();
    rows.sort_by(|a, b| compare_rows(a, b, &plan.sort));

    if let Some(column) = &plan.distinct_on {
        let mut seen: HashSet<&Value> = HashSet::new();
        rows.retain(|row| seen.insert(cell(*row, column)));
    }

    let offset = usize::try_from(plan.offset).unwrap_or(usize::MAX);
    let limit = plan
        .limit
        .map(|l| usize::try_from(l).unwrap_or(usize::MAX))
        .unwrap_or(usize::MAX);

    Ok(rows.into_iter().skip(offset).take(limit).cloned().collect())
}

fn check_unique(
    schema: &ResourceSchema,
    table: &Table,
    candidate: &Record,
    operation: StoreOperation,
) -> StoreResult<()> {
    let candidate_id = candidate.id();
    for constraint in &schema.unique_constraints {
        let key: Vec<&Value> = constraint
            .iter()
            .map(|c| cell(candidate, c))
            .collect();
        if key.iter().any(|v| v.is_null()) {
            continue;
        }
        let clash = table.rows.values().any(|row| {
            row.id() != candidate_id
                && constraint
                    .iter()
                    .zip(&key)
                    .all(|(c, v)| row.get(c) == Some(*v))
        });
        if clash {
            return Err(StoreError::unique_violation(
                operation,
                format!("duplicate key value violates unique ({})", constraint.join(", ")),
            )
            .with_table(schema.table));
        }
    }
    Ok(())
}

fn check_references(
    registry: &SchemaRegistry,
    schema: &ResourceSchema,
    tables: &HashMap<&'static str, Table>,
    candidate: &Record,
    operation: StoreOperation,
) -> StoreResult<()> {
    for fk in &schema.foreign_keys {
        let Some(target_id) = candidate.get_i64(fk.column) else {
            continue;
        };
        let target = registry
            .get(fk.references)
            .map_err(|e| StoreError::new(operation, StoreErrorKind::Other, e.to_string()))?;
        let exists = tables
            .get(target.table)
            .is_some_and(|t| t.rows.contains_key(&target_id));
        if !exists {
            return Err(StoreError::foreign_key_violation(
                operation,
                format!(
                    "{}.{}={} is not present in {}",
                    schema.table, fk.column, target_id, target.table
                ),
            )
            .with_table(schema.table));
        }
    }
    Ok(())
}

fn check_columns(schema: &ResourceSchema, row: &Record, operation: StoreOperation) -> StoreResult<()> {
    for (name, value) in row.columns() {
        let Some(column) = schema.get_column(name) else {
            return Err(StoreError::new(
                operation,
                StoreErrorKind::QueryFailed,
                format!("column \"{}\" does not exist", name),
            )
            .with_table(schema.table));
        };
        if value.is_null() && !column.nullable {
            return Err(StoreError::new(
                operation,
                StoreErrorKind::QueryFailed,
                format!("null value in column \"{}\" violates not-null constraint", name),
            )
            .with_table(schema.table));
        }
    }
    Ok(())
}

impl MemoryStore {
    /// Ids to remove per table, following cascades and refusing restricted references
    fn deletion_set(
        &self,
        tables: &HashMap<&'static str, Table>,
        schema: &ResourceSchema,
        ids: Vec<i64>,
        out: &mut Vec<(&'static str, Vec<i64>)>,
    ) -> StoreResult<()> {
        for (child, fk) in self.registry.referencing(schema.kind) {
            let Some(child_table) = tables.get(child.table) else {
                continue;
            };
            let dependents: Vec<i64> = child_table
                .rows
                .iter()
                .filter(|(_, row)| row.get_i64(fk.column).is_some_and(|v| ids.contains(&v)))
                .map(|(id, _)| *id)
                .collect();
            if dependents.is_empty() {
                continue;
            }
            match fk.on_delete {
                OnDelete::Restrict => {
                    return Err(StoreError::foreign_key_violation(
                        StoreOperation::Delete,
                        format!(
                            "{} is still referenced from {}.{}",
                            schema.table, child.table, fk.column
                        ),
                    )
                    .with_table(schema.table));
                }
                OnDelete::Cascade => self.deletion_set(tables, &child, dependents, out)?,
            }
        }
        out.push((schema.table, ids));
        Ok(())
    }
}

#[async_trait]
impl RowStore for MemoryStore {
    async fn insert(&self, schema: &ResourceSchema, row: Record) -> StoreResult<Record> {
        let mut tables = self.tables.write().await;

        let mut stored = Record::new();
        for column in &schema.columns {
            let value = match row.get(column.name) {
                Some(v) => v.clone(),
                None => match column.default {
                    Some(default) => default.into(),
                    None if column.name == "created_at" => Value::from(Utc::now()),
                    None => Value::Null,
                },
            };
            stored.set(column.name, value);
        }
        for (name, _) in row.columns() {
            if !schema.has_column(name) {
                return Err(StoreError::new(
                    StoreOperation::Insert,
                    StoreErrorKind::QueryFailed,
                    format!("column \"{}\" does not exist", name),
                )
                .with_table(schema.table));
            }
        }

        let table = tables.entry(schema.table).or_default();
        let id = table.last_id + 1;
        stored.set("id", id);
        check_columns(schema, &stored, StoreOperation::Insert)?;
        check_unique(schema, table, &stored, StoreOperation::Insert)?;
        check_references(&self.registry, schema, &tables, &stored, StoreOperation::Insert)?;

        let table = tables.entry(schema.table).or_default();
        table.last_id = id;
        table.rows.insert(id, stored.clone());
        Ok(stored)
    }

    async fn select(&self, schema: &ResourceSchema, plan: &QueryPlan) -> StoreResult<Vec<Record>> {
        let tables = self.tables.read().await;
        plan_rows(tables.get(schema.table), plan)
    }

    async fn count(&self, schema: &ResourceSchema, plan: &QueryPlan) -> StoreResult<u64> {
        let tables = self.tables.read().await;
        let rows = plan_rows(tables.get(schema.table), plan)?;
        Ok(rows.len() as u64)
    }

    async fn update(
        &self,
        schema: &ResourceSchema,
        id: i64,
        row: Record,
    ) -> StoreResult<Option<Record>> {
        let mut tables = self.tables.write().await;
        check_columns(schema, &row, StoreOperation::Update)?;

        let Some(current) = tables.get(schema.table).and_then(|t| t.rows.get(&id)) else {
            return Ok(None);
        };
        let mut updated = current.clone();
        updated.merge(row);
        updated.set("id", id);

        if let Some(table) = tables.get(schema.table) {
            check_unique(schema, table, &updated, StoreOperation::Update)?;
        }
        check_references(&self.registry, schema, &tables, &updated, StoreOperation::Update)?;

        tables
            .entry(schema.table)
            .or_default()
            .rows
            .insert(id, updated.clone());
        Ok(Some(updated))
    }

    async fn soft_delete(&self, schema: &ResourceSchema, predicate: &Predicate) -> StoreResult<u64> {
        if !schema.soft_delete {
            return Err(StoreError::new(
                StoreOperation::SoftDelete,
                StoreErrorKind::QueryFailed,
                "table has no deletion marker",
            )
            .with_table(schema.table));
        }
        let matchers = matchers(predicate)?;
        let mut tables = self.tables.write().await;
        let Some(table) = tables.get_mut(schema.table) else {
            return Ok(0);
        };

        let now = Utc::now();
        let mut affected = 0;
        for (id, row) in table.rows.iter_mut() {
            if matches_all(&matchers, row) {
                row.set(DELETED_COLUMN, *id);
                row.set(DELETED_AT_COLUMN, now);
                row.set("updated_at", now);
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn delete(&self, schema: &ResourceSchema, predicate: &Predicate) -> StoreResult<u64> {
        let matchers = matchers(predicate)?;
        let mut tables = self.tables.write().await;
        let ids: Vec<i64> = match tables.get(schema.table) {
            Some(table) => table
                .rows
                .iter()
                .filter(|(_, row)| matches_all(&matchers, row))
                .map(|(id, _)| *id)
                .collect(),
            None => return Ok(0),
        };
        if ids.is_empty() {
            return Ok(0);
        }
        let affected = ids.len() as u64;

        let mut removals = Vec::new();
        self.deletion_set(&tables, schema, ids, &mut removals)?;
        for (table, ids) in removals {
            if let Some(table) = tables.get_mut(table) {
                for id in ids {
                    table.rows.remove(&id);
                }
            }
        }
        Ok(affected)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
