//! PostgreSQL row store
//!
//! Statements are assembled with [`sqlx::QueryBuilder`]; every value is
//! bound, identifiers are quoted. Contains-filters use the `~` operator on
//! the text form of the column.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow, Postgres};
use sqlx::{QueryBuilder, Row};

use super::{RowStore, StoreError, StoreErrorKind, StoreOperation, StoreResult};
use crate::query::{ComparisonOp, MatchClause, Predicate, QueryPlan, SortDirection};
use crate::schema::{ResourceSchema, DELETED_AT_COLUMN, DELETED_COLUMN};
use crate::value::{ColumnType, Record, Value};

type Sql = QueryBuilder<'static, Postgres>;

/// Row store backed by a PostgreSQL connection pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list(schema: &ResourceSchema) -> String {
    schema
        .columns
        .iter()
        .map(|c| ident(c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn value_type(value: &Value) -> Option<ColumnType> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(ColumnType::Boolean),
        Value::Int(_) => Some(ColumnType::Integer),
        Value::Text(_) => Some(ColumnType::Text),
        Value::Timestamp(_) => Some(ColumnType::Timestamp),
    }
}

fn push_value(sql: &mut Sql, value: &Value) {
    match value {
        Value::Null => {
            sql.push("NULL");
        }
        Value::Bool(b) => {
            sql.push_bind(*b);
        }
        Value::Int(v) => {
            sql.push_bind(*v);
        }
        Value::Text(s) => {
            sql.push_bind(s.clone());
        }
        Value::Timestamp(ts) => {
            sql.push_bind(*ts);
        }
    }
}

fn push_clause(sql: &mut Sql, schema: &ResourceSchema, clause: &MatchClause) {
    match clause {
        MatchClause::Exact { field, value } if value.is_null() => {
            sql.push(ident(field)).push(" IS NULL");
        }
        MatchClause::Exact { field, value } => {
            sql.push(ident(field)).push(" = ");
            push_value(sql, value);
        }
        MatchClause::ExactIn { values, negate, .. } if values.is_empty() => {
            sql.push(if *negate { "TRUE" } else { "FALSE" });
        }
        MatchClause::ExactIn {
            field,
            values,
            negate,
        } => {
            let column_ty = schema.get_column(field).map(|c| c.ty);
            let uniform = values
                .iter()
                .all(|v| v.is_null() || value_type(v) == column_ty);
            if *negate {
                sql.push("NOT (");
            }
            if uniform {
                sql.push(ident(field)).push(" IN (");
                let mut list = sql.separated(", ");
                for value in values {
                    match value {
                        Value::Null => list.push("NULL"),
                        Value::Bool(b) => list.push_bind(*b),
                        Value::Int(v) => list.push_bind(*v),
                        Value::Text(s) => list.push_bind(s.clone()),
                        Value::Timestamp(ts) => list.push_bind(*ts),
                    };
                }
                sql.push(")");
            } else {
                // mixed types compare on the text form of the column
                sql.push("CAST(")
                    .push(ident(field))
                    .push(" AS TEXT) IN (");
                let mut list = sql.separated(", ");
                for value in values {
                    list.push_bind(value.render());
                }
                sql.push(")");
            }
            if *negate {
                sql.push(")");
            }
        }
        MatchClause::Comparison {
            field,
            op: ComparisonOp::Between,
            operand,
            operand2,
        } => {
            sql.push(ident(field)).push(" BETWEEN ");
            push_value(sql, operand);
            sql.push(" AND ");
            push_value(sql, operand2.as_ref().unwrap_or(&Value::Null));
        }
        MatchClause::Comparison {
            field, op, operand, ..
        } => {
            sql.push(ident(field))
                .push(" ")
                .push(op.as_sql())
                .push(" ");
            push_value(sql, operand);
        }
        MatchClause::RegexAnd { field, pattern } => {
            sql.push("CAST(")
                .push(ident(field))
                .push(" AS TEXT) ~ ")
                .push_bind(pattern.clone());
        }
        MatchClause::RegexOr { terms } => {
            sql.push("(");
            for (i, term) in terms.iter().enumerate() {
                if i > 0 {
                    sql.push(" OR ");
                }
                sql.push("CAST(")
                    .push(ident(&term.field))
                    .push(" AS TEXT) ~ ")
                    .push_bind(term.pattern.clone());
            }
            sql.push(")");
        }
    }
}

fn push_where(sql: &mut Sql, schema: &ResourceSchema, predicate: &Predicate) {
    sql.push(" WHERE TRUE");
    for clause in predicate.clauses() {
        sql.push(" AND ");
        push_clause(sql, schema, clause);
    }
}

/// `(k1 > m1) OR (k1 = m1 AND k2 > m2) OR ...`, flipped for descending keys
/// Rows strictly after `marker` under the plan's ordering
///
/// NULL sorts last ascending and first descending, matching the ORDER BY
/// Postgres emits by default.
fn push_keyset(sql: &mut Sql, plan: &QueryPlan, marker: &Record) {
    let entries = plan.sort.entries();
    sql.push(" AND (");
    for (i, entry) in entries.iter().enumerate() {
        if i > 0 {
            sql.push(" OR ");
        }
        sql.push("(");
        for prior in &entries[..i] {
            sql.push(ident(&prior.column));
            match marker.get(&prior.column).unwrap_or(&Value::Null) {
                Value::Null => {
                    sql.push(" IS NULL");
                }
                value => {
                    sql.push(" = ");
                    push_value(sql, value);
                }
            }
            sql.push(" AND ");
        }
        let column = ident(&entry.column);
        match (entry.direction, marker.get(&entry.column).unwrap_or(&Value::Null)) {
            (SortDirection::Asc, Value::Null) => {
                sql.push("FALSE");
            }
            (SortDirection::Asc, value) => {
                sql.push("(").push(column.clone()).push(" > ");
                push_value(sql, value);
                sql.push(" OR ").push(column).push(" IS NULL)");
            }
            (SortDirection::Desc, Value::Null) => {
                sql.push(column).push(" IS NOT NULL");
            }
            (SortDirection::Desc, value) => {
                sql.push(column).push(" < ");
                push_value(sql, value);
            }
        }
        sql.push(")");
    }
    sql.push(")");
}

fn push_select(sql: &mut Sql, schema: &ResourceSchema, plan: &QueryPlan) {
    sql.push("SELECT ");
    if let Some(column) = &plan.distinct_on {
        sql.push("DISTINCT ON (").push(ident(column)).push(") ");
    }
    sql.push(column_list(schema))
        .push(" FROM ")
        .push(ident(schema.table));

    push_where(sql, schema, &plan.predicate);
    if let Some(marker) = &plan.marker {
        push_keyset(sql, plan, marker);
    }

    if !plan.sort.is_empty() {
        sql.push(" ORDER BY ");
        for (i, entry) in plan.sort.entries().iter().enumerate() {
            if i > 0 {
                sql.push(", ");
            }
            sql.push(ident(&entry.column))
                .push(" ")
                .push(entry.direction.as_sql());
        }
    }
    if let Some(limit) = plan.limit {
        sql.push(" LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
    }
    if plan.offset > 0 {
        sql.push(" OFFSET ")
            .push_bind(i64::try_from(plan.offset).unwrap_or(i64::MAX));
    }
}

pub(crate) fn select_sql(schema: &ResourceSchema, plan: &QueryPlan) -> Sql {
    let mut sql = QueryBuilder::new("");
    push_select(&mut sql, schema, plan);
    sql
}

pub(crate) fn count_sql(schema: &ResourceSchema, plan: &QueryPlan) -> Sql {
    let mut sql = QueryBuilder::new("SELECT COUNT(*) FROM (");
    push_select(&mut sql, schema, plan);
    sql.push(") AS counted");
    sql
}

fn decode(schema: &ResourceSchema, row: &PgRow) -> StoreResult<Record> {
    let mut record = Record::new();
    for column in &schema.columns {
        let value = match column.ty {
            ColumnType::Integer => Value::from(row.try_get::<Option<i64>, _>(column.name)?),
            ColumnType::Text => Value::from(row.try_get::<Option<String>, _>(column.name)?),
            ColumnType::Timestamp => {
                Value::from(row.try_get::<Option<DateTime<Utc>>, _>(column.name)?)
            }
            ColumnType::Boolean => Value::from(row.try_get::<Option<bool>, _>(column.name)?),
        };
        record.set(column.name, value);
    }
    Ok(record)
}

fn reject_unknown_columns(
    schema: &ResourceSchema,
    row: &Record,
    operation: StoreOperation,
) -> StoreResult<()> {
    match row.columns().find(|(name, _)| !schema.has_column(name)) {
        Some((name, _)) => Err(StoreError::new(
            operation,
            StoreErrorKind::QueryFailed,
            format!("column \"{}\" does not exist", name),
        )
        .with_table(schema.table)),
        None => Ok(()),
    }
}

#[async_trait]
impl RowStore for PgStore {
    async fn insert(&self, schema: &ResourceSchema, row: Record) -> StoreResult<Record> {
        reject_unknown_columns(schema, &row, StoreOperation::Insert)?;
        let columns: Vec<(&str, &Value)> = row.columns().filter(|(name, _)| *name != "id").collect();

        let mut sql: Sql = QueryBuilder::new("INSERT INTO ");
        sql.push(ident(schema.table));
        if columns.is_empty() {
            sql.push(" DEFAULT VALUES");
        } else {
            sql.push(" (")
                .push(
                    columns
                        .iter()
                        .map(|(name, _)| ident(name))
                        .collect::<Vec<_>>()
                        .join(", "),
                )
                .push(") VALUES (");
            for (i, (_, value)) in columns.iter().enumerate() {
                if i > 0 {
                    sql.push(", ");
                }
                push_value(&mut sql, value);
            }
            sql.push(")");
        }
        sql.push(" RETURNING ").push(column_list(schema));

        let stored = sql
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::from(e).during(StoreOperation::Insert).with_table(schema.table))?;
        decode(schema, &stored)
    }

    async fn select(&self, schema: &ResourceSchema, plan: &QueryPlan) -> StoreResult<Vec<Record>> {
        let rows = select_sql(schema, plan)
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::from(e).during(StoreOperation::Select).with_table(schema.table))?;
        rows.iter().map(|row| decode(schema, row)).collect()
    }

    async fn count(&self, schema: &ResourceSchema, plan: &QueryPlan) -> StoreResult<u64> {
        let count: i64 = count_sql(schema, plan)
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::from(e).during(StoreOperation::Count).with_table(schema.table))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn update(
        &self,
        schema: &ResourceSchema,
        id: i64,
        row: Record,
    ) -> StoreResult<Option<Record>> {
        reject_unknown_columns(schema, &row, StoreOperation::Update)?;
        let columns: Vec<(&str, &Value)> = row.columns().filter(|(name, _)| *name != "id").collect();

        let mut sql: Sql = QueryBuilder::new("UPDATE ");
        sql.push(ident(schema.table)).push(" SET ");
        if columns.is_empty() {
            sql.push("\"id\" = \"id\"");
        }
        for (i, (name, value)) in columns.iter().enumerate() {
            if i > 0 {
                sql.push(", ");
            }
            sql.push(ident(name)).push(" = ");
            push_value(&mut sql, value);
        }
        sql.push(" WHERE \"id\" = ")
            .push_bind(id)
            .push(" RETURNING ")
            .push(column_list(schema));

        let updated = sql
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::from(e).during(StoreOperation::Update).with_table(schema.table))?;
        updated.map(|row| decode(schema, &row)).transpose()
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
        let mut sql: Sql = QueryBuilder::new("UPDATE ");
        sql.push(ident(schema.table))
            .push(" SET ")
            .push(ident(DELETED_COLUMN))
            .push(" = \"id\", ")
            .push(ident(DELETED_AT_COLUMN))
            .push(" = now(), \"updated_at\" = now()");
        push_where(&mut sql, schema, predicate);

        let done = sql
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from(e).during(StoreOperation::SoftDelete).with_table(schema.table))?;
        Ok(done.rows_affected())
    }

    async fn delete(&self, schema: &ResourceSchema, predicate: &Predicate) -> StoreResult<u64> {
        let mut sql: Sql = QueryBuilder::new("DELETE FROM ");
        sql.push(ident(schema.table));
        push_where(&mut sql, schema, predicate);

        let done = sql
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from(e).during(StoreOperation::Delete).with_table(schema.table))?;
        Ok(done.rows_affected())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
