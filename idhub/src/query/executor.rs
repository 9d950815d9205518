//! Paginated query execution
//!
//! Combines a compiled [`Predicate`], a normalized [`SortSpec`], soft-delete
//! visibility and a [`PageWindow`] into a [`QueryPlan`] and runs it against a
//! [`RowStore`]. Everything that can be rejected is rejected before the
//! store is contacted.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::query::{
    ComparisonOp, DeletedMode, Marker, MatchClause, PageWindow, Predicate, SortDirection, SortSpec,
};
use crate::schema::{ResourceSchema, SchemaRegistry, DELETED_COLUMN, VISIBLE_SENTINEL};
use crate::store::{RowStore, StoreOperation};
use crate::value::{Record, Value};

/// A fully validated query ready for a store
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    /// Filter clauses with the visibility clause appended
    pub predicate: Predicate,
    pub sort: SortSpec,
    pub limit: Option<u64>,
    pub offset: u64,
    /// Rows resume strictly after this row under `sort`
    pub marker: Option<Record>,
    /// Keep only the first row per value of this column
    pub distinct_on: Option<String>,
}

impl QueryPlan {
    /// Unbounded plan over a predicate, ordered by id
    pub fn scan(predicate: Predicate) -> Self {
        Self {
            predicate,
            sort: SortSpec::new([("id", SortDirection::Asc)]),
            limit: None,
            offset: 0,
            marker: None,
            distinct_on: None,
        }
    }
}

/// Rows or a row count
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Rows(Vec<Record>),
    Count(u64),
}

/// One request to the executor
#[derive(Debug, Clone)]
pub struct Execution<'a> {
    pub schema: &'a ResourceSchema,
    pub predicate: Predicate,
    pub sort: SortSpec,
    pub window: &'a PageWindow,
    pub read_deleted: DeletedMode,
    /// Relation names to attach to each row
    pub eager: &'a [String],
    pub count_only: bool,
}

/// Runs paginated queries against an injected row store
#[derive(Clone)]
pub struct PaginatedQueryExecutor {
    store: Arc<dyn RowStore>,
    registry: Arc<SchemaRegistry>,
}

impl PaginatedQueryExecutor {
    pub fn new(store: Arc<dyn RowStore>, registry: Arc<SchemaRegistry>) -> Self {
        Self { store, registry }
    }

    pub async fn execute(&self, request: Execution<'_>) -> Result<QueryOutcome> {
        let empty = || {
            if request.count_only {
                QueryOutcome::Count(0)
            } else {
                QueryOutcome::Rows(Vec::new())
            }
        };

        if request.window.is_empty() {
            debug!(table = request.schema.table, "Zero limit, skipping storage");
            return Ok(empty());
        }

        let schema = request.schema;
        let mut plan = self.plan(
            schema,
            request.predicate,
            request.sort,
            request.window,
            request.read_deleted,
        )?;
        let relations = request
            .eager
            .iter()
            .map(|relation| {
                schema.foreign_key_for_relation(relation).cloned().ok_or_else(|| {
                    Error::InvalidInput(format!("{} has no relation '{}'", schema.kind, relation))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if let Some(Marker::Id(id)) = request.window.marker {
            plan.marker = Some(self.resolve_marker(schema, id).await?);
        }

        debug!(
            table = schema.table,
            clauses = plan.predicate.clauses().len(),
            sort = ?plan.sort.keys(),
            limit = ?plan.limit,
            offset = plan.offset,
            keyset = plan.marker.is_some(),
            count_only = request.count_only,
            "Executing paginated query"
        );

        if request.count_only {
            let count = self
                .store
                .count(schema, &plan)
                .await
                .map_err(|e| e.during(StoreOperation::Count).with_table(schema.table))?;
            return Ok(QueryOutcome::Count(count));
        }

        let mut rows = self
            .store
            .select(schema, &plan)
            .await
            .map_err(|e| e.during(StoreOperation::Select).with_table(schema.table))?;

        for fk in relations {
            let target = self.registry.get(fk.references)?;
            self.attach_related(&mut rows, fk.column, fk.relation, &target)
                .await?;
        }

        Ok(QueryOutcome::Rows(rows))
    }

    pub async fn fetch(&self, request: Execution<'_>) -> Result<Vec<Record>> {
        match self.execute(Execution {
            count_only: false,
            ..request
        })
        .await?
        {
            QueryOutcome::Rows(rows) => Ok(rows),
            QueryOutcome::Count(_) => Err(Error::Internal("expected rows, got a count".into())),
        }
    }

    pub async fn count(&self, request: Execution<'_>) -> Result<u64> {
        match self.execute(Execution {
            count_only: true,
            ..request
        })
        .await?
        {
            QueryOutcome::Count(count) => Ok(count),
            QueryOutcome::Rows(_) => Err(Error::Internal("expected a count, got rows".into())),
        }
    }

    /// Validate a request and build its plan without touching storage
    pub fn plan(
        &self,
        schema: &ResourceSchema,
        mut predicate: Predicate,
        mut sort: SortSpec,
        window: &PageWindow,
        read_deleted: DeletedMode,
    ) -> Result<QueryPlan> {
        if let Some(clause) = visibility_clause(schema, read_deleted)? {
            predicate.push(clause);
        }

        for key in sort.keys() {
            if !schema.has_column(key) {
                return Err(Error::InvalidSortKey(format!(
                    "{} has no column '{}'",
                    schema.kind, key
                )));
            }
        }

        if let Some(column) = &window.distinct_on {
            if !schema.has_column(column) {
                return Err(Error::InvalidInput(format!(
                    "cannot select distinct on unknown column '{}'",
                    column
                )));
            }
            sort.lead_with(column);
        }

        let marker = match &window.marker {
            Some(Marker::Row(row)) => Some(marker_keys(schema, &sort, row)?),
            _ => None,
        };

        Ok(QueryPlan {
            predicate,
            sort,
            limit: window.effective_limit(),
            offset: window.offset(),
            marker,
            distinct_on: window.distinct_on.clone(),
        })
    }

    async fn resolve_marker(&self, schema: &ResourceSchema, id: i64) -> Result<Record> {
        let plan = QueryPlan {
            limit: Some(1),
            ..QueryPlan::scan(Predicate::all().and(MatchClause::Exact {
                field: "id".into(),
                value: Value::Int(id),
            }))
        };
        let rows = self
            .store
            .select(schema, &plan)
            .await
            .map_err(|e| e.during(StoreOperation::Select).with_table(schema.table))?;
        rows.into_iter()
            .next()
            .ok_or_else(|| Error::InvalidInput(format!("marker {} could not be found", id)))
    }

    async fn attach_related(
        &self,
        rows: &mut [Record],
        column: &str,
        relation: &str,
        target: &ResourceSchema,
    ) -> Result<()> {
        let ids: BTreeSet<i64> = rows.iter().filter_map(|r| r.get_i64(column)).collect();
        if ids.is_empty() {
            return Ok(());
        }

        let plan = QueryPlan::scan(Predicate::all().and(MatchClause::ExactIn {
            field: "id".into(),
            values: ids.into_iter().map(Value::Int).collect(),
            negate: false,
        }));
        let related: HashMap<i64, Record> = self
            .store
            .select(target, &plan)
            .await
            .map_err(|e| e.during(StoreOperation::Select).with_table(target.table))?
            .into_iter()
            .filter_map(|r| r.id().map(|id| (id, r)))
            .collect();

        debug!(
            table = target.table,
            relation,
            loaded = related.len(),
            "Eager-loaded related rows"
        );

        for row in rows.iter_mut() {
            if let Some(found) = row.get_i64(column).and_then(|id| related.get(&id)) {
                row.attach(relation, found.clone());
            }
        }
        Ok(())
    }
}

/// Sort-key values of a caller-supplied marker, typed like their columns
///
/// Markers echoed back over the wire carry timestamps as text.
fn marker_keys(schema: &ResourceSchema, sort: &SortSpec, row: &Record) -> Result<Record> {
    let mut marker = Record::new();
    for key in sort.keys() {
        let value = row.get(key).ok_or_else(|| {
            Error::InvalidSortKey(format!("marker row has no value for sort key '{}'", key))
        })?;
        let column = schema.get_column(key).ok_or_else(|| {
            Error::InvalidSortKey(format!("{} has no column '{}'", schema.kind, key))
        })?;
        let typed = value.coerce(column.ty).ok_or_else(|| {
            Error::InvalidInput(format!(
                "marker value for '{}' is not a valid {}",
                key, column.ty
            ))
        })?;
        marker.set(key, typed);
    }
    Ok(marker)
}

/// Final predicate for a soft-delete mode
pub(crate) fn visibility_clause(
    schema: &ResourceSchema,
    mode: DeletedMode,
) -> Result<Option<MatchClause>> {
    if !schema.soft_delete {
        return match mode {
            DeletedMode::Yes => Ok(None),
            other => Err(Error::Configuration(format!(
                "{} has no deletion marker, read_deleted={} is unsupported",
                schema.table, other
            ))),
        };
    }

    Ok(match mode {
        DeletedMode::No => Some(MatchClause::Exact {
            field: DELETED_COLUMN.into(),
            value: Value::Int(VISIBLE_SENTINEL),
        }),
        DeletedMode::Only => Some(MatchClause::Comparison {
            field: DELETED_COLUMN.into(),
            op: ComparisonOp::Ne,
            operand: Value::Int(VISIBLE_SENTINEL),
            operand2: None,
        }),
        DeletedMode::Yes => None,
    })
}
