//! Filtered, sorted and paginated reads
//!
//! The pipeline is [`FilterCompiler`] → [`SortNormalizer`] →
//! [`PaginatedQueryExecutor`]. Compilation and normalization are pure; only
//! the executor talks to storage.

mod executor;
mod filter;
mod page;
mod sort;

pub(crate) use executor::visibility_clause;
pub use executor::{Execution, PaginatedQueryExecutor, QueryOutcome, QueryPlan};
pub use filter::{
    ComparisonOp, FilterCompiler, FilterSpec, FilterValue, MatchClause, Predicate, RegexTerm,
    NEGATE_SENTINEL,
};
pub use page::{DeletedMode, ListQuery, Marker, PageWindow, DEFAULT_PAGE_SIZE};
pub use sort::{SortDirection, SortKey, SortNormalizer, SortSpec};
