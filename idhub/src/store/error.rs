//! Storage error types
//!
//! Row stores report failures as [`StoreError`], which carries the operation
//! being performed and a coarse kind. The repository layer translates these
//! into domain errors; only the constraint kinds keep their meaning upward.
//!
//! # Example
//!
//! ```rust
//! use idhub::store::{StoreError, StoreErrorKind, StoreOperation};
//!
//! let error = StoreError::unique_violation(StoreOperation::Insert, "users_username_deleted_key")
//!     .with_table("users");
//! assert!(matches!(error.kind, StoreErrorKind::UniqueViolation));
//! assert_eq!(error.table.as_deref(), Some("users"));
//! ```

use std::fmt;

/// Operation being performed when the storage error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    /// Establishing a backend connection
    Connect,
    /// Acquiring a connection from the pool
    PoolAcquire,
    /// Reading rows
    Select,
    /// Counting rows
    Count,
    /// Inserting a row
    Insert,
    /// Updating a row
    Update,
    /// Flipping the deletion marker
    SoftDelete,
    /// Removing rows outright
    Delete,
    /// Running schema migrations
    Migration,
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::PoolAcquire => write!(f, "pool_acquire"),
            Self::Select => write!(f, "select"),
            Self::Count => write!(f, "count"),
            Self::Insert => write!(f, "insert"),
            Self::Update => write!(f, "update"),
            Self::SoftDelete => write!(f, "soft_delete"),
            Self::Delete => write!(f, "delete"),
            Self::Migration => write!(f, "migration"),
        }
    }
}

/// Category of storage error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    /// Unique constraint violated
    UniqueViolation,
    /// Foreign key constraint violated
    ForeignKeyViolation,
    /// Failed to connect to the backend
    ConnectionFailed,
    /// No pooled connection became available in time
    PoolExhausted,
    /// Operation timed out
    Timeout,
    /// Statement execution failed
    QueryFailed,
    /// Column value could not be decoded
    Decode,
    /// Other unclassified error
    Other,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UniqueViolation => write!(f, "unique_violation"),
            Self::ForeignKeyViolation => write!(f, "foreign_key_violation"),
            Self::ConnectionFailed => write!(f, "connection_failed"),
            Self::PoolExhausted => write!(f, "pool_exhausted"),
            Self::Timeout => write!(f, "timeout"),
            Self::QueryFailed => write!(f, "query_failed"),
            Self::Decode => write!(f, "decode"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Structured storage error with operation context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    /// The operation being performed when the error occurred
    pub operation: StoreOperation,
    /// The category of error
    pub kind: StoreErrorKind,
    /// Backend message, never shown to clients
    pub message: String,
    /// Table the operation targeted
    pub table: Option<String>,
}

impl StoreError {
    pub fn new(operation: StoreOperation, kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
            table: None,
        }
    }

    pub fn unique_violation(operation: StoreOperation, message: impl Into<String>) -> Self {
        Self::new(operation, StoreErrorKind::UniqueViolation, message)
    }

    pub fn foreign_key_violation(operation: StoreOperation, message: impl Into<String>) -> Self {
        Self::new(operation, StoreErrorKind::ForeignKeyViolation, message)
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(
            StoreOperation::Connect,
            StoreErrorKind::ConnectionFailed,
            message,
        )
    }

    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::new(
            StoreOperation::PoolAcquire,
            StoreErrorKind::PoolExhausted,
            message,
        )
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(StoreOperation::Select, StoreErrorKind::Decode, message)
    }

    /// Attach the table name
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Re-tag the operation, keeping the pool and connect phases intact
    pub fn during(mut self, operation: StoreOperation) -> Self {
        if !matches!(
            self.operation,
            StoreOperation::PoolAcquire | StoreOperation::Connect
        ) {
            self.operation = operation;
        }
        self
    }

    /// Transient errors that may succeed on retry
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind,
            StoreErrorKind::ConnectionFailed | StoreErrorKind::PoolExhausted | StoreErrorKind::Timeout
        )
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Storage {} error during {}: {}",
            self.kind, self.operation, self.message
        )?;
        if let Some(ref table) = self.table {
            write!(f, " [table: {}]", table)?;
        }
        Ok(())
    }
}

impl std::error::Error for StoreError {}

#[cfg(feature = "database")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error as E;
        match err {
            E::PoolTimedOut => Self::pool_exhausted("Connection pool timed out"),
            E::PoolClosed => Self::connection_failed("Connection pool is closed"),
            E::Io(e) => Self::connection_failed(e.to_string()),
            E::Tls(e) => Self::connection_failed(format!("TLS error: {}", e)),
            E::WorkerCrashed => Self::connection_failed("Database worker crashed"),
            E::ColumnDecode { index, source } => {
                Self::decode(format!("Failed to decode column {}: {}", index, source))
            }
            E::Decode(e) => Self::decode(e.to_string()),
            E::Migrate(e) => Self::new(
                StoreOperation::Migration,
                StoreErrorKind::QueryFailed,
                e.to_string(),
            ),
            E::Database(db_err) => {
                let kind = if db_err.is_unique_violation() {
                    StoreErrorKind::UniqueViolation
                } else if db_err.is_foreign_key_violation() {
                    StoreErrorKind::ForeignKeyViolation
                } else {
                    StoreErrorKind::QueryFailed
                };
                let mut error = Self::new(StoreOperation::Select, kind, db_err.to_string());
                if let Some(table) = db_err.table() {
                    error.table = Some(table.to_string());
                }
                error
            }
            other => Self::new(
                StoreOperation::Select,
                StoreErrorKind::Other,
                other.to_string(),
            ),
        }
    }
}

/// Remove credentials from a connection URL before it is logged
pub fn sanitize_url(url: &str) -> String {
    if let (Some(at_pos), Some(scheme_end)) = (url.rfind('@'), url.find("://")) {
        if at_pos > scheme_end {
            let scheme = &url[..scheme_end + 3];
            let after_at = &url[at_pos + 1..];
            return format!("{}<redacted>@{}", scheme, after_at);
        }
    }
    url.to_string()
}
