//! Error types and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::store::{StoreError, StoreErrorKind};

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the identity backend
///
/// Every storage and cache failure is translated into one of these variants
/// before it leaves a repository or the token store.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Unique constraint violation
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Zero rows or keys matched
    #[error("{0} not found")]
    NotFound(String),

    /// Foreign key constraint blocked the write
    #[error("Reference failure: {0}")]
    ReferenceFailure(String),

    /// Sort key is not a column, or a marker row lacks a sort column
    #[error("Invalid sort key: {0}")]
    InvalidSortKey(String),

    /// Sort direction other than `asc` / `desc`
    #[error("Invalid sort direction: {0}")]
    InvalidSortDirection(String),

    /// Malformed filter, sort or page request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Filter names a field that does not exist on the resource
    #[error("Invalid filter field: {0}")]
    InvalidFilterField(String),

    /// Resource schema does not support the requested operation
    #[error("Schema configuration error: {0}")]
    Configuration(String),

    /// Session token is absent from the cache
    #[error("Session token has expired")]
    Expired,

    /// Unknown user or wrong password
    #[error("Incorrect username or password")]
    IncorrectCredentials,

    /// Caller may not perform the operation
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Password rejected by the hasher policy
    #[error("Password too weak: {0}")]
    PasswordTooWeak(String),

    /// Backend exhausted or unexpected failure
    #[error("Internal failure: {0}")]
    Internal(String),
}

/// Tagged error kind carried across the request boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AlreadyExists,
    NotFound,
    ReferenceFailure,
    InvalidSortKey,
    InvalidSortDirection,
    InvalidInput,
    InvalidFilterField,
    Configuration,
    Expired,
    IncorrectCredentials,
    PermissionDenied,
    PasswordTooWeak,
    Internal,
}

impl ErrorKind {
    /// Stable numeric return code exposed to clients
    pub fn code(self) -> u32 {
        match self {
            Self::Internal | Self::InvalidSortKey | Self::Configuration => 1000,
            Self::InvalidInput | Self::InvalidSortDirection | Self::InvalidFilterField => 1002,
            Self::AlreadyExists => 1003,
            Self::NotFound => 1004,
            Self::ReferenceFailure => 1005,
            Self::Expired => 1006,
            Self::IncorrectCredentials => 1007,
            Self::PermissionDenied => 1008,
            Self::PasswordTooWeak => 1009,
        }
    }

    /// HTTP status used when the error reaches a handler
    pub fn status(self) -> StatusCode {
        match self {
            Self::AlreadyExists | Self::ReferenceFailure => StatusCode::CONFLICT,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::InvalidSortKey
            | Self::InvalidSortDirection
            | Self::InvalidInput
            | Self::InvalidFilterField
            | Self::PasswordTooWeak => StatusCode::BAD_REQUEST,
            Self::Expired | Self::IncorrectCredentials => StatusCode::UNAUTHORIZED,
            Self::PermissionDenied => StatusCode::FORBIDDEN,
            Self::Configuration | Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "already_exists"),
            Self::NotFound => write!(f, "not_found"),
            Self::ReferenceFailure => write!(f, "reference_failure"),
            Self::InvalidSortKey => write!(f, "invalid_sort_key"),
            Self::InvalidSortDirection => write!(f, "invalid_sort_direction"),
            Self::InvalidInput => write!(f, "invalid_input"),
            Self::InvalidFilterField => write!(f, "invalid_filter_field"),
            Self::Configuration => write!(f, "configuration"),
            Self::Expired => write!(f, "expired"),
            Self::IncorrectCredentials => write!(f, "incorrect_credentials"),
            Self::PermissionDenied => write!(f, "permission_denied"),
            Self::PasswordTooWeak => write!(f, "password_too_weak"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

impl Error {
    /// The tagged kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::Configuration(_) => ErrorKind::Configuration,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::ReferenceFailure(_) => ErrorKind::ReferenceFailure,
            Self::InvalidSortKey(_) => ErrorKind::InvalidSortKey,
            Self::InvalidSortDirection(_) => ErrorKind::InvalidSortDirection,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::InvalidFilterField(_) => ErrorKind::InvalidFilterField,
            Self::Expired => ErrorKind::Expired,
            Self::IncorrectCredentials => ErrorKind::IncorrectCredentials,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::PasswordTooWeak(_) => ErrorKind::PasswordTooWeak,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable numeric return code
    pub fn code(&self) -> u32 {
        self.kind().code()
    }

    /// Message safe to hand to a client
    fn public_message(&self) -> String {
        match self {
            Self::Config(_) | Self::Configuration(_) => "Service misconfigured".to_string(),
            Self::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Numeric return code
    pub retcode: u32,

    /// Error message
    pub error: String,

    /// HTTP status code
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(status: StatusCode, retcode: u32, error: impl Into<String>) -> Self {
        Self {
            retcode,
            error: error.into(),
            status: status.as_u16(),
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.retcode, self.error)
    }
}

impl From<&Error> for ErrorResponse {
    fn from(err: &Error) -> Self {
        let kind = err.kind();
        Self::new(kind.status(), kind.code(), err.public_message())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let kind = self.kind();
        match kind {
            ErrorKind::Internal | ErrorKind::Configuration => {
                tracing::error!(kind = %kind, code = kind.code(), "Request failed: {}", self);
            }
            _ => {
                tracing::debug!(kind = %kind, code = kind.code(), "Request rejected: {}", self);
            }
        }

        let body = ErrorResponse::from(&self);
        (kind.status(), Json(body)).into_response()
    }
}

// Manual From implementations for boxed errors
impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        let subject = err.table.clone().unwrap_or_else(|| "record".to_string());
        match err.kind {
            StoreErrorKind::UniqueViolation => Error::AlreadyExists(subject),
            StoreErrorKind::ForeignKeyViolation => Error::ReferenceFailure(format!(
                "{} is referenced by or references a missing row",
                subject
            )),
            _ => {
                tracing::error!(
                    operation = %err.operation,
                    kind = %err.kind,
                    table = ?err.table,
                    retriable = err.is_retriable(),
                    "Storage error: {}", err.message
                );
                Error::Internal(format!("storage {} failed", err.operation))
            }
        }
    }
}
