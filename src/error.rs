use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sub-classification of statement failures reported by the query engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlErrorKind {
    Syntax,
    UndefinedTable,
    UndefinedSchema,
    UndefinedColumn,
    DuplicateObject,
    ConstraintViolation,
    TypeMismatch,
    Execution,
}

#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("operation not permitted: {0}")]
    OperationNotPermitted(String),
    #[error("branching is not enabled: {0}")]
    BranchingNotEnabled(String),
    #[error("merge conflict on '{resource}': {message}")]
    MergeConflict { resource: String, message: String },
    #[error("rebase conflict on migration '{migration}': {message}")]
    RebaseConflict { migration: String, message: String },
    #[error("migration '{name}' ({version}) failed: {message}")]
    Migration {
        name: String,
        version: String,
        message: String,
    },
    #[error("sql error: {message}")]
    Sql { kind: SqlErrorKind, message: String },
    #[error("database connection error: {0}")]
    DatabaseConnection(String),
    #[error("internal error: {0}")]
    Api(String),
}

pub type Result<T, E = PlatformError> = std::result::Result<T, E>;

impl PlatformError {
    pub fn not_found(kind: &str, id: &str) -> Self {
        PlatformError::NotFound(format!("{} '{}' not found", kind, id))
    }

    pub fn sql(kind: SqlErrorKind, message: impl Into<String>) -> Self {
        PlatformError::Sql {
            kind,
            message: message.into(),
        }
    }

    /// Kind of a statement failure, if this is one
    pub fn sql_kind(&self) -> Option<SqlErrorKind> {
        match self {
            PlatformError::Sql { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            PlatformError::MergeConflict { .. } | PlatformError::RebaseConflict { .. }
        )
    }
}

impl From<serde_json::Error> for PlatformError {
    fn from(err: serde_json::Error) -> Self {
        PlatformError::Validation(format!("malformed document: {}", err))
    }
}

impl From<std::io::Error> for PlatformError {
    fn from(err: std::io::Error) -> Self {
        PlatformError::Api(format!("i/o failure: {}", err))
    }
}
