//! Error types for the graphrag core library.

/// Top-level error enum for the graphrag core library.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// A single source file could not be parsed.  Recovered by the indexers.
    #[error("Parse error in {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A row write for one file failed inside a commit transaction.  The
    /// whole transaction has been rolled back.
    #[error("Failed to write rows for {path}: {source}")]
    RowWrite {
        path: String,
        #[source]
        source: Box<GraphError>,
    },

    #[error("Manifest error in {path}: {message}")]
    Manifest { path: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Indexing run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GraphError {
    pub fn parse(path: impl Into<String>, message: impl Into<String>) -> Self {
        GraphError::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn repository(message: impl Into<String>) -> Self {
        GraphError::Repository(message.into())
    }

    /// True for failures that abort the current indexing run.  Constraint
    /// violations and unconvertible values are local to the rows being
    /// written; every other SQLite failure (I/O, full disk, busy) is not.
    pub fn is_fatal(&self) -> bool {
        match self {
            GraphError::Parse { .. } | GraphError::Manifest { .. } | GraphError::Json(_) => false,
            GraphError::Sqlite(err) => !is_row_level(err),
            GraphError::RowWrite { source, .. } => source.is_fatal(),
            _ => true,
        }
    }
}

fn is_row_level(err: &rusqlite::Error) -> bool {
    use rusqlite::Error;
    match err {
        Error::SqliteFailure(failure, _) => {
            failure.code == rusqlite::ErrorCode::ConstraintViolation
        }
        Error::ToSqlConversionFailure(_)
        | Error::FromSqlConversionFailure(..)
        | Error::IntegralValueOutOfRange(..)
        | Error::InvalidColumnType(..) => true,
        _ => false,
    }
}

#[cfg(feature = "python")]
impl From<GraphError> for pyo3::PyErr {
    fn from(err: GraphError) -> pyo3::PyErr {
        use pyo3::exceptions::{PyIOError, PyRuntimeError, PyValueError};
        match &err {
            GraphError::Io(_) => PyIOError::new_err(err.to_string()),
            GraphError::Parse { .. }
            | GraphError::Manifest { .. }
            | GraphError::Config(_)
            | GraphError::Json(_) => PyValueError::new_err(err.to_string()),
            _ => PyRuntimeError::new_err(err.to_string()),
        }
    }
}

pub type GraphResult<T> = Result<T, GraphError>;
