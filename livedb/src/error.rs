use thiserror::Error;

#[derive(Error, Debug)]
pub enum LiveDbError {
    #[error("Incorrect database schema version: {actual} not {expected}")]
    SchemaVersionMismatch { actual: u32, expected: u32 },

    #[error("Database schema changed while executing: {sql}")]
    SchemaChanged { sql: String },

    #[error("Query {sql} failed: {message}")]
    QueryExecution { sql: String, message: String },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Transaction body failed: {0}")]
    TransactionBody(Box<LiveDbError>),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Model class not registered: {0}")]
    UnknownClass(String),

    #[error("Database is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

impl LiveDbError {
    /// The error raised by a transaction body, if this wraps one.
    pub fn body_error(&self) -> Option<&LiveDbError> {
        match self {
            LiveDbError::TransactionBody(inner) => Some(inner),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LiveDbError>;
