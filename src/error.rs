use thiserror::Error;

#[derive(Error, Debug)]
pub enum MalloyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("A connection named '{0}' already exists")]
    DuplicateConnectionName(String),

    #[error("Query selection error: {0}")]
    QuerySelection(String),

    #[error("Compile error: {0}")]
    Compile(String),

    #[error("Query execution error: {0}")]
    Execution(String),

    #[error("{0}")]
    Usage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl MalloyError {
    /// Process exit code for this error. Usage errors follow clap's convention.
    pub fn exit_code(&self) -> i32 {
        match self {
            MalloyError::Usage(_) => 2,
            _ => 1,
        }
    }
}

pub type MalloyResult<T> = Result<T, MalloyError>;
