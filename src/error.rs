use thiserror::Error;

#[derive(Error, Debug)]
pub enum PolystoreError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Unknown operator: {0}")]
    UnknownOperator(String),
    #[error("Shape error: {operator} {message}")]
    Shape { operator: String, message: String },
    #[error("Connective error: {0}")]
    Connective(String),
    #[error("Unsupported by the {backend} backend: {message}")]
    Unsupported { backend: &'static str, message: String },
    #[error("Parameter count mismatch: expected {expected}, got {found}")]
    ParameterCount { expected: usize, found: usize },
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),
    #[error("Invalid parameter name: {0}")]
    InvalidParameterName(String),
    #[error("Invalid range: {0}")]
    Range(String),
    #[error("Unknown table: {0}")]
    UnknownTable(String),
    #[error("Unknown column {column} in {table}")]
    UnknownColumn { table: String, column: String },
    #[error("Data corruption: {message}")]
    DataCorruption { message: String },
    #[error("Backend error in {backend}: {source}")]
    Backend {
        backend: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Lock poisoned: {0}")]
    Lock(String),
    #[error("Query is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, PolystoreError>;

impl PolystoreError {
    pub(crate) fn shape(operator: impl ToString, message: impl Into<String>) -> Self {
        Self::Shape { operator: operator.to_string(), message: message.into() }
    }
    pub(crate) fn unsupported(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Unsupported { backend, message: message.into() }
    }
    pub(crate) fn backend<E>(backend: &'static str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend { backend, source: Box::new(source) }
    }
}

// Helper conversions
impl From<rusqlite::Error> for PolystoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::backend("relational", e)
    }
}
impl From<serde_json::Error> for PolystoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::backend("document", e)
    }
}
impl From<regex::Error> for PolystoreError {
    fn from(e: regex::Error) -> Self {
        Self::shape("LIKE", e.to_string())
    }
}
impl From<config::ConfigError> for PolystoreError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
