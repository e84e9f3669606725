use std::fmt;

/// Typed error for every component of the pipeline and query engine.
///
/// Generalizes the single-message `MyError` the rest of this crate's
/// ancestry used everywhere: callers that need to branch on error kind
/// (the HTTP layer mapping to a status code, the orchestrator choosing
/// an exit code) can match on the variant instead of parsing a string.
#[derive(Debug)]
pub enum IndexerError {
    /// A request to the node failed but may succeed on retry.
    Transport(String),
    /// The node returned a non-200, non-retryable status.
    PermanentHttp { status: u16, message: String },
    /// Retry budget exhausted without a successful response.
    RetryExhausted(String),
    /// Caller-supplied argument is invalid (unknown coin, bad address, ...).
    InvalidArgument(String),
    /// Data read back from the store or node violates an expected shape.
    InvalidData(String),
    /// A requested key does not exist.
    NotFound(String),
    /// The key-value store returned an error.
    Store(String),
    /// Filesystem or process I/O failure.
    Io(String),
    /// JSON (de)serialization failure.
    Serde(String),
}

impl fmt::Display for IndexerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexerError::Transport(m) => write!(f, "transport error: {m}"),
            IndexerError::PermanentHttp { status, message } => {
                write!(f, "http {status}: {message}")
            }
            IndexerError::RetryExhausted(m) => write!(f, "retry budget exhausted: {m}"),
            IndexerError::InvalidArgument(m) => write!(f, "invalid argument: {m}"),
            IndexerError::InvalidData(m) => write!(f, "invalid data: {m}"),
            IndexerError::NotFound(m) => write!(f, "not found: {m}"),
            IndexerError::Store(m) => write!(f, "store error: {m}"),
            IndexerError::Io(m) => write!(f, "io error: {m}"),
            IndexerError::Serde(m) => write!(f, "serialization error: {m}"),
        }
    }
}

impl std::error::Error for IndexerError {}

impl From<std::io::Error> for IndexerError {
    fn from(e: std::io::Error) -> Self {
        IndexerError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(e: serde_json::Error) -> Self {
        IndexerError::Serde(e.to_string())
    }
}

impl From<rocksdb::Error> for IndexerError {
    fn from(e: rocksdb::Error) -> Self {
        IndexerError::Store(e.to_string())
    }
}

impl From<reqwest::Error> for IndexerError {
    fn from(e: reqwest::Error) -> Self {
        IndexerError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IndexerError>;
