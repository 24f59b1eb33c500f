use thiserror::Error;

/// Errors surfaced by the store. Callers in `taskdaemon` generally wrap these
/// in `eyre::Context` at the application boundary and log-and-continue at the
/// driver boundary (persistence failures are an Environment-class error, not
/// process-fatal).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("record not found: {collection}/{id}")]
    NotFound { collection: &'static str, id: String },

    #[error("conditional update failed: {collection}/{id} was not in the expected state")]
    ConditionFailed { collection: &'static str, id: String },

    #[error("store directory is not writable: {0}")]
    NotWritable(String),
}
