use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The lookup sentinel. Callers that treat absence as normal match on
    /// this variant instead of logging it.
    #[error("key not found: {bucket}/{key}")]
    KeyNotFound { bucket: String, key: String },

    #[error("bucket '{0}' was never created")]
    UnknownBucket(String),

    #[error("store is closed")]
    Closed,

    #[error("write confirm failed for {bucket}/{key}")]
    ConfirmFailed { bucket: String, key: String },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, StoreError::KeyNotFound { .. })
    }
}
