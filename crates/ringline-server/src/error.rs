use thiserror::Error;

use ringline_store::StoreError;

#[derive(Error, Debug)]
pub enum ServerError {
    /// Returned by [`crate::endpoint::SignalingEndpoint::write`] when the
    /// socket has already gone offline.
    #[error("Write not connected")]
    WriteNotConnected,

    /// The callee behind a global id has already signed off; expected
    /// during teardown races and usually suppressed by callers.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("TLS setup error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub fn is_key_not_found(&self) -> bool {
        match self {
            ServerError::KeyNotFound(_) => true,
            ServerError::Store(e) => e.is_key_not_found(),
            _ => false,
        }
    }
}
