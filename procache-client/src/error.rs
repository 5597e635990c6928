//! Client-side error types.

use procache_core::{CacheError, ConfigError, ProcacheError};

/// Errors surfaced by the client runtime: fetch, socket, and wiring.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Core(#[from] ProcacheError),

    /// The in-flight request this call coalesced onto failed; the owner
    /// saw the original error.
    #[error("Coalesced fetch failed: {message}")]
    CoalescedFetch { message: String },

    /// The in-flight request this call coalesced onto went away without
    /// producing a result.
    #[error("Coalesced fetch for {key} was abandoned")]
    FetchAbandoned { key: String },
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

/// Result type alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
