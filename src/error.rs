use std::io;

use thiserror::Error;

use crate::pool::EndpointKey;

/// Failures surfaced by the keyed connection pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The factory could not open a connection to the collector.
    #[error("cannot connect to {key}: {source}")]
    Connect {
        key: EndpointKey,
        #[source]
        source: io::Error,
    },

    /// A per-key limit is configured and every slot is checked out.
    #[error("pool exhausted for {key} ({limit} connections active)")]
    Exhausted { key: EndpointKey, limit: usize },

    /// `close()` has been called; no further borrows are served.
    #[error("pool is closed")]
    Closed,
}

/// Setup-time failures of the reporting backend.
///
/// Flush-time problems never show up here: they are logged and counted
/// in [`FlushStats`](crate::sender::FlushStats) instead.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cannot resolve collector address {host}:{port}")]
    Resolve { host: String, port: u16 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("malformed JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BackendError>;
