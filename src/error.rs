//! Crate-wide error types.
//!
//! Mirrors the six error kinds from the coordination design: protocol,
//! timing, transport, stage, S3-operation and persistence failures. Library
//! code returns `WarpcoreError` where the caller might reasonably want to
//! match on the failure kind (handshake, stage RPCs, aggregation); the CLI
//! binary and test helpers work in terms of `anyhow::Result` instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WarpcoreError {
    /// Malformed frame, version mismatch, or a conflicting coordinator id.
    /// Fatal to the session that raised it.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Clock skew between coordinator and agent exceeded the bound at
    /// handshake time. Fatal to the whole run.
    #[error("timing error: {0}")]
    Timing(String),

    /// Socket read/write failure. Recoverable at the connection-pool layer
    /// via a single in-call reconnect.
    #[error("transport error: {0}")]
    Transport(String),

    /// A workload module's `Prepare`/`Start`/`Cleanup` stage returned an
    /// error.
    #[error("stage error: {0}")]
    Stage(String),

    /// Recorded on an individual OpLog; never propagated as a Rust error in
    /// normal operation, but representable for tooling that inspects a log.
    #[error("s3 operation error: {0}")]
    S3Operation(String),

    /// Inability to create, write, or compress an output file.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl From<std::io::Error> for WarpcoreError {
    fn from(e: std::io::Error) -> Self {
        WarpcoreError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for WarpcoreError {
    fn from(e: serde_json::Error) -> Self {
        WarpcoreError::Protocol(format!("json: {e}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for WarpcoreError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        WarpcoreError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WarpcoreError>;
