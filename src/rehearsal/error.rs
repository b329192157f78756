//! Rehearsal error types.

use thiserror::Error;

/// Errors that reject a client request. None of these end a session.
#[derive(Debug, Error)]
pub enum RehearsalError {
    #[error("script_id is required")]
    MissingScript,

    #[error("unknown rehearsal mode: {0}")]
    UnknownMode(String),

    #[error("failed to load script {script_id}: {message}")]
    ScriptLoad { script_id: String, message: String },

    #[error("connection closed")]
    ConnectionClosed,
}

impl RehearsalError {
    pub(crate) fn script_load(script_id: &str, err: &anyhow::Error) -> Self {
        Self::ScriptLoad {
            script_id: script_id.to_string(),
            message: format!("{:#}", err),
        }
    }
}

/// Inbound frames that could not be decoded.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("binary frames are not supported")]
    Binary,
}
