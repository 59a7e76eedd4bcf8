//! Error types for the evaluation gateway.
//!
//! Every variant is terminal for a run: the gateway never retries a case and
//! never emits a partial submission.

use std::path::PathBuf;
use std::time::Duration;

use evalgate_common::RowId;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Missing case file {path}: {reason}")]
    MissingFile { path: PathBuf, reason: String },

    #[error("Timeout waiting for prediction of {row_id} after {elapsed:?}")]
    Timeout { row_id: RowId, elapsed: Duration },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Predict failed for {row_id}: {message}")]
    Application { row_id: RowId, message: String },

    #[error("Invalid prediction for {row_id}: {reason}")]
    Validation { row_id: RowId, reason: String },

    #[error("Submission integrity check failed: {0}")]
    SubmissionIntegrity(String),

    #[error("Test index error: {0}")]
    TestIndex(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub(crate) fn missing_file(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        GatewayError::MissingFile {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Row identifier of the case the error is attributed to, if any.
    pub fn row_id(&self) -> Option<&RowId> {
        match self {
            GatewayError::Timeout { row_id, .. }
            | GatewayError::Application { row_id, .. }
            | GatewayError::Validation { row_id, .. } => Some(row_id),
            _ => None,
        }
    }
}

impl From<csv::Error> for GatewayError {
    fn from(e: csv::Error) -> Self {
        GatewayError::TestIndex(e.to_string())
    }
}

impl From<config::ConfigError> for GatewayError {
    fn from(e: config::ConfigError) -> Self {
        GatewayError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
