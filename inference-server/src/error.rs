//! Error types for the inference server.

use evalgate_common::ErrorCode;
use evalgate_gateway::GatewayError;

/// Error types for serving and invoking the predictor.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Predictor failed: {0}")]
    Predictor(String),

    #[error("Failed to start predictor: {0}")]
    Spawn(String),

    #[error("Predictor produced invalid output: {0}")]
    InvalidOutput(String),

    #[error("Prediction cancelled")]
    Cancelled,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl Error {
    /// Wire code reported to the gateway for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Predictor(_) | Error::Spawn(_) | Error::InvalidOutput(_) | Error::Cancelled => {
                ErrorCode::Application
            }
            Error::Protocol(_) => ErrorCode::Protocol,
            Error::Config(_) | Error::Internal(_) | Error::Io(_) | Error::Gateway(_) => {
                ErrorCode::Internal
            }
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predictor_failures_are_application_errors() {
        assert_eq!(Error::Predictor("x".into()).code(), ErrorCode::Application);
        assert_eq!(Error::InvalidOutput("x".into()).code(), ErrorCode::Application);
        assert_eq!(Error::Spawn("x".into()).code(), ErrorCode::Application);
    }

    #[test]
    fn test_server_faults_are_not_application_errors() {
        assert_eq!(Error::Protocol("x".into()).code(), ErrorCode::Protocol);
        assert_eq!(Error::Internal("x".into()).code(), ErrorCode::Internal);
    }
}
