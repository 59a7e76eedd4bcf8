//! Request/response channel to the inference server.

use async_trait::async_trait;
use uuid::Uuid;

use evalgate_common::{BatchPayload, ErrorCode, Prediction};

use crate::error::Result;

/// One case as sent over the wire. The row identifier is deliberately absent.
#[derive(Debug, Clone)]
pub struct PredictRequest {
    pub request_id: String,
    pub args: BatchPayload,
}

impl PredictRequest {
    /// New request with a fresh, unique request id.
    pub fn new(args: BatchPayload) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            args,
        }
    }
}

/// Server's answer to a [`PredictRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Prediction {
        prediction: Prediction,
        elapsed_ms: u64,
    },
    /// Structured error reported by the server for this request.
    Failed { code: ErrorCode, message: String },
}

/// A channel that carries exactly one exchange at a time.
///
/// Broken channels (crash, closed socket, malformed frames) are reported as
/// `GatewayError::Transport`. Replies belonging to other requests must never
/// be returned from [`exchange`](Transport::exchange).
#[async_trait]
pub trait Transport: Send {
    /// Send `request` and wait for its reply.
    async fn exchange(&mut self, request: &PredictRequest) -> Result<Reply>;

    /// Tell the server a request was abandoned. Best effort.
    async fn cancel(&mut self, request_id: &str) -> Result<()>;

    /// Close the channel.
    async fn close(&mut self) -> Result<()>;
}
