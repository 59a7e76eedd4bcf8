//! Predictor abstraction layer.
//!
//! This module defines the `Predictor` trait the server invokes once per
//! case. Implementations must watch the cancellation token: the server
//! cancels it when the gateway abandons a request, a newer request
//! supersedes it, the session ends, or the server deadline passes.

mod command;

pub use command::CommandPredictor;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use evalgate_common::{BatchPayload, Prediction};

use crate::error::Result;

/// A competitor's predict callable.
#[async_trait]
pub trait Predictor: Send + Sync {
    /// Short name used in logs and the health endpoint.
    fn name(&self) -> &str;

    /// Produce a prediction for one case.
    async fn predict(&self, args: &BatchPayload, cancel: CancellationToken) -> Result<Prediction>;
}
