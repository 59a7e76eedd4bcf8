//! Gateway driving loop and its channel to the inference server.
//!
//! This module provides:
//! - The [`Gateway`] run loop (shuffle, share, dispatch, validate, seal)
//! - The [`Transport`] seam with its WebSocket implementation

mod runner;
mod transport;
mod ws;

pub use runner::{Gateway, RunReport};
pub use transport::{PredictRequest, Reply, Transport};
pub use ws::WsTransport;
