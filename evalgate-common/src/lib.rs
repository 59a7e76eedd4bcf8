//! evalgate Common Types
//!
//! Shared types used by both the inference server and the evaluation gateway.

pub mod payload;
pub mod protocol;

pub use payload::{BatchPayload, Prediction, PredictionRecord, RowId};
pub use protocol::{ErrorCode, GatewayMessage, ServerMessage, PROTOCOL_VERSION};
