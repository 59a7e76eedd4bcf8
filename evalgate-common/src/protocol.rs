//! WebSocket protocol types for gateway-server communication.
//!
//! This module defines the message format exchanged between the evaluation
//! gateway and the inference server hosting a competitor's predict callable.
//!
//! # Protocol Overview
//!
//! The protocol uses JSON-encoded text frames over WebSocket. Each message has
//! a `type` field that determines its structure.
//!
//! ## Session Flow
//!
//! 1. Gateway connects to the server's `/ws` endpoint
//! 2. Gateway sends `Hello` with its protocol version and a fresh session id
//! 3. Server responds with `HelloAck` on success or `Error` on failure
//! 4. For each case, gateway sends `Predict` and waits for a `Prediction` or
//!    `Error` carrying the same `request_id`
//! 5. Gateway may send `Cancel` for a request it has given up on
//!
//! ## Stale Replies
//!
//! Every `Predict` carries a unique `request_id`. A reply whose id does not
//! match the request currently awaited belongs to an abandoned exchange and
//! must be discarded by the receiver.
//!
//! The row identifier of a case never crosses this boundary: the server only
//! sees the (sandboxed) batch payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BatchPayload, Prediction};

/// Protocol version constant.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from gateway to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    /// Opens a session.
    Hello {
        protocol_version: u32,
        session_id: String,
        started_at: DateTime<Utc>,
    },
    /// One evaluation case.
    Predict {
        request_id: String,
        args: BatchPayload,
    },
    /// The gateway abandoned this request; no reply is expected.
    Cancel { request_id: String },
}

/// Messages sent from server to gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledgment of a successful handshake.
    HelloAck {
        server_name: String,
        protocol_version: u32,
    },
    /// Successful prediction for a request.
    Prediction {
        request_id: String,
        prediction: Prediction,
        /// Server-side time spent inside the predict callable.
        elapsed_ms: u64,
    },
    /// Structured error. `request_id` is absent for session-level errors.
    Error {
        #[serde(default)]
        request_id: Option<String>,
        code: ErrorCode,
        message: String,
    },
}

/// Machine-readable error classes reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The competitor's predict callable failed.
    Application,
    /// The predict callable did not finish within the server's deadline.
    Timeout,
    /// Malformed or unexpected message.
    Protocol,
    /// Server-side failure unrelated to the competitor's code.
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::Application => write!(f, "application"),
            ErrorCode::Timeout => write!(f, "timeout"),
            ErrorCode::Protocol => write!(f, "protocol"),
            ErrorCode::Internal => write!(f, "internal"),
        }
    }
}

impl GatewayMessage {
    /// Build a `Hello` for a new session.
    pub fn hello(session_id: String) -> Self {
        GatewayMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            session_id,
            started_at: Utc::now(),
        }
    }
}

impl ServerMessage {
    /// The request this message answers, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ServerMessage::HelloAck { .. } => None,
            ServerMessage::Prediction { request_id, .. } => Some(request_id),
            ServerMessage::Error { request_id, .. } => request_id.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_gateway_hello_serialization() {
        let msg = GatewayMessage::hello("session-1".to_string());
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"hello""#));
        assert!(json.contains(r#""protocol_version":1"#));
        assert!(json.contains(r#""session_id":"session-1""#));
    }

    #[test]
    fn test_predict_carries_payload_not_row_id() {
        let msg = GatewayMessage::Predict {
            request_id: "req-1".to_string(),
            args: BatchPayload::new(vec![json!("/kaggle/shared/abc")]),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"predict""#));
        assert!(json.contains(r#""args":["/kaggle/shared/abc"]"#));
        assert!(!json.contains("row_id"));
    }

    #[test]
    fn test_server_error_without_request_id() {
        let json = r#"{"type":"error","code":"protocol","message":"bad hello"}"#;
        let parsed: ServerMessage = serde_json::from_str(json).unwrap();
        match parsed {
            ServerMessage::Error {
                request_id,
                code,
                message,
            } => {
                assert!(request_id.is_none());
                assert_eq!(code, ErrorCode::Protocol);
                assert_eq!(message, "bad hello");
            }
            _ => panic!("Expected Error message"),
        }
    }

    #[test]
    fn test_prediction_message_request_id() {
        let msg = ServerMessage::Prediction {
            request_id: "req-9".to_string(),
            prediction: json!({"Aneurysm Present": 0.2}),
            elapsed_ms: 12,
        };
        assert_eq!(msg.request_id(), Some("req-9"));

        let ack = ServerMessage::HelloAck {
            server_name: "srv".to_string(),
            protocol_version: PROTOCOL_VERSION,
        };
        assert_eq!(ack.request_id(), None);
    }

    #[test]
    fn test_error_code_display_matches_wire_name() {
        for code in [
            ErrorCode::Application,
            ErrorCode::Timeout,
            ErrorCode::Protocol,
            ErrorCode::Internal,
        ] {
            let wire = serde_json::to_string(&code).unwrap();
            assert_eq!(wire, format!("\"{}\"", code));
        }
    }
}
