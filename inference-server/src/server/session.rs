//! WebSocket handler for gateway sessions.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{timeout, timeout_at, Duration, Instant};
use tokio_util::sync::CancellationToken;

use evalgate_common::{BatchPayload, ErrorCode, GatewayMessage, Prediction, ServerMessage, PROTOCOL_VERSION};

use crate::error::{Error, Result};
use crate::predictor::Predictor;
use crate::state::AppState;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a session is in its request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for a request.
    Idle,
    /// Decoding a request.
    Receiving,
    /// The predictor is running.
    Invoking,
    /// Sending a reply.
    Responding,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Receiving => "receiving",
            SessionState::Invoking => "invoking",
            SessionState::Responding => "responding",
        };
        f.write_str(name)
    }
}

/// A predict call running in its own task.
struct Invocation {
    request_id: String,
    cancel: CancellationToken,
    handle: JoinHandle<Result<Prediction>>,
    started: Instant,
    deadline: Instant,
}

impl Invocation {
    fn start(
        predictor: Arc<dyn Predictor>,
        request_id: String,
        args: BatchPayload,
        session: &CancellationToken,
        response_timeout: Duration,
    ) -> Self {
        let cancel = session.child_token();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { predictor.predict(&args, token).await });
        let started = Instant::now();
        Self {
            request_id,
            cancel,
            handle,
            started,
            deadline: started + response_timeout,
        }
    }

    /// Cancel the call. The task is aborted if it has not wound down within `grace`.
    fn abandon(self, grace: Duration) {
        self.cancel.cancel();
        let mut handle = self.handle;
        tokio::spawn(async move {
            if timeout(grace, &mut handle).await.is_err() {
                handle.abort();
            }
        });
    }
}

enum Outcome {
    Finished(Result<Prediction>),
    Panicked(String),
    TimedOut,
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    tracing::info!("Gateway connection attempt from {}", addr);
    ws.on_upgrade(move |socket| handle_session(socket, state, addr))
}

/// Handle one gateway session.
async fn handle_session(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Wait for hello
    let session_id = match timeout(HANDSHAKE_TIMEOUT, ws_rx.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<GatewayMessage>(&text) {
            Ok(GatewayMessage::Hello {
                protocol_version,
                session_id,
                started_at,
            }) => {
                if protocol_version != PROTOCOL_VERSION {
                    let msg = format!(
                        "Protocol version mismatch: expected {}, got {}",
                        PROTOCOL_VERSION, protocol_version
                    );
                    tracing::warn!("Rejecting gateway from {}: {}", addr, msg);
                    let _ = send_error(&mut ws_tx, None, ErrorCode::Protocol, &msg).await;
                    return;
                }
                tracing::info!(
                    session_id = %session_id,
                    gateway_started_at = %started_at,
                    "Gateway session opened from {}",
                    addr
                );
                session_id
            }
            Ok(_) => {
                tracing::warn!("Expected Hello message from {}, got different type", addr);
                let _ = send_error(&mut ws_tx, None, ErrorCode::Protocol, "Expected Hello message").await;
                return;
            }
            Err(e) => {
                tracing::warn!("Failed to parse hello from {}: {}", addr, e);
                let _ = send_error(&mut ws_tx, None, ErrorCode::Protocol, &e.to_string()).await;
                return;
            }
        },
        Ok(Some(Ok(_))) => {
            tracing::warn!("Expected text message for hello from {}", addr);
            let _ = send_error(&mut ws_tx, None, ErrorCode::Protocol, "Expected text message").await;
            return;
        }
        Ok(Some(Err(e))) => {
            tracing::warn!("WebSocket error during handshake from {}: {}", addr, e);
            return;
        }
        Ok(None) => {
            tracing::info!("Connection closed before hello from {}", addr);
            return;
        }
        Err(_) => {
            tracing::warn!("Hello timeout from {}", addr);
            let _ = send_error(&mut ws_tx, None, ErrorCode::Timeout, "Hello timeout").await;
            return;
        }
    };

    // Take over before acknowledging so the previous session is gone once the gateway proceeds.
    let session = state.begin_session().await;

    let ack = ServerMessage::HelloAck {
        server_name: state.config.server.name.clone(),
        protocol_version: PROTOCOL_VERSION,
    };
    if let Err(e) = send_message(&mut ws_tx, &ack).await {
        tracing::error!("Failed to send HelloAck: {}", e);
        state.end_session(&session).await;
        return;
    }

    let response_timeout = Duration::from_secs(state.config.server.response_timeout_secs);
    let cancel_grace = Duration::from_secs(state.config.server.cancel_grace_secs);
    let mut phase = SessionState::Idle;
    let mut in_flight: Option<Invocation> = None;

    // Main message loop
    loop {
        tokio::select! {
            _ = session.cancelled() => {
                tracing::info!(session_id = %session_id, "Session superseded or server shutting down");
                break;
            }

            outcome = next_outcome(&mut in_flight) => {
                let Some(invocation) = in_flight.take() else { continue };
                set_phase(&mut phase, SessionState::Responding, &session_id);
                let reply = reply_for(&invocation, outcome, &state);
                if matches!(reply, ServerMessage::Error { code: ErrorCode::Timeout, .. }) {
                    invocation.abandon(cancel_grace);
                }
                if let Err(e) = send_message(&mut ws_tx, &reply).await {
                    tracing::error!("Failed to send reply for session {}: {}", session_id, e);
                    break;
                }
                set_phase(&mut phase, SessionState::Idle, &session_id);
            }

            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        set_phase(&mut phase, SessionState::Receiving, &session_id);
                        match serde_json::from_str::<GatewayMessage>(&text) {
                            Ok(GatewayMessage::Predict { request_id, args }) => {
                                if let Some(stale) = in_flight.take() {
                                    tracing::warn!(
                                        request_id = %stale.request_id,
                                        "Request {} supersedes the in-flight call",
                                        request_id
                                    );
                                    stale.abandon(cancel_grace);
                                }
                                tracing::debug!(request_id = %request_id, "Invoking {}", state.predictor.name());
                                in_flight = Some(Invocation::start(
                                    state.predictor.clone(),
                                    request_id,
                                    args,
                                    &session,
                                    response_timeout,
                                ));
                                set_phase(&mut phase, SessionState::Invoking, &session_id);
                            }
                            Ok(GatewayMessage::Cancel { request_id }) => {
                                match in_flight.take() {
                                    Some(call) if call.request_id == request_id => {
                                        tracing::info!(request_id = %request_id, "Gateway cancelled request");
                                        call.abandon(cancel_grace);
                                    }
                                    other => {
                                        tracing::debug!(request_id = %request_id, "Cancel for unknown request ignored");
                                        in_flight = other;
                                    }
                                }
                                settle(&mut phase, &in_flight, &session_id);
                            }
                            Ok(GatewayMessage::Hello { .. }) => {
                                tracing::warn!("Unexpected Hello in established session {}", session_id);
                                settle(&mut phase, &in_flight, &session_id);
                            }
                            Err(e) => {
                                tracing::warn!("Malformed message in session {}: {}", session_id, e);
                                if let Err(e) = send_error(&mut ws_tx, None, ErrorCode::Protocol, &e.to_string()).await {
                                    tracing::error!("Failed to send error to {}: {}", addr, e);
                                    break;
                                }
                                settle(&mut phase, &in_flight, &session_id);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            tracing::error!("Failed to send pong to {}: {}", addr, e);
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("Gateway {} sent close frame", session_id);
                        break;
                    }
                    Some(Ok(_)) => {} // Ignore binary, pong, etc.
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    if let Some(call) = in_flight.take() {
        tracing::info!(request_id = %call.request_id, "Session ended during invocation, cancelling");
        call.abandon(cancel_grace);
    }
    state.end_session(&session).await;
    tracing::info!("Gateway session {} closed", session_id);
}

async fn next_outcome(in_flight: &mut Option<Invocation>) -> Outcome {
    let Some(call) = in_flight.as_mut() else {
        return std::future::pending().await;
    };
    match timeout_at(call.deadline, &mut call.handle).await {
        Ok(Ok(result)) => Outcome::Finished(result),
        Ok(Err(e)) => join_failure(e),
        Err(_) => Outcome::TimedOut,
    }
}

fn join_failure(e: JoinError) -> Outcome {
    if !e.is_panic() {
        return Outcome::Finished(Err(Error::Cancelled));
    }
    let payload = e.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    Outcome::Panicked(message)
}

fn reply_for(call: &Invocation, outcome: Outcome, state: &AppState) -> ServerMessage {
    let elapsed = call.started.elapsed();
    let request_id = call.request_id.clone();
    match outcome {
        Outcome::Finished(Ok(prediction)) => {
            tracing::debug!(request_id = %request_id, elapsed_ms = elapsed.as_millis() as u64, "Prediction ready");
            ServerMessage::Prediction {
                request_id,
                prediction,
                elapsed_ms: elapsed.as_millis() as u64,
            }
        }
        Outcome::Finished(Err(e)) => {
            tracing::warn!(request_id = %request_id, "Predictor {} failed: {}", state.predictor.name(), e);
            ServerMessage::Error {
                request_id: Some(request_id),
                code: e.code(),
                message: e.to_string(),
            }
        }
        Outcome::Panicked(message) => {
            tracing::error!(request_id = %request_id, "Predictor {} panicked: {}", state.predictor.name(), message);
            ServerMessage::Error {
                request_id: Some(request_id),
                code: ErrorCode::Application,
                message: format!("predictor panicked: {}", message),
            }
        }
        Outcome::TimedOut => {
            tracing::error!(
                request_id = %request_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Predictor {} exceeded the response deadline",
                state.predictor.name()
            );
            ServerMessage::Error {
                request_id: Some(request_id),
                code: ErrorCode::Timeout,
                message: format!("no prediction after {:?}", elapsed),
            }
        }
    }
}

fn set_phase(phase: &mut SessionState, next: SessionState, session_id: &str) {
    tracing::trace!(session_id, "Session {} -> {}", phase, next);
    *phase = next;
}

/// Back to `Invoking` or `Idle` after handling a message that starts nothing.
fn settle(phase: &mut SessionState, in_flight: &Option<Invocation>, session_id: &str) {
    let next = if in_flight.is_some() {
        SessionState::Invoking
    } else {
        SessionState::Idle
    };
    set_phase(phase, next, session_id);
}

/// Send a ServerMessage over WebSocket.
async fn send_message<S>(
    sink: &mut S,
    msg: &ServerMessage,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = serde_json::to_string(msg)?;
    sink.send(Message::Text(json)).await?;
    Ok(())
}

/// Send an error message over WebSocket.
async fn send_error<S>(
    sink: &mut S,
    request_id: Option<String>,
    code: ErrorCode,
    message: &str,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let msg = ServerMessage::Error {
        request_id,
        code,
        message: message.to_string(),
    };
    send_message(sink, &msg).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::Idle.to_string(), "idle");
        assert_eq!(SessionState::Invoking.to_string(), "invoking");
    }

    #[tokio::test]
    async fn test_panic_message_is_captured() {
        let handle = tokio::spawn(async { panic!("weights not found") });
        let err = handle.await.unwrap_err();
        match join_failure(err) {
            Outcome::Panicked(message) => assert_eq!(message, "weights not found"),
            _ => panic!("expected a panic outcome"),
        }
    }

    #[tokio::test]
    async fn test_aborted_task_counts_as_cancelled() {
        let handle = tokio::spawn(std::future::pending::<()>());
        handle.abort();
        let err = handle.await.unwrap_err();
        assert!(matches!(join_failure(err), Outcome::Finished(Err(Error::Cancelled))));
    }
}
