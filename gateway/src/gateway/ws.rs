//! WebSocket transport to the inference server.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use evalgate_common::{GatewayMessage, ServerMessage, PROTOCOL_VERSION};

use super::transport::{PredictRequest, Reply, Transport};
use crate::config::ServerConnectionConfig;
use crate::error::{GatewayError, Result};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Gateway side of the WebSocket session.
pub struct WsTransport {
    stream: WsStream,
    session_id: String,
    server_name: String,
}

impl WsTransport {
    /// Connect and perform the handshake.
    ///
    /// The server may still be starting, so the connection is retried until
    /// `connect_timeout_secs` elapses. No case has been sent at this point.
    pub async fn connect(config: &ServerConnectionConfig) -> Result<Self> {
        let deadline = Instant::now() + Duration::from_secs(config.connect_timeout_secs);
        let retry = Duration::from_millis(config.connect_retry_interval_ms);

        let stream = loop {
            let attempt = timeout_at(deadline, connect_async(config.ws_url.as_str()))
                .await
                .map_err(|_| {
                    GatewayError::Transport(format!(
                        "no answer from inference server at {} within {}s",
                        config.ws_url, config.connect_timeout_secs
                    ))
                })?;
            match attempt {
                Ok((stream, _)) => break stream,
                Err(e) if Instant::now() + retry < deadline => {
                    tracing::debug!("Inference server not reachable yet at {}: {}", config.ws_url, e);
                    sleep(retry).await;
                }
                Err(e) => {
                    return Err(GatewayError::Transport(format!(
                        "cannot reach inference server at {}: {}",
                        config.ws_url, e
                    )));
                }
            }
        };

        let mut transport = Self {
            stream,
            session_id: Uuid::new_v4().to_string(),
            server_name: String::new(),
        };
        transport.handshake().await?;
        tracing::info!(
            session_id = %transport.session_id,
            server = %transport.server_name,
            "Connected to inference server at {}",
            config.ws_url
        );
        Ok(transport)
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn handshake(&mut self) -> Result<()> {
        self.send(&GatewayMessage::hello(self.session_id.clone())).await?;

        match timeout(HANDSHAKE_TIMEOUT, self.stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match parse(&text)? {
                ServerMessage::HelloAck {
                    server_name,
                    protocol_version,
                } => {
                    if protocol_version != PROTOCOL_VERSION {
                        return Err(GatewayError::Transport(format!(
                            "protocol version mismatch: expected {}, got {}",
                            PROTOCOL_VERSION, protocol_version
                        )));
                    }
                    self.server_name = server_name;
                    Ok(())
                }
                ServerMessage::Error { code, message, .. } => Err(GatewayError::Transport(
                    format!("handshake rejected: {} - {}", code, message),
                )),
                _ => Err(GatewayError::Transport("unexpected response to hello".into())),
            },
            Ok(Some(Ok(_))) => Err(GatewayError::Transport(
                "expected text message for hello ack".into(),
            )),
            Ok(Some(Err(e))) => Err(GatewayError::Transport(format!(
                "WebSocket error during handshake: {}",
                e
            ))),
            Ok(None) => Err(GatewayError::Transport(
                "connection closed during handshake".into(),
            )),
            Err(_) => Err(GatewayError::Transport("hello acknowledgment timeout".into())),
        }
    }

    async fn send(&mut self, msg: &GatewayMessage) -> Result<()> {
        let json = serde_json::to_string(msg)
            .map_err(|e| GatewayError::Transport(format!("encode failed: {}", e)))?;
        self.stream
            .send(Message::Text(json))
            .await
            .map_err(|e| GatewayError::Transport(format!("send failed: {}", e)))
    }
}

fn parse(text: &str) -> Result<ServerMessage> {
    serde_json::from_str(text)
        .map_err(|e| GatewayError::Transport(format!("malformed server message: {}", e)))
}

#[async_trait]
impl Transport for WsTransport {
    async fn exchange(&mut self, request: &PredictRequest) -> Result<Reply> {
        self.send(&GatewayMessage::Predict {
            request_id: request.request_id.clone(),
            args: request.args.clone(),
        })
        .await?;

        loop {
            let frame = self
                .stream
                .next()
                .await
                .ok_or_else(|| GatewayError::Transport("inference server closed the connection".into()))?
                .map_err(|e| GatewayError::Transport(format!("WebSocket error: {}", e)))?;

            let text = match frame {
                Message::Text(text) => text,
                Message::Ping(data) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| GatewayError::Transport(format!("send failed: {}", e)))?;
                    continue;
                }
                Message::Close(_) => {
                    return Err(GatewayError::Transport(
                        "inference server sent close frame".into(),
                    ));
                }
                _ => continue,
            };

            match parse(&text)? {
                ServerMessage::Prediction {
                    request_id,
                    prediction,
                    elapsed_ms,
                } if request_id == request.request_id => {
                    return Ok(Reply::Prediction {
                        prediction,
                        elapsed_ms,
                    });
                }
                ServerMessage::Error {
                    request_id: Some(request_id),
                    code,
                    message,
                } if request_id == request.request_id => {
                    return Ok(Reply::Failed { code, message });
                }
                ServerMessage::Error {
                    request_id: None,
                    code,
                    message,
                } => {
                    return Err(GatewayError::Transport(format!(
                        "session error from server: {} - {}",
                        code, message
                    )));
                }
                ServerMessage::HelloAck { .. } => {
                    tracing::warn!("Ignoring unexpected hello ack during exchange");
                }
                stale => {
                    tracing::warn!(
                        request_id = %request.request_id,
                        "Discarding stale reply for abandoned request {}",
                        stale.request_id().unwrap_or_default()
                    );
                }
            }
        }
    }

    async fn cancel(&mut self, request_id: &str) -> Result<()> {
        self.send(&GatewayMessage::Cancel {
            request_id: request_id.to_string(),
        })
        .await
    }

    async fn close(&mut self) -> Result<()> {
        self.stream
            .close(None)
            .await
            .map_err(|e| GatewayError::Transport(format!("close failed: {}", e)))
    }
}
