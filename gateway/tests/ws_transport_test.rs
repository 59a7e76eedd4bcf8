//! WsTransport against a scripted WebSocket peer.

use std::future::Future;
use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

use evalgate_common::{BatchPayload, ErrorCode, GatewayMessage, ServerMessage, PROTOCOL_VERSION};
use evalgate_gateway::config::ServerConnectionConfig;
use evalgate_gateway::{GatewayError, PredictRequest, Reply, Transport, WsTransport};

type Peer = WebSocketStream<TcpStream>;

async fn scripted_peer<F, Fut>(script: F) -> SocketAddr
where
    F: FnOnce(Peer) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        script(ws).await;
    });
    addr
}

fn connection(addr: SocketAddr) -> ServerConnectionConfig {
    ServerConnectionConfig {
        ws_url: format!("ws://{}/ws", addr),
        connect_timeout_secs: 5,
        connect_retry_interval_ms: 50,
    }
}

async fn read(peer: &mut Peer) -> GatewayMessage {
    loop {
        match peer.next().await.unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            _ => continue,
        }
    }
}

async fn write(peer: &mut Peer, msg: &ServerMessage) {
    peer.send(Message::Text(serde_json::to_string(msg).unwrap()))
        .await
        .unwrap();
}

async fn accept_hello(peer: &mut Peer) {
    match read(peer).await {
        GatewayMessage::Hello {
            protocol_version, ..
        } => assert_eq!(protocol_version, PROTOCOL_VERSION),
        other => panic!("expected hello, got {:?}", other),
    }
    write(
        peer,
        &ServerMessage::HelloAck {
            server_name: "scripted".to_string(),
            protocol_version: PROTOCOL_VERSION,
        },
    )
    .await;
}

async fn read_predict(peer: &mut Peer) -> String {
    match read(peer).await {
        GatewayMessage::Predict { request_id, .. } => request_id,
        other => panic!("expected predict, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stale_reply_is_discarded() {
    let addr = scripted_peer(|mut peer| async move {
        accept_hello(&mut peer).await;
        let request_id = read_predict(&mut peer).await;
        write(
            &mut peer,
            &ServerMessage::Prediction {
                request_id: "abandoned-earlier".to_string(),
                prediction: json!("stale"),
                elapsed_ms: 5,
            },
        )
        .await;
        write(
            &mut peer,
            &ServerMessage::Prediction {
                request_id,
                prediction: json!("fresh"),
                elapsed_ms: 5,
            },
        )
        .await;
        let _ = peer.next().await;
    })
    .await;

    let mut transport = WsTransport::connect(&connection(addr)).await.unwrap();
    assert_eq!(transport.server_name(), "scripted");

    let reply = transport
        .exchange(&PredictRequest::new(BatchPayload::new(vec![json!("/kaggle/shared/s1")])))
        .await
        .unwrap();

    assert_eq!(
        reply,
        Reply::Prediction {
            prediction: json!("fresh"),
            elapsed_ms: 5
        }
    );
}

#[tokio::test]
async fn test_error_reply_for_request() {
    let addr = scripted_peer(|mut peer| async move {
        accept_hello(&mut peer).await;
        let request_id = read_predict(&mut peer).await;
        write(
            &mut peer,
            &ServerMessage::Error {
                request_id: Some(request_id),
                code: ErrorCode::Application,
                message: "division by zero".to_string(),
            },
        )
        .await;
        let _ = peer.next().await;
    })
    .await;

    let mut transport = WsTransport::connect(&connection(addr)).await.unwrap();
    let reply = transport
        .exchange(&PredictRequest::new(BatchPayload::new(vec![])))
        .await
        .unwrap();

    assert_eq!(
        reply,
        Reply::Failed {
            code: ErrorCode::Application,
            message: "division by zero".to_string()
        }
    );
}

#[tokio::test]
async fn test_peer_closing_mid_exchange_is_transport_error() {
    let addr = scripted_peer(|mut peer| async move {
        accept_hello(&mut peer).await;
        read_predict(&mut peer).await;
        let _ = peer.close(None).await;
    })
    .await;

    let mut transport = WsTransport::connect(&connection(addr)).await.unwrap();
    let err = transport
        .exchange(&PredictRequest::new(BatchPayload::new(vec![])))
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Transport(_)), "{:?}", err);
}

#[tokio::test]
async fn test_cancel_reaches_peer() {
    let (tx, rx) = oneshot::channel();
    let addr = scripted_peer(|mut peer| async move {
        accept_hello(&mut peer).await;
        let _ = tx.send(read(&mut peer).await);
    })
    .await;

    let mut transport = WsTransport::connect(&connection(addr)).await.unwrap();
    transport.cancel("req-1").await.unwrap();

    match rx.await.unwrap() {
        GatewayMessage::Cancel { request_id } => assert_eq!(request_id, "req-1"),
        other => panic!("expected cancel, got {:?}", other),
    }
}

#[tokio::test]
async fn test_protocol_version_mismatch_fails_connect() {
    let addr = scripted_peer(|mut peer| async move {
        read(&mut peer).await;
        write(
            &mut peer,
            &ServerMessage::HelloAck {
                server_name: "future".to_string(),
                protocol_version: PROTOCOL_VERSION + 1,
            },
        )
        .await;
        let _ = peer.next().await;
    })
    .await;

    let result = WsTransport::connect(&connection(addr)).await;
    assert!(matches!(result, Err(GatewayError::Transport(_))));
}

#[tokio::test]
async fn test_unreachable_server_gives_up_after_connect_timeout() {
    // Bind then drop to get a port nobody listens on.
    let addr = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();
    let config = ServerConnectionConfig {
        connect_timeout_secs: 1,
        ..connection(addr)
    };

    let start = std::time::Instant::now();
    let result = WsTransport::connect(&config).await;

    assert!(matches!(result, Err(GatewayError::Transport(_))));
    assert!(start.elapsed() < std::time::Duration::from_secs(5));
}

#[tokio::test]
async fn test_silent_server_gives_up_after_connect_timeout() {
    // Accepts TCP but never answers the WebSocket upgrade.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        std::future::pending::<()>().await;
    });
    let config = ServerConnectionConfig {
        connect_timeout_secs: 1,
        ..connection(addr)
    };

    let start = std::time::Instant::now();
    let result = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        WsTransport::connect(&config),
    )
    .await
    .expect("connect outlived its timeout");

    assert!(matches!(result, Err(GatewayError::Transport(_))));
    assert!(start.elapsed() < std::time::Duration::from_secs(5));
}
