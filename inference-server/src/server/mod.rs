//! HTTP/WebSocket surface of the inference server.

pub mod health;
mod session;

pub use session::{ws_handler, SessionState};

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::Result;
use crate::predictor::Predictor;
use crate::state::AppState;

/// Serves one predictor to the evaluation gateway.
pub struct InferenceServer {
    state: Arc<AppState>,
}

impl InferenceServer {
    pub fn new(config: Config, predictor: Arc<dyn Predictor>) -> Self {
        Self {
            state: Arc::new(AppState::new(config, predictor)),
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Cancelling this token stops the server and ends every session.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown_token()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health::health))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve on `listener` until the shutdown token is cancelled.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let app = self.router();
        let shutdown = self.shutdown_token();
        tracing::info!(
            predictor = %self.state.predictor.name(),
            "Listening on {}",
            listener.local_addr()?
        );

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

        Ok(())
    }
}
