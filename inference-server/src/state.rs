//! Shared application state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::predictor::Predictor;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub config: Config,
    pub predictor: Arc<dyn Predictor>,
    pub started_at: DateTime<Utc>,
    /// Cancelled when the server shuts down. Session tokens are its children.
    shutdown: CancellationToken,
    active_session: Mutex<Option<CancellationToken>>,
}

impl AppState {
    pub fn new(config: Config, predictor: Arc<dyn Predictor>) -> Self {
        Self {
            config,
            predictor,
            started_at: Utc::now(),
            shutdown: CancellationToken::new(),
            active_session: Mutex::new(None),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Make a new session the active one, cancelling any previous session.
    pub async fn begin_session(&self) -> CancellationToken {
        let token = self.shutdown.child_token();
        let previous = self.active_session.lock().await.replace(token.clone());
        if let Some(previous) = previous {
            if !previous.is_cancelled() {
                tracing::warn!("New gateway session supersedes the active one");
                previous.cancel();
            }
        }
        token
    }

    /// Forget `session` if it is still the active one.
    pub async fn end_session(&self, session: &CancellationToken) {
        session.cancel();
        let mut active = self.active_session.lock().await;
        // Tokens share state across clones; a cancelled active token is this one or older.
        if active.as_ref().map_or(false, |t| t.is_cancelled()) {
            *active = None;
        }
    }

    pub async fn has_active_session(&self) -> bool {
        self.active_session
            .lock()
            .await
            .as_ref()
            .map_or(false, |t| !t.is_cancelled())
    }
}
