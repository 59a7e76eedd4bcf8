//! In-process gateway run against a locally served predictor.
//!
//! Lets a competitor exercise the full evaluation flow (shuffling, sandboxed
//! file sharing, deadlines, submission checks) on their own machine.

use std::sync::Arc;

use tokio::net::TcpListener;

use evalgate_gateway::{Gateway, RunReport, SeriesCompetition, WsTransport};

use crate::config::Config;
use crate::error::Result;
use crate::predictor::Predictor;
use crate::server::InferenceServer;

/// Serve `predictor` on an ephemeral loopback port and run a full gateway against it.
pub async fn run_local_gateway(
    server_config: Config,
    gateway_config: evalgate_gateway::Config,
    predictor: Arc<dyn Predictor>,
) -> Result<RunReport> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = InferenceServer::new(server_config, predictor);
    let shutdown = server.shutdown_token();
    let serving = tokio::spawn(server.serve(listener));

    let mut connection = gateway_config.server.clone();
    connection.ws_url = format!("ws://{}/ws", addr);
    tracing::info!("Running local gateway against {}", connection.ws_url);

    let outcome = async {
        let transport = WsTransport::connect(&connection).await?;
        let competition = Arc::new(SeriesCompetition::new(gateway_config.data.clone()));
        let mut gateway = Gateway::new(gateway_config, competition, Box::new(transport));
        gateway.run().await
    }
    .await;

    shutdown.cancel();
    match serving.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Local server stopped with error: {}", e),
        Err(e) => tracing::warn!("Local server task failed: {}", e),
    }

    Ok(outcome?)
}
