//! evalgate Server - serves a competitor's predictor to the evaluation gateway.

use std::env;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use evalgate_server::{run_local_gateway, CommandPredictor, Config, InferenceServer};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_version() {
    println!("evalgate-server {}", VERSION);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Handle --version / -V
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        print_version();
        return Ok(());
    }
    let local_gateway = args.iter().any(|a| a == "--local-gateway");

    // Load configuration
    let config = Config::load().map_err(|e| {
        format!(
            "Failed to load configuration: {}. \
             Make sure server.toml exists or set SERVER__PREDICTOR__COMMAND.",
            e
        )
    })?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let predictor = Arc::new(CommandPredictor::new(config.predictor.clone())?);
    tracing::info!("Starting evalgate server {}: {}", VERSION, config.server.name);

    if local_gateway {
        let gateway_config = evalgate_gateway::Config::load()?;
        let report = run_local_gateway(config, gateway_config, predictor).await?;
        tracing::info!(
            "Local run complete: {} cases, seed {}, submission at {}",
            report.cases,
            report.seed,
            report.submission_path.display()
        );
        return Ok(());
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;

    let server = InferenceServer::new(config, predictor);
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    server.serve(listener).await?;
    Ok(())
}
