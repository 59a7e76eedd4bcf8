//! evalgate Gateway - runs the hidden test set against an inference server.

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use evalgate_gateway::{
    is_competition_rerun, logging, Config, Gateway, SeriesCompetition, WsTransport,
    COMPETITION_RERUN_ENV,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_version() {
    println!("evalgate-gateway {}", VERSION);
}

#[tokio::main]
async fn main() -> ExitCode {
    // Handle --version / -V
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        print_version();
        return ExitCode::SUCCESS;
    }

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Failed to load configuration: {}. \
                 Check gateway.toml or the GATEWAY__SECTION__KEY environment variables.",
                e
            );
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config.logging.level);

    if !is_competition_rerun() {
        tracing::info!(
            "{} is not set, skipping evaluation (interactive session)",
            COMPETITION_RERUN_ENV
        );
        return ExitCode::SUCCESS;
    }

    tracing::info!("Starting evalgate gateway {}", VERSION);

    let transport = match WsTransport::connect(&config.server).await {
        Ok(transport) => transport,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let competition = Arc::new(SeriesCompetition::new(config.data.clone()));
    let mut gateway = Gateway::new(config, competition, Box::new(transport));
    match gateway.run().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}
