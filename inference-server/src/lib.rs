//! Inference server: hosts a competitor's predict callable for the
//! evaluation gateway.

pub mod config;
pub mod error;
pub mod local;
pub mod predictor;
pub mod server;
pub mod state;

pub use config::Config;
pub use error::{Error, Result};
pub use local::run_local_gateway;
pub use predictor::{CommandPredictor, Predictor};
pub use server::{InferenceServer, SessionState};
pub use state::AppState;
