//! Configuration for the inference server.

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure for the inference server.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub predictor: PredictorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Reported to the gateway in the handshake.
    #[serde(default = "default_name")]
    pub name: String,
    /// Server-side deadline for one predict call, in seconds.
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
    /// How long a cancelled call may take to wind down before its task is aborted.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            name: default_name(),
            response_timeout_secs: default_response_timeout(),
            cancel_grace_secs: default_cancel_grace(),
        }
    }
}

/// Competitor program invoked once per case.
///
/// The program receives `args` followed by the case payload as arguments and
/// must print its prediction as JSON on stdout.
#[derive(Debug, Clone, Deserialize)]
pub struct PredictorConfig {
    /// Program to run. Required when serving.
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments inserted before the payload.
    /// Example: `["predict.py"]` with `command = "python"`
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Grace period between SIGTERM and kill on cancellation.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Forward the program's stderr to the log at debug level.
    #[serde(default)]
    pub log_stderr: bool,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            working_dir: None,
            shutdown_timeout_secs: default_shutdown_timeout(),
            log_stderr: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    50051
}
fn default_name() -> String {
    "evalgate-server".to_string()
}
fn default_response_timeout() -> u64 {
    30 * 60
}
fn default_cancel_grace() -> u64 {
    15
}
fn default_shutdown_timeout() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (SERVER__SECTION__KEY format)
    /// 2. server.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port() as i64)?
            .add_source(File::with_name("server").required(false))
            .add_source(
                Environment::with_prefix("SERVER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
