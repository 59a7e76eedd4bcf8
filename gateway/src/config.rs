//! Configuration for the evaluation gateway.

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure for the gateway.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub share: ShareConfig,
    #[serde(default)]
    pub server: ServerConnectionConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Location and layout of the held-out test set.
#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    /// Path to the test index CSV. Defaults to `<base_dir>/test.csv`.
    #[serde(default)]
    pub test_csv_path: Option<String>,
    /// Directory holding one subdirectory per case. Defaults to `<base_dir>/series`.
    #[serde(default)]
    pub case_dir: Option<String>,
    /// Base directory for the default paths above.
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    /// Column of the test index naming the row identifier.
    #[serde(default = "default_row_id_column")]
    pub row_id_column: String,
    /// Extension of the case files to share (without the dot).
    #[serde(default = "default_file_extension")]
    pub file_extension: String,
    /// Prediction fields written to the submission, in column order.
    /// Empty means the raw prediction is written as a single JSON column.
    #[serde(default)]
    pub label_columns: Vec<String>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            test_csv_path: None,
            case_dir: None,
            base_dir: default_base_dir(),
            row_id_column: default_row_id_column(),
            file_extension: default_file_extension(),
            label_columns: vec![],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShareConfig {
    /// Directory the inference server reads case files from.
    #[serde(default = "default_share_root")]
    pub root: String,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            root: default_share_root(),
        }
    }
}

/// Connection to the inference server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConnectionConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// How long to keep trying to reach a server that is still starting.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_connect_retry_interval")]
    pub connect_retry_interval_ms: u64,
}

impl Default for ServerConnectionConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            connect_timeout_secs: default_connect_timeout(),
            connect_retry_interval_ms: default_connect_retry_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Wall-clock deadline for a single case, in seconds.
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
    /// Where the finalized submission is written.
    #[serde(default = "default_submission_path")]
    pub submission_path: String,
    /// Fixed shuffle seed. When unset, a seed is derived from the clock.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            response_timeout_secs: default_response_timeout(),
            submission_path: default_submission_path(),
            seed: None,
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
fn default_base_dir() -> String {
    ".".to_string()
}
fn default_row_id_column() -> String {
    "SeriesInstanceUID".to_string()
}
fn default_file_extension() -> String {
    "dcm".to_string()
}
fn default_share_root() -> String {
    "/kaggle/shared".to_string()
}
fn default_ws_url() -> String {
    "ws://127.0.0.1:50051/ws".to_string()
}
fn default_connect_timeout() -> u64 {
    900
}
fn default_connect_retry_interval() -> u64 {
    500
}
fn default_response_timeout() -> u64 {
    30 * 60
}
fn default_submission_path() -> String {
    "submission.csv".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (GATEWAY__SECTION__KEY format)
    /// 2. gateway.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("run.response_timeout_secs", default_response_timeout() as i64)?
            .set_default("share.root", default_share_root())?
            .add_source(File::with_name("gateway").required(false))
            .add_source(
                Environment::with_prefix("GATEWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
