//! Evaluation gateway: feeds a hidden test set to a participant's inference
//! server one case at a time and assembles the submission.

pub mod batch_source;
pub mod competition;
pub mod config;
pub mod error;
pub mod file_share;
pub mod gateway;
pub mod logging;
pub mod submission;
pub mod timeout;

pub use batch_source::{BatchSource, Case, TestIndex};
pub use competition::{Competition, DataPaths, SeriesCompetition};
pub use config::Config;
pub use error::{GatewayError, Result};
pub use file_share::{FileShare, SharedManifest};
pub use gateway::{Gateway, PredictRequest, Reply, RunReport, Transport, WsTransport};
pub use submission::{SealedSubmission, Submission};
pub use timeout::ResponseTimeoutController;

/// Set by the platform only when a submission is being scored.
pub const COMPETITION_RERUN_ENV: &str = "KAGGLE_IS_COMPETITION_RERUN";

/// Whether this process runs inside a scoring rerun.
pub fn is_competition_rerun() -> bool {
    rerun_flag_set(std::env::var_os(COMPETITION_RERUN_ENV).as_deref())
}

/// Set and non-empty.
fn rerun_flag_set(value: Option<&std::ffi::OsStr>) -> bool {
    value.is_some_and(|v| !v.is_empty())
}
