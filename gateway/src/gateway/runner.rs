//! The gateway run loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{timeout, Instant};

use evalgate_common::{ErrorCode, RowId};

use super::transport::{PredictRequest, Reply, Transport};
use crate::batch_source::{clock_seed, BatchSource, Case, TestIndex};
use crate::competition::Competition;
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::file_share::FileShare;
use crate::submission::Submission;
use crate::timeout::ResponseTimeoutController;

/// How long an abandoned request's cancel notice may take to send.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Summary of a completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub cases: usize,
    pub submission_path: PathBuf,
    pub seed: u64,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

/// Drives one evaluation run against an inference server.
pub struct Gateway {
    config: Config,
    competition: Arc<dyn Competition>,
    transport: Box<dyn Transport>,
    controller: ResponseTimeoutController,
    seed: Option<u64>,
}

impl Gateway {
    pub fn new(
        config: Config,
        competition: Arc<dyn Competition>,
        transport: Box<dyn Transport>,
    ) -> Self {
        let controller = ResponseTimeoutController::from_secs(config.run.response_timeout_secs);
        let seed = config.run.seed;
        Self {
            config,
            competition,
            transport,
            controller,
            seed,
        }
    }

    /// Fix the shuffle seed for this run.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_response_timeout(mut self, deadline: Duration) -> Self {
        self.controller = ResponseTimeoutController::new(deadline);
        self
    }

    /// Evaluate every test case and write the submission.
    ///
    /// Any failure aborts the run with no submission written. The share root
    /// is emptied and the transport closed in every outcome.
    pub async fn run(&mut self) -> Result<RunReport> {
        let outcome = self.run_to_submission().await;

        if let Err(e) = self.transport.close().await {
            tracing::debug!("Closing transport failed: {}", e);
        }

        match &outcome {
            Ok(report) => tracing::info!(
                cases = report.cases,
                seed = report.seed,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Submission written to {}",
                report.submission_path.display()
            ),
            Err(e) => match e.row_id() {
                Some(row_id) => tracing::error!(row_id = %row_id, "Run aborted: {}", e),
                None => tracing::error!("Run aborted: {}", e),
            },
        }
        outcome
    }

    async fn run_to_submission(&mut self) -> Result<RunReport> {
        let started_at = Utc::now();
        let start = Instant::now();

        let paths = self.competition.resolve_data_paths(&self.config.data);
        let index = TestIndex::load(&paths.test_csv, self.competition.row_id_column())?;
        let seed = self.seed.unwrap_or_else(clock_seed);
        tracing::info!(
            cases = index.len(),
            rows = index.rows(),
            seed,
            "Loaded test index from {}",
            paths.test_csv.display()
        );

        let source = BatchSource::seeded(&index, &paths.case_root, seed);
        let mut share = FileShare::new(&self.config.share.root, &paths.case_root);
        let mut submission = Submission::with_capacity(index.len());

        let evaluated = self.evaluate(source, &mut share, &mut submission).await;
        let cleared = share.clear();
        evaluated?;
        cleared?;

        let sealed = submission.seal(&index.unique_row_ids())?;
        let submission_path = PathBuf::from(&self.config.run.submission_path);
        sealed.write_csv(
            &submission_path,
            self.competition.row_id_column(),
            self.competition.label_columns(),
        )?;

        Ok(RunReport {
            cases: sealed.len(),
            submission_path,
            seed,
            started_at,
            elapsed: start.elapsed(),
        })
    }

    async fn evaluate(
        &mut self,
        source: BatchSource,
        share: &mut FileShare,
        submission: &mut Submission,
    ) -> Result<()> {
        let total = source.len();
        for (position, case) in source.produce().enumerate() {
            self.evaluate_case(&case, share, submission).await?;
            tracing::info!(
                row_id = %case.row_id,
                "Case {}/{} complete",
                position + 1,
                total
            );
        }
        Ok(())
    }

    async fn evaluate_case(
        &mut self,
        case: &Case,
        share: &mut FileShare,
        submission: &mut Submission,
    ) -> Result<()> {
        let files = self.competition.source_files(case)?;
        let manifest = share.share(&files)?;
        let args = self.competition.sandbox_payload(case, share, &manifest)?;
        let request = PredictRequest::new(args);
        tracing::debug!(
            row_id = %case.row_id,
            request_id = %request.request_id,
            files = manifest.len(),
            "Dispatching case"
        );

        let start = Instant::now();
        let controller = self.controller;
        let reply = match controller
            .call_with_deadline(&case.row_id, self.transport.exchange(&request))
            .await
        {
            Ok(reply) => reply,
            Err(e @ GatewayError::Timeout { .. }) => {
                self.abandon(&request.request_id).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let prediction = match reply {
            Reply::Prediction {
                prediction,
                elapsed_ms,
            } => {
                tracing::debug!(row_id = %case.row_id, elapsed_ms, "Prediction received");
                prediction
            }
            Reply::Failed { code, message } => {
                return Err(reply_error(&case.row_id, code, message, start.elapsed()));
            }
        };

        self.competition
            .validate(&prediction, &case.row_id, &request.args)
            .map_err(|reason| GatewayError::Validation {
                row_id: case.row_id.clone(),
                reason,
            })?;

        submission.push(case.row_id.clone(), prediction)
    }

    async fn abandon(&mut self, request_id: &str) {
        match timeout(CANCEL_GRACE, self.transport.cancel(request_id)).await {
            Ok(Ok(())) => tracing::debug!(request_id, "Cancel sent for abandoned request"),
            Ok(Err(e)) => tracing::warn!(request_id, "Failed to cancel abandoned request: {}", e),
            Err(_) => tracing::warn!(request_id, "Timed out sending cancel"),
        }
    }
}

fn reply_error(row_id: &RowId, code: ErrorCode, message: String, elapsed: Duration) -> GatewayError {
    match code {
        ErrorCode::Application => GatewayError::Application {
            row_id: row_id.clone(),
            message,
        },
        ErrorCode::Timeout => GatewayError::Timeout {
            row_id: row_id.clone(),
            elapsed,
        },
        ErrorCode::Protocol | ErrorCode::Internal => {
            GatewayError::Transport(format!("server reported {}: {}", code, message))
        }
    }
}
