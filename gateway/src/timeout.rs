//! Per-case wall-clock deadline enforcement.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use evalgate_common::RowId;

use crate::error::{GatewayError, Result};

/// Wraps one request/response exchange with a deadline.
///
/// The deadline is measured on the wall clock from the moment
/// [`call_with_deadline`](Self::call_with_deadline) is invoked. When it
/// elapses the operation future is dropped, so a late answer can never be
/// observed by the caller.
#[derive(Debug, Clone, Copy)]
pub struct ResponseTimeoutController {
    deadline: Duration,
}

impl ResponseTimeoutController {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Run `operation`, passing its result through unchanged if it finishes in time.
    pub async fn call_with_deadline<F, T>(&self, row_id: &RowId, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        match tokio::time::timeout(self.deadline, operation).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed = start.elapsed();
                tracing::error!(
                    row_id = %row_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    deadline_secs = self.deadline.as_secs_f64(),
                    "Inference server missed the response deadline"
                );
                Err(GatewayError::Timeout {
                    row_id: row_id.clone(),
                    elapsed,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_fast_operation_returns_value() {
        let controller = ResponseTimeoutController::from_secs(5);
        let row_id = RowId::new("r1");

        let result = controller
            .call_with_deadline(&row_id, async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok("V")
            })
            .await;

        assert_eq!(result.unwrap(), "V");
    }

    #[tokio::test(start_paused = true)]
    async fn test_application_error_passes_through() {
        let controller = ResponseTimeoutController::from_secs(5);
        let row_id = RowId::new("r1");

        let result: Result<()> = controller
            .call_with_deadline(&row_id, async {
                Err(GatewayError::Application {
                    row_id: RowId::new("r1"),
                    message: "boom".to_string(),
                })
            })
            .await;

        assert!(matches!(result, Err(GatewayError::Application { .. })));
    }

    #[tokio::test]
    async fn test_slow_operation_times_out_near_deadline() {
        let controller = ResponseTimeoutController::new(Duration::from_millis(100));
        let row_id = RowId::new("slow-case");
        let start = Instant::now();

        let result: Result<()> = controller
            .call_with_deadline(&row_id, async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        let waited = start.elapsed();
        match result {
            Err(GatewayError::Timeout { row_id, elapsed }) => {
                assert_eq!(row_id.as_str(), "slow-case");
                assert!(elapsed >= Duration::from_millis(100));
            }
            other => panic!("expected Timeout, got {:?}", other.err()),
        }
        assert!(waited < Duration::from_secs(2), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_operation_never_completes() {
        let controller = ResponseTimeoutController::from_secs(1);
        let row_id = RowId::new("r1");
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let result: Result<()> = controller
            .call_with_deadline(&row_id, async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(GatewayError::Timeout { .. })));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }
}
