//! Predictor backed by an external program.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use evalgate_common::{BatchPayload, Prediction};

use super::Predictor;
use crate::config::PredictorConfig;
use crate::error::{Error, Result};

/// Bytes of stderr quoted in a failure message.
const STDERR_TAIL: usize = 2048;

/// Runs the configured program once per case.
///
/// Payload elements are appended to the command line (strings verbatim,
/// anything else as JSON) and stdout is parsed as the JSON prediction.
pub struct CommandPredictor {
    config: PredictorConfig,
    command: String,
    name: String,
}

impl CommandPredictor {
    pub fn new(config: PredictorConfig) -> Result<Self> {
        let command = config
            .command
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Error::Config("predictor.command is not set".to_string()))?;
        let name = Path::new(&command)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| command.clone());

        Ok(Self {
            config,
            command,
            name,
        })
    }

    fn build_command(&self, args: &BatchPayload) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.config.args);
        for arg in args.args() {
            cmd.arg(payload_arg(arg));
        }
        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so helpers the program starts are signalled with it.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// SIGTERM the process group, wait up to the shutdown timeout, then kill.
    async fn terminate(&self, child: &mut Child) {
        let group = child.id();
        signal_group(group, GroupSignal::Terminate);

        let wait_result = tokio::time::timeout(
            Duration::from_secs(self.config.shutdown_timeout_secs),
            child.wait(),
        )
        .await;

        match wait_result {
            Ok(Ok(status)) => {
                tracing::debug!("Predictor {} exited with {} after cancel", self.name, status);
            }
            Ok(Err(e)) => {
                tracing::warn!("Error waiting for predictor {}: {}", self.name, e);
            }
            Err(_timeout) => {
                tracing::warn!("Predictor {} didn't stop gracefully, killing", self.name);
                signal_group(group, GroupSignal::Kill);
                let _ = child.kill().await;
            }
        }
        // Stragglers that outlived the leader.
        signal_group(group, GroupSignal::Kill);
    }

    fn check_exit(&self, status: ExitStatus, stderr: &[u8]) -> Result<()> {
        if status.success() {
            return Ok(());
        }
        Err(Error::Predictor(format!(
            "{} exited with {}: {}",
            self.name,
            status,
            stderr_tail(stderr)
        )))
    }
}

#[async_trait]
impl Predictor for CommandPredictor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn predict(&self, args: &BatchPayload, cancel: CancellationToken) -> Result<Prediction> {
        let mut child = self
            .build_command(args)
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", self.command, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("predictor stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("predictor stderr not captured".to_string()))?;
        let stdout_task = tokio::spawn(read_all(stdout));
        let stderr_task = tokio::spawn(read_all(stderr));

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                self.terminate(&mut child).await;
                return Err(Error::Cancelled);
            }
        };

        let stdout = join_output(stdout_task).await?;
        let stderr = join_output(stderr_task).await?;
        if self.config.log_stderr && !stderr.is_empty() {
            tracing::debug!("{} stderr: {}", self.name, String::from_utf8_lossy(&stderr));
        }
        self.check_exit(status, &stderr)?;

        parse_prediction(&stdout)
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(group: Option<u32>, signal: GroupSignal) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = group else { return };
    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    if let Err(e) = killpg(Pid::from_raw(pgid as i32), signal) {
        tracing::trace!("killpg({}, {}) failed: {}", pgid, signal, e);
    }
}

#[cfg(not(unix))]
fn signal_group(_group: Option<u32>, _signal: GroupSignal) {}

fn payload_arg(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

async fn join_output(task: tokio::task::JoinHandle<std::io::Result<Vec<u8>>>) -> Result<Vec<u8>> {
    task.await
        .map_err(|e| Error::Internal(format!("predictor output reader failed: {}", e)))?
        .map_err(Error::from)
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.is_empty() {
        return "<no stderr>".to_string();
    }
    let start = text.len().saturating_sub(STDERR_TAIL);
    let start = (start..text.len())
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(text.len());
    text[start..].to_string()
}

fn parse_prediction(stdout: &[u8]) -> Result<Prediction> {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::InvalidOutput("nothing written to stdout".to_string()));
    }
    serde_json::from_str(text).map_err(|e| Error::InvalidOutput(e.to_string()))
}
