//! Claude CLI engine: one `claude -p` subprocess per job.

use std::collections::VecDeque;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{AgentEngine, EngineQuery, ItemStream};
use crate::error::EngineError;

/// Lines of stderr kept for failure reports.
const STDERR_TAIL_LINES: usize = 20;

/// Spawns the `claude` CLI in stream-json mode and streams its stdout items.
pub struct ClaudeCliEngine {
    program: String,
}

impl ClaudeCliEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Command-line arguments for a query.
    pub fn build_args(query: &EngineQuery) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            query.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        let options = &query.options;
        if let Some(ref model) = options.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(ref token) = options.resume_token {
            args.push("--resume".to_string());
            args.push(token.clone());
        }
        if let Some(ref mode) = options.permission_mode {
            args.push("--permission-mode".to_string());
            args.push(mode.clone());
        }
        args
    }
}

#[async_trait]
impl AgentEngine for ClaudeCliEngine {
    fn name(&self) -> &str {
        "claude"
    }

    async fn query(
        &self,
        query: EngineQuery,
        cancel: CancellationToken,
    ) -> Result<ItemStream, EngineError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(Self::build_args(&query));
        if !query.options.working_directory.as_os_str().is_empty() {
            cmd.current_dir(&query.options.working_directory);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| EngineError::Spawn {
            program: self.program.clone(),
            reason: e.to_string(),
        })?;
        debug!(pid = ?child.id(), "Spawned claude");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Failed("claude stdout was not captured".to_string()))?;
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump_items(child, stdout, stderr, tx, cancel));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Read stdout lines as JSON items until EOF, then report the exit status.
///
/// Stops (and kills the child) as soon as the job is cancelled or the
/// consumer drops the stream.
async fn pump_items(
    mut child: Child,
    stdout: ChildStdout,
    stderr: Option<ChildStderr>,
    tx: mpsc::Sender<Result<serde_json::Value, EngineError>>,
    cancel: CancellationToken,
) {
    let stderr_tail = stderr.map(|s| tokio::spawn(collect_tail(s)));
    let mut lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return;
            }
            _ = tx.closed() => {
                let _ = child.kill().await;
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<serde_json::Value>(&line) {
                        Ok(item) => {
                            if tx.send(Ok(item)).await.is_err() {
                                let _ = child.kill().await;
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "Skipping non-JSON line from claude"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(EngineError::Io(e))).await;
                    let _ = child.kill().await;
                    return;
                }
            }
        }
    }

    match child.wait().await {
        Ok(status) if status.success() => {}
        Ok(status) => {
            let tail = match stderr_tail {
                Some(handle) => handle.await.unwrap_or_default(),
                None => String::new(),
            };
            let reason = if tail.is_empty() {
                format!("claude exited with {status}")
            } else {
                format!("claude exited with {status}: {tail}")
            };
            let _ = tx.send(Err(EngineError::Failed(reason))).await;
        }
        Err(e) => {
            let _ = tx.send(Err(EngineError::Io(e))).await;
        }
    }
}

async fn collect_tail(stderr: ChildStderr) -> String {
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}
