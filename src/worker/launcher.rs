//! Worker launchers: how the pool gets a fresh worker process.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::info;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::worker::state::WorkerId;

/// A launched worker: its pipes plus a way to observe and force its exit.
pub struct WorkerProcess {
    /// OS process id, when there is one.
    pub pid: Option<u32>,
    /// Manager → worker envelopes.
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Worker → manager envelopes.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Diagnostic output, forwarded to the log.
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    /// Resolves with the exit code once the worker is gone.
    pub exit: BoxFuture<'static, Option<i32>>,
    /// Send (or drop) to force the worker down.
    pub kill: oneshot::Sender<()>,
}

/// Starts worker processes for the pool.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, worker_id: WorkerId) -> Result<WorkerProcess, PoolError>;
}

/// Launches the worker executable as a child process speaking the protocol
/// over stdin/stdout.
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Launcher for the configured worker binary and engine.
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            program: config.worker_program.clone(),
            args: config.worker_args.clone(),
            env: config.engine.to_env(),
        }
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, worker_id: WorkerId) -> Result<WorkerProcess, PoolError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| PoolError::LaunchFailed {
            worker_id,
            reason: format!("{}: {}", self.program.display(), e),
        })?;
        let pid = child.id();

        let missing = |pipe: &str| PoolError::LaunchFailed {
            worker_id,
            reason: format!("{pipe} was not captured"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take();

        info!(worker_id, pid = ?pid, "Spawned worker process");

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let exit = async move {
            tokio::select! {
                status = child.wait() => status.ok().and_then(|s| s.code()),
                _ = kill_rx => {
                    let _ = child.kill().await;
                    child.wait().await.ok().and_then(|s| s.code())
                }
            }
        }
        .boxed();

        Ok(WorkerProcess {
            pid,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
            exit,
            kill: kill_tx,
        })
    }
}
