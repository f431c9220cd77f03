//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const ENV_POOL_SIZE: &str = "AGENT_POOL_SIZE";
pub const ENV_WORKER_BIN: &str = "AGENT_POOL_WORKER_BIN";
pub const ENV_ENGINE: &str = "AGENT_POOL_ENGINE";
pub const ENV_READY_TIMEOUT: &str = "AGENT_POOL_READY_TIMEOUT_SECS";
pub const ENV_SHUTDOWN_TIMEOUT: &str = "AGENT_POOL_SHUTDOWN_TIMEOUT_SECS";
pub const ENV_RESPAWN_DELAY: &str = "AGENT_POOL_RESPAWN_DELAY_MS";
pub const ENV_CLAUDE_BIN: &str = "AGENT_POOL_CLAUDE_BIN";
pub const ENV_ECHO_DELAY: &str = "AGENT_POOL_ECHO_DELAY_MS";

/// Name of the worker executable shipped next to the control binary.
pub const WORKER_BINARY_NAME: &str = "agent-pool-worker";

/// Which agent-query engine the workers drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// The `claude` CLI in stream-json mode.
    Claude,
    /// Offline engine that streams a synthetic conversation.
    Echo,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Echo => "echo",
        }
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "claude" => Ok(Self::Claude),
            "echo" => Ok(Self::Echo),
            other => Err(format!("unknown engine '{other}' (expected 'claude' or 'echo')")),
        }
    }
}

/// Engine settings, shared by the manager (which forwards them) and the
/// worker process (which reads them back from its environment).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub kind: EngineKind,
    /// Program invoked by the Claude engine.
    pub claude_program: String,
    /// Pause between items emitted by the echo engine.
    pub echo_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Claude,
            claude_program: "claude".to_string(),
            echo_delay: Duration::from_millis(20),
        }
    }
}

impl EngineConfig {
    /// Build from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let kind = match lookup(ENV_ENGINE) {
            Some(raw) => raw.parse().map_err(|message| ConfigError::InvalidValue {
                key: ENV_ENGINE.to_string(),
                message,
            })?,
            None => defaults.kind,
        };
        let claude_program = lookup(ENV_CLAUDE_BIN)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.claude_program);
        let echo_delay = Duration::from_millis(parse_or(&lookup, ENV_ECHO_DELAY, 20u64)?);

        Ok(Self {
            kind,
            claude_program,
            echo_delay,
        })
    }

    /// Environment passed to worker processes so they build the same engine.
    pub fn to_env(&self) -> Vec<(String, String)> {
        vec![
            (ENV_ENGINE.to_string(), self.kind.as_str().to_string()),
            (ENV_CLAUDE_BIN.to_string(), self.claude_program.clone()),
            (
                ENV_ECHO_DELAY.to_string(),
                self.echo_delay.as_millis().to_string(),
            ),
        ]
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker processes.
    pub pool_size: usize,
    /// Worker executable.
    pub worker_program: PathBuf,
    /// Extra arguments for the worker executable.
    pub worker_args: Vec<String>,
    /// Engine the workers run.
    pub engine: EngineConfig,
    /// How long `start()` waits for every worker to report ready.
    pub ready_timeout: Duration,
    /// How long `stop()` waits for shutdown acknowledgments before killing.
    pub shutdown_timeout: Duration,
    /// Pause before retrying a failed worker launch.
    pub respawn_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            worker_program: default_worker_program(),
            worker_args: Vec::new(),
            engine: EngineConfig::default(),
            ready_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            respawn_delay: Duration::from_millis(500),
        }
    }
}

impl PoolConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let pool_size: usize = parse_or(&lookup, ENV_POOL_SIZE, defaults.pool_size)?;
        if pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: ENV_POOL_SIZE.to_string(),
                message: "pool size must be at least 1".to_string(),
            });
        }

        let worker_program = lookup(ENV_WORKER_BIN)
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.worker_program);

        Ok(Self {
            pool_size,
            worker_program,
            worker_args: defaults.worker_args,
            engine: EngineConfig::from_lookup(&lookup)?,
            ready_timeout: Duration::from_secs(parse_or(
                &lookup,
                ENV_READY_TIMEOUT,
                defaults.ready_timeout.as_secs(),
            )?),
            shutdown_timeout: Duration::from_secs(parse_or(
                &lookup,
                ENV_SHUTDOWN_TIMEOUT,
                defaults.shutdown_timeout.as_secs(),
            )?),
            respawn_delay: Duration::from_millis(parse_or(
                &lookup,
                ENV_RESPAWN_DELAY,
                defaults.respawn_delay.as_millis() as u64,
            )?),
        })
    }
}

/// `agent-pool-worker` next to the running executable, or bare on `$PATH`.
fn default_worker_program() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_BINARY_NAME)))
        .filter(|path| path.exists())
        .unwrap_or_else(|| PathBuf::from(WORKER_BINARY_NAME))
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}
