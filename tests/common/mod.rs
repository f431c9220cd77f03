//! Shared fixtures: a prompt-scripted engine and an in-process launcher that
//! runs `WorkerRuntime` over duplex pipes instead of OS processes.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_pool::config::PoolConfig;
use agent_pool::engine::{AgentEngine, EngineQuery, ItemStream};
use agent_pool::error::{EngineError, PoolError};
use agent_pool::pool::{JobEvent, JobEventKind};
use agent_pool::protocol::{JobOptions, MAX_ENVELOPE_BYTES};
use agent_pool::worker::{WorkerId, WorkerLauncher, WorkerProcess, WorkerRuntime};
use async_trait::async_trait;
use futures::{FutureExt, StreamExt, stream};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Maximum time any test is allowed to run before we consider it hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Exit code reported when a scripted crash takes the worker down.
pub const CRASH_EXIT_CODE: i32 = 101;

/// What the engine was asked to do.
#[derive(Debug, Clone)]
pub struct EngineCall {
    pub prompt: String,
    pub options: JobOptions,
}

/// Behaviour parsed from whitespace-separated directives in the prompt:
///
/// - `items=N`: stream N items (default 2)
/// - `delay=MS`: sleep before each item (default 0)
/// - `token=X`: conversation id carried by the items (default random)
/// - `untagged=N`: the first N items carry no conversation id
/// - `drift`: items after the first carry a different conversation id
/// - `oversize`: the first item is too large to frame
/// - `fail`: error before streaming, `fail-late`: error after the items
/// - `panic`: panic inside the engine
/// - `stuck`: never return from the query, ignoring cancellation
/// - `crash`: take the whole worker down
#[derive(Debug, Clone)]
struct Script {
    items: usize,
    delay: Duration,
    token: String,
    untagged: usize,
    drift: bool,
    oversize: bool,
    fail: bool,
    fail_late: bool,
    panic: bool,
    stuck: bool,
    crash: bool,
}

impl Script {
    fn parse(prompt: &str, resume: Option<&str>) -> Self {
        let mut script = Script {
            items: 2,
            delay: Duration::ZERO,
            token: resume
                .map(String::from)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            untagged: 0,
            drift: false,
            oversize: false,
            fail: false,
            fail_late: false,
            panic: false,
            stuck: false,
            crash: false,
        };
        for word in prompt.split_whitespace() {
            match word.split_once('=') {
                Some(("items", n)) => script.items = n.parse().unwrap_or(2),
                Some(("delay", ms)) => {
                    script.delay = Duration::from_millis(ms.parse().unwrap_or(0))
                }
                Some(("token", t)) => script.token = t.to_string(),
                Some(("untagged", n)) => script.untagged = n.parse().unwrap_or(0),
                _ => match word {
                    "drift" => script.drift = true,
                    "oversize" => script.oversize = true,
                    "fail" => script.fail = true,
                    "fail-late" => script.fail_late = true,
                    "panic" => script.panic = true,
                    "stuck" => script.stuck = true,
                    "crash" => script.crash = true,
                    _ => {}
                },
            }
        }
        script
    }
}

/// Engine driven by prompt directives. One instance per worker, sharing the
/// call log.
pub struct ScriptedEngine {
    calls: Arc<Mutex<Vec<EngineCall>>>,
    crash: CancellationToken,
}

#[async_trait]
impl AgentEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn query(
        &self,
        query: EngineQuery,
        _cancel: CancellationToken,
    ) -> Result<ItemStream, EngineError> {
        self.calls.lock().unwrap().push(EngineCall {
            prompt: query.prompt.clone(),
            options: query.options.clone(),
        });
        let script = Script::parse(&query.prompt, query.options.resume_token.as_deref());

        if script.crash {
            self.crash.cancel();
            futures::future::pending::<()>().await;
        }
        if script.stuck {
            futures::future::pending::<()>().await;
        }
        if script.panic {
            panic!("scripted engine panic");
        }
        if script.fail {
            return Err(EngineError::Failed("scripted failure".into()));
        }

        let delay = script.delay;
        let untagged = script.untagged;
        let drift = script.drift;
        let oversize = script.oversize;
        let token = script.token.clone();
        let items = stream::iter(0..script.items).then(move |i| {
            let token = token.clone();
            async move {
                tokio::time::sleep(delay).await;
                let mut item = json!({"type": "assistant", "index": i});
                if i >= untagged {
                    let id = if drift && i > untagged {
                        format!("{token}-{i}")
                    } else {
                        token
                    };
                    item["session_id"] = json!(id);
                }
                if oversize && i == 0 {
                    item["text"] = json!("x".repeat(MAX_ENVELOPE_BYTES + 10));
                }
                Ok(item)
            }
        });
        let tail = stream::iter(
            script
                .fail_late
                .then(|| Err(EngineError::Failed("scripted late failure".into()))),
        );
        Ok(Box::pin(items.chain(tail)))
    }
}

/// Launches `WorkerRuntime`s on tokio tasks wired up with duplex pipes.
#[derive(Default)]
pub struct InProcessLauncher {
    calls: Arc<Mutex<Vec<EngineCall>>>,
    launches: AtomicUsize,
}

impl InProcessLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every prompt any worker's engine received, in order.
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, _worker_id: WorkerId) -> Result<WorkerProcess, PoolError> {
        self.launches.fetch_add(1, Ordering::SeqCst);

        let crash = CancellationToken::new();
        let engine = Arc::new(ScriptedEngine {
            calls: self.calls.clone(),
            crash: crash.clone(),
        });

        let (manager_side, worker_side) = tokio::io::duplex(64 * 1024);
        let (manager_read, manager_write) = tokio::io::split(manager_side);
        let (worker_read, worker_write) = tokio::io::split(worker_side);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = WorkerRuntime::new(engine).run(worker_read, worker_write) => Some(0),
                _ = crash.cancelled() => Some(CRASH_EXIT_CODE),
                _ = kill_rx => Some(137),
            }
        });

        Ok(WorkerProcess {
            pid: None,
            stdin: Box::new(manager_write),
            stdout: Box::new(manager_read),
            stderr: None,
            exit: async move { task.await.ok().flatten() }.boxed(),
            kill: kill_tx,
        })
    }
}

pub fn test_config(pool_size: usize) -> PoolConfig {
    PoolConfig {
        pool_size,
        ready_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(2),
        respawn_delay: Duration::from_millis(10),
        ..PoolConfig::default()
    }
}

/// Receive events until `count` jobs have finished.
pub async fn collect_finished(
    rx: &mut mpsc::UnboundedReceiver<JobEvent>,
    count: usize,
) -> Vec<JobEvent> {
    let mut events = Vec::new();
    let mut finished = 0;
    tokio::time::timeout(TEST_TIMEOUT, async {
        while finished < count {
            let Some(event) = rx.recv().await else { break };
            if event.is_finished() {
                finished += 1;
            }
            events.push(event);
        }
    })
    .await
    .expect("timed out waiting for jobs to finish");
    events
}

/// Receive events until one matches.
pub async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<JobEvent>, mut pred: F) -> JobEvent
where
    F: FnMut(&JobEvent) -> bool,
{
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let event = rx.recv().await.expect("listener closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub fn finished_status(events: &[JobEvent], job_id: Uuid) -> Vec<JobEventKind> {
    events
        .iter()
        .filter(|e| e.job_id == job_id && e.is_finished())
        .map(|e| e.kind.clone())
        .collect()
}
