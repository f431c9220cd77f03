//! Pool manager: owns the worker slots, the job queue and response routing.
//!
//! All mutable pool state lives in a single actor task. [`PoolHandle`] is the
//! cheap, cloneable front end: `dispatch` and `abort` never wait on the actor,
//! `start`, `stop` and `status` await a reply.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::{Job, JobEvent, JobEventKind};
use super::queue::JobQueue;
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::protocol::{JobId, JobRequest, ManagerEnvelope, SessionId, TerminalStatus, WorkerEnvelope};
use crate::worker::{
    SignalKind, WorkerHandle, WorkerId, WorkerLauncher, WorkerProcess, WorkerSignal, WorkerState,
};

/// Receives every event for the sessions it is registered for.
pub type JobListener = mpsc::UnboundedSender<JobEvent>;

/// Outcome of a graceful stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Workers that answered `shutdown` with `shutdown_ack`.
    pub acknowledged: usize,
    /// Workers force-killed after the shutdown timeout.
    pub killed: usize,
}

/// Point-in-time view of one worker slot.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub worker_id: WorkerId,
    pub state: WorkerState,
    pub current_job: Option<JobId>,
    pub pid: Option<u32>,
    pub restarts: u32,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub workers: Vec<WorkerSnapshot>,
    pub running: usize,
    pub queued: usize,
    pub accepting: bool,
}

impl PoolStatus {
    /// Workers able to run jobs (`ready` or `busy`).
    pub fn usable_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.state.is_usable()).count()
    }
}

enum Command {
    Start {
        reply: oneshot::Sender<Result<(), PoolError>>,
    },
    Dispatch {
        job: Job,
    },
    Abort {
        session_id: SessionId,
    },
    Stop {
        reply: oneshot::Sender<ShutdownReport>,
    },
    RegisterListener {
        session_id: SessionId,
        listener: JobListener,
    },
    UnregisterListener {
        session_id: SessionId,
    },
    Status {
        reply: oneshot::Sender<PoolStatus>,
    },
}

/// Handle to a running pool. Clones share the same pool.
#[derive(Clone)]
pub struct PoolHandle {
    commands: mpsc::UnboundedSender<Command>,
    accepting: Arc<AtomicBool>,
    ready_timeout: Duration,
}

impl PoolHandle {
    /// Create the pool actor. No worker is launched until [`start`](Self::start).
    pub fn spawn(config: &PoolConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let accepting = Arc::new(AtomicBool::new(true));

        let actor = PoolActor::new(config, launcher, commands_rx, accepting.clone());
        tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            accepting,
            ready_timeout: config.ready_timeout,
        }
    }

    /// Launch every worker and wait until all of them report `ready`.
    /// Calling it again after a successful start returns immediately.
    pub async fn start(&self) -> Result<(), PoolError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start { reply })?;

        match tokio::time::timeout(self.ready_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PoolError::Closed),
            Err(_) => Err(PoolError::ReadyTimeout {
                waited: self.ready_timeout,
            }),
        }
    }

    /// Submit a job. Validation happens here, before anything else sees the
    /// request; the job then starts on an idle worker or waits in the queue.
    pub fn dispatch(&self, request: JobRequest) -> Result<JobId, PoolError> {
        request.validate()?;
        if !self.is_accepting() {
            return Err(PoolError::ShuttingDown);
        }

        let job_id = Uuid::new_v4();
        self.send(Command::Dispatch {
            job: Job::new(job_id, request),
        })?;
        Ok(job_id)
    }

    /// Cancel whatever the session has in the pool. Fire-and-forget; a
    /// session with no job is left alone.
    pub fn abort(&self, session_id: &str) {
        let _ = self.send(Command::Abort {
            session_id: session_id.to_string(),
        });
    }

    /// Stop accepting jobs, shut every worker down, and wait (bounded) for
    /// their acknowledgements.
    pub async fn stop(&self) -> Result<ShutdownReport, PoolError> {
        self.accepting.store(false, Ordering::SeqCst);
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stop { reply })?;
        rx.await.map_err(|_| PoolError::Closed)
    }

    /// Route every event for `session_id` to `listener`, replacing any
    /// previous listener for that session.
    pub fn register_listener(&self, session_id: impl Into<SessionId>, listener: JobListener) {
        let _ = self.send(Command::RegisterListener {
            session_id: session_id.into(),
            listener,
        });
    }

    pub fn unregister_listener(&self, session_id: &str) {
        let _ = self.send(Command::UnregisterListener {
            session_id: session_id.to_string(),
        });
    }

    pub async fn status(&self) -> Result<PoolStatus, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply })?;
        rx.await.map_err(|_| PoolError::Closed)
    }

    /// Whether `dispatch` still accepts jobs.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn send(&self, command: Command) -> Result<(), PoolError> {
        self.commands.send(command).map_err(|_| PoolError::Closed)
    }
}

/// Result of a background launch.
struct Launched {
    worker_id: WorkerId,
    result: Result<WorkerProcess, PoolError>,
}

/// Bookkeeping for an in-progress stop.
struct Stopping {
    deadline: Instant,
    deadline_hit: bool,
    report: ShutdownReport,
    replies: Vec<oneshot::Sender<ShutdownReport>>,
}

struct PoolActor {
    launcher: Arc<dyn WorkerLauncher>,
    respawn_delay: Duration,
    shutdown_timeout: Duration,

    workers: Vec<WorkerHandle>,
    launching: Vec<bool>,
    /// Running jobs by id.
    running: HashMap<JobId, Job>,
    /// Session → its running job.
    running_sessions: HashMap<SessionId, JobId>,
    queue: JobQueue,
    listeners: HashMap<SessionId, JobListener>,

    started: bool,
    ready_waiters: Vec<oneshot::Sender<Result<(), PoolError>>>,
    stopping: Option<Stopping>,
    stopped: Option<ShutdownReport>,
    accepting: Arc<AtomicBool>,

    commands: mpsc::UnboundedReceiver<Command>,
    signals_tx: mpsc::UnboundedSender<WorkerSignal>,
    signals_rx: mpsc::UnboundedReceiver<WorkerSignal>,
    launches_tx: mpsc::UnboundedSender<Launched>,
    launches_rx: mpsc::UnboundedReceiver<Launched>,
}

impl PoolActor {
    fn new(
        config: &PoolConfig,
        launcher: Arc<dyn WorkerLauncher>,
        commands: mpsc::UnboundedReceiver<Command>,
        accepting: Arc<AtomicBool>,
    ) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (launches_tx, launches_rx) = mpsc::unbounded_channel();

        Self {
            launcher,
            respawn_delay: config.respawn_delay,
            shutdown_timeout: config.shutdown_timeout,
            workers: (0..config.pool_size).map(WorkerHandle::new).collect(),
            launching: vec![false; config.pool_size],
            running: HashMap::new(),
            running_sessions: HashMap::new(),
            queue: JobQueue::new(),
            listeners: HashMap::new(),
            started: false,
            ready_waiters: Vec::new(),
            stopping: None,
            stopped: None,
            accepting,
            commands,
            signals_tx,
            signals_rx,
            launches_tx,
            launches_rx,
        }
    }

    async fn run(mut self) {
        info!(pool_size = self.workers.len(), "Pool manager started");

        loop {
            let deadline = self
                .stopping
                .as_ref()
                .filter(|s| !s.deadline_hit)
                .map(|s| s.deadline);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(signal) = self.signals_rx.recv() => self.on_signal(signal),
                Some(launched) = self.launches_rx.recv() => self.on_launched(launched),
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_stop_deadline();
                }
            }
        }

        // Every handle is gone; nobody can observe the pool any more.
        for worker in &mut self.workers {
            worker.kill();
        }
        info!("Pool manager exited");
    }

    // ── Commands ────────────────────────────────────────────────────

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Start { reply } => self.on_start(reply),
            Command::Dispatch { job } => self.on_dispatch(job),
            Command::Abort { session_id } => self.on_abort(&session_id),
            Command::Stop { reply } => self.on_stop(reply),
            Command::RegisterListener {
                session_id,
                listener,
            } => {
                self.listeners.insert(session_id, listener);
            }
            Command::UnregisterListener { session_id } => {
                self.listeners.remove(&session_id);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn on_start(&mut self, reply: oneshot::Sender<Result<(), PoolError>>) {
        if self.stopping.is_some() || self.stopped.is_some() {
            let _ = reply.send(Err(PoolError::ShuttingDown));
            return;
        }
        if self.all_usable() {
            let _ = reply.send(Ok(()));
            return;
        }

        self.ready_waiters.push(reply);
        if !self.started {
            self.started = true;
            for worker_id in 0..self.workers.len() {
                self.schedule_launch(worker_id, Duration::ZERO);
            }
        }
    }

    fn on_dispatch(&mut self, job: Job) {
        if self.stopping.is_some() || self.stopped.is_some() {
            // Slipped past the accepting check while stop was starting.
            self.cancel_queued(job);
            return;
        }

        debug!(job_id = %job.job_id, session_id = %job.session_id(), "Job queued");
        self.queue.push_back(job);
        self.drain_queue();
    }

    fn on_abort(&mut self, session_id: &str) {
        let queued = self.queue.remove_session(session_id);
        let had_queued = !queued.is_empty();
        for job in queued {
            self.cancel_queued(job);
        }

        let running = self.running_sessions.get(session_id).copied();
        if let Some(job_id) = running {
            if let Some(worker) = self
                .workers
                .iter()
                .find(|w| w.current_job() == Some(job_id))
            {
                info!(job_id = %job_id, session_id, worker_id = worker.id(), "Aborting running job");
                worker.send(ManagerEnvelope::Abort {
                    job_id,
                    session_id: session_id.to_string(),
                });
            }
        } else if !had_queued {
            debug!(session_id, "Abort ignored, session has no job");
        }
    }

    fn on_stop(&mut self, reply: oneshot::Sender<ShutdownReport>) {
        if let Some(report) = self.stopped {
            let _ = reply.send(report);
            return;
        }
        if let Some(ref mut stopping) = self.stopping {
            stopping.replies.push(reply);
            return;
        }

        info!(
            running = self.running.len(),
            queued = self.queue.len(),
            "Stopping pool"
        );
        self.accepting.store(false, Ordering::SeqCst);

        for waiter in self.ready_waiters.drain(..) {
            let _ = waiter.send(Err(PoolError::ShuttingDown));
        }
        for job in self.queue.drain() {
            self.cancel_queued(job);
        }

        for worker in &mut self.workers {
            if worker.state().is_live() && worker.state() != WorkerState::Terminating {
                worker.send(ManagerEnvelope::Shutdown);
                let _ = worker.transition_to(WorkerState::Terminating);
            }
        }

        self.stopping = Some(Stopping {
            deadline: Instant::now() + self.shutdown_timeout,
            deadline_hit: false,
            report: ShutdownReport::default(),
            replies: vec![reply],
        });
        self.check_stop_complete();
    }

    fn on_stop_deadline(&mut self) {
        let Some(ref mut stopping) = self.stopping else {
            return;
        };
        stopping.deadline_hit = true;

        for worker in &mut self.workers {
            if worker.state().is_live() {
                warn!(worker_id = worker.id(), "Worker missed the shutdown deadline, killing");
                worker.kill();
                stopping.report.killed += 1;
            }
        }
    }

    fn check_stop_complete(&mut self) {
        if self.workers.iter().any(|w| w.state().is_live()) {
            return;
        }
        let Some(stopping) = self.stopping.take() else {
            return;
        };

        info!(
            acknowledged = stopping.report.acknowledged,
            killed = stopping.report.killed,
            "Pool stopped"
        );
        self.stopped = Some(stopping.report);
        for reply in stopping.replies {
            let _ = reply.send(stopping.report);
        }
    }

    // ── Worker lifecycle ────────────────────────────────────────────

    fn schedule_launch(&mut self, worker_id: WorkerId, delay: Duration) {
        if self.launching[worker_id] {
            return;
        }
        self.launching[worker_id] = true;

        let launcher = self.launcher.clone();
        let launches = self.launches_tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = launcher.launch(worker_id).await;
            let _ = launches.send(Launched { worker_id, result });
        });
    }

    fn on_launched(&mut self, launched: Launched) {
        let worker_id = launched.worker_id;
        self.launching[worker_id] = false;

        if self.stopping.is_some() || self.stopped.is_some() {
            // Dropping the process tears it down.
            debug!(worker_id, "Discarding worker launched during shutdown");
            return;
        }

        match launched.result {
            Ok(process) => {
                let worker = &mut self.workers[worker_id];
                worker.attach(process, self.signals_tx.clone());
                debug!(
                    worker_id,
                    generation = worker.generation(),
                    pid = ?worker.pid(),
                    "Worker attached, waiting for ready"
                );
            }
            Err(e) => {
                error!(worker_id, error = %e, "Worker launch failed, retrying");
                for waiter in self.ready_waiters.drain(..) {
                    let _ = waiter.send(Err(PoolError::LaunchFailed {
                        worker_id,
                        reason: e.to_string(),
                    }));
                }
                self.schedule_launch(worker_id, self.respawn_delay);
            }
        }
    }

    fn on_signal(&mut self, signal: WorkerSignal) {
        let worker_id = signal.worker_id;
        if self.workers[worker_id].generation() != signal.generation {
            debug!(worker_id, generation = signal.generation, "Ignoring signal from replaced worker");
            return;
        }

        match signal.kind {
            SignalKind::Envelope(envelope) => self.on_envelope(worker_id, envelope),
            SignalKind::Unreadable { reason } => {
                error!(worker_id, reason = %reason, "Killing worker with unreadable output");
                self.workers[worker_id].fail(reason);
            }
            SignalKind::Exited { code } => self.on_exited(worker_id, code),
        }
    }

    fn on_envelope(&mut self, worker_id: WorkerId, envelope: WorkerEnvelope) {
        match envelope {
            WorkerEnvelope::Ready { pid } => {
                let worker = &mut self.workers[worker_id];
                if worker.state() != WorkerState::Starting {
                    debug!(worker_id, state = %worker.state(), "Unexpected ready");
                    return;
                }
                let _ = worker.transition_to(WorkerState::Ready);
                info!(worker_id, pid, "Worker ready");

                if self.all_usable() {
                    for waiter in self.ready_waiters.drain(..) {
                        let _ = waiter.send(Ok(()));
                    }
                }
                self.drain_queue();
            }
            WorkerEnvelope::Message {
                job_id,
                session_id,
                item,
            } => {
                if !self.owns_job(worker_id, job_id) {
                    debug!(worker_id, job_id = %job_id, "Dropping message for a job this worker does not hold");
                    return;
                }
                self.emit(JobEvent::new(job_id, session_id, JobEventKind::Message(item)));
            }
            WorkerEnvelope::Complete { job_id, status, .. } => {
                if !self.owns_job(worker_id, job_id) {
                    debug!(worker_id, job_id = %job_id, "Dropping completion for a job this worker does not hold");
                    return;
                }
                self.finish_job(worker_id, job_id, status.into(), None);
            }
            WorkerEnvelope::Error { job_id, error, .. } => {
                if !self.owns_job(worker_id, job_id) {
                    warn!(worker_id, job_id = %job_id, error = %error, "Worker rejected a job it was not assigned");
                    return;
                }
                self.finish_job(worker_id, job_id, TerminalStatus::Error, Some(error));
            }
            WorkerEnvelope::ShutdownAck => {
                debug!(worker_id, "Shutdown acknowledged");
                if let Some(ref mut stopping) = self.stopping {
                    stopping.report.acknowledged += 1;
                }
            }
        }
    }

    fn on_exited(&mut self, worker_id: WorkerId, code: Option<i32>) {
        let worker = &mut self.workers[worker_id];
        let previous = worker.state();
        let orphan = worker.current_job();
        let fault = worker.fault().map(str::to_string);
        worker.detach();
        let _ = worker.transition_to(WorkerState::Terminated);

        let stopping = self.stopping.is_some() || self.stopped.is_some();
        if stopping {
            debug!(worker_id, code = ?code, "Worker exited");
        } else {
            warn!(worker_id, code = ?code, state = %previous, "Worker exited unexpectedly");
        }

        if let Some(job_id) = orphan {
            let reason = match (fault, code) {
                (Some(fault), _) => format!("worker {worker_id} sent unreadable output: {fault}"),
                (None, Some(code)) => format!("worker {worker_id} exited unexpectedly with code {code}"),
                (None, None) => format!("worker {worker_id} was terminated"),
            };
            self.finish_job(worker_id, job_id, TerminalStatus::Error, Some(reason));
        }

        if stopping {
            self.check_stop_complete();
        } else {
            // A worker that never became ready gets a breather before retrying.
            let delay = if previous == WorkerState::Starting {
                self.respawn_delay
            } else {
                Duration::ZERO
            };
            self.schedule_launch(worker_id, delay);
        }
    }

    // ── Jobs ────────────────────────────────────────────────────────

    /// Start queued jobs on idle workers, oldest eligible first.
    fn drain_queue(&mut self) {
        if self.stopping.is_some() || self.stopped.is_some() {
            return;
        }

        while let Some(worker_id) = self.workers.iter().position(|w| w.is_idle()) {
            let running_sessions = &self.running_sessions;
            let Some(mut job) = self
                .queue
                .take_next_eligible(|session| running_sessions.contains_key(session))
            else {
                break;
            };

            let worker = &mut self.workers[worker_id];
            if let Err(e) = job.start(worker_id).and_then(|_| worker.assign(job.job_id)) {
                error!(job_id = %job.job_id, error = %e, "Cannot start job");
                self.queue.push_back(job);
                break;
            }

            let job_id = job.job_id;
            let session_id = job.request.session_id.clone();
            worker.send(ManagerEnvelope::Job {
                job_id,
                session_id: session_id.clone(),
                prompt: job.request.prompt.clone(),
                options: job.request.options.clone(),
            });

            info!(job_id = %job_id, session_id = %session_id, worker_id, "Job started");
            self.running_sessions.insert(session_id.clone(), job_id);
            self.running.insert(job_id, job);
            self.emit(JobEvent::new(
                job_id,
                session_id,
                JobEventKind::Started { worker_id },
            ));
        }
    }

    /// Record a running job's terminal outcome and free its worker.
    fn finish_job(
        &mut self,
        worker_id: WorkerId,
        job_id: JobId,
        status: TerminalStatus,
        failure: Option<String>,
    ) {
        let worker = &mut self.workers[worker_id];
        if worker.current_job() == Some(job_id) {
            worker.release();
        }

        let Some(mut job) = self.running.remove(&job_id) else {
            return;
        };
        if self.running_sessions.get(job.session_id()) == Some(&job_id) {
            self.running_sessions.remove(job.session_id());
        }
        if let Err(e) = job.finish(status) {
            warn!(job_id = %job_id, error = %e, "Job finished twice");
        }

        info!(job_id = %job_id, session_id = %job.session_id(), %status, "Job finished");
        let session_id = job.request.session_id;
        if let Some(description) = failure {
            self.emit(JobEvent::new(
                job_id,
                session_id.clone(),
                JobEventKind::Failed(description),
            ));
        }
        self.emit(JobEvent::new(job_id, session_id, JobEventKind::Finished(status)));

        self.drain_queue();
    }

    fn cancel_queued(&mut self, mut job: Job) {
        let _ = job.finish(TerminalStatus::Cancelled);
        debug!(job_id = %job.job_id, session_id = %job.session_id(), "Queued job cancelled");
        let session_id = job.request.session_id;
        self.emit(JobEvent::new(
            job.job_id,
            session_id,
            JobEventKind::Finished(TerminalStatus::Cancelled),
        ));
    }

    fn emit(&mut self, event: JobEvent) {
        let Some(listener) = self.listeners.get(&event.session_id) else {
            debug!(session_id = %event.session_id, job_id = %event.job_id, "No listener for job event");
            return;
        };
        if listener.send(event).is_err() {
            // Receiver dropped; forget it so the table does not grow.
            self.listeners.retain(|_, l| !l.is_closed());
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn owns_job(&self, worker_id: WorkerId, job_id: JobId) -> bool {
        self.workers[worker_id].current_job() == Some(job_id) && self.running.contains_key(&job_id)
    }

    fn all_usable(&self) -> bool {
        self.workers.iter().all(|w| w.state().is_usable())
    }

    fn snapshot(&self) -> PoolStatus {
        PoolStatus {
            workers: self
                .workers
                .iter()
                .map(|w| WorkerSnapshot {
                    worker_id: w.id(),
                    state: w.state(),
                    current_job: w.current_job(),
                    pid: w.pid(),
                    restarts: w.restarts(),
                })
                .collect(),
            running: self.running.len(),
            queued: self.queue.len(),
            accepting: self.accepting.load(Ordering::SeqCst),
        }
    }
}
