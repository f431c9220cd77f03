//! Worker handle: the pool manager's proxy for one worker slot.
//!
//! Each attached process gets three background tasks: a writer draining the
//! outbox into stdin, a reader turning stdout lines into [`WorkerSignal`]s
//! (and reporting the exit once stdout closes), and a stderr forwarder.
//! Output that cannot be framed is reported as [`SignalKind::Unreadable`];
//! the reader then waits for the exit, so the owner must kill the process.
//! Signals carry the slot's generation so anything from a replaced process
//! can be told apart from the current one.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::protocol::{
    JobId, ManagerEnvelope, WorkerEnvelope, envelope_reader, envelope_writer, next_envelope,
    send_envelope,
};
use crate::worker::launcher::WorkerProcess;
use crate::worker::state::{WorkerId, WorkerState};

/// Something observed on a worker's pipes.
#[derive(Debug)]
pub struct WorkerSignal {
    pub worker_id: WorkerId,
    pub generation: u64,
    pub kind: SignalKind,
}

#[derive(Debug)]
pub enum SignalKind {
    /// A decoded envelope from the worker's stdout.
    Envelope(WorkerEnvelope),
    /// Stdout can no longer be read. Nothing more will be relayed until the
    /// process exits.
    Unreadable { reason: String },
    /// The worker process is gone.
    Exited { code: Option<i32> },
}

/// Manager-side proxy for one pool slot.
pub struct WorkerHandle {
    id: WorkerId,
    generation: u64,
    state: WorkerState,
    current_job: Option<JobId>,
    pid: Option<u32>,
    restarts: u32,
    fault: Option<String>,
    outbox: Option<mpsc::UnboundedSender<ManagerEnvelope>>,
    kill: Option<oneshot::Sender<()>>,
}

impl WorkerHandle {
    /// An empty slot with no process attached.
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            generation: 0,
            state: WorkerState::Terminated,
            current_job: None,
            pid: None,
            restarts: 0,
            fault: None,
            outbox: None,
            kill: None,
        }
    }

    /// Attach a freshly launched process and start its IO tasks.
    pub fn attach(&mut self, process: WorkerProcess, signals: mpsc::UnboundedSender<WorkerSignal>) {
        if self.generation > 0 {
            self.restarts += 1;
        }
        self.generation += 1;
        self.state = WorkerState::Starting;
        self.current_job = None;
        self.fault = None;
        self.pid = process.pid;

        let WorkerProcess {
            pid: _,
            stdin,
            stdout,
            stderr,
            exit,
            kill,
        } = process;

        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<ManagerEnvelope>();
        let worker_id = self.id;
        let generation = self.generation;

        tokio::spawn(async move {
            let mut writer = envelope_writer(stdin);
            while let Some(envelope) = outbox_rx.recv().await {
                if let Err(e) = send_envelope(&mut writer, &envelope).await {
                    warn!(worker_id, error = %e, "Failed to write to worker");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut reader = envelope_reader(stdout);
            let mut exit = exit;
            let relay = |envelope: WorkerEnvelope| {
                signals
                    .send(WorkerSignal {
                        worker_id,
                        generation,
                        kind: SignalKind::Envelope(envelope),
                    })
                    .is_ok()
            };

            let code = loop {
                tokio::select! {
                    biased;

                    envelope = next_envelope::<_, WorkerEnvelope>(&mut reader) => match envelope {
                        Ok(Some(envelope)) => {
                            if !relay(envelope) {
                                return;
                            }
                        }
                        Ok(None) => break (&mut exit).await,
                        Err(e) => {
                            warn!(worker_id, error = %e, "Worker output unreadable");
                            let reported = signals
                                .send(WorkerSignal {
                                    worker_id,
                                    generation,
                                    kind: SignalKind::Unreadable {
                                        reason: e.to_string(),
                                    },
                                })
                                .is_ok();
                            if !reported {
                                return;
                            }
                            break (&mut exit).await;
                        }
                    },

                    code = &mut exit => {
                        // Pick up whatever the worker wrote before it went away.
                        while let Ok(Some(envelope)) = next_envelope(&mut reader).await {
                            if !relay(envelope) {
                                return;
                            }
                        }
                        break code;
                    }
                }
            };

            let _ = signals.send(WorkerSignal {
                worker_id,
                generation,
                kind: SignalKind::Exited { code },
            });
        });

        if let Some(stderr) = stderr {
            tokio::spawn(forward_stderr(worker_id, stderr));
        }

        self.outbox = Some(outbox_tx);
        self.kill = Some(kill);
    }

    /// Queue an envelope for the worker. Returns false if the writer is gone.
    pub fn send(&self, envelope: ManagerEnvelope) -> bool {
        match self.outbox {
            Some(ref outbox) => outbox.send(envelope).is_ok(),
            None => false,
        }
    }

    /// Force the process down. Its exit still arrives as a signal.
    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    /// Kill a process that can no longer be trusted, remembering why.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.fault.is_none() {
            self.fault = Some(reason.into());
        }
        self.kill();
    }

    /// Why the process was killed by [`fail`](Self::fail), if it was.
    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    /// Forget the process after its exit has been observed.
    pub fn detach(&mut self) {
        self.fault = None;
        self.outbox = None;
        self.kill = None;
        self.pid = None;
        self.current_job = None;
    }

    /// Transition to a new state.
    pub fn transition_to(&mut self, target: WorkerState) -> Result<(), String> {
        if self.state == target {
            return Ok(());
        }
        if !self.state.can_transition_to(target) {
            return Err(format!(
                "Worker {} cannot transition from {} to {}",
                self.id, self.state, target
            ));
        }
        self.state = target;
        Ok(())
    }

    /// Mark the worker busy with a job.
    pub fn assign(&mut self, job_id: JobId) -> Result<(), String> {
        self.transition_to(WorkerState::Busy)?;
        self.current_job = Some(job_id);
        Ok(())
    }

    /// Clear the current job and return the slot to `ready`.
    pub fn release(&mut self) -> Option<JobId> {
        let job = self.current_job.take();
        if self.state == WorkerState::Busy {
            self.state = WorkerState::Ready;
        }
        job
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn current_job(&self) -> Option<JobId> {
        self.current_job
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn is_idle(&self) -> bool {
        self.state == WorkerState::Ready && self.current_job.is_none()
    }
}

async fn forward_stderr(worker_id: WorkerId, stderr: Box<dyn AsyncRead + Send + Unpin>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            debug!(worker_id, "worker stderr: {}", line);
        }
    }
}
