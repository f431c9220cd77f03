//! Worker runtime: the loop that runs inside each pool process.
//!
//! Reads [`ManagerEnvelope`]s from its input, drives at most one engine call
//! at a time, and writes [`WorkerEnvelope`]s to its output. Everything runs
//! inside a single future (no spawned tasks), so dropping the future tears
//! the worker down completely, pipes included.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{AgentEngine, EngineQuery};
use crate::error::{EngineError, ProtocolError};
use crate::protocol::{
    CompletionStatus, JobId, JobOptions, ManagerEnvelope, SessionId, WorkerEnvelope,
    envelope_reader, envelope_writer, next_envelope, send_envelope, validate_job_fields,
};

type Outbox = mpsc::UnboundedSender<WorkerEnvelope>;

/// The job currently executing in this worker.
struct RunningJob {
    job_id: JobId,
    session_id: SessionId,
    cancel: CancellationToken,
    task: Pin<Box<dyn Future<Output = ()> + Send>>,
}

/// Executes jobs received over a pair of pipes.
pub struct WorkerRuntime {
    engine: Arc<dyn AgentEngine>,
}

impl WorkerRuntime {
    pub fn new(engine: Arc<dyn AgentEngine>) -> Self {
        Self { engine }
    }

    /// Serve envelopes until `shutdown` or until the input closes.
    pub async fn run<R, W>(self, input: R, output: W) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = envelope_reader(input);
        let mut writer = envelope_writer(output);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WorkerEnvelope>();

        let mut current: Option<RunningJob> = None;
        let mut shutdown_requested = false;
        let mut input_open = true;

        send_envelope(
            &mut writer,
            &WorkerEnvelope::Ready {
                pid: std::process::id(),
            },
        )
        .await?;
        info!(engine = self.engine.name(), "Worker ready");

        loop {
            tokio::select! {
                biased;

                Some(envelope) = out_rx.recv() => {
                    send_envelope(&mut writer, &envelope).await?;
                }

                _ = poll_current(&mut current), if current.is_some() => {
                    if let Some(job) = current.take() {
                        debug!(job_id = %job.job_id, session_id = %job.session_id, "Job finished");
                    }
                    if shutdown_requested {
                        break;
                    }
                }

                envelope = next_envelope::<_, ManagerEnvelope>(&mut reader), if input_open && !shutdown_requested => {
                    match envelope {
                        Ok(Some(ManagerEnvelope::Job { job_id, session_id, prompt, options })) => {
                            self.accept_job(&mut current, &out_tx, job_id, session_id, prompt, options);
                        }
                        Ok(Some(ManagerEnvelope::Abort { job_id, session_id })) => {
                            match current {
                                Some(ref job) if job.job_id == job_id => {
                                    info!(job_id = %job_id, session_id = %session_id, "Aborting job");
                                    job.cancel.cancel();
                                }
                                _ => debug!(job_id = %job_id, "Abort for a job that is not running"),
                            }
                        }
                        Ok(Some(ManagerEnvelope::Shutdown)) => {
                            info!("Shutdown requested");
                            shutdown_requested = true;
                            match current {
                                Some(ref job) => job.cancel.cancel(),
                                None => break,
                            }
                        }
                        Ok(None) => {
                            info!("Manager closed the input; exiting");
                            input_open = false;
                            shutdown_requested = true;
                            match current {
                                Some(ref job) => job.cancel.cancel(),
                                None => break,
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Input stream failed; exiting");
                            input_open = false;
                            shutdown_requested = true;
                            match current {
                                Some(ref job) => job.cancel.cancel(),
                                None => break,
                            }
                        }
                    }
                }
            }
        }

        // Flush whatever the last job emitted, then acknowledge.
        while let Ok(envelope) = out_rx.try_recv() {
            send_envelope(&mut writer, &envelope).await?;
        }
        if input_open {
            send_envelope(&mut writer, &WorkerEnvelope::ShutdownAck).await?;
        }
        Ok(())
    }

    fn accept_job(
        &self,
        current: &mut Option<RunningJob>,
        out: &Outbox,
        job_id: JobId,
        session_id: SessionId,
        prompt: String,
        options: JobOptions,
    ) {
        if let Err(e) = validate_job_fields(&session_id, &prompt) {
            warn!(job_id = %job_id, error = %e, "Rejected job");
            let _ = out.send(WorkerEnvelope::Error {
                job_id,
                session_id,
                error: e.to_string(),
            });
            return;
        }

        if let Some(ref running) = *current {
            warn!(
                job_id = %job_id,
                running = %running.job_id,
                "Job received while busy"
            );
            let _ = out.send(WorkerEnvelope::Error {
                job_id,
                session_id,
                error: format!("worker is busy with job {}", running.job_id),
            });
            return;
        }

        info!(job_id = %job_id, session_id = %session_id, "Starting job");
        let cancel = CancellationToken::new();
        let task = execute_job(
            Arc::clone(&self.engine),
            job_id,
            session_id.clone(),
            EngineQuery { prompt, options },
            cancel.clone(),
            out.clone(),
        );
        *current = Some(RunningJob {
            job_id,
            session_id,
            cancel,
            task: Box::pin(task),
        });
    }
}

async fn poll_current(current: &mut Option<RunningJob>) {
    match current {
        Some(job) => (&mut job.task).await,
        None => std::future::pending().await,
    }
}

/// Run one job to its single terminal envelope.
async fn execute_job(
    engine: Arc<dyn AgentEngine>,
    job_id: JobId,
    session_id: SessionId,
    query: EngineQuery,
    cancel: CancellationToken,
    out: Outbox,
) {
    let outcome = AssertUnwindSafe(stream_items(
        engine,
        job_id,
        &session_id,
        query,
        cancel.clone(),
        &out,
    ))
    .catch_unwind()
    .await;

    let terminal = match outcome {
        Ok(Ok(status)) => WorkerEnvelope::Complete {
            job_id,
            session_id,
            status,
        },
        Ok(Err(error)) if cancel.is_cancelled() => {
            debug!(job_id = %job_id, error = %error, "Engine error after cancellation");
            WorkerEnvelope::Complete {
                job_id,
                session_id,
                status: CompletionStatus::Cancelled,
            }
        }
        Ok(Err(error)) => WorkerEnvelope::Error {
            job_id,
            session_id,
            error,
        },
        Err(payload) => WorkerEnvelope::Error {
            job_id,
            session_id,
            error: EngineError::Panicked(describe_panic(payload.as_ref())).to_string(),
        },
    };
    let _ = out.send(terminal);
}

/// Forward every engine item, checking the cancellation signal between items.
async fn stream_items(
    engine: Arc<dyn AgentEngine>,
    job_id: JobId,
    session_id: &str,
    query: EngineQuery,
    cancel: CancellationToken,
    out: &Outbox,
) -> Result<CompletionStatus, String> {
    let mut items = engine
        .query(query, cancel.clone())
        .await
        .map_err(|e| e.to_string())?;

    loop {
        if cancel.is_cancelled() {
            return Ok(CompletionStatus::Cancelled);
        }
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(CompletionStatus::Cancelled),
            next = items.next() => next,
        };
        match next {
            Some(Ok(item)) => {
                let sent = out.send(WorkerEnvelope::Message {
                    job_id,
                    session_id: session_id.to_string(),
                    item,
                });
                if sent.is_err() {
                    return Ok(CompletionStatus::Cancelled);
                }
            }
            Some(Err(e)) => return Err(e.to_string()),
            None if cancel.is_cancelled() => return Ok(CompletionStatus::Cancelled),
            None => return Ok(CompletionStatus::Success),
        }
    }
}

/// Turn a panic payload into something a human can read.
pub fn describe_panic(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
