//! Job records and the events the pool emits about them.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::{JobId, JobRequest, SessionId, TerminalStatus};
use crate::worker::WorkerId;

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Success,
    Error,
    Cancelled,
}

impl JobState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            (Queued, Running) | (Queued, Cancelled) |
            (Running, Success) | (Running, Error) | (Running, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }
}

impl From<TerminalStatus> for JobState {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Success => Self::Success,
            TerminalStatus::Error => Self::Error,
            TerminalStatus::Cancelled => Self::Cancelled,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Pool-internal record of one dispatched job.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: JobId,
    pub request: JobRequest,
    pub state: JobState,
    /// Worker running the job, once started.
    pub worker_id: Option<WorkerId>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(job_id: JobId, request: JobRequest) -> Self {
        Self {
            job_id,
            request,
            state: JobState::Queued,
            worker_id: None,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.request.session_id
    }

    /// Mark the job running on a worker.
    pub fn start(&mut self, worker_id: WorkerId) -> Result<(), String> {
        self.transition_to(JobState::Running)?;
        self.worker_id = Some(worker_id);
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Record the terminal outcome.
    pub fn finish(&mut self, status: TerminalStatus) -> Result<(), String> {
        self.transition_to(status.into())?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    fn transition_to(&mut self, target: JobState) -> Result<(), String> {
        if !self.state.can_transition_to(target) {
            return Err(format!(
                "Job {} cannot transition from {} to {}",
                self.job_id, self.state, target
            ));
        }
        self.state = target;
        Ok(())
    }
}

/// Something that happened to a job, delivered to the session's listener.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub job_id: JobId,
    pub session_id: SessionId,
    pub kind: JobEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobEventKind {
    /// The job was handed to a worker.
    Started { worker_id: WorkerId },
    /// One streamed engine item.
    Message(serde_json::Value),
    /// Failure description; always followed by `Finished(Error)`.
    Failed(String),
    /// Exactly once per job.
    Finished(TerminalStatus),
}

impl JobEvent {
    pub fn new(job_id: JobId, session_id: impl Into<SessionId>, kind: JobEventKind) -> Self {
        Self {
            job_id,
            session_id: session_id.into(),
            kind,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.kind, JobEventKind::Finished(_))
    }
}
