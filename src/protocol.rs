//! Manager ⇄ worker message protocol.
//!
//! Envelopes travel as newline-delimited JSON over the worker's stdin
//! (manager → worker) and stdout (worker → manager). Each direction is a
//! closed tagged union; a line that does not decode into it (unknown `type`,
//! missing fields, bad JSON) is rejected at the framing boundary and never
//! reaches the state machines.

use std::path::PathBuf;

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use uuid::Uuid;

use crate::error::{ProtocolError, ValidationError};

/// Stable identity of a logical conversation.
pub type SessionId = String;

/// Unique identity of one dispatched job.
pub type JobId = Uuid;

/// Upper bound for a single encoded envelope. Engine items can carry whole
/// file contents, so this is generous.
pub const MAX_ENVELOPE_BYTES: usize = 16 * 1024 * 1024;

/// Per-job engine options, passed through to the agent-query call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Directory the agent runs in.
    pub working_directory: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Engine conversation id to resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    /// Forwarded verbatim to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
}

/// A request to run one streaming engine call for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub session_id: SessionId,
    pub prompt: String,
    pub options: JobOptions,
}

impl JobRequest {
    pub fn new(
        session_id: impl Into<SessionId>,
        prompt: impl Into<String>,
        options: JobOptions,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            prompt: prompt.into(),
            options,
        }
    }

    /// Check the request shape. Runs on both sides of the pipe.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_job_fields(&self.session_id, &self.prompt)
    }
}

/// Reject empty (or whitespace-only) session ids and prompts.
pub fn validate_job_fields(session_id: &str, prompt: &str) -> Result<(), ValidationError> {
    if session_id.trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: "session_id",
        });
    }
    if prompt.trim().is_empty() {
        return Err(ValidationError::MissingField { field: "prompt" });
    }
    Ok(())
}

/// Envelopes sent from the pool manager to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManagerEnvelope {
    /// Start a job.
    Job {
        job_id: JobId,
        session_id: SessionId,
        prompt: String,
        options: JobOptions,
    },
    /// Cancel the job currently running for this session.
    Abort { job_id: JobId, session_id: SessionId },
    /// Abort anything running, acknowledge, and exit.
    Shutdown,
}

/// How a job ended without an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Success,
    Cancelled,
}

/// Envelopes sent from a worker to the pool manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEnvelope {
    /// Initialization finished; the worker accepts jobs.
    Ready { pid: u32 },
    /// One item streamed by the engine.
    Message {
        job_id: JobId,
        session_id: SessionId,
        item: serde_json::Value,
    },
    /// The job ended normally (including by cancellation).
    Complete {
        job_id: JobId,
        session_id: SessionId,
        status: CompletionStatus,
    },
    /// The job failed.
    Error {
        job_id: JobId,
        session_id: SessionId,
        error: String,
    },
    /// Reply to `shutdown`; nothing follows it.
    ShutdownAck,
}

/// Terminal outcome of a job (and of a session turn).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Success,
    Error,
    Cancelled,
}

impl From<CompletionStatus> for TerminalStatus {
    fn from(status: CompletionStatus) -> Self {
        match status {
            CompletionStatus::Success => Self::Success,
            CompletionStatus::Cancelled => Self::Cancelled,
        }
    }
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Line-framed envelope reader.
pub type EnvelopeReader<R> = FramedRead<R, LinesCodec>;

/// Line-framed envelope writer.
pub type EnvelopeWriter<W> = FramedWrite<W, LinesCodec>;

pub fn envelope_reader<R: AsyncRead>(reader: R) -> EnvelopeReader<R> {
    FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_ENVELOPE_BYTES))
}

pub fn envelope_writer<W: AsyncWrite>(writer: W) -> EnvelopeWriter<W> {
    FramedWrite::new(writer, LinesCodec::new_with_max_length(MAX_ENVELOPE_BYTES))
}

/// Encode an envelope as a single JSON line (without the trailing newline).
pub fn encode<T: Serialize>(envelope: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode one line into an envelope.
pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(line)?)
}

/// Write one envelope and flush.
pub async fn send_envelope<W, T>(
    writer: &mut EnvelopeWriter<W>,
    envelope: &T,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = encode(envelope)?;
    writer.send(line).await?;
    Ok(())
}

/// Read the next decodable envelope.
///
/// Blank lines are skipped. Lines that fail to decode are logged and skipped
/// so a single bad line never tears down the channel. Returns `Ok(None)` at
/// end of stream.
pub async fn next_envelope<R, T>(reader: &mut EnvelopeReader<R>) -> Result<Option<T>, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    while let Some(line) = reader.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match decode::<T>(&line) {
            Ok(envelope) => return Ok(Some(envelope)),
            Err(e) => {
                tracing::warn!(error = %e, line = %truncate(&line, 200), "Rejected envelope");
            }
        }
    }
    Ok(None)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
