//! Session data model: conversation state kept by the orchestrator.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::resume_token_of;
use crate::protocol::{JobId, JobOptions, SessionId, TerminalStatus};

/// Where a session is in its current turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed { status: TerminalStatus },
}

impl SessionStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Terminal status of the last turn, once it ended.
    pub fn terminal(&self) -> Option<TerminalStatus> {
        match self {
            Self::Running => None,
            Self::Completed { status } => Some(*status),
        }
    }
}

/// One entry in a session's message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
    /// Written when the session is created.
    Init {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skill_name: Option<String>,
        prompt: String,
        timestamp: DateTime<Utc>,
    },
    /// A follow-up message sent through `continue`.
    User {
        content: String,
        timestamp: DateTime<Utc>,
    },
    /// An item streamed by the engine.
    Engine {
        item: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
}

/// A tool call waiting for approval. Carried in the model only; the engine
/// currently runs fully trusted and never asks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPermission {
    pub request_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
}

/// Caller-supplied settings for every turn of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    pub working_directory: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
}

impl RunOptions {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_permission_mode(mut self, mode: impl Into<String>) -> Self {
        self.permission_mode = Some(mode.into());
        self
    }

    /// Job options for one turn.
    pub fn to_job_options(&self, resume_token: Option<String>) -> JobOptions {
        JobOptions {
            working_directory: self.working_directory.clone(),
            model: self.model.clone(),
            resume_token,
            permission_mode: self.permission_mode.clone(),
        }
    }
}

/// A logical, possibly multi-turn conversation.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill_name: Option<String>,
    pub status: SessionStatus,
    pub message_log: Vec<LogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_permission: Option<PendingPermission>,
    pub approved_permission_types: HashSet<String>,
    /// Engine conversation id, needed to continue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_job_id: Option<JobId>,
    pub options: RunOptions,
    /// Failure description of the last turn, if it failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of jobs dispatched for this session.
    pub turns: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// A new session about to run its first turn.
    pub fn new(
        session_id: impl Into<SessionId>,
        skill_name: Option<String>,
        prompt: &str,
        options: RunOptions,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            message_log: vec![LogEntry::Init {
                skill_name: skill_name.clone(),
                prompt: prompt.to_string(),
                timestamp: now,
            }],
            skill_name,
            status: SessionStatus::Running,
            pending_permission: None,
            approved_permission_types: HashSet::new(),
            resume_token: None,
            current_job_id: None,
            options,
            error: None,
            turns: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    /// Record that a job was dispatched for the next turn.
    pub fn begin_turn(&mut self, job_id: JobId) {
        self.status = SessionStatus::Running;
        self.current_job_id = Some(job_id);
        self.error = None;
        self.turns += 1;
        self.updated_at = Utc::now();
    }

    pub fn record_user(&mut self, content: &str) {
        let timestamp = Utc::now();
        self.message_log.push(LogEntry::User {
            content: content.to_string(),
            timestamp,
        });
        self.updated_at = timestamp;
    }

    /// Append a streamed item. Returns the resume token if this item is the
    /// one that supplied it.
    pub fn record_item(&mut self, item: serde_json::Value) -> Option<String> {
        let captured = match self.resume_token {
            None => resume_token_of(&item).map(str::to_string),
            Some(_) => None,
        };
        if let Some(ref token) = captured {
            self.resume_token = Some(token.clone());
        }

        let timestamp = Utc::now();
        self.message_log.push(LogEntry::Engine { item, timestamp });
        self.updated_at = timestamp;
        captured
    }

    /// End the current turn.
    pub fn finish(&mut self, status: TerminalStatus, error: Option<String>) {
        self.status = SessionStatus::Completed { status };
        self.current_job_id = None;
        self.error = error;
        self.updated_at = Utc::now();
    }
}
