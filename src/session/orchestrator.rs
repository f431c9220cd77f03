//! Session orchestrator: maps conversations onto pool jobs.
//!
//! Each turn of a session is one job. The orchestrator registers itself as
//! the pool listener for every session it creates, folds job events into the
//! session record, and republishes them to subscribers: per session, and on a
//! firehose channel for bridge layers that want everything.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{SessionEvent, SessionSubscription};
use super::model::{RunOptions, Session};
use super::skills::{SkillCatalog, SkillInfo, build_skill_prompt, validate_skill_name};
use crate::error::{PoolError, SessionError};
use crate::pool::{JobEvent, JobEventKind, PoolHandle};
use crate::protocol::{JobId, JobRequest, SessionId, TerminalStatus};

/// Events buffered per session for subscribers that fall behind.
const SESSION_CHANNEL_CAPACITY: usize = 1024;
/// Events buffered on the all-sessions channel.
const FIREHOSE_CHANNEL_CAPACITY: usize = 4096;

struct SessionEntry {
    session: Session,
    channel: broadcast::Sender<SessionEvent>,
}

impl SessionEntry {
    fn publish(&self, firehose: &broadcast::Sender<SessionEvent>, event: SessionEvent) {
        // Broadcast, ok if no receivers are listening yet
        let _ = self.channel.send(event.clone());
        let _ = firehose.send(event);
    }
}

pub struct SessionOrchestrator {
    pool: PoolHandle,
    skills: Arc<dyn SkillCatalog>,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    firehose: broadcast::Sender<SessionEvent>,
    /// Handed to the pool as the listener for every session.
    job_events: mpsc::UnboundedSender<JobEvent>,
}

impl SessionOrchestrator {
    /// Create the orchestrator and start pumping pool events into it.
    pub fn new(pool: PoolHandle, skills: Arc<dyn SkillCatalog>) -> Arc<Self> {
        let (job_events, events_rx) = mpsc::unbounded_channel();
        let (firehose, _rx) = broadcast::channel(FIREHOSE_CHANNEL_CAPACITY);

        let orchestrator = Arc::new(Self {
            pool,
            skills,
            sessions: RwLock::new(HashMap::new()),
            firehose,
            job_events,
        });
        spawn_event_pump(Arc::downgrade(&orchestrator), events_rx);
        orchestrator
    }

    /// Start a session that invokes a skill, optionally with arguments and
    /// free text.
    pub async fn run(
        &self,
        skill_name: &str,
        prompt: Option<&str>,
        args: &[String],
        options: RunOptions,
    ) -> Result<SessionId, SessionError> {
        validate_skill_name(skill_name)?;
        let prompt = build_skill_prompt(skill_name, args, prompt);
        self.start_session(Some(skill_name.to_string()), prompt, options)
            .await
    }

    /// Start a session from a plain prompt.
    pub async fn run_with_prompt(
        &self,
        prompt: &str,
        options: RunOptions,
    ) -> Result<SessionId, SessionError> {
        self.start_session(None, prompt.to_string(), options).await
    }

    async fn start_session(
        &self,
        skill_name: Option<String>,
        prompt: String,
        options: RunOptions,
    ) -> Result<SessionId, SessionError> {
        let session_id = Uuid::new_v4().to_string();
        let request = JobRequest::new(
            session_id.clone(),
            prompt.clone(),
            options.to_job_options(None),
        );
        request.validate().map_err(PoolError::from)?;

        // Held across dispatch so no event for the new job can be handled
        // before the session records it.
        let mut sessions = self.sessions.write().await;
        self.pool
            .register_listener(session_id.clone(), self.job_events.clone());
        let job_id = match self.pool.dispatch(request) {
            Ok(job_id) => job_id,
            Err(e) => {
                self.pool.unregister_listener(&session_id);
                return Err(e.into());
            }
        };

        info!(session_id = %session_id, job_id = %job_id, skill = ?skill_name, "Session started");
        let mut session = Session::new(session_id.clone(), skill_name, &prompt, options);
        session.begin_turn(job_id);
        let (channel, _rx) = broadcast::channel(SESSION_CHANNEL_CAPACITY);
        sessions.insert(session_id.clone(), SessionEntry { session, channel });
        Ok(session_id)
    }

    /// Send a follow-up message in an existing conversation.
    pub async fn continue_session(
        &self,
        session_id: &str,
        message: &str,
    ) -> Result<JobId, SessionError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound {
                session_id: session_id.to_string(),
            })?;
        let session = &mut entry.session;

        let Some(resume_token) = session.resume_token.clone() else {
            return Err(SessionError::ResumeUnavailable {
                session_id: session_id.to_string(),
            });
        };
        if session.is_running() {
            return Err(SessionError::Busy {
                session_id: session_id.to_string(),
            });
        }

        let request = JobRequest::new(
            session_id,
            message,
            session.options.to_job_options(Some(resume_token)),
        );
        let job_id = self.pool.dispatch(request)?;

        session.record_user(message);
        session.begin_turn(job_id);
        info!(session_id, job_id = %job_id, turn = session.turns, "Session continued");
        Ok(job_id)
    }

    /// Cancel the running turn. Subscribers see `cancelled` right away;
    /// whatever the worker reports later for that job is ignored.
    pub async fn cancel(&self, session_id: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound {
                session_id: session_id.to_string(),
            })?;

        if !entry.session.is_running() {
            debug!(session_id, "Cancel ignored, session is not running");
            return Ok(());
        }

        self.pool.abort(session_id);
        entry.session.finish(TerminalStatus::Cancelled, None);
        info!(session_id, "Session cancelled");

        entry.publish(
            &self.firehose,
            SessionEvent::Complete {
                session_id: session_id.to_string(),
                status: TerminalStatus::Cancelled,
                error: None,
            },
        );
        Ok(())
    }

    /// Snapshot of one session.
    pub async fn get_session(&self, session_id: &str) -> Option<Session> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|e| e.session.clone())
    }

    /// Snapshots of every session, oldest first.
    pub async fn list_sessions(&self) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        let mut all: Vec<Session> = sessions.values().map(|e| e.session.clone()).collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    /// Forget a session, aborting its job if one is still running. Its
    /// subscriptions end.
    pub async fn remove_session(&self, session_id: &str) -> Option<Session> {
        let entry = self.sessions.write().await.remove(session_id)?;
        if entry.session.is_running() {
            self.pool.abort(session_id);
        }
        self.pool.unregister_listener(session_id);
        info!(session_id, "Session removed");
        Some(entry.session)
    }

    /// Events for one session.
    pub async fn subscribe(&self, session_id: &str) -> Result<SessionSubscription, SessionError> {
        let sessions = self.sessions.read().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound {
                session_id: session_id.to_string(),
            })?;
        Ok(SessionSubscription::new(entry.channel.subscribe()))
    }

    /// Events for every session.
    pub fn subscribe_all(&self) -> SessionSubscription {
        SessionSubscription::new(self.firehose.subscribe())
    }

    pub async fn available_skills(&self) -> Vec<SkillInfo> {
        self.skills.list_skills().await
    }

    async fn handle_job_event(&self, event: JobEvent) {
        let mut sessions = self.sessions.write().await;
        let Some(entry) = sessions.get_mut(&event.session_id) else {
            debug!(session_id = %event.session_id, "Event for unknown session");
            return;
        };
        if entry.session.current_job_id != Some(event.job_id) {
            debug!(
                session_id = %event.session_id,
                job_id = %event.job_id,
                "Ignoring event for a job the session no longer tracks"
            );
            return;
        }

        match event.kind {
            JobEventKind::Started { worker_id } => {
                debug!(session_id = %event.session_id, job_id = %event.job_id, worker_id, "Turn started");
            }
            JobEventKind::Message(item) => {
                if let Some(token) = entry.session.record_item(item.clone()) {
                    info!(session_id = %event.session_id, resume_token = %token, "Captured resume token");
                }
                entry.publish(
                    &self.firehose,
                    SessionEvent::Message {
                        session_id: event.session_id,
                        item,
                    },
                );
            }
            JobEventKind::Failed(description) => {
                warn!(session_id = %event.session_id, job_id = %event.job_id, error = %description, "Turn failed");
                entry.session.error = Some(description);
            }
            JobEventKind::Finished(status) => {
                let error = entry.session.error.take();
                entry.session.finish(status, error.clone());
                info!(session_id = %event.session_id, %status, "Turn finished");
                entry.publish(
                    &self.firehose,
                    SessionEvent::Complete {
                        session_id: event.session_id,
                        status,
                        error,
                    },
                );
            }
        }
    }
}

fn spawn_event_pump(
    orchestrator: Weak<SessionOrchestrator>,
    mut events: mpsc::UnboundedReceiver<JobEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(orchestrator) = orchestrator.upgrade() else {
                break;
            };
            orchestrator.handle_job_event(event).await;
        }
        debug!("Session event pump stopped");
    });
}
