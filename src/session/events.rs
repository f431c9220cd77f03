//! Session events and subscriptions.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::protocol::{SessionId, TerminalStatus};

/// What subscribers see for a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// One streamed engine item.
    Message {
        session_id: SessionId,
        item: serde_json::Value,
    },
    /// The current turn ended.
    Complete {
        session_id: SessionId,
        status: TerminalStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Message { session_id, .. } | Self::Complete { session_id, .. } => session_id,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }
}

/// A live subscription. Dropping it unsubscribes; it also ends on its own
/// once the session is removed.
///
/// Delivery is lossy: the channel buffers a bounded number of events, and a
/// subscriber that falls further behind misses the oldest ones. The
/// session's `message_log` always holds every item.
pub struct SessionSubscription {
    rx: broadcast::Receiver<SessionEvent>,
}

impl SessionSubscription {
    pub(crate) fn new(rx: broadcast::Receiver<SessionEvent>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the channel is closed. Events dropped
    /// because this subscriber fell behind are skipped with a warning.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Session subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
