//! Echo engine: streams a synthetic conversation without any network or CLI.
//!
//! Emits the same item shapes as the Claude CLI (`system/init`, `assistant`,
//! `result`) so everything above the worker behaves identically in dry runs.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{AgentEngine, EngineQuery, ItemStream};
use crate::error::EngineError;

pub struct EchoEngine {
    delay: Duration,
}

impl EchoEngine {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    fn items(query: &EngineQuery) -> Vec<serde_json::Value> {
        let conversation_id = query
            .options
            .resume_token
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let text = format!("echo: {}", query.prompt);

        vec![
            json!({
                "type": "system",
                "subtype": "init",
                "session_id": conversation_id,
                "cwd": query.options.working_directory,
                "model": query.options.model.as_deref().unwrap_or("echo"),
                "permissionMode": query.options.permission_mode,
            }),
            json!({
                "type": "assistant",
                "session_id": conversation_id,
                "message": {
                    "role": "assistant",
                    "content": [{"type": "text", "text": text}],
                },
            }),
            json!({
                "type": "result",
                "subtype": "success",
                "session_id": conversation_id,
                "is_error": false,
                "result": text,
            }),
        ]
    }
}

#[async_trait]
impl AgentEngine for EchoEngine {
    fn name(&self) -> &str {
        "echo"
    }

    async fn query(
        &self,
        query: EngineQuery,
        cancel: CancellationToken,
    ) -> Result<ItemStream, EngineError> {
        let items = Self::items(&query).into_iter();
        let delay = self.delay;

        let stream = stream::unfold((items, cancel), move |(mut items, cancel)| async move {
            let item = items.next()?;
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            Some((Ok(item), (items, cancel)))
        });

        Ok(Box::pin(stream))
    }
}
