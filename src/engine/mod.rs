//! Agent-query engines.
//!
//! An engine turns one prompt into a stream of opaque JSON items. The worker
//! runtime forwards every item verbatim; the only field anything upstream
//! looks at is `session_id`, which becomes the conversation's resume token.
//!
//! Supports:
//! - **Claude**: the `claude` CLI in `stream-json` output mode
//! - **Echo**: an offline engine that streams a synthetic conversation

mod claude;
mod echo;

pub use claude::ClaudeCliEngine;
pub use echo::EchoEngine;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, EngineKind};
use crate::error::EngineError;
use crate::protocol::JobOptions;

/// Stream of items produced by one engine call.
pub type ItemStream = BoxStream<'static, Result<serde_json::Value, EngineError>>;

/// Input for a single streaming call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineQuery {
    pub prompt: String,
    pub options: JobOptions,
}

/// A streaming agent-query engine.
#[async_trait]
pub trait AgentEngine: Send + Sync {
    /// Engine name, for logs.
    fn name(&self) -> &str;

    /// Start a streaming call.
    ///
    /// `cancel` is the job's cancellation signal. Engines may watch it to
    /// release resources early; the runtime also checks it between items.
    async fn query(
        &self,
        query: EngineQuery,
        cancel: CancellationToken,
    ) -> Result<ItemStream, EngineError>;
}

/// Create an engine from configuration.
pub fn create_engine(config: &EngineConfig) -> Arc<dyn AgentEngine> {
    match config.kind {
        EngineKind::Claude => {
            tracing::info!("Using Claude CLI engine ({})", config.claude_program);
            Arc::new(ClaudeCliEngine::new(config.claude_program.clone()))
        }
        EngineKind::Echo => {
            tracing::info!("Using echo engine (delay {:?})", config.echo_delay);
            Arc::new(EchoEngine::new(config.echo_delay))
        }
    }
}

/// Read the resumable conversation id an engine item carries, if any.
pub fn resume_token_of(item: &serde_json::Value) -> Option<&str> {
    item.get("session_id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}
