//! The external agent collaborator.
//!
//! An [`Agent`] takes a prompt and produces a stream of typed blocks followed
//! by a final reply. The core never interprets block payloads beyond the tag;
//! it accumulates text and forwards everything to subscribers.

mod catalog;
mod process;

pub use catalog::AgentCatalog;
pub use process::ProcessAgent;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Blocks
// ============================================================================

/// One tagged chunk emitted by an agent while it works.
///
/// The payload shapes vary per agent; the core only relies on the tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentBlock {
    Text {
        text: String,
    },
    Code {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        code: String,
    },
    Thinking {
        text: String,
    },
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        output: String,
    },
    Image {
        media_type: String,
        data: String,
    },
    Bash {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    System {
        text: String,
    },
}

impl AgentBlock {
    /// Displayable text carried by this block, if it contributes to the
    /// accumulated response.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AgentBlock::Text { text } => Some(text),
            _ => None,
        }
    }
}

// ============================================================================
// Run Contract
// ============================================================================

/// Token usage reported by an agent, when available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Final result of an agent run.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub final_text: String,
    pub usage: Option<Usage>,
}

/// Per-run context handed to [`Agent::run`].
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Optional working directory / project folder for the agent.
    pub folder_context: Option<String>,
    /// Cancelling this token must abort the run promptly.
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(folder_context: Option<String>, cancel: CancellationToken) -> Self {
        Self {
            folder_context,
            cancel,
        }
    }
}

/// Chunk callback invoked zero or more times before `run` resolves.
pub type ChunkSink<'a> = &'a (dyn Fn(AgentBlock) + Send + Sync);

/// An external command-line AI agent.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Prepare the agent for a run.
    ///
    /// Called under the dispatcher's acquisition timeout; implementations
    /// that need warm-up (process start, handshake) do it here.
    async fn connect(&self) -> Result<(), AgentError> {
        Ok(())
    }

    /// Run a prompt to completion, emitting chunks along the way.
    async fn run(
        &self,
        prompt: &str,
        ctx: RunContext,
        on_chunk: ChunkSink<'_>,
    ) -> Result<AgentReply, AgentError>;
}

impl std::fmt::Debug for dyn Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Agent")
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from agent acquisition and invocation.
#[derive(Debug, Error)]
pub enum AgentError {
    /// No agent is registered under the requested id.
    #[error("agent '{0}' not found")]
    UnknownAgent(String),

    /// Acquisition did not finish within the bounded timeout.
    #[error("timed out acquiring agent '{0}' after {1:?}")]
    AcquireTimeout(String, Duration),

    /// The agent process or protocol failed.
    #[error("agent invocation failed: {0}")]
    Invocation(String),

    /// The run was aborted through its cancellation handle.
    #[error("agent run was cancelled")]
    Cancelled,

    /// I/O failure talking to the agent.
    #[error("agent i/o error: {0}")]
    Io(#[from] std::io::Error),
}
