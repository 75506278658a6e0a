#![allow(dead_code)]
//! Common test utilities.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use tempfile::TempDir;
use tokio::sync::Mutex;

use parlor::agent::{
    Agent, AgentBlock, AgentCatalog, AgentError, AgentReply, ChunkSink, RunContext,
};
use parlor::background::BackgroundTasks;
use parlor::dispatch::{DispatchTimeouts, Dispatcher};
use parlor::hub::SyncHub;
use parlor::server::{self, AppState};
use parlor::session::SessionRegistry;
use parlor::store::Store;

// ============================================================================
// Scripted Agents
// ============================================================================

/// Emits a fixed sequence of chunks, then resolves with a final text.
pub struct ScriptedAgent {
    pub chunks: Vec<AgentBlock>,
    pub final_text: String,
    pub chunk_delay: Duration,
}

impl ScriptedAgent {
    /// One text chunk equal to the reply, no delay.
    pub fn replying(text: &str) -> Self {
        Self {
            chunks: vec![AgentBlock::Text {
                text: text.to_string(),
            }],
            final_text: text.to_string(),
            chunk_delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn run(
        &self,
        _prompt: &str,
        ctx: RunContext,
        on_chunk: ChunkSink<'_>,
    ) -> Result<AgentReply, AgentError> {
        for chunk in &self.chunks {
            if !self.chunk_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.chunk_delay) => {}
                    _ = ctx.cancel.cancelled() => return Err(AgentError::Cancelled),
                }
            }
            on_chunk(chunk.clone());
        }
        Ok(AgentReply {
            final_text: self.final_text.clone(),
            usage: None,
        })
    }
}

/// Never emits a chunk and never resolves, but honours cancellation.
pub struct StalledAgent;

#[async_trait]
impl Agent for StalledAgent {
    async fn run(
        &self,
        _prompt: &str,
        ctx: RunContext,
        _on_chunk: ChunkSink<'_>,
    ) -> Result<AgentReply, AgentError> {
        ctx.cancel.cancelled().await;
        Err(AgentError::Cancelled)
    }
}

/// Fails every invocation.
pub struct BrokenAgent;

#[async_trait]
impl Agent for BrokenAgent {
    async fn run(
        &self,
        _prompt: &str,
        _ctx: RunContext,
        _on_chunk: ChunkSink<'_>,
    ) -> Result<AgentReply, AgentError> {
        Err(AgentError::Invocation("agent exploded".to_string()))
    }
}

// ============================================================================
// App Fixtures
// ============================================================================

/// Create a test `AppState` with a ScriptedAgent registered as
/// "claude-code".
pub fn test_state() -> AppState {
    test_state_with(DispatchTimeouts::default(), |agents| {
        agents.register("claude-code", Arc::new(ScriptedAgent::replying("pong")));
    })
}

/// Create a test `AppState` with custom timeouts and agent registrations.
pub fn test_state_with(
    timeouts: DispatchTimeouts,
    register: impl FnOnce(&AgentCatalog),
) -> AppState {
    // Leak the TempDir so it outlives the test body; the OS cleans up on
    // process exit.
    let tmp = Box::leak(Box::new(TempDir::new().unwrap()));
    let store = Store::open(tmp.path().join("parlor.db")).unwrap();

    let registry = SessionRegistry::new();
    let hub = SyncHub::new(store.clone());
    let agents = AgentCatalog::new();
    register(&agents);
    let background_tasks = BackgroundTasks::new();
    let dispatcher = Dispatcher::new(
        store.clone(),
        registry.clone(),
        hub.clone(),
        agents.clone(),
        background_tasks.clone(),
    )
    .with_timeouts(timeouts);

    let (shutdown_tx, _shutdown_rx) = server::shutdown_channel();
    AppState {
        store,
        registry,
        hub,
        agents,
        dispatcher,
        background_tasks,
        shutdown_tx: Arc::new(Mutex::new(Some(shutdown_tx))),
    }
}

/// Create a test app with the default state and no URL prefix.
pub fn test_app() -> Router {
    server::build_app(test_state(), "", 30, 64)
}

/// Poll until `pred` returns true or the deadline passes.
pub async fn wait_until(mut pred: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if pred() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    pred()
}
