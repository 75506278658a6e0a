//! Registry of available agents.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use super::{Agent, AgentError};

/// Maps agent ids to their implementations.
///
/// Thread-safe and cheap to clone. Acquisition runs the agent's `connect`
/// hook under a bounded timeout so a wedged agent cannot stall dispatch
/// indefinitely.
#[derive(Clone, Default)]
pub struct AgentCatalog {
    agents: Arc<DashMap<String, Arc<dyn Agent>>>,
}

impl AgentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under an id. Replaces any previous registration.
    pub fn register(&self, agent_id: impl Into<String>, agent: Arc<dyn Agent>) {
        let agent_id = agent_id.into();
        debug!(agent_id = %agent_id, "registering agent");
        self.agents.insert(agent_id, agent);
    }

    /// Look up an agent without connecting.
    pub fn get(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(agent_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Acquire an agent for a run, bounded by `timeout`.
    ///
    /// Runs the agent's `connect` hook; if it does not finish in time the
    /// caller gets `AcquireTimeout` and the session fails without hanging.
    pub async fn acquire(
        &self,
        agent_id: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn Agent>, AgentError> {
        let agent = self
            .get(agent_id)
            .ok_or_else(|| AgentError::UnknownAgent(agent_id.to_string()))?;

        match tokio::time::timeout(timeout, agent.connect()).await {
            Ok(Ok(())) => Ok(agent),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AgentError::AcquireTimeout(agent_id.to_string(), timeout)),
        }
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentReply, ChunkSink, RunContext};
    use async_trait::async_trait;

    struct NoopAgent;

    #[async_trait]
    impl Agent for NoopAgent {
        async fn run(
            &self,
            _prompt: &str,
            _ctx: RunContext,
            _on_chunk: ChunkSink<'_>,
        ) -> Result<AgentReply, AgentError> {
            Ok(AgentReply {
                final_text: String::new(),
                usage: None,
            })
        }
    }

    struct StalledAgent;

    #[async_trait]
    impl Agent for StalledAgent {
        async fn connect(&self) -> Result<(), AgentError> {
            std::future::pending().await
        }

        async fn run(
            &self,
            _prompt: &str,
            _ctx: RunContext,
            _on_chunk: ChunkSink<'_>,
        ) -> Result<AgentReply, AgentError> {
            unreachable!("connect never resolves")
        }
    }

    #[tokio::test]
    async fn acquire_unknown_agent_fails() {
        let catalog = AgentCatalog::new();
        let err = catalog
            .acquire("missing", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::UnknownAgent(_)));
    }

    #[tokio::test]
    async fn acquire_registered_agent_succeeds() {
        let catalog = AgentCatalog::new();
        catalog.register("claude-code", Arc::new(NoopAgent));

        assert!(catalog.contains("claude-code"));
        assert!(catalog
            .acquire("claude-code", Duration::from_millis(50))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn acquire_times_out_on_stalled_connect() {
        let catalog = AgentCatalog::new();
        catalog.register("stalled", Arc::new(StalledAgent));

        let err = catalog
            .acquire("stalled", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::AcquireTimeout(_, _)));
    }
}
