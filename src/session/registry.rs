//! Process-wide index of live session state machines.
//!
//! The registry is the only place that holds `SessionFsm` instances by id.
//! It serves lookups for cancellation and diagnostics, and periodically
//! sweeps out terminal machines past their retention window.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::api::ActiveSessionInfo;

use super::fsm::{FsmSummary, SessionFsm};

// ============================================================================
// Constants
// ============================================================================

/// How long terminal sessions stay visible in diagnostics before the sweep
/// removes them.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Interval between retention sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// How many terminal sessions `diagnostics()` reports.
const RECENT_TERMINAL_LIMIT: usize = 20;

// ============================================================================
// Diagnostics
// ============================================================================

/// Point-in-time snapshot of the registry for the diagnostics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryDiagnostics {
    pub active_count: usize,
    pub terminal_count: usize,
    pub total: usize,
    pub active: Vec<ActiveSessionInfo>,
    pub recent_terminal: Vec<FsmSummary>,
}

// ============================================================================
// Registry
// ============================================================================

/// Registry of live session FSMs. Thread-safe and cheap to clone.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Arc<SessionFsm>>>,
    retention: Duration,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            retention,
        }
    }

    // ------------------------------------------------------------------------
    // Core API
    // ------------------------------------------------------------------------

    /// Create and index an FSM for a new session.
    pub fn create(
        &self,
        session_id: &str,
        conversation_id: &str,
        user_message_id: &str,
        timeout: Duration,
    ) -> Arc<SessionFsm> {
        let fsm = SessionFsm::spawn(session_id, conversation_id, user_message_id, timeout);
        self.sessions.insert(session_id.to_string(), fsm.clone());
        debug!(session_id, conversation_id, "registered session fsm");
        fsm
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionFsm>> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Remove a session from the index. Returns true if one was removed.
    pub fn remove(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of all non-terminal machines.
    pub fn active(&self) -> Vec<Arc<SessionFsm>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|fsm| !fsm.is_terminal())
            .collect()
    }

    /// Snapshot of all terminal machines still in the retention window.
    pub fn terminal(&self) -> Vec<Arc<SessionFsm>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|fsm| fsm.is_terminal())
            .collect()
    }

    // ------------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------------

    /// Copy-producing snapshot for the diagnostics endpoint.
    pub fn diagnostics(&self) -> RegistryDiagnostics {
        let active_fsms = self.active();
        let mut terminal_fsms = self.terminal();
        terminal_fsms.sort_by_key(|fsm| std::cmp::Reverse(fsm.last_transition_at()));

        let active: Vec<ActiveSessionInfo> = active_fsms
            .iter()
            .map(|fsm| ActiveSessionInfo {
                session_id: fsm.session_id().to_string(),
                state: fsm.state().to_string(),
                uptime_ms: fsm.uptime_ms(),
            })
            .collect();

        let recent_terminal: Vec<FsmSummary> = terminal_fsms
            .iter()
            .take(RECENT_TERMINAL_LIMIT)
            .map(|fsm| fsm.summary())
            .collect();

        RegistryDiagnostics {
            active_count: active.len(),
            terminal_count: terminal_fsms.len(),
            total: self.sessions.len(),
            active,
            recent_terminal,
        }
    }

    // ------------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------------

    /// Remove terminal sessions whose last transition is older than the
    /// retention window. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::zero());

        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| {
                let fsm = entry.value();
                fsm.is_terminal() && fsm.last_transition_at() < cutoff
            })
            .map(|entry| entry.key().clone())
            .collect();

        let count = stale.len();
        for session_id in stale {
            self.sessions.remove(&session_id);
        }
        if count > 0 {
            info!(removed = count, "session retention sweep complete");
        }
        count
    }

    /// Spawn the periodic retention sweep. Runs until the runtime shuts down.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                registry.sweep();
            }
        })
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
