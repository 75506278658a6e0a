//! Per-session explicit state machine.
//!
//! Every observable session state change funnels through [`SessionFsm::transition`],
//! which validates the move against the legal transition table, appends to the
//! ordered history, and merges details into the session data bag. Invalid
//! transitions fail loudly at the call site instead of producing silent
//! inconsistency. A watchdog armed at construction forces `timeout` if the
//! machine is still non-terminal when it fires, so a wedged agent can never
//! hang a session indefinitely.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;
use tracing::debug;

use crate::agent::AgentBlock;

// ============================================================================
// States
// ============================================================================

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    AcquiringAgent,
    AgentAcquired,
    SendingPrompt,
    Processing,
    Completed,
    Error,
    Timeout,
    Cancelled,
}

impl SessionState {
    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Error
                | SessionState::Timeout
                | SessionState::Cancelled
        )
    }

    /// Whether `self -> next` is in the legal transition set.
    ///
    /// The happy path is a strict chain; every non-terminal state may also
    /// fail into `error`, `timeout`, or `cancelled`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            SessionState::Error | SessionState::Timeout | SessionState::Cancelled => true,
            SessionState::AcquiringAgent => self == SessionState::Pending,
            SessionState::AgentAcquired => self == SessionState::AcquiringAgent,
            SessionState::SendingPrompt => self == SessionState::AgentAcquired,
            SessionState::Processing => self == SessionState::SendingPrompt,
            SessionState::Completed => self == SessionState::Processing,
            SessionState::Pending => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::AcquiringAgent => "acquiring_agent",
            SessionState::AgentAcquired => "agent_acquired",
            SessionState::SendingPrompt => "sending_prompt",
            SessionState::Processing => "processing",
            SessionState::Completed => "completed",
            SessionState::Error => "error",
            SessionState::Timeout => "timeout",
            SessionState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// History / Data Bag
// ============================================================================

/// One entry in a session's ordered transition history.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    pub state: SessionState,
    pub at: DateTime<Utc>,
    pub reason: String,
    pub details: serde_json::Value,
}

/// Accumulated facts about a session's run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_sent_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_received_at: Option<DateTime<Utc>>,
    pub full_text: String,
    pub blocks: Vec<AgentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

/// Partial update merged into [`SessionData`] by a transition.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DataPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_sent_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_received_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl DataPatch {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

impl SessionData {
    fn merge(&mut self, patch: &DataPatch) {
        if patch.agent_connected_at.is_some() {
            self.agent_connected_at = patch.agent_connected_at;
        }
        if patch.prompt_sent_at.is_some() {
            self.prompt_sent_at = patch.prompt_sent_at;
        }
        if patch.response_received_at.is_some() {
            self.response_received_at = patch.response_received_at;
        }
        if let Some(error) = &patch.error {
            self.error = Some(error.clone());
        }
        if let Some(trace) = &patch.stack_trace {
            self.stack_trace = Some(trace.clone());
        }
    }
}

// ============================================================================
// Completion
// ============================================================================

/// Yielded by the completion future when the session completes.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub state: SessionState,
    pub data: SessionData,
}

/// Raised by the completion future on any non-completed terminal state.
#[derive(Debug, Clone, Error)]
#[error("session ended in {state}: {}", .error.as_deref().unwrap_or("no detail"))]
pub struct SessionFailed {
    pub state: SessionState,
    pub error: Option<String>,
}

pub type SessionResult = Result<SessionOutcome, SessionFailed>;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum FsmError {
    /// The requested transition is not in the legal set. State is unchanged
    /// and no history entry is appended.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    /// Chunks are only accepted while the session is processing.
    #[error("cannot record chunk in state {0}")]
    NotProcessing(SessionState),
}

// ============================================================================
// Summary
// ============================================================================

/// Copy-producing snapshot of an FSM for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct FsmSummary {
    pub session_id: String,
    pub conversation_id: String,
    pub user_message_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    pub history: Vec<TransitionRecord>,
}

// ============================================================================
// SessionFsm
// ============================================================================

/// Default watchdog timeout for a session.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(120);

struct FsmInner {
    state: SessionState,
    history: Vec<TransitionRecord>,
    data: SessionData,
    completion_tx: Option<oneshot::Sender<SessionResult>>,
    completion_rx: Option<oneshot::Receiver<SessionResult>>,
    watchdog: Option<AbortHandle>,
    last_transition_at: DateTime<Utc>,
}

/// Explicit per-session state machine with watchdog and completion future.
///
/// External code reads state only through copy-producing accessors; the lock
/// is internal and never held across an await point.
pub struct SessionFsm {
    session_id: String,
    conversation_id: String,
    user_message_id: String,
    created_at: DateTime<Utc>,
    inner: Mutex<FsmInner>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionFsm {
    /// Create the machine in `pending` and arm the watchdog for `timeout`.
    pub fn spawn(
        session_id: impl Into<String>,
        conversation_id: impl Into<String>,
        user_message_id: impl Into<String>,
        timeout: Duration,
    ) -> Arc<Self> {
        let session_id = session_id.into();
        let now = Utc::now();
        let (state_tx, _) = watch::channel(SessionState::Pending);
        let (completion_tx, completion_rx) = oneshot::channel();

        let fsm = Arc::new(Self {
            session_id: session_id.clone(),
            conversation_id: conversation_id.into(),
            user_message_id: user_message_id.into(),
            created_at: now,
            inner: Mutex::new(FsmInner {
                state: SessionState::Pending,
                history: vec![TransitionRecord {
                    state: SessionState::Pending,
                    at: now,
                    reason: "session created".to_string(),
                    details: serde_json::Value::Null,
                }],
                data: SessionData::default(),
                completion_tx: Some(completion_tx),
                completion_rx: Some(completion_rx),
                watchdog: None,
                last_transition_at: now,
            }),
            state_tx,
        });

        // The watchdog holds only a weak reference so a dropped FSM does not
        // linger for the full timeout.
        let weak: Weak<SessionFsm> = Arc::downgrade(&fsm);
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(fsm) = weak.upgrade() {
                fsm.expire();
            }
        });
        fsm.inner.lock().expect("fsm lock poisoned").watchdog = Some(watchdog.abort_handle());

        fsm
    }

    // ------------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------------

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn user_message_id(&self) -> &str {
        &self.user_message_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    /// Apply a validated transition.
    ///
    /// Terminal-to-terminal attempts are treated as no-ops so that a racing
    /// watchdog and a normal completion cannot both "win"; the completion
    /// future resolves exactly once, on the first terminal transition.
    pub fn transition(
        &self,
        next: SessionState,
        reason: &str,
        patch: DataPatch,
    ) -> Result<(), FsmError> {
        let mut inner = self.inner.lock().expect("fsm lock poisoned");
        let current = inner.state;

        if current.is_terminal() {
            if next.is_terminal() {
                debug!(
                    session_id = %self.session_id,
                    current = %current,
                    attempted = %next,
                    "ignoring terminal transition on terminal session"
                );
                return Ok(());
            }
            return Err(FsmError::InvalidTransition {
                from: current,
                to: next,
            });
        }

        if !current.can_transition_to(next) {
            return Err(FsmError::InvalidTransition {
                from: current,
                to: next,
            });
        }

        let now = Utc::now();
        inner.state = next;
        inner.last_transition_at = now;
        inner.data.merge(&patch);
        let details = serde_json::to_value(&patch).unwrap_or(serde_json::Value::Null);
        inner.history.push(TransitionRecord {
            state: next,
            at: now,
            reason: reason.to_string(),
            details,
        });

        debug!(
            session_id = %self.session_id,
            from = %current,
            to = %next,
            reason,
            "session transition"
        );

        if next.is_terminal() {
            if let Some(watchdog) = inner.watchdog.take() {
                watchdog.abort();
            }
            if let Some(tx) = inner.completion_tx.take() {
                let result = if next == SessionState::Completed {
                    Ok(SessionOutcome {
                        state: next,
                        data: inner.data.clone(),
                    })
                } else {
                    Err(SessionFailed {
                        state: next,
                        error: inner.data.error.clone(),
                    })
                };
                let _ = tx.send(result);
            }
        }

        // send_replace updates the watched value even with no subscribers
        // yet; a later watch_state() must still observe this transition.
        let _ = self.state_tx.send_replace(next);
        Ok(())
    }

    /// Watchdog entry point: force `timeout` if still non-terminal.
    fn expire(&self) {
        let _ = self.transition(
            SessionState::Timeout,
            "watchdog fired",
            DataPatch::error("session watchdog timeout"),
        );
    }

    /// Record a streamed chunk. Only legal while `processing`.
    pub fn push_chunk(&self, block: AgentBlock) -> Result<(), FsmError> {
        let mut inner = self.inner.lock().expect("fsm lock poisoned");
        if inner.state != SessionState::Processing {
            return Err(FsmError::NotProcessing(inner.state));
        }
        if let Some(text) = block.as_text() {
            if !inner.data.full_text.is_empty() {
                inner.data.full_text.push('\n');
            }
            inner.data.full_text.push_str(text);
        }
        inner.data.blocks.push(block);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.inner.lock().expect("fsm lock poisoned").state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn data(&self) -> SessionData {
        self.inner.lock().expect("fsm lock poisoned").data.clone()
    }

    pub fn history(&self) -> Vec<TransitionRecord> {
        self.inner
            .lock()
            .expect("fsm lock poisoned")
            .history
            .clone()
    }

    pub fn last_transition_at(&self) -> DateTime<Utc> {
        self.inner
            .lock()
            .expect("fsm lock poisoned")
            .last_transition_at
    }

    /// Watch channel observing every state change.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Take the single-shot completion future. The first caller gets it;
    /// subsequent calls return None.
    pub fn take_completion(&self) -> Option<oneshot::Receiver<SessionResult>> {
        self.inner
            .lock()
            .expect("fsm lock poisoned")
            .completion_rx
            .take()
    }

    pub fn uptime_ms(&self) -> u64 {
        (Utc::now() - self.created_at).num_milliseconds().max(0) as u64
    }

    pub fn summary(&self) -> FsmSummary {
        let inner = self.inner.lock().expect("fsm lock poisoned");
        FsmSummary {
            session_id: self.session_id.clone(),
            conversation_id: self.conversation_id.clone(),
            user_message_id: self.user_message_id.clone(),
            state: inner.state,
            created_at: self.created_at,
            last_transition_at: inner.last_transition_at,
            history: inner.history.clone(),
        }
    }
}

impl std::fmt::Debug for SessionFsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFsm")
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
