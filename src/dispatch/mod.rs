//! The dispatcher closes the loop between an inbound user message and a
//! persisted assistant reply.
//!
//! The intake path is synchronous and fast: persist the user message
//! (idempotently), create the session row, register the state machine, and
//! publish `message_created`. Everything else — agent acquisition, prompt
//! streaming, terminal persistence — runs on a background task that owns the
//! session's FSM and outlives the originating request.
//!
//! At most one session per conversation is in flight; later dispatches queue
//! on a per-conversation lock so subscribers observe messages in persistence
//! order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::agent::{AgentBlock, AgentCatalog, AgentError, RunContext};
use crate::api::StreamEvent;
use crate::background::BackgroundTasks;
use crate::hub::SyncHub;
use crate::session::{
    DataPatch, SessionFsm, SessionRegistry, SessionResult, SessionState, DEFAULT_SESSION_TIMEOUT,
};
use crate::store::{
    Message, MessageRole, Session, SessionPatch, SessionReply, SessionStatus, Store, StoreError,
};
use crate::sync::KeyedLocks;

// ============================================================================
// Types
// ============================================================================

/// Default bound on agent acquisition.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadlines applied to every dispatched session.
#[derive(Debug, Clone, Copy)]
pub struct DispatchTimeouts {
    /// Overall session watchdog.
    pub session: Duration,
    /// Bound on agent acquisition.
    pub acquire: Duration,
}

impl Default for DispatchTimeouts {
    fn default() -> Self {
        Self {
            session: DEFAULT_SESSION_TIMEOUT,
            acquire: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

/// An inbound user message to run against an agent.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub conversation_id: String,
    pub content: String,
    pub agent_id: String,
    pub idempotency_key: Option<String>,
    pub folder_context: Option<String>,
}

/// Returned synchronously from [`Dispatcher::dispatch`].
pub struct DispatchHandle {
    pub message: Message,
    pub session: Session,
    /// True when an idempotent retry matched an earlier dispatch; no new
    /// session was started.
    pub replayed: bool,
    completion: Option<oneshot::Receiver<SessionResult>>,
}

impl DispatchHandle {
    /// Await the session's terminal outcome. Returns None for replayed
    /// dispatches (the original dispatch owns the completion).
    pub async fn wait(self) -> Option<SessionResult> {
        match self.completion {
            Some(rx) => rx.await.ok(),
            None => None,
        }
    }
}

/// Errors surfaced on the synchronous intake path.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("session not found: {0}")]
    SessionNotFound(String),
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Orchestrates the path from inbound user message to persisted assistant
/// reply. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    store: Store,
    registry: SessionRegistry,
    hub: SyncHub,
    agents: AgentCatalog,
    conversation_locks: KeyedLocks,
    tasks: BackgroundTasks,
    timeouts: DispatchTimeouts,
}

impl Dispatcher {
    pub fn new(
        store: Store,
        registry: SessionRegistry,
        hub: SyncHub,
        agents: AgentCatalog,
        tasks: BackgroundTasks,
    ) -> Self {
        Self {
            store,
            registry,
            hub,
            agents,
            conversation_locks: KeyedLocks::new(),
            tasks,
            timeouts: DispatchTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: DispatchTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    // ------------------------------------------------------------------------
    // Intake
    // ------------------------------------------------------------------------

    /// Persist the user message and start a session for it.
    ///
    /// Returns as soon as the message and session rows are durable; the
    /// agent run continues on a background task. An idempotent retry of an
    /// earlier dispatch returns the original message and session without
    /// starting anything new.
    pub fn dispatch(&self, req: DispatchRequest) -> Result<DispatchHandle, DispatchError> {
        let message = self.store.append_message(
            &req.conversation_id,
            MessageRole::User,
            &req.content,
            req.idempotency_key.as_deref(),
        )?;

        if let Some(session) = self.store.session_for_message(&message.id)? {
            debug!(
                message_id = %message.id,
                session_id = %session.id,
                "idempotent replay, reusing existing session"
            );
            return Ok(DispatchHandle {
                message,
                session,
                replayed: true,
                completion: None,
            });
        }

        let session = self
            .store
            .create_session(&req.conversation_id, &message.id)?;

        let fsm = self.registry.create(
            &session.id,
            &req.conversation_id,
            &message.id,
            self.timeouts.session,
        );
        let completion = fsm.take_completion();

        self.hub.publish(StreamEvent::MessageCreated {
            conversation_id: req.conversation_id.clone(),
            message: message.clone(),
        });

        let dispatcher = self.clone();
        let prompt = req.content.clone();
        let agent_id = req.agent_id.clone();
        let folder_context = req.folder_context.clone();
        self.tasks.spawn(async move {
            dispatcher
                .run_session(fsm, agent_id, prompt, folder_context)
                .await;
        });

        Ok(DispatchHandle {
            message,
            session,
            replayed: false,
            completion,
        })
    }

    /// Cancel an in-flight session from any non-terminal state.
    ///
    /// The FSM transition is authoritative; the background task observes it,
    /// aborts the agent run through its cancellation handle, and persists
    /// the terminal row.
    pub fn cancel(&self, session_id: &str) -> Result<(), DispatchError> {
        let fsm = self
            .registry
            .get(session_id)
            .ok_or_else(|| DispatchError::SessionNotFound(session_id.to_string()))?;

        let _ = fsm.transition(
            SessionState::Cancelled,
            "cancellation requested",
            DataPatch::default(),
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Background Session Task
    // ------------------------------------------------------------------------

    async fn run_session(
        &self,
        fsm: Arc<SessionFsm>,
        agent_id: String,
        prompt: String,
        folder_context: Option<String>,
    ) {
        let conversation_id = fsm.conversation_id().to_string();
        let session_id = fsm.session_id().to_string();

        // One in-flight session per conversation; later dispatches wait here
        // for the prior session to reach a terminal state.
        let lock = self.conversation_locks.get(&conversation_id);
        let _guard = lock.lock().await;

        // Cancelled or timed out while queued behind another session.
        if fsm.is_terminal() {
            self.persist_terminal(&fsm);
            return;
        }

        if fsm
            .transition(
                SessionState::AcquiringAgent,
                "acquiring agent",
                DataPatch::default(),
            )
            .is_err()
        {
            self.persist_terminal(&fsm);
            return;
        }

        let agent = match self.agents.acquire(&agent_id, self.timeouts.acquire).await {
            Ok(agent) => agent,
            Err(e) => {
                self.fail_session(&fsm, &e.to_string());
                return;
            }
        };

        if fsm
            .transition(
                SessionState::AgentAcquired,
                "agent connected",
                DataPatch {
                    agent_connected_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .is_err()
        {
            self.persist_terminal(&fsm);
            return;
        }

        if fsm
            .transition(
                SessionState::SendingPrompt,
                "sending prompt",
                DataPatch {
                    prompt_sent_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .is_err()
        {
            self.persist_terminal(&fsm);
            return;
        }

        let cancel = CancellationToken::new();
        let ctx = RunContext::new(folder_context, cancel.clone());
        let first_chunk = Arc::new(AtomicBool::new(false));

        let on_chunk = {
            let fsm = fsm.clone();
            let hub = self.hub.clone();
            let store = self.store.clone();
            let session_id = session_id.clone();
            let conversation_id = conversation_id.clone();
            let first_chunk = first_chunk.clone();
            move |block: AgentBlock| {
                if !first_chunk.swap(true, Ordering::SeqCst) {
                    let _ = fsm.transition(
                        SessionState::Processing,
                        "first chunk received",
                        DataPatch::default(),
                    );
                    if let Err(e) = store.update_session(
                        &session_id,
                        SessionPatch {
                            status: Some(SessionStatus::Processing),
                            ..Default::default()
                        },
                    ) {
                        warn!(
                            session_id = %session_id,
                            error = %e,
                            "failed to persist processing status"
                        );
                    }
                }
                if let Err(e) = fsm.push_chunk(block.clone()) {
                    debug!(session_id = %session_id, error = %e, "dropped late chunk");
                    return;
                }
                hub.publish(StreamEvent::Stream {
                    conversation_id: conversation_id.clone(),
                    session_id: session_id.clone(),
                    chunk: block,
                });
            }
        };

        let mut terminal_rx = fsm.watch_state();
        let run = agent.run(&prompt, ctx, &on_chunk);
        tokio::pin!(run);

        let outcome = tokio::select! {
            result = &mut run => Some(result),
            // Watchdog timeout or external cancellation transitioned the FSM
            // out from under the run.
            _ = terminal_rx.wait_for(|s| s.is_terminal()) => None,
        };

        match outcome {
            None => {
                cancel.cancel();
                self.persist_terminal(&fsm);
            }
            Some(Ok(reply)) => {
                self.complete_session(&fsm, &first_chunk, reply.final_text);
            }
            Some(Err(AgentError::Cancelled)) => {
                let _ = fsm.transition(
                    SessionState::Cancelled,
                    "agent run cancelled",
                    DataPatch::default(),
                );
                self.persist_terminal(&fsm);
            }
            Some(Err(e)) => {
                self.fail_session(&fsm, &e.to_string());
            }
        }
    }

    /// Persist the completed run: assistant row first, then the terminal
    /// session row, then the FSM transition, then the fan-out. Subscribers
    /// only see the assistant message after it is durably committed.
    fn complete_session(&self, fsm: &Arc<SessionFsm>, first_chunk: &AtomicBool, text: String) {
        let conversation_id = fsm.conversation_id().to_string();
        let session_id = fsm.session_id().to_string();

        // Agents may resolve without streaming any chunk.
        if !first_chunk.load(Ordering::SeqCst) {
            let _ = fsm.transition(
                SessionState::Processing,
                "agent resolved without streaming",
                DataPatch::default(),
            );
        }

        let assistant =
            match self
                .store
                .append_message(&conversation_id, MessageRole::Assistant, &text, None)
            {
                Ok(message) => message,
                Err(e) => {
                    self.fail_session(fsm, &format!("failed to persist assistant message: {e}"));
                    return;
                }
            };

        let session = match self.store.update_session(
            &session_id,
            SessionPatch {
                status: Some(SessionStatus::Completed),
                completed_at: Some(Utc::now()),
                response: Some(SessionReply {
                    text,
                    assistant_message_id: assistant.id.clone(),
                }),
                ..Default::default()
            },
        ) {
            Ok(session) => session,
            Err(e) => {
                self.fail_session(fsm, &format!("failed to persist session completion: {e}"));
                return;
            }
        };

        if let Err(e) = fsm.transition(
            SessionState::Completed,
            "agent run complete",
            DataPatch {
                response_received_at: Some(Utc::now()),
                ..Default::default()
            },
        ) {
            // A racing watchdog lost to the durable commit; keep the store's
            // word and say so.
            warn!(session_id = %session_id, error = %e, "completion raced a terminal transition");
        }

        self.hub.publish(StreamEvent::MessageCreated {
            conversation_id: conversation_id.clone(),
            message: assistant,
        });
        self.hub.publish(StreamEvent::SessionUpdated {
            conversation_id,
            session,
        });
    }

    /// Drive the FSM to `error` and persist the failure.
    fn fail_session(&self, fsm: &Arc<SessionFsm>, error_message: &str) {
        error!(
            session_id = %fsm.session_id(),
            error = %error_message,
            "session failed"
        );
        let _ = fsm.transition(
            SessionState::Error,
            "session failed",
            DataPatch::error(error_message),
        );
        self.persist_terminal(fsm);
    }

    /// Persist whatever terminal state the FSM reached and publish the
    /// terminal `session_updated`.
    fn persist_terminal(&self, fsm: &Arc<SessionFsm>) {
        let state = fsm.state();
        let status = match state {
            SessionState::Completed => SessionStatus::Completed,
            SessionState::Error => SessionStatus::Error,
            SessionState::Timeout => SessionStatus::Timeout,
            SessionState::Cancelled => SessionStatus::Cancelled,
            other => {
                warn!(
                    session_id = %fsm.session_id(),
                    state = %other,
                    "persist_terminal called on non-terminal session"
                );
                return;
            }
        };

        let error = fsm.data().error;
        match self.store.update_session(
            fsm.session_id(),
            SessionPatch {
                status: Some(status),
                completed_at: Some(Utc::now()),
                error,
                ..Default::default()
            },
        ) {
            Ok(session) => {
                self.hub.publish(StreamEvent::SessionUpdated {
                    conversation_id: fsm.conversation_id().to_string(),
                    session,
                });
            }
            Err(e) => {
                error!(
                    session_id = %fsm.session_id(),
                    error = %e,
                    "failed to persist terminal session state"
                );
            }
        }
    }
}
