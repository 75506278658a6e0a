//! Shared API types used by both server handlers and clients.
//!
//! These types define the contract between server and client.
//! Changes here affect both sides, preventing silent drift.

use serde::{Deserialize, Serialize};

use crate::agent::AgentBlock;
use crate::store::{Conversation, ConversationStatus, Message, Session, StoredEvent};

// ============================================================================
// ID Prefixes
// ============================================================================

/// ID prefix for conversations.
pub const CONVERSATION_ID_PREFIX: &str = "conv_";

/// ID prefix for messages.
pub const MESSAGE_ID_PREFIX: &str = "msg_";

/// ID prefix for sessions.
pub const SESSION_ID_PREFIX: &str = "sess_";

/// ID prefix for audit events.
pub const EVENT_ID_PREFIX: &str = "evt_";

// ============================================================================
// Conversation Requests/Responses
// ============================================================================

/// Request to create a new conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Request to update a conversation's title or status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConversationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ConversationStatus>,
}

/// Response wrapping a single conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationResponse {
    pub conversation: Conversation,
}

/// Response for listing conversations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListConversationsResponse {
    pub conversations: Vec<Conversation>,
}

// ============================================================================
// Message Requests/Responses
// ============================================================================

/// Request to send a message into a conversation.
///
/// The `idempotency_key` is client-generated; resending with the same key
/// within the dedup window returns the original message instead of creating
/// a duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Response for a dispatched message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message: Message,
    pub session: Session,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Response for listing messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListMessagesResponse {
    pub messages: Vec<Message>,
}

// ============================================================================
// Session Responses
// ============================================================================

/// Response wrapping a single session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session: Session,
}

/// Response for the latest session of a conversation, with its audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestSessionResponse {
    pub session: Option<Session>,
    pub events: Vec<StoredEvent>,
}

// ============================================================================
// Streaming Surface
// ============================================================================

/// Server-to-client event on the streaming transport.
///
/// `stream` events carry agent chunk deltas and are only delivered to
/// per-conversation subscribers; the other variants are lifecycle events
/// that also reach the global channel for sidebar updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A message row was durably committed.
    MessageCreated {
        conversation_id: String,
        message: Message,
    },
    /// A streaming chunk from an in-flight agent run.
    Stream {
        conversation_id: String,
        session_id: String,
        chunk: AgentBlock,
    },
    /// A session reached a new persisted status (including terminal states).
    SessionUpdated {
        conversation_id: String,
        session: Session,
    },
    /// Conversation metadata changed.
    ConversationUpdated { conversation: Conversation },
}

impl StreamEvent {
    /// The conversation this event belongs to.
    pub fn conversation_id(&self) -> &str {
        match self {
            StreamEvent::MessageCreated {
                conversation_id, ..
            }
            | StreamEvent::Stream {
                conversation_id, ..
            }
            | StreamEvent::SessionUpdated {
                conversation_id, ..
            } => conversation_id,
            StreamEvent::ConversationUpdated { conversation } => &conversation.id,
        }
    }

    /// Whether this is a droppable chunk delta (as opposed to a lifecycle event).
    pub fn is_stream(&self) -> bool {
        matches!(self, StreamEvent::Stream { .. })
    }
}

/// Client-to-server frame on the streaming transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Declare interest in a conversation's events.
    Subscribe { conversation_id: String },
    /// Request cancellation of an in-flight session.
    Cancel { session_id: String },
}

/// Outcome of a reconnect, sent as the first frame of a new subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ResumeOutcome {
    /// A session is in flight; the live stream continues from here.
    Attach { session: Session },
    /// The latest session completed while the client was away; the full
    /// response is in `session.response`.
    Replay { session: Session },
    /// The latest session ended in error, timeout, or cancellation.
    Terminal { session: Session },
    /// No session has ever run in this conversation.
    Idle,
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Snapshot of one live session for the diagnostics endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSessionInfo {
    pub session_id: String,
    pub state: String,
    pub uptime_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_roundtrip() {
        let json = r#"{"type":"subscribe","conversation_id":"conv_abc"}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        match frame {
            ClientFrame::Subscribe { conversation_id } => {
                assert_eq!(conversation_id, "conv_abc");
            }
            ClientFrame::Cancel { .. } => panic!("wrong frame type"),
        }

        let json = r#"{"type":"cancel","session_id":"sess_1"}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        assert!(matches!(frame, ClientFrame::Cancel { .. }));
    }

    #[test]
    fn stream_event_tagging() {
        let event = StreamEvent::Stream {
            conversation_id: "conv_1".to_string(),
            session_id: "sess_1".to_string(),
            chunk: AgentBlock::Text {
                text: "hello".to_string(),
            },
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"stream\""));
        assert!(event.is_stream());
        assert_eq!(event.conversation_id(), "conv_1");
    }

    #[test]
    fn lifecycle_event_is_not_stream() {
        let event = StreamEvent::ConversationUpdated {
            conversation: Conversation {
                id: "conv_9".to_string(),
                agent_id: "claude-code".to_string(),
                title: None,
                status: ConversationStatus::Active,
                source: crate::store::ConversationSource::Gui,
                external_id: None,
                project_path: None,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            },
        };
        assert!(!event.is_stream());
        assert_eq!(event.conversation_id(), "conv_9");
    }

    #[test]
    fn resume_outcome_idle_serializes_mode() {
        let json = serde_json::to_string(&ResumeOutcome::Idle).unwrap();
        assert_eq!(json, r#"{"mode":"idle"}"#);
    }

    #[test]
    fn send_message_request_accepts_minimal_body() {
        let json = r#"{"content": "hi", "agent_id": "claude-code"}"#;
        let req: SendMessageRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.content, "hi");
        assert!(req.idempotency_key.is_none());
        assert!(req.folder_context.is_none());
    }
}
