//! Durable, transactional storage for conversations, messages, sessions,
//! audit events, and idempotency records.
//!
//! Backed by `SQLite` in WAL mode with foreign keys enforced. Every mutating
//! operation is atomic: either all durable effects (row writes, audit event,
//! idempotency record, conversation touch) commit together, or none do.

mod connection;
mod error;
mod migrations;
mod records;

pub use connection::{ConnectionConfig, ConnectionPool};
pub use error::{StoreError, StoreResult};
pub use migrations::run_migrations;
pub use records::{
    Conversation, ConversationSource, ConversationStatus, EventRefs, IntegrityReport, Message,
    MessageRole, Session, SessionPatch, SessionReply, SessionStatus, StoredEvent,
};

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use ulid::Ulid;

use crate::api::{CONVERSATION_ID_PREFIX, EVENT_ID_PREFIX, MESSAGE_ID_PREFIX, SESSION_ID_PREFIX};

// ============================================================================
// Constants
// ============================================================================

/// How long an idempotency record deduplicates retries.
pub const IDEMPOTENCY_TTL_MICROS: i64 = 24 * 60 * 60 * 1_000_000;

// ============================================================================
// Store
// ============================================================================

/// Handle to the durable store. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct Store {
    pool: ConnectionPool,
}

/// Fields for a new conversation.
#[derive(Debug, Clone, Default)]
pub struct NewConversation {
    pub agent_id: String,
    pub title: Option<String>,
    pub external_id: Option<String>,
    pub project_path: Option<String>,
    pub imported: bool,
}

/// Fields for a conversation update.
#[derive(Debug, Clone, Default)]
pub struct ConversationPatch {
    pub title: Option<String>,
    pub status: Option<ConversationStatus>,
}

impl Store {
    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Open (or create) the store at `path` and apply pending migrations.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with(path, &ConnectionConfig::default())
    }

    pub fn open_with(path: impl AsRef<Path>, config: &ConnectionConfig) -> StoreResult<Self> {
        let pool = connection::new_pool(path.as_ref(), config)?;
        {
            let conn = pool.get()?;
            migrations::run_migrations(&conn)?;
        }
        Ok(Self { pool })
    }

    // ------------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------------

    pub fn create_conversation(&self, new: NewConversation) -> StoreResult<Conversation> {
        if new.agent_id.trim().is_empty() {
            return Err(StoreError::validation("agent_id must not be empty"));
        }

        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let id = new_id(CONVERSATION_ID_PREFIX);
        let now = now_micros();
        let source = if new.imported {
            ConversationSource::Imported
        } else {
            ConversationSource::Gui
        };

        tx.execute(
            "INSERT INTO conversations \
             (id, agent_id, title, status, source, external_id, project_path, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                id,
                new.agent_id,
                new.title,
                ConversationStatus::Active.as_str(),
                source.as_str(),
                new.external_id,
                new.project_path,
                now,
            ],
        )?;

        insert_event(
            &tx,
            "conversation.created",
            &id,
            &EventRefs::default(),
            serde_json::json!({ "agent_id": new.agent_id }),
        )?;

        tx.commit()?;
        self.get_conversation_raw(&id)?
            .ok_or_else(|| StoreError::not_found("conversation", id))
    }

    /// Fetch a conversation. Soft-deleted conversations read as absent.
    pub fn get_conversation(&self, id: &str) -> StoreResult<Option<Conversation>> {
        Ok(self
            .get_conversation_raw(id)?
            .filter(|c| c.status != ConversationStatus::Deleted))
    }

    fn get_conversation_raw(&self, id: &str) -> StoreResult<Option<Conversation>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT id, agent_id, title, status, source, external_id, project_path, \
                        created_at, updated_at \
                 FROM conversations WHERE id = ?1",
                params![id],
                map_conversation,
            )
            .optional()?;
        Ok(row)
    }

    /// List conversations, most recently updated first, soft-deleted excluded.
    pub fn list_conversations(&self) -> StoreResult<Vec<Conversation>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, title, status, source, external_id, project_path, \
                    created_at, updated_at \
             FROM conversations WHERE status != 'deleted' \
             ORDER BY updated_at DESC, id DESC",
        )?;
        let rows = stmt
            .query_map([], map_conversation)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Update title and/or status. Advances `updated_at` and emits
    /// `conversation.updated` in the same transaction.
    pub fn update_conversation(
        &self,
        id: &str,
        patch: ConversationPatch,
    ) -> StoreResult<Conversation> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: Option<String> = tx
            .query_row(
                "SELECT status FROM conversations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() || exists.as_deref() == Some("deleted") {
            return Err(StoreError::not_found("conversation", id));
        }

        tx.execute(
            "UPDATE conversations SET \
               title = COALESCE(?2, title), \
               status = COALESCE(?3, status), \
               updated_at = MAX(?4, updated_at + 1) \
             WHERE id = ?1",
            params![
                id,
                patch.title,
                patch.status.map(|s| s.as_str()),
                now_micros(),
            ],
        )?;

        insert_event(
            &tx,
            "conversation.updated",
            id,
            &EventRefs::default(),
            serde_json::json!({
                "title": patch.title,
                "status": patch.status.map(|s| s.as_str()),
            }),
        )?;

        tx.commit()?;
        self.get_conversation_raw(id)?
            .ok_or_else(|| StoreError::not_found("conversation", id))
    }

    /// Soft-delete a conversation. Returns false if it was already absent.
    pub fn delete_conversation(&self, id: &str) -> StoreResult<bool> {
        match self.update_conversation(
            id,
            ConversationPatch {
                status: Some(ConversationStatus::Deleted),
                ..Default::default()
            },
        ) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------------

    /// Append a message to a conversation, idempotently.
    ///
    /// If `idempotency_key` is non-empty and a non-expired record exists for
    /// it, the original message is returned verbatim: no new row, no new
    /// event, no timestamp change. Otherwise the message row, its
    /// `message.created` event, the conversation touch, and the idempotency
    /// record commit in one transaction.
    pub fn append_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
        idempotency_key: Option<&str>,
    ) -> StoreResult<Message> {
        let key = idempotency_key.filter(|k| !k.is_empty());
        let mut conn = self.pool.get()?;

        if let Some(k) = key {
            if let Some(message) = lookup_idempotent(&conn, k)? {
                return Ok(message);
            }
        }

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Re-check under the write lock: a concurrent retry may have
        // committed between the fast-path read and here.
        if let Some(k) = key {
            if let Some(message) = lookup_idempotent(&tx, k)? {
                return Ok(message);
            }
        }

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?;
        if status.is_none() || status.as_deref() == Some("deleted") {
            return Err(StoreError::not_found("conversation", conversation_id));
        }

        // Strictly increasing created_at within the conversation: if the
        // wall clock has not advanced past the newest message, bump by one
        // microsecond.
        let newest: Option<i64> = tx.query_row(
            "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        let mut created_at = now_micros();
        if let Some(newest) = newest {
            if created_at <= newest {
                created_at = newest + 1;
            }
        }

        let id = new_id(MESSAGE_ID_PREFIX);
        tx.execute(
            "INSERT INTO messages (id, conversation_id, role, content, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, conversation_id, role.as_str(), content, created_at],
        )?;

        insert_event(
            &tx,
            "message.created",
            conversation_id,
            &EventRefs {
                message_id: Some(id.clone()),
                ..Default::default()
            },
            serde_json::json!({ "role": role.as_str() }),
        )?;

        touch_conversation(&tx, conversation_id, created_at)?;

        let message = Message {
            id,
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            created_at: to_datetime(created_at),
        };

        if let Some(k) = key {
            tx.execute(
                "INSERT OR REPLACE INTO idempotency_keys (key, value, created_at) \
                 VALUES (?1, ?2, ?3)",
                params![k, serde_json::to_string(&message)?, now_micros()],
            )?;
        }

        tx.commit()?;
        Ok(message)
    }

    pub fn get_message(&self, id: &str) -> StoreResult<Option<Message>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT id, conversation_id, role, content, created_at \
                 FROM messages WHERE id = ?1",
                params![id],
                map_message,
            )
            .optional()?;
        Ok(row)
    }

    /// List messages in a conversation, oldest first.
    pub fn list_messages(
        &self,
        conversation_id: &str,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> StoreResult<Vec<Message>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, created_at \
             FROM messages WHERE conversation_id = ?1 \
             ORDER BY created_at ASC, id ASC \
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(
                params![
                    conversation_id,
                    limit.map(i64::from).unwrap_or(-1),
                    offset.map(i64::from).unwrap_or(0),
                ],
                map_message,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    /// Create a pending session for a user message.
    ///
    /// Emits `session.created` in the same transaction. `started_at` is
    /// non-decreasing within the conversation.
    pub fn create_session(
        &self,
        conversation_id: &str,
        user_message_id: &str,
    ) -> StoreResult<Session> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let newest: Option<i64> = tx.query_row(
            "SELECT MAX(started_at) FROM sessions WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        let mut started_at = now_micros();
        if let Some(newest) = newest {
            if started_at < newest {
                started_at = newest;
            }
        }

        let id = new_id(SESSION_ID_PREFIX);
        tx.execute(
            "INSERT INTO sessions (id, conversation_id, user_message_id, status, started_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                conversation_id,
                user_message_id,
                SessionStatus::Pending.as_str(),
                started_at,
            ],
        )?;

        insert_event(
            &tx,
            "session.created",
            conversation_id,
            &EventRefs {
                session_id: Some(id.clone()),
                message_id: Some(user_message_id.to_string()),
            },
            serde_json::json!({}),
        )?;

        touch_conversation(&tx, conversation_id, started_at)?;
        tx.commit()?;

        self.get_session(&id)?
            .ok_or_else(|| StoreError::not_found("session", id))
    }

    pub fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT id, conversation_id, user_message_id, status, started_at, \
                        completed_at, response_text, assistant_message_id, error \
                 FROM sessions WHERE id = ?1",
                params![id],
                map_session,
            )
            .optional()?;
        Ok(row)
    }

    /// Most recent session of a conversation, or None if it never ran one.
    pub fn latest_session(&self, conversation_id: &str) -> StoreResult<Option<Session>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT id, conversation_id, user_message_id, status, started_at, \
                        completed_at, response_text, assistant_message_id, error \
                 FROM sessions WHERE conversation_id = ?1 \
                 ORDER BY started_at DESC, id DESC LIMIT 1",
                params![conversation_id],
                map_session,
            )
            .optional()?;
        Ok(row)
    }

    /// The session dispatched for a given user message, if any.
    pub fn session_for_message(&self, user_message_id: &str) -> StoreResult<Option<Session>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT id, conversation_id, user_message_id, status, started_at, \
                        completed_at, response_text, assistant_message_id, error \
                 FROM sessions WHERE user_message_id = ?1 \
                 ORDER BY started_at DESC, id DESC LIMIT 1",
                params![user_message_id],
                map_session,
            )
            .optional()?;
        Ok(row)
    }

    /// Apply a patch to a session atomically.
    ///
    /// A terminal session admits no further status change. When the patch
    /// carries a status, the matching `session.<status>` audit event is
    /// written in the same transaction as the row update.
    pub fn update_session(&self, id: &str, patch: SessionPatch) -> StoreResult<Session> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = tx
            .query_row(
                "SELECT id, conversation_id, user_message_id, status, started_at, \
                        completed_at, response_text, assistant_message_id, error \
                 FROM sessions WHERE id = ?1",
                params![id],
                map_session,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("session", id))?;

        if let Some(new_status) = patch.status {
            if current.status.is_terminal() && new_status != current.status {
                return Err(StoreError::validation(format!(
                    "session {id} already terminal ({})",
                    current.status
                )));
            }
        }

        tx.execute(
            "UPDATE sessions SET \
               status = COALESCE(?2, status), \
               completed_at = COALESCE(?3, completed_at), \
               response_text = COALESCE(?4, response_text), \
               assistant_message_id = COALESCE(?5, assistant_message_id), \
               error = COALESCE(?6, error) \
             WHERE id = ?1",
            params![
                id,
                patch.status.map(|s| s.as_str()),
                patch.completed_at.map(|t| t.timestamp_micros()),
                patch.response.as_ref().map(|r| r.text.as_str()),
                patch
                    .response
                    .as_ref()
                    .map(|r| r.assistant_message_id.as_str()),
                patch.error,
            ],
        )?;

        let updated = tx
            .query_row(
                "SELECT id, conversation_id, user_message_id, status, started_at, \
                        completed_at, response_text, assistant_message_id, error \
                 FROM sessions WHERE id = ?1",
                params![id],
                map_session,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("session", id))?;

        if let Some(status) = patch.status {
            insert_event(
                &tx,
                &format!("session.{status}"),
                &updated.conversation_id,
                &EventRefs {
                    session_id: Some(id.to_string()),
                    ..Default::default()
                },
                serde_json::json!({
                    "status": status.as_str(),
                    "error": updated.error,
                }),
            )?;
            touch_conversation(&tx, &updated.conversation_id, now_micros())?;
        }

        tx.commit()?;
        Ok(updated)
    }

    // ------------------------------------------------------------------------
    // Audit Events
    // ------------------------------------------------------------------------

    pub fn append_event(
        &self,
        event_type: &str,
        conversation_id: &str,
        refs: EventRefs,
        data: serde_json::Value,
    ) -> StoreResult<StoredEvent> {
        let conn = self.pool.get()?;
        let event = insert_event(&conn, event_type, conversation_id, &refs, data)?;
        Ok(event)
    }

    /// All audit events for a conversation, oldest first.
    pub fn list_events(&self, conversation_id: &str) -> StoreResult<Vec<StoredEvent>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, type, conversation_id, session_id, message_id, data, created_at \
             FROM events WHERE conversation_id = ?1 \
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![conversation_id], map_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Audit events attached to one session, oldest first.
    pub fn list_session_events(&self, session_id: &str) -> StoreResult<Vec<StoredEvent>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, type, conversation_id, session_id, message_id, data, created_at \
             FROM events WHERE session_id = ?1 \
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![session_id], map_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Remove idempotency records older than the dedup window.
    pub fn purge_expired_idempotency(&self) -> StoreResult<usize> {
        let conn = self.pool.get()?;
        let cutoff = now_micros() - IDEMPOTENCY_TTL_MICROS;
        let removed = conn.execute(
            "DELETE FROM idempotency_keys WHERE created_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    /// Cross-table consistency check: orphaned messages, dangling session
    /// references, assistant messages claimed by more than one session.
    pub fn validate_integrity(&self) -> StoreResult<IntegrityReport> {
        let conn = self.pool.get()?;
        let mut violations = Vec::new();

        collect_ids(
            &conn,
            "SELECT m.id FROM messages m \
             LEFT JOIN conversations c ON c.id = m.conversation_id \
             WHERE c.id IS NULL",
            |id| format!("message {id} references a missing conversation"),
            &mut violations,
        )?;

        collect_ids(
            &conn,
            "SELECT s.id FROM sessions s \
             LEFT JOIN messages m ON m.id = s.user_message_id \
             WHERE m.id IS NULL",
            |id| format!("session {id} references a missing user message"),
            &mut violations,
        )?;

        collect_ids(
            &conn,
            "SELECT s.id FROM sessions s \
             LEFT JOIN messages m ON m.id = s.assistant_message_id \
             WHERE s.assistant_message_id IS NOT NULL AND m.id IS NULL",
            |id| format!("session {id} references a missing assistant message"),
            &mut violations,
        )?;

        collect_ids(
            &conn,
            "SELECT assistant_message_id FROM sessions \
             WHERE assistant_message_id IS NOT NULL \
             GROUP BY assistant_message_id HAVING COUNT(*) > 1",
            |id| format!("assistant message {id} is claimed by multiple sessions"),
            &mut violations,
        )?;

        Ok(IntegrityReport {
            ok: violations.is_empty(),
            violations,
        })
    }

    #[cfg(test)]
    fn backdate_idempotency(&self, key: &str, micros: i64) -> StoreResult<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE idempotency_keys SET created_at = created_at - ?2 WHERE key = ?1",
            params![key, micros],
        )?;
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn new_id(prefix: &str) -> String {
    format!("{prefix}{}", Ulid::new())
}

fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

fn to_datetime(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Advance a conversation's `updated_at` monotonically.
fn touch_conversation(conn: &Connection, id: &str, at_least: i64) -> StoreResult<()> {
    let _ = conn.execute(
        "UPDATE conversations SET updated_at = MAX(?2, updated_at + 1) WHERE id = ?1",
        params![id, at_least.max(now_micros())],
    )?;
    Ok(())
}

fn insert_event(
    conn: &Connection,
    event_type: &str,
    conversation_id: &str,
    refs: &EventRefs,
    data: serde_json::Value,
) -> StoreResult<StoredEvent> {
    let id = new_id(EVENT_ID_PREFIX);
    let created_at = now_micros();
    conn.execute(
        "INSERT INTO events (id, type, conversation_id, session_id, message_id, data, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id,
            event_type,
            conversation_id,
            refs.session_id,
            refs.message_id,
            serde_json::to_string(&data)?,
            created_at,
        ],
    )?;
    Ok(StoredEvent {
        id,
        event_type: event_type.to_string(),
        conversation_id: conversation_id.to_string(),
        session_id: refs.session_id.clone(),
        message_id: refs.message_id.clone(),
        data,
        created_at: to_datetime(created_at),
    })
}

fn lookup_idempotent(conn: &Connection, key: &str) -> StoreResult<Option<Message>> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT value, created_at FROM idempotency_keys WHERE key = ?1",
            params![key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match row {
        Some((value, created_at)) if now_micros() - created_at <= IDEMPOTENCY_TTL_MICROS => {
            Ok(Some(serde_json::from_str(&value)?))
        }
        // Expired records read as absent; the sweep reclaims the row later.
        _ => Ok(None),
    }
}

fn collect_ids(
    conn: &Connection,
    sql: &str,
    describe: impl Fn(&str) -> String,
    out: &mut Vec<String>,
) -> StoreResult<()> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    out.extend(ids.iter().map(|id| describe(id)));
    Ok(())
}

// ============================================================================
// Row Mapping
// ============================================================================

fn map_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let status: String = row.get(3)?;
    let source: String = row.get(4)?;
    Ok(Conversation {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        title: row.get(2)?,
        status: ConversationStatus::parse(&status).unwrap_or(ConversationStatus::Active),
        source: ConversationSource::parse(&source).unwrap_or(ConversationSource::Gui),
        external_id: row.get(5)?,
        project_path: row.get(6)?,
        created_at: to_datetime(row.get(7)?),
        updated_at: to_datetime(row.get(8)?),
    })
}

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get(2)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: MessageRole::parse(&role).unwrap_or(MessageRole::System),
        content: row.get(3)?,
        created_at: to_datetime(row.get(4)?),
    })
}

fn map_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get(3)?;
    let response_text: Option<String> = row.get(6)?;
    let assistant_message_id: Option<String> = row.get(7)?;
    let response = match (response_text, assistant_message_id) {
        (Some(text), Some(assistant_message_id)) => Some(SessionReply {
            text,
            assistant_message_id,
        }),
        _ => None,
    };
    Ok(Session {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        user_message_id: row.get(2)?,
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Pending),
        started_at: to_datetime(row.get(4)?),
        completed_at: row.get::<_, Option<i64>>(5)?.map(to_datetime),
        response,
        error: row.get(8)?,
    })
}

fn map_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredEvent> {
    let data: String = row.get(5)?;
    Ok(StoredEvent {
        id: row.get(0)?,
        event_type: row.get(1)?,
        conversation_id: row.get(2)?,
        session_id: row.get(3)?,
        message_id: row.get(4)?,
        data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
        created_at: to_datetime(row.get(6)?),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> Store {
        Store::open(dir.path().join("test.db")).unwrap()
    }

    fn conversation(store: &Store) -> Conversation {
        store
            .create_conversation(NewConversation {
                agent_id: "claude-code".to_string(),
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn create_conversation_rejects_empty_agent() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let err = store
            .create_conversation(NewConversation::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn conversation_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let created = store
            .create_conversation(NewConversation {
                agent_id: "claude-code".to_string(),
                title: Some("Debugging".to_string()),
                ..Default::default()
            })
            .unwrap();

        let fetched = store.get_conversation(&created.id).unwrap().unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.status, ConversationStatus::Active);
        assert_eq!(fetched.source, ConversationSource::Gui);
    }

    #[test]
    fn list_orders_by_updated_at_desc() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let first = conversation(&store);
        let second = conversation(&store);

        // Touch the first via a child mutation
        store
            .append_message(&first.id, MessageRole::User, "bump", None)
            .unwrap();

        let listed = store.list_conversations().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1].id, second.id);
    }

    #[test]
    fn update_conversation_advances_updated_at_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let conv = conversation(&store);

        let patch = ConversationPatch {
            title: Some("Renamed".to_string()),
            ..Default::default()
        };
        let once = store.update_conversation(&conv.id, patch.clone()).unwrap();
        assert!(once.updated_at > conv.updated_at);

        let twice = store.update_conversation(&conv.id, patch).unwrap();
        assert_eq!(twice.title, once.title);
        assert_eq!(twice.status, once.status);
        assert_eq!(twice.agent_id, once.agent_id);
    }

    #[test]
    fn soft_delete_hides_conversation() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let conv = conversation(&store);

        assert!(store.delete_conversation(&conv.id).unwrap());
        assert!(store.get_conversation(&conv.id).unwrap().is_none());
        assert!(store.list_conversations().unwrap().is_empty());

        // Messages into a deleted conversation are rejected
        let err = store
            .append_message(&conv.id, MessageRole::User, "hello?", None)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn update_missing_conversation_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let err = store
            .update_conversation("conv_nope", ConversationPatch::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(!store.delete_conversation("conv_nope").unwrap());
    }

    #[test]
    fn append_message_assigns_strictly_increasing_timestamps() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let conv = conversation(&store);

        for i in 0..20 {
            store
                .append_message(&conv.id, MessageRole::User, &format!("m{i}"), None)
                .unwrap();
        }

        let messages = store.list_messages(&conv.id, None, None).unwrap();
        assert_eq!(messages.len(), 20);
        for pair in messages.windows(2) {
            assert!(pair[0].created_at < pair[1].created_at);
        }
    }

    #[test]
    fn append_message_accepts_empty_and_large_content() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let conv = conversation(&store);

        let empty = store
            .append_message(&conv.id, MessageRole::User, "", None)
            .unwrap();
        assert_eq!(empty.content, "");

        let big = "x".repeat(10_000);
        let large = store
            .append_message(&conv.id, MessageRole::User, &big, None)
            .unwrap();
        assert_eq!(large.content.len(), 10_000);
    }

    #[test]
    fn idempotent_retry_returns_original_message() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let conv = conversation(&store);

        let first = store
            .append_message(&conv.id, MessageRole::User, "hi", Some("k-1"))
            .unwrap();
        let second = store
            .append_message(&conv.id, MessageRole::User, "hi", Some("k-1"))
            .unwrap();
        let third = store
            .append_message(&conv.id, MessageRole::User, "hi", Some("k-1"))
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.id, third.id);
        assert_eq!(first.created_at, third.created_at);

        assert_eq!(store.list_messages(&conv.id, None, None).unwrap().len(), 1);

        let created_events: Vec<_> = store
            .list_events(&conv.id)
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == "message.created")
            .collect();
        assert_eq!(created_events.len(), 1);
    }

    #[test]
    fn expired_idempotency_key_creates_new_message() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let conv = conversation(&store);

        let first = store
            .append_message(&conv.id, MessageRole::User, "hi", Some("k-old"))
            .unwrap();

        store
            .backdate_idempotency("k-old", IDEMPOTENCY_TTL_MICROS + 1)
            .unwrap();

        let second = store
            .append_message(&conv.id, MessageRole::User, "hi", Some("k-old"))
            .unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(store.list_messages(&conv.id, None, None).unwrap().len(), 2);
    }

    #[test]
    fn purge_removes_only_expired_records() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let conv = conversation(&store);

        store
            .append_message(&conv.id, MessageRole::User, "a", Some("k-live"))
            .unwrap();
        store
            .append_message(&conv.id, MessageRole::User, "b", Some("k-dead"))
            .unwrap();
        store
            .backdate_idempotency("k-dead", IDEMPOTENCY_TTL_MICROS + 1)
            .unwrap();

        assert_eq!(store.purge_expired_idempotency().unwrap(), 1);
        assert_eq!(store.purge_expired_idempotency().unwrap(), 0);
    }

    #[test]
    fn list_messages_respects_limit_and_offset() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let conv = conversation(&store);

        for i in 0..5 {
            store
                .append_message(&conv.id, MessageRole::User, &format!("m{i}"), None)
                .unwrap();
        }

        let page = store.list_messages(&conv.id, Some(2), Some(1)).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].content, "m1");
        assert_eq!(page[1].content, "m2");
    }

    #[test]
    fn session_lifecycle_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let conv = conversation(&store);

        let user_msg = store
            .append_message(&conv.id, MessageRole::User, "ping", None)
            .unwrap();
        let session = store.create_session(&conv.id, &user_msg.id).unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.user_message_id, user_msg.id);

        assert_eq!(
            store.latest_session(&conv.id).unwrap().unwrap().id,
            session.id
        );
        assert_eq!(
            store.session_for_message(&user_msg.id).unwrap().unwrap().id,
            session.id
        );

        let assistant = store
            .append_message(&conv.id, MessageRole::Assistant, "pong", None)
            .unwrap();
        let updated = store
            .update_session(
                &session.id,
                SessionPatch {
                    status: Some(SessionStatus::Completed),
                    completed_at: Some(Utc::now()),
                    response: Some(SessionReply {
                        text: "pong".to_string(),
                        assistant_message_id: assistant.id.clone(),
                    }),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(updated.status, SessionStatus::Completed);
        assert_eq!(updated.response.unwrap().assistant_message_id, assistant.id);
        assert!(assistant.created_at > user_msg.created_at);
    }

    #[test]
    fn latest_session_is_none_without_sessions() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let conv = conversation(&store);

        assert!(store.latest_session(&conv.id).unwrap().is_none());
    }

    #[test]
    fn update_session_emits_matching_event() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let conv = conversation(&store);
        let msg = store
            .append_message(&conv.id, MessageRole::User, "go", None)
            .unwrap();
        let session = store.create_session(&conv.id, &msg.id).unwrap();

        store
            .update_session(
                &session.id,
                SessionPatch {
                    status: Some(SessionStatus::Processing),
                    ..Default::default()
                },
            )
            .unwrap();

        let events = store.list_session_events(&session.id).unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert!(types.contains(&"session.created"));
        assert!(types.contains(&"session.processing"));
    }

    #[test]
    fn terminal_session_rejects_status_change() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let conv = conversation(&store);
        let msg = store
            .append_message(&conv.id, MessageRole::User, "go", None)
            .unwrap();
        let session = store.create_session(&conv.id, &msg.id).unwrap();

        store
            .update_session(
                &session.id,
                SessionPatch {
                    status: Some(SessionStatus::Cancelled),
                    ..Default::default()
                },
            )
            .unwrap();

        let err = store
            .update_session(
                &session.id,
                SessionPatch {
                    status: Some(SessionStatus::Completed),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        // Same terminal status again is a no-op, not an error
        let again = store
            .update_session(
                &session.id,
                SessionPatch {
                    status: Some(SessionStatus::Cancelled),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(again.status, SessionStatus::Cancelled);
    }

    #[test]
    fn update_missing_session_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let err = store
            .update_session("sess_nope", SessionPatch::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn append_event_is_listed_in_order() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let conv = conversation(&store);

        let event = store
            .append_event(
                "conversation.imported",
                &conv.id,
                EventRefs::default(),
                serde_json::json!({"external_id": "abc"}),
            )
            .unwrap();
        assert!(event.id.starts_with("evt_"));

        let events = store.list_events(&conv.id).unwrap();
        assert_eq!(events.last().unwrap().event_type, "conversation.imported");
        assert_eq!(events.last().unwrap().data["external_id"], "abc");
        for pair in events.windows(2) {
            assert!(pair[0].created_at <= pair[1].created_at);
        }
    }

    #[test]
    fn integrity_clean_store() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let conv = conversation(&store);
        let msg = store
            .append_message(&conv.id, MessageRole::User, "hello", None)
            .unwrap();
        store.create_session(&conv.id, &msg.id).unwrap();

        let report = store.validate_integrity().unwrap();
        assert!(report.ok, "unexpected violations: {:?}", report.violations);
    }

    #[test]
    fn integrity_flags_orphaned_message() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        // Bypass foreign keys to simulate a historically corrupted row
        let conn = store.pool.get().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = OFF;").unwrap();
        conn.execute(
            "INSERT INTO messages (id, conversation_id, role, content, created_at) \
             VALUES ('msg_orphan', 'conv_gone', 'user', 'hi', 1)",
            [],
        )
        .unwrap();

        let report = store.validate_integrity().unwrap();
        assert!(!report.ok);
        assert!(report.violations[0].contains("msg_orphan"));
    }

    #[test]
    fn concurrent_appends_all_persist_with_distinct_timestamps() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let conv = conversation(&store);

        let handles: Vec<_> = ["a", "b", "c", "d", "e"]
            .into_iter()
            .map(|content| {
                let store = store.clone();
                let conv_id = conv.id.clone();
                std::thread::spawn(move || {
                    store
                        .append_message(&conv_id, MessageRole::User, content, Some(content))
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let messages = store.list_messages(&conv.id, None, None).unwrap();
        assert_eq!(messages.len(), 5);
        for pair in messages.windows(2) {
            assert!(pair[0].created_at < pair[1].created_at);
        }
    }
}
