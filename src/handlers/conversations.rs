//! Conversation and message HTTP handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::error;

use crate::api::{
    ConversationResponse, CreateConversationRequest, ListConversationsResponse,
    ListMessagesResponse, SendMessageRequest, SendMessageResponse, StreamEvent,
    UpdateConversationRequest,
};
use crate::dispatch::{DispatchError, DispatchRequest};
use crate::handlers::problem_details;
use crate::server::AppState;
use crate::store::{ConversationPatch, NewConversation};

#[derive(Deserialize)]
pub struct ListMessagesQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

/// POST /api/conversations
pub async fn create_conversation(
    State(state): State<AppState>,
    Json(req): Json<CreateConversationRequest>,
) -> Response {
    match state.store.create_conversation(NewConversation {
        agent_id: req.agent_id,
        title: req.title,
        ..Default::default()
    }) {
        Ok(conversation) => (
            StatusCode::CREATED,
            Json(ConversationResponse { conversation }),
        )
            .into_response(),
        Err(e) => problem_details::from_store_error(&e).into_response(),
    }
}

/// GET /api/conversations
pub async fn list_conversations(State(state): State<AppState>) -> Response {
    match state.store.list_conversations() {
        Ok(conversations) => Json(ListConversationsResponse { conversations }).into_response(),
        Err(e) => {
            error!(error = %e, "failed to list conversations");
            problem_details::internal_error("failed to list conversations").into_response()
        }
    }
}

/// GET /api/conversations/{conversation_id}
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Response {
    match state.store.get_conversation(&conversation_id) {
        Ok(Some(conversation)) => Json(ConversationResponse { conversation }).into_response(),
        Ok(None) => problem_details::not_found("conversation not found").into_response(),
        Err(e) => {
            error!(error = %e, "failed to load conversation");
            problem_details::internal_error("failed to load conversation").into_response()
        }
    }
}

/// POST /api/conversations/{conversation_id}
pub async fn update_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(req): Json<UpdateConversationRequest>,
) -> Response {
    match state.store.update_conversation(
        &conversation_id,
        ConversationPatch {
            title: req.title,
            status: req.status,
        },
    ) {
        Ok(conversation) => {
            state.hub.publish(StreamEvent::ConversationUpdated {
                conversation: conversation.clone(),
            });
            Json(ConversationResponse { conversation }).into_response()
        }
        Err(e) => problem_details::from_store_error(&e).into_response(),
    }
}

/// GET /api/conversations/{conversation_id}/messages
pub async fn list_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<ListMessagesQuery>,
) -> Response {
    match state.store.get_conversation(&conversation_id) {
        Ok(Some(_)) => {}
        Ok(None) => return problem_details::not_found("conversation not found").into_response(),
        Err(e) => {
            error!(error = %e, "failed to load conversation");
            return problem_details::internal_error("failed to load conversation").into_response();
        }
    }

    match state
        .store
        .list_messages(&conversation_id, query.limit, query.offset)
    {
        Ok(messages) => Json(ListMessagesResponse { messages }).into_response(),
        Err(e) => {
            error!(error = %e, "failed to list messages");
            problem_details::internal_error("failed to list messages").into_response()
        }
    }
}

/// POST /api/conversations/{conversation_id}/messages
///
/// Persists the user message idempotently, starts a session, and returns as
/// soon as both rows are durable. The agent run streams on the conversation's
/// WebSocket; this response only carries the accepted message and session.
pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Response {
    let idempotency_key = req.idempotency_key.clone();
    let handle = match state.dispatcher.dispatch(DispatchRequest {
        conversation_id,
        content: req.content,
        agent_id: req.agent_id,
        idempotency_key: idempotency_key.clone(),
        folder_context: req.folder_context,
    }) {
        Ok(handle) => handle,
        Err(DispatchError::Store(e)) => {
            return problem_details::from_store_error(&e).into_response();
        }
        Err(e) => {
            error!(error = %e, "dispatch failed");
            return problem_details::internal_error("dispatch failed").into_response();
        }
    };

    (
        StatusCode::CREATED,
        Json(SendMessageResponse {
            message: handle.message,
            session: handle.session,
            idempotency_key,
        }),
    )
        .into_response()
}
