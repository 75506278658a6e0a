//! Session HTTP handlers.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use crate::api::{LatestSessionResponse, SessionResponse};
use crate::handlers::problem_details;
use crate::server::AppState;

/// GET /api/sessions/{session_id}
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.store.get_session(&session_id) {
        Ok(Some(session)) => Json(SessionResponse { session }).into_response(),
        Ok(None) => problem_details::not_found("session not found").into_response(),
        Err(e) => {
            error!(error = %e, "failed to load session");
            problem_details::internal_error("failed to load session").into_response()
        }
    }
}

/// GET /api/conversations/{conversation_id}/sessions/latest
///
/// The latest session with its full audit trail, or `session: null` when the
/// conversation has never dispatched.
pub async fn latest_session(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Response {
    match state.store.get_conversation(&conversation_id) {
        Ok(Some(_)) => {}
        Ok(None) => return problem_details::not_found("conversation not found").into_response(),
        Err(e) => {
            error!(error = %e, "failed to load conversation");
            return problem_details::internal_error("failed to load conversation").into_response();
        }
    }

    let session = match state.store.latest_session(&conversation_id) {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "failed to load latest session");
            return problem_details::internal_error("failed to load latest session")
                .into_response();
        }
    };

    let events = match &session {
        Some(session) => match state.store.list_session_events(&session.id) {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "failed to load session events");
                return problem_details::internal_error("failed to load session events")
                    .into_response();
            }
        },
        None => Vec::new(),
    };

    Json(LatestSessionResponse { session, events }).into_response()
}
