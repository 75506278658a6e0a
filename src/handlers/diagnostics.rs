//! Diagnostics endpoint over the session registry.

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::api::ActiveSessionInfo;
use crate::server::AppState;
use crate::session::FsmSummary;

#[derive(Debug, Serialize)]
pub struct SessionDiagnosticsResponse {
    pub timestamp: String,
    pub active_sessions: usize,
    pub terminal_sessions: usize,
    pub total: usize,
    pub active: Vec<ActiveSessionInfo>,
    pub recent_terminal: Vec<FsmSummary>,
}

/// GET /api/diagnostics/sessions
///
/// Snapshot of live session machines plus the transition history of recent
/// terminal ones, for debugging stuck or failed sessions.
pub async fn sessions(State(state): State<AppState>) -> Json<SessionDiagnosticsResponse> {
    let diagnostics = state.registry.diagnostics();
    Json(SessionDiagnosticsResponse {
        timestamp: Utc::now().to_rfc3339(),
        active_sessions: diagnostics.active_count,
        terminal_sessions: diagnostics.terminal_count,
        total: diagnostics.total,
        active: diagnostics.active,
        recent_terminal: diagnostics.recent_terminal,
    })
}
