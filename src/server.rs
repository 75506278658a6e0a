use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::{oneshot, Mutex};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::agent::AgentCatalog;
use crate::background::BackgroundTasks;
use crate::dispatch::Dispatcher;
use crate::handlers;
use crate::hub::SyncHub;
use crate::session::SessionRegistry;
use crate::store::Store;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub registry: SessionRegistry,
    pub hub: SyncHub,
    pub agents: AgentCatalog,
    pub dispatcher: Dispatcher,
    pub background_tasks: BackgroundTasks,
    pub shutdown_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

// ============================================================================
// Server Setup
// ============================================================================

/// Create a shutdown channel pair.
///
/// Returns (sender for AppState, receiver for the graceful-shutdown future).
pub fn shutdown_channel() -> (oneshot::Sender<()>, oneshot::Receiver<()>) {
    oneshot::channel()
}

pub fn build_app(
    state: AppState,
    base_url: &str,
    request_timeout_seconds: u64,
    max_connections: usize,
) -> Router {
    // WebSocket streaming route - no request timeout (connections are
    // long-lived by design)
    let streaming_routes = Router::new()
        .route(
            "/conversations/{conversation_id}/ws",
            get(handlers::conversation_stream),
        )
        .with_state(state.clone());

    // Regular API routes - with request timeout
    let api_routes = Router::new()
        .route(
            "/conversations",
            get(handlers::list_conversations).post(handlers::create_conversation),
        )
        .route(
            "/conversations/{conversation_id}",
            get(handlers::get_conversation).post(handlers::update_conversation),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(handlers::list_messages).post(handlers::send_message),
        )
        .route(
            "/conversations/{conversation_id}/sessions/latest",
            get(handlers::latest_session),
        )
        .route("/sessions/{session_id}", get(handlers::get_session))
        .route(
            "/diagnostics/sessions",
            get(handlers::diagnostics_sessions),
        )
        .with_state(state.clone())
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )));

    // Admin routes (no timeout, state required for shutdown)
    let admin_routes = Router::new()
        .route("/admin/shutdown", post(handlers::shutdown))
        .with_state(state.clone());

    let api = Router::new()
        .merge(streaming_routes)
        .merge(api_routes)
        .merge(admin_routes)
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024)) // 2 MB
        .layer(ConcurrencyLimitLayer::new(max_connections));

    let prefix = normalize_base_url(base_url);
    Router::new()
        .route("/livez", get(handlers::livez))
        .route("/version", get(handlers::version))
        .with_state(state)
        .nest(&format!("{prefix}/api"), api)
}

/// Normalize the configured URL prefix: no trailing slash, and a bare or
/// empty prefix collapses to the root.
fn normalize_base_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.is_empty() || trimmed == "/" {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
