//! Administrative handlers.

use axum::extract::State;
use axum::http::StatusCode;
use tracing::info;

use crate::server::AppState;

/// POST /api/admin/shutdown
///
/// Triggers graceful shutdown: the listener stops accepting, in-flight
/// background session tasks are awaited, then the process exits cleanly.
pub async fn shutdown(State(state): State<AppState>) -> StatusCode {
    info!("shutdown requested via admin endpoint");

    let sender = state.shutdown_tx.lock().await.take();
    match sender {
        Some(tx) => {
            let _ = tx.send(());
            StatusCode::ACCEPTED
        }
        None => StatusCode::CONFLICT,
    }
}
