//! RFC 7807 problem-details error responses.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::store::StoreError;

/// An `application/problem+json` body.
#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: &'static str,
    pub title: &'static str,
    pub status: u16,
    pub detail: String,
}

impl ProblemDetails {
    fn new(status: StatusCode, title: &'static str, detail: impl Into<String>) -> Self {
        Self {
            problem_type: "about:blank",
            title,
            status: status.as_u16(),
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ProblemDetails {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::to_string(&self).unwrap_or_else(|_| "{}".to_string());
        (
            status,
            [(header::CONTENT_TYPE, "application/problem+json")],
            body,
        )
            .into_response()
    }
}

pub fn bad_request(detail: impl Into<String>) -> ProblemDetails {
    ProblemDetails::new(StatusCode::BAD_REQUEST, "Bad Request", detail)
}

pub fn not_found(detail: impl Into<String>) -> ProblemDetails {
    ProblemDetails::new(StatusCode::NOT_FOUND, "Not Found", detail)
}

pub fn internal_error(detail: impl Into<String>) -> ProblemDetails {
    ProblemDetails::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal Server Error",
        detail,
    )
}

/// Map a store failure onto the wire taxonomy: validation → 400,
/// not-found → 404, anything else → 500.
pub fn from_store_error(error: &StoreError) -> ProblemDetails {
    match error {
        StoreError::Validation(detail) => bad_request(detail.clone()),
        StoreError::NotFound { .. } => not_found(error.to_string()),
        _ => internal_error(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_status_codes() {
        assert_eq!(
            from_store_error(&StoreError::validation("bad input")).status,
            400
        );
        assert_eq!(
            from_store_error(&StoreError::not_found("session", "sess_1")).status,
            404
        );
        assert_eq!(
            from_store_error(&StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows)).status,
            500
        );
    }

    #[test]
    fn body_carries_rfc7807_fields() {
        let problem = not_found("conversation not found");
        let json = serde_json::to_value(&problem).unwrap();
        assert_eq!(json["type"], "about:blank");
        assert_eq!(json["title"], "Not Found");
        assert_eq!(json["status"], 404);
        assert!(json["detail"].as_str().unwrap().contains("not found"));
    }
}
