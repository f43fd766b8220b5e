use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Errors returned by the HTTP side of the server, before any WebSocket is
/// established.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message.
#[derive(Debug)]
pub enum ApiError {
    /// 403 - The Origin header does not match the configured host.
    OriginNotAllowed,
    /// 404 - Generic not-found.
    NotFound,
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::OriginNotAllowed => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::OriginNotAllowed => "origin_not_allowed",
            ApiError::NotFound => "not_found",
            ApiError::InvalidRequest(_) => "invalid_request",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::OriginNotAllowed => "Request origin is not allowed.".to_string(),
            ApiError::NotFound => "Not found.".to_string(),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
