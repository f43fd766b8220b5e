// Origin validation for WebSocket upgrades and the HTTPS redirect.

use std::sync::Arc;

use axum::{
    extract::Request,
    http::{header, HeaderMap, Uri},
    middleware::Next,
    response::Response,
};

use super::error::ApiError;

/// Whether the request's Origin matches `expected_host`.
///
/// An empty `expected_host` disables the check. Otherwise the Origin header
/// must parse as a URI whose authority (`host[:port]`) equals it exactly;
/// a missing or unparseable Origin is rejected.
pub fn origin_allowed(expected_host: &str, headers: &HeaderMap) -> bool {
    if expected_host.is_empty() {
        return true;
    }
    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    match origin.parse::<Uri>() {
        Ok(uri) if uri.scheme().is_some() => {
            uri.authority().is_some_and(|a| a.as_str() == expected_host)
        }
        Ok(_) => false,
        Err(_) => false,
    }
}

/// Middleware rejecting requests whose Origin does not match.
pub async fn check_origin(
    expected_host: Arc<str>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if origin_allowed(&expected_host, req.headers()) {
        return Ok(next.run(req).await);
    }
    tracing::warn!(
        origin = ?req.headers().get(header::ORIGIN),
        expected = %expected_host,
        "rejecting request from foreign origin"
    );
    Err(ApiError::OriginNotAllowed)
}
