// Plain-HTTP listener that sends browsers to the HTTPS server.

use std::sync::Arc;

use axum::{
    extract::Request,
    http::{header, Uri},
    response::Redirect,
    Router,
};
use tower_http::trace::TraceLayer;

use super::error::ApiError;
use super::origin::origin_allowed;

/// Router answering every request with a permanent redirect to HTTPS.
/// Requests failing the origin check get 403 instead.
pub fn redirect_router(origin_host: Arc<str>) -> Router {
    Router::new()
        .fallback(move |req: Request| {
            let origin_host = origin_host.clone();
            async move { https_redirect(&origin_host, &req) }
        })
        .layer(TraceLayer::new_for_http())
}

fn https_redirect(origin_host: &str, req: &Request) -> Result<Redirect, ApiError> {
    if !origin_allowed(origin_host, req.headers()) {
        return Err(ApiError::OriginNotAllowed);
    }
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())
        .ok_or_else(|| ApiError::InvalidRequest("missing Host header".into()))?;
    let target = redirect_target(host, req.uri());
    tracing::info!(%target, user_agent = ?req.headers().get(header::USER_AGENT), "redirecting client to https");
    Ok(Redirect::permanent(&target))
}

/// `https://` URL for `host` and the request's path and query. The port and
/// a leading `www.` are dropped from the host.
pub fn redirect_target(host: &str, uri: &Uri) -> String {
    let host = strip_port(host);
    let host = host.strip_prefix("www.").unwrap_or(host);
    let mut target = format!("https://{host}{}", uri.path());
    if let Some(query) = uri.query().filter(|q| !q.is_empty()) {
        target.push('?');
        target.push_str(query);
    }
    target
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}
