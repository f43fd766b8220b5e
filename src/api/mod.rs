pub mod error;
mod handlers;
pub mod origin;
pub mod redirect;
pub mod ws_methods;

use std::sync::Arc;

use axum::{
    http::{HeaderName, HeaderValue},
    routing::get,
    Router,
};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::config::Settings;
use crate::registry::{ConnectionRegistry, RegistryOptions};
use crate::shutdown::ShutdownCoordinator;

use handlers::*;

pub use redirect::redirect_router;

#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub settings: Arc<Settings>,
    pub shutdown: ShutdownCoordinator,
}

impl AppState {
    /// Build the shared state and start the connection registry.
    pub fn new(settings: Settings, shutdown: ShutdownCoordinator) -> Self {
        let registry = ConnectionRegistry::spawn(RegistryOptions {
            max_sessions: settings.max_sessions,
            ..RegistryOptions::new(settings.preview_base_url.clone())
        });
        Self {
            registry,
            settings: Arc::new(settings),
            shutdown,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let expected_host: Arc<str> = Arc::from(state.settings.upgrade.origin_host.as_str());

    // Origin is enforced on the upgrade endpoint only.
    let socket_routes = Router::new()
        .route("/socket", get(socket))
        .layer(axum::middleware::from_fn(move |req, next| {
            origin::check_origin(expected_host.clone(), req, next)
        }));

    Router::new()
        .route("/health", get(health))
        .merge(socket_routes)
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .with_state(state)
}
