pub mod auth;
pub mod error;
mod handlers;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    routing::get,
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::mux::Multiplexer;
use crate::store::HostStore;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub hosts: HostStore,
    pub mux: Multiplexer,
}

/// Configuration for the HTTP router.
///
/// Controls authentication and CORS. Use `RouterConfig::default()` in tests
/// for a minimal no-auth setup.
pub struct RouterConfig {
    pub token: Option<String>,
    pub cors_origins: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            token: None,
            cors_origins: vec![],
        }
    }
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let protected = Router::new()
        .route("/hosts", get(list_hosts).post(add_host))
        .route("/hosts/{id}", get(get_host).delete(delete_host))
        .route("/sessions", get(list_sessions).post(open_session))
        .route("/sessions/{key}", get(get_session).delete(close_session))
        .route("/events", get(events))
        .with_state(state);

    let protected = match config.token {
        Some(token) => protected.layer(axum::middleware::from_fn(move |req, next| {
            let t = token.clone();
            async move { auth::require_auth(t, req, next).await }
        })),
        None => protected,
    };

    let router = Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(TraceLayer::new_for_http());

    // Conditionally apply CORS if origins are configured.
    if config.cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
        )
    }
}
