use crate::controller::{connection_controller, health_check_controller, publish_controller};
use crate::sse::handler;
use crate::AppState;
use axum::http::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, Method};
use axum::{
    routing::{get, post},
    Router,
};
use log::*;
use tower_http::cors::{AllowOrigin, CorsLayer};

pub fn define_routes(app_state: AppState) -> Router {
    let cors = cors_layer(&app_state.config.allowed_origins);

    Router::new()
        .merge(health_routes())
        .merge(event_stream_routes(app_state.clone()))
        .merge(publish_routes(app_state.clone()))
        .merge(connection_routes(app_state))
        .layer(cors)
}

fn health_routes() -> Router {
    Router::new().route("/health", get(health_check_controller::health_check))
}

fn event_stream_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/events", get(handler::event_stream))
        .route("/events/*topic", get(handler::event_stream))
        .with_state(app_state)
}

fn publish_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/publish", post(publish_controller::publish))
        .with_state(app_state)
}

fn connection_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/connections", get(connection_controller::index))
        .with_state(app_state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter(|origin| origin.as_str() != "*")
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {origin:?}");
                None
            }
        })
        .collect();

    let allow_origin = if allowed_origins.iter().any(|origin| origin == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            ACCEPT,
            CACHE_CONTROL,
            CONTENT_TYPE,
            HeaderName::from_static("last-event-id"),
        ])
}
