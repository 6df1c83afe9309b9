use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use log::*;
use serde::{Deserialize, Serialize};
use sse::Event;
use std::time::Duration;

use crate::controller::ApiResponse;
use crate::{AppState, Error};

/// Request body for publishing one event to open streams.
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    /// Event type, sent as the `event` field.
    pub event: Option<String>,
    pub id: Option<String>,
    /// Tell clients to forget their last event id. Takes precedence over `id`.
    #[serde(default)]
    pub reset_id: bool,
    /// Reconnection interval in milliseconds to announce with the event.
    pub retry: Option<u64>,
    pub data: String,
    /// Only deliver to streams opened on this request path (e.g. `/events/news`).
    pub path: Option<String>,
}

impl PublishRequest {
    fn to_event(&self) -> Event {
        let mut event = Event::new(self.data.clone());
        if let Some(event_type) = &self.event {
            event = event.with_type(event_type.as_str());
        }
        if let Some(id) = &self.id {
            event = event.with_id(id.as_str());
        }
        if let Some(retry) = self.retry {
            event = event.with_retry(Duration::from_millis(retry));
        }
        if self.reset_id {
            event = event.reset_id();
        }
        event
    }
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    /// Streams still open after the event was delivered.
    pub connections: usize,
}

/// POST an event to every open stream, or to the streams on one path
pub async fn publish(
    State(app_state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> Result<impl IntoResponse, Error> {
    debug!(
        "POST Publish event {:?} (id {:?}) to {}",
        request.event,
        request.id,
        request.path.as_deref().unwrap_or("all streams")
    );

    let event = request.to_event();
    let registry = app_state.registry_ref();
    let result = match request.path.as_deref() {
        Some(path) => registry.broadcast_to(&event, |info| info.path == path).await,
        None => registry.broadcast(&event).await,
    };

    // Dead streams are pruned by the broadcast; that is not a publish failure.
    if let Err(e) = result {
        if !e.is_connection_error() {
            return Err(e.into());
        }
        warn!("Publish dropped at least one SSE connection: {e}");
    }

    Ok(Json(ApiResponse::new(
        StatusCode::OK.into(),
        PublishResponse {
            connections: registry.count(),
        },
    )))
}
