use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use log::*;
use serde::Serialize;

use crate::controller::ApiResponse;
use crate::AppState;

/// Public view of one open event stream.
#[derive(Debug, Serialize)]
pub struct ConnectionSummary {
    pub id: String,
    pub remote_addr: Option<String>,
    pub path: String,
    pub last_event_id: String,
}

/// GET all currently open event streams
pub async fn index(State(app_state): State<AppState>) -> impl IntoResponse {
    let connections: Vec<ConnectionSummary> = app_state
        .registry_ref()
        .list()
        .into_iter()
        .map(|(id, info)| ConnectionSummary {
            id: id.to_string(),
            remote_addr: info.remote_addr.map(|addr| addr.to_string()),
            path: info.path.clone(),
            last_event_id: info.last_event_id.clone(),
        })
        .collect();

    debug!("GET {} open SSE connection(s)", connections.len());

    Json(ApiResponse::new(StatusCode::OK.into(), connections))
}
