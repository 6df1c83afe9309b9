use axum::http::header::{ACCEPT, CACHE_CONTROL, VARY};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

pub const EVENT_STREAM: &str = "text/event-stream";

/// Media ranges under which an event stream is an acceptable response.
const ACCEPTABLE: &[&str] = &[EVENT_STREAM, "text/*", "*/*"];

/// Whether the request's `Accept` header allows a `text/event-stream`
/// response. A missing header accepts anything. Media range parameters
/// (including `q`) are ignored.
pub fn accepts_event_stream(headers: &HeaderMap) -> bool {
    let mut values = headers.get_all(ACCEPT).iter().peekable();
    if values.peek().is_none() {
        return true;
    }

    values
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|range| range.split(';').next().unwrap_or_default().trim())
        .any(|range| {
            ACCEPTABLE
                .iter()
                .any(|acceptable| range.eq_ignore_ascii_case(acceptable))
        })
}

/// Headers every event-stream endpoint response carries, whether the stream
/// was accepted or not.
pub fn apply_stream_headers(headers: &mut HeaderMap) {
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(VARY, HeaderValue::from_static("Accept"));
}

pub fn not_acceptable() -> Response {
    let mut response = (StatusCode::NOT_ACCEPTABLE, "NOT ACCEPTABLE").into_response();
    apply_stream_headers(response.headers_mut());
    response
}
