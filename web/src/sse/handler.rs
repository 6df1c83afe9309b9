use crate::sse::negotiate::{self, EVENT_STREAM};
use crate::{AppState, Error};
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, Uri};
use axum::response::{IntoResponse, Response};
use futures_util::Stream;
use log::*;
use sse::{Connection, ConnectionInfo};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::DuplexStream;
use tokio_util::io::ReaderStream;
use tokio_util::sync::{CancellationToken, DropGuard};

static LAST_EVENT_ID: &str = "last-event-id";

/// Opens a long-lived event stream for the caller and registers it so that
/// broadcasts reach it. The stream stays registered until the client goes
/// away or the registry closes it.
pub(crate) async fn event_stream(
    State(app_state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, Error> {
    if !negotiate::accepts_event_stream(&headers) {
        debug!("Rejecting SSE request for {}: not acceptable", uri.path());
        return Ok(negotiate::not_acceptable());
    }

    let last_event_id = headers
        .get(LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let cancel = CancellationToken::new();
    let mut info = ConnectionInfo::new(uri.path())
        .with_last_event_id(last_event_id)
        .with_cancel(cancel.clone());
    if let Some(ConnectInfo(remote_addr)) = connect_info {
        info = info.with_remote_addr(remote_addr);
    }

    let (writer, reader) = tokio::io::duplex(app_state.config.event_buffer_bytes());
    let connection = Connection::new(writer, info);

    // Sent before registering so it precedes any broadcast on this stream.
    if let Some(retry_ms) = app_state.config.client_retry_ms() {
        connection.encoder.set_retry(retry_ms).await?;
    }

    let encoder = connection.encoder.clone();
    let registry = app_state.registry.clone();
    let connection_id = registry.register_new(connection);
    debug!(
        "Established SSE connection {} for {} (last event id: {:?})",
        connection_id,
        uri.path(),
        last_event_id
    );

    // Dropping the response body (client gone, or the stream ended) cancels
    // the token, which triggers the cleanup below.
    let body = Body::from_stream(GuardedStream {
        inner: ReaderStream::new(reader),
        _guard: cancel.clone().drop_guard(),
    });

    tokio::spawn(async move {
        cancel.cancelled().await;
        debug!("SSE connection {} closed, cleaning up", connection_id);
        registry.unregister(&connection_id);
        if let Err(e) = encoder.close().await {
            debug!("Error closing SSE connection {}: {}", connection_id, e);
        }
    });

    let mut response = body.into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(EVENT_STREAM));
    negotiate::apply_stream_headers(response.headers_mut());
    Ok(response)
}

/// Response body stream that cancels its connection's token when dropped.
struct GuardedStream {
    inner: ReaderStream<DuplexStream>,
    _guard: DropGuard,
}

impl Stream for GuardedStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
