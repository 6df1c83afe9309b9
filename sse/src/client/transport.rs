//! The byte-stream transport the reconnecting client runs on.
//!
//! The client only needs a status code, a content type and a body stream, so
//! the HTTP client is hidden behind [`Transport`]. [`HttpTransport`] is the
//! production implementation.

use crate::error::{Error, ErrorKind, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use log::*;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::StatusCode;
use std::io;
use std::time::Duration;

/// Body of a streaming response.
pub type BodyStream = BoxStream<'static, io::Result<Bytes>>;

/// One connection attempt.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub url: String,
    pub headers: HeaderMap,
    /// Upper bound for establishing the connection and receiving the
    /// response head. Does not apply to reading the body.
    pub connect_timeout: Duration,
}

pub struct StreamResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: BodyStream,
}

impl StreamResponse {
    pub fn new(status: StatusCode, content_type: Option<&str>, body: BodyStream) -> Self {
        Self {
            status,
            content_type: content_type.map(str::to_string),
            body,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends the request and returns once the response head has arrived.
    /// Failures to reach the server are reported as `ConnectionFailed`.
    async fn open(&self, request: &StreamRequest) -> Result<StreamResponse>;
}

/// `reqwest`-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        // No overall request timeout: the body of an event stream is open
        // ended. Silence on the stream is handled by the idle timeout.
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(format!("sse/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, request: &StreamRequest) -> Result<StreamResponse> {
        debug!("Opening event stream {}", request.url);

        let send = self
            .client
            .get(&request.url)
            .headers(request.headers.clone())
            .send();

        let response = match tokio::time::timeout(request.connect_timeout, send).await {
            Ok(Ok(response)) => response,
            // A malformed URL or header never gets better on retry.
            Ok(Err(e)) if e.is_builder() => return Err(e.into()),
            Ok(Err(e)) => return Err(Error::with_source(ErrorKind::ConnectionFailed, e)),
            Err(_) => {
                return Err(Error::new(
                    ErrorKind::ConnectionFailed,
                    format!(
                        "no response from {} within {:?}",
                        request.url, request.connect_timeout
                    ),
                ))
            }
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes_stream().map_err(io::Error::other).boxed();

        Ok(StreamResponse {
            status,
            content_type,
            body,
        })
    }
}
