//! Reconnecting event-stream client.
//!
//! [`EventSource`] owns one subscription and drives it through
//! `Disconnected → Connecting → Streaming`, falling back to `Disconnected` on
//! recoverable errors (the next `read` reconnects) and ending in `Closed` on
//! terminal ones. Every (re)connection carries the cursor of the last
//! delivered event in `Last-Event-Id`, so the server can resume the stream.
//!
//! The client is meant for one consumer calling [`EventSource::read`] in a
//! loop. Concurrent calls are serialized rather than rejected.

pub mod observer;
pub mod timeout;
pub mod transport;

use crate::decoder::Decoder;
use crate::error::{Error, ErrorKind, Result};
use crate::event::Event;
use log::*;
use observer::Observer;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CACHE_CONTROL};
use reqwest::StatusCode;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use timeout::IdleTimeout;
use tokio::io::BufReader;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use transport::{BodyStream, HttpTransport, StreamRequest, StreamResponse, Transport};

pub const DEFAULT_RETRY: Duration = Duration::from_secs(3);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_STREAM: &str = "text/event-stream";
static LAST_EVENT_ID: HeaderName = HeaderName::from_static("last-event-id");

type StreamDecoder = Decoder<BufReader<IdleTimeout<StreamReader<BodyStream, bytes::Bytes>>>>;

/// Where an [`EventSource`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    Closed,
}

/// Everything that changes while streaming, behind one lock. The lock is
/// never held across an `.await`.
struct Shared {
    state: ConnectionState,
    last_event_id: String,
    retry: Duration,
    terminal: Option<Error>,
    /// Set after a failed attempt or a dropped stream; the next attempt waits
    /// one retry interval first.
    backoff_pending: bool,
}

pub struct EventSource {
    url: String,
    headers: HeaderMap,
    retry_override: Option<Duration>,
    idle_timeout: Duration,
    connect_timeout: Duration,
    transport: Arc<dyn Transport>,
    observers: Vec<Arc<dyn Observer>>,
    cancel: CancellationToken,
    shared: Mutex<Shared>,
    /// The live stream. Holding this lock is what makes connection attempts
    /// single-flight: whoever holds it is the only one allowed to connect.
    stream: tokio::sync::Mutex<Option<StreamDecoder>>,
}

impl EventSource {
    pub fn builder(url: impl Into<String>) -> EventSourceBuilder {
        EventSourceBuilder::new(url)
    }

    /// Shorthand for a source with default settings.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::builder(url).build()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.shared().state
    }

    /// Cursor of the last delivered event; empty if there is none.
    pub fn last_event_id(&self) -> String {
        self.shared().last_event_id.clone()
    }

    /// The interval waited before reconnecting.
    pub fn retry_interval(&self) -> Duration {
        self.retry_override.unwrap_or(self.shared().retry)
    }

    /// Establishes the stream unless one is already open.
    ///
    /// Server errors (`5xx`) are retried after the retry interval. `204`, any
    /// other non-`200` status and a wrong content type are terminal.
    pub async fn connect(&self) -> Result<()> {
        self.check_terminal()?;
        // A read may hold the stream lock for as long as the stream is quiet.
        if self.state() == ConnectionState::Streaming {
            return Ok(());
        }

        let mut slot = self.stream.lock().await;
        if slot.is_none() {
            let decoder = self.establish().await?;
            *slot = Some(decoder);
        }
        Ok(())
    }

    /// Returns the next event, connecting or reconnecting first if needed.
    ///
    /// * `InvalidEncoding`: the event was skipped, the stream is still open.
    /// * `EmptyData`: a keep-alive arrived; nothing to deliver.
    /// * `Timeout`, `ConnectionClosed`, `Io`: the stream was dropped; the next
    ///   call reconnects.
    /// * `Closed`, `UnrecoverableProtocol`: terminal, every later call fails
    ///   the same way.
    pub async fn read(&self) -> Result<Event> {
        self.check_terminal()?;
        let mut slot = self.stream.lock().await;

        if slot.is_none() {
            let decoder = self.establish().await?;
            *slot = Some(decoder);
        }
        let Some(decoder) = slot.as_mut() else {
            return Err(Error::new(ErrorKind::ConnectionClosed, "no active stream"));
        };

        let decoded = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(self.cancelled()),
            result = decoder.decode() => result,
        };

        match decoded {
            Ok(event) if event.data.is_empty() => Err(Error::new(
                ErrorKind::EmptyData,
                "event without data (keep-alive)",
            )),
            Ok(event) => {
                self.record(&event);
                Ok(event)
            }
            Err(err) if err.kind() == ErrorKind::InvalidEncoding => {
                warn!("Skipping undecodable event from {}: {err}", self.url);
                self.notify_error(&err);
                Err(err)
            }
            Err(err) if err.is_terminal() => {
                *slot = None;
                Err(err)
            }
            Err(err) => {
                *slot = None;
                let err = classify_read_error(err);
                {
                    let mut shared = self.shared();
                    shared.state = ConnectionState::Disconnected;
                    shared.backoff_pending = true;
                }
                warn!("Event stream {} dropped: {err}", self.url);
                self.notify_disconnect(&err);
                Err(err)
            }
        }
    }

    /// Stops the source for good. In-flight `connect`/`read` calls return
    /// promptly with `Closed`, and so does every later call.
    pub async fn close(&self) {
        self.latch(Error::closed());
        self.cancel.cancel();

        let mut slot = self.stream.lock().await;
        if slot.take().is_some() {
            info!("Closed event stream {}", self.url);
        }
    }

    /// Runs connection attempts until one succeeds, fails terminally, or the
    /// transport cannot be reached.
    async fn establish(&self) -> Result<StreamDecoder> {
        let wait_first = {
            let mut shared = self.shared();
            shared.state = ConnectionState::Connecting;
            std::mem::take(&mut shared.backoff_pending)
        };
        let mut attempt = AttemptGuard {
            source: self,
            backoff_owed: wait_first,
        };
        if wait_first {
            self.wait_retry().await?;
        }
        attempt.backoff_owed = false;

        loop {
            let request = self.request();
            debug!(
                "Connecting to {} (Last-Event-Id: {:?})",
                self.url,
                request.headers.get(&LAST_EVENT_ID)
            );

            let opened = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled()),
                opened = self.transport.open(&request) => opened,
            };

            let response = match opened {
                Ok(response) => response,
                Err(err) if err.is_terminal() => return Err(self.fail_terminal(err, false)),
                Err(err) => {
                    let err = if err.kind() == ErrorKind::ConnectionFailed {
                        err
                    } else {
                        Error::with_source(ErrorKind::ConnectionFailed, err)
                    };
                    warn!("Connection attempt to {} failed: {err}", self.url);
                    {
                        let mut shared = self.shared();
                        shared.state = ConnectionState::Disconnected;
                        shared.backoff_pending = true;
                    }
                    self.notify_error(&err);
                    return Err(err);
                }
            };

            let body = match self.classify(response) {
                Ok(body) => body,
                Err(err) if err.is_terminal() => {
                    let is_close = err.kind() == ErrorKind::Closed;
                    return Err(self.fail_terminal(err, is_close));
                }
                Err(err) => {
                    warn!("{err}; retrying {} in {:?}", self.url, self.retry_interval());
                    self.notify_error(&err);
                    attempt.backoff_owed = true;
                    self.wait_retry().await?;
                    attempt.backoff_owed = false;
                    continue;
                }
            };

            let reader = IdleTimeout::new(StreamReader::new(body), self.idle_timeout);
            let decoder = Decoder::new(BufReader::new(reader));

            // Re-check before committing: the source may have been closed
            // while the request was in flight.
            {
                let mut shared = self.shared();
                if let Some(err) = &shared.terminal {
                    return Err(err.duplicate());
                }
                shared.state = ConnectionState::Streaming;
            }

            info!("Connected to event stream {}", self.url);
            for observer in &self.observers {
                observer.on_connect(&self.url);
            }
            return Ok(decoder);
        }
    }

    /// Maps a response onto the protocol rules. `Ok` carries the body of a
    /// usable stream; transient failures are non-terminal errors.
    fn classify(&self, response: StreamResponse) -> Result<BodyStream> {
        let status = response.status;

        if status.is_server_error() {
            return Err(Error::new(
                ErrorKind::ConnectionFailed,
                format!("temporary server error: {status}"),
            ));
        }

        if status == StatusCode::NO_CONTENT {
            return Err(Error::new(
                ErrorKind::Closed,
                "server closed the stream (204 No Content)",
            ));
        }

        if status != StatusCode::OK {
            return Err(Error::new(
                ErrorKind::UnrecoverableProtocol,
                format!("unrecoverable HTTP status: {status}"),
            ));
        }

        if !is_event_stream(response.content_type.as_deref()) {
            return Err(Error::new(
                ErrorKind::UnrecoverableProtocol,
                format!(
                    "invalid content type: {}",
                    response.content_type.as_deref().unwrap_or("<none>")
                ),
            ));
        }

        Ok(response.body)
    }

    fn request(&self) -> StreamRequest {
        let last_event_id = self.last_event_id();

        let mut headers = self.headers.clone();
        headers.insert(ACCEPT, HeaderValue::from_static(EVENT_STREAM));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        let cursor = HeaderValue::from_str(&last_event_id).unwrap_or_else(|_| {
            warn!("Last event id {last_event_id:?} is not a valid header value, sending it empty");
            HeaderValue::from_static("")
        });
        headers.insert(LAST_EVENT_ID.clone(), cursor);

        StreamRequest {
            url: self.url.clone(),
            headers,
            connect_timeout: self.connect_timeout,
        }
    }

    /// Applies the cursor and retry fields of a delivered event.
    fn record(&self, event: &Event) {
        let mut shared = self.shared();

        if event.reset_id {
            shared.last_event_id.clear();
        } else if let Some(id) = event.id.as_deref().filter(|id| !id.is_empty()) {
            shared.last_event_id = id.to_string();
        }

        if let Some(retry) = event.retry_interval() {
            debug!("Server set retry interval to {retry:?}");
            shared.retry = retry;
        }
    }

    async fn wait_retry(&self) -> Result<()> {
        let delay = self.retry_interval();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(self.cancelled()),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn check_terminal(&self) -> Result<()> {
        match &self.shared().terminal {
            Some(err) => Err(err.duplicate()),
            None => Ok(()),
        }
    }

    /// Records `err` as the terminal error unless one is already set and
    /// returns the error that is now in effect.
    fn latch(&self, err: Error) -> Error {
        let mut shared = self.shared();
        shared.state = ConnectionState::Closed;
        match &shared.terminal {
            Some(existing) if err.kind() != ErrorKind::Closed => existing.duplicate(),
            _ => {
                let current = err.duplicate();
                shared.terminal = Some(err);
                current
            }
        }
    }

    fn fail_terminal(&self, err: Error, as_disconnect: bool) -> Error {
        error!("Giving up on event stream {}: {err}", self.url);
        let err = self.latch(err);
        if as_disconnect {
            self.notify_disconnect(&err);
        } else {
            self.notify_error(&err);
        }
        err
    }

    fn cancelled(&self) -> Error {
        let existing = self.shared().terminal.as_ref().map(Error::duplicate);
        existing.unwrap_or_else(|| self.latch(Error::new(ErrorKind::Closed, "cancelled")))
    }

    fn notify_error(&self, err: &Error) {
        for observer in &self.observers {
            observer.on_error(&self.url, err);
        }
    }

    fn notify_disconnect(&self, err: &Error) {
        for observer in &self.observers {
            observer.on_disconnect(&self.url, err);
        }
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        // The guarded data stays consistent even if an observer panicked
        // while another thread held the lock.
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Rolls the state back when an `establish` future is dropped mid-attempt,
/// e.g. by a caller-side timeout around `read`. Every completed path leaves
/// the state somewhere other than `Connecting`, which disarms it.
struct AttemptGuard<'a> {
    source: &'a EventSource,
    /// A retry wait that was started but not finished.
    backoff_owed: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        let mut shared = self.source.shared();
        if shared.state == ConnectionState::Connecting {
            shared.state = ConnectionState::Disconnected;
            shared.backoff_pending |= self.backoff_owed;
        }
    }
}

/// Checks the media type of a `Content-Type` value, ignoring parameters.
fn is_event_stream(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|ct| ct.split(';').next())
        .map(|media_type| media_type.trim().eq_ignore_ascii_case(EVENT_STREAM))
        .unwrap_or(false)
}

/// An idle-deadline expiry surfaces from the decoder as an I/O error; give it
/// its own kind.
fn classify_read_error(err: Error) -> Error {
    if err.kind() != ErrorKind::Io {
        return err;
    }

    let timed_out = err
        .source
        .as_ref()
        .and_then(|source| source.downcast_ref::<std::io::Error>())
        .map(|io_err| io_err.kind() == std::io::ErrorKind::TimedOut)
        .unwrap_or(false);

    if timed_out {
        Error {
            source: err.source,
            error_kind: ErrorKind::Timeout,
        }
    } else {
        err
    }
}

pub struct EventSourceBuilder {
    url: String,
    headers: HeaderMap,
    retry: Duration,
    retry_override: Option<Duration>,
    idle_timeout: Duration,
    connect_timeout: Duration,
    transport: Option<Arc<dyn Transport>>,
    observers: Vec<Arc<dyn Observer>>,
    cancel: Option<CancellationToken>,
}

impl EventSourceBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HeaderMap::new(),
            retry: DEFAULT_RETRY,
            retry_override: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            transport: None,
            observers: Vec::new(),
            cancel: None,
        }
    }

    /// Initial reconnection interval; the server may change it.
    pub fn retry(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    /// Fixed reconnection interval; `retry` fields from the server are
    /// ignored.
    pub fn retry_override(mut self, retry: Duration) -> Self {
        self.retry_override = Some(retry);
        self
    }

    /// Longest silence tolerated on an open stream. Zero disables it.
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Extra header sent with every connection attempt.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Starts from an existing cursor, e.g. one persisted by the caller.
    pub fn last_event_id(mut self, id: impl Into<String>) -> Self {
        if let Ok(value) = HeaderValue::from_str(&id.into()) {
            self.headers.insert(LAST_EVENT_ID.clone(), value);
        }
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Ties the source to an outer cancellation signal. Cancelling it closes
    /// the source.
    pub fn cancellation(mut self, token: &CancellationToken) -> Self {
        self.cancel = Some(token.child_token());
        self
    }

    pub fn build(mut self) -> Result<EventSource> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(self.connect_timeout)?),
        };

        let last_event_id = self
            .headers
            .remove(&LAST_EVENT_ID)
            .and_then(|value| value.to_str().ok().map(str::to_string))
            .unwrap_or_default();

        Ok(EventSource {
            url: self.url,
            headers: self.headers,
            retry_override: self.retry_override,
            idle_timeout: self.idle_timeout,
            connect_timeout: self.connect_timeout,
            transport,
            observers: self.observers,
            cancel: self.cancel.unwrap_or_default(),
            shared: Mutex::new(Shared {
                state: ConnectionState::Disconnected,
                last_event_id,
                retry: self.retry,
                terminal: None,
                backoff_pending: false,
            }),
            stream: tokio::sync::Mutex::new(None),
        })
    }
}
