use anyhow::Result;
use colored::*;
use log::*;
use serde_json::Value;
use sse::{Error, ErrorKind, Event, EventSource, Observer};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How to open the stream; mirrors the command line flags.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub url: String,
    pub retry: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub last_event_id: Option<String>,
}

/// What one read from the stream produced.
#[derive(Debug)]
pub enum Received {
    Event(Event),
    KeepAlive,
    /// The stream was interrupted; the next read reconnects.
    Interrupted(Error),
    /// The source is closed for good.
    Finished(Error),
}

/// Prints connection lifecycle notifications as they happen.
pub struct ConsoleObserver {
    label: String,
}

impl ConsoleObserver {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl Observer for ConsoleObserver {
    fn on_connect(&self, url: &str) {
        println!("{} {} connected to {}", "✓".green(), self.label, url);
    }

    fn on_disconnect(&self, url: &str, err: &Error) {
        println!(
            "{} {} disconnected from {}: {}",
            "✗".yellow(),
            self.label,
            url,
            err
        );
    }

    fn on_error(&self, url: &str, err: &Error) {
        println!("{} {} error on {}: {}", "!".red(), self.label, url, err);
    }
}

pub struct Connection {
    pub label: String,
    source: EventSource,
}

impl Connection {
    pub fn establish(options: &Options, label: String, cancel: &CancellationToken) -> Result<Self> {
        let mut builder = EventSource::builder(options.url.as_str())
            .observer(Arc::new(ConsoleObserver::new(label.clone())))
            .cancellation(cancel);

        if let Some(retry) = options.retry {
            builder = builder.retry_override(retry);
        }
        if let Some(idle_timeout) = options.idle_timeout {
            builder = builder.idle_timeout(idle_timeout);
        }
        if let Some(last_event_id) = &options.last_event_id {
            builder = builder.last_event_id(last_event_id.as_str());
        }

        Ok(Self {
            label,
            source: builder.build()?,
        })
    }

    pub async fn next(&self) -> Received {
        match self.source.read().await {
            Ok(event) => Received::Event(event),
            Err(e) if e.kind() == ErrorKind::EmptyData => Received::KeepAlive,
            Err(e) if e.is_terminal() => Received::Finished(e),
            Err(e) => {
                debug!("{} stream interrupted: {}", self.label, e);
                Received::Interrupted(e)
            }
        }
    }

    /// Reads until an event of `event_type` arrives. Interruptions are
    /// reconnected through; a closed source or the deadline ends the wait.
    pub async fn wait_for_event(&self, event_type: &str, timeout: Duration) -> Result<Event> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                anyhow::bail!("Timeout waiting for event: {}", event_type);
            }

            match tokio::time::timeout(remaining, self.next()).await {
                Ok(Received::Event(event)) if event_type_of(&event) == event_type => {
                    return Ok(event);
                }
                Ok(Received::Event(_) | Received::KeepAlive | Received::Interrupted(_)) => {
                    // Wrong event type or a reconnect, keep waiting
                    continue;
                }
                Ok(Received::Finished(e)) => {
                    anyhow::bail!("SSE connection closed: {}", e);
                }
                Err(_) => {
                    anyhow::bail!("Timeout waiting for event: {}", event_type);
                }
            }
        }
    }

    pub fn last_event_id(&self) -> String {
        self.source.last_event_id()
    }

    pub async fn close(&self) {
        self.source.close().await;
    }
}

/// Events without an explicit type are dispatched as `message`.
pub fn event_type_of(event: &Event) -> &str {
    event.event_type.as_deref().unwrap_or("message")
}

/// One-line summary plus the payload, pretty-printed when it is JSON.
pub fn format_event(event: &Event) -> String {
    let mut header = format!("[{}]", event_type_of(event));
    if let Some(id) = &event.id {
        header.push_str(&format!(" id={id}"));
    }
    if event.reset_id {
        header.push_str(" id reset");
    }
    if let Some(retry) = event.retry_interval() {
        header.push_str(&format!(" retry={}ms", retry.as_millis()));
    }

    let payload = match event.data_str() {
        Some(text) => match serde_json::from_str::<Value>(text) {
            Ok(json @ (Value::Object(_) | Value::Array(_))) => {
                serde_json::to_string_pretty(&json).unwrap_or_else(|_| text.to_owned())
            }
            _ => text.to_owned(),
        },
        None => String::from_utf8_lossy(&event.data).into_owned(),
    };

    format!("{header}\n{payload}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_plain_event() {
        let event = Event::new("hello").with_id("3");
        assert_eq!(format_event(&event), "[message] id=3\nhello");
    }

    #[test]
    fn test_format_json_event_is_pretty_printed() {
        let event = Event::new(r#"{"a":1}"#)
            .with_type("update")
            .with_retry(Duration::from_millis(1500));
        assert_eq!(
            format_event(&event),
            "[update] retry=1500ms\n{\n  \"a\": 1\n}"
        );
    }

    #[test]
    fn test_format_reset_event() {
        let event = Event::new("x").reset_id();
        assert_eq!(format_event(&event), "[message] id reset\nx");
    }

    #[tokio::test]
    async fn test_wait_for_event_skips_other_types() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/events")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body("data\n\nevent: noise\ndata: skip\n\nid: 9\nevent: greeting\ndata: hi\n\n")
            .create_async()
            .await;

        let options = Options {
            url: format!("{}/events", server.url()),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let connection = Connection::establish(&options, "test".to_string(), &cancel).unwrap();

        let event = connection
            .wait_for_event("greeting", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(event.data_str(), Some("hi"));
        assert_eq!(connection.last_event_id(), "9");
        connection.close().await;
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_wait_for_event_reports_permanent_close() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/events")
            .with_status(204)
            .create_async()
            .await;

        let options = Options {
            url: format!("{}/events", server.url()),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let connection = Connection::establish(&options, "test".to_string(), &cancel).unwrap();

        let err = connection
            .wait_for_event("greeting", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("SSE connection closed"));
    }
}
