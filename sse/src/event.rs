use bytes::Bytes;
use std::time::Duration;

/// A single server-sent event, the unit of transfer on the wire.
///
/// `id` and `reset_id` are distinct: an absent `id` leaves the client's
/// cursor untouched while `reset_id` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    /// Event name, sent as the `event` field.
    pub event_type: Option<String>,
    /// Opaque cursor value, sent as the `id` field.
    pub id: Option<String>,
    /// Reconnection interval in milliseconds, kept as the raw field value.
    pub retry: Option<String>,
    /// Payload; every line becomes one `data` record.
    pub data: Bytes,
    /// Sends an empty `id` so the client forgets its cursor.
    pub reset_id: bool,
}

impl Event {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    /// An event with no payload, used to keep idle connections open.
    pub fn keep_alive() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self.reset_id = false;
        self
    }

    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = Some(retry.as_millis().to_string());
        self
    }

    pub fn reset_id(mut self) -> Self {
        self.id = None;
        self.reset_id = true;
        self
    }

    /// The payload as text, if it is valid UTF-8.
    pub fn data_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Parses `retry` as a number of milliseconds.
    pub fn retry_interval(&self) -> Option<Duration> {
        self.retry
            .as_deref()
            .and_then(|ms| ms.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
    }
}
