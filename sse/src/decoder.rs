//! Parses a `text/event-stream` byte stream back into [`Event`]s.

use crate::error::{Error, ErrorKind, Result};
use crate::event::Event;
use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Reads one record group at a time from `reader`.
///
/// Partially read lines and fields survive a dropped `decode` future, so a
/// `decode` raced in `tokio::select!` can simply be called again.
pub struct Decoder<R> {
    reader: R,
    line: Vec<u8>,
    pending: PendingEvent,
}

#[derive(Default)]
struct PendingEvent {
    event_type: Option<Vec<u8>>,
    id: Option<Vec<u8>>,
    retry: Option<Vec<u8>>,
    data: Option<Vec<u8>>,
    reset_id: bool,
}

impl<R> Decoder<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::new(),
            pending: PendingEvent::default(),
        }
    }

    /// Returns the next event, i.e. everything up to the next blank line.
    ///
    /// A record with a field that is not valid UTF-8 fails with
    /// `InvalidEncoding` after it has been consumed entirely; the following
    /// call starts at the next record. Read errors are passed through as
    /// `Io` and the end of the stream is `ConnectionClosed`.
    pub async fn decode(&mut self) -> Result<Event> {
        loop {
            let read = self.reader.read_until(b'\n', &mut self.line).await?;
            if read == 0 || self.line.last() != Some(&b'\n') {
                // EOF, possibly in the middle of a line: the record is lost.
                self.line.clear();
                self.pending = PendingEvent::default();
                return Err(Error::new(ErrorKind::ConnectionClosed, "stream ended"));
            }

            let line = std::mem::take(&mut self.line);
            let line = strip_eol(&line);

            if line.is_empty() {
                return std::mem::take(&mut self.pending).finish();
            }

            self.pending.apply(line);
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl PendingEvent {
    fn apply(&mut self, line: &[u8]) {
        if line[0] == b':' {
            return;
        }

        let (name, value) = match line.iter().position(|b| *b == b':') {
            Some(colon) => {
                let value = &line[colon + 1..];
                (&line[..colon], value.strip_prefix(b" ").unwrap_or(value))
            }
            None => (line, &[][..]),
        };

        match name {
            b"data" => match self.data.as_mut() {
                Some(data) => {
                    data.push(b'\n');
                    data.extend_from_slice(value);
                }
                None => self.data = Some(value.to_vec()),
            },
            b"id" if value.is_empty() => {
                self.id = None;
                self.reset_id = true;
            }
            b"id" => {
                self.id = Some(value.to_vec());
                self.reset_id = false;
            }
            b"event" => self.event_type = Some(value.to_vec()),
            b"retry" => self.retry = Some(value.to_vec()),
            _ => {}
        }
    }

    fn finish(self) -> Result<Event> {
        let data = self.data.unwrap_or_default();
        if std::str::from_utf8(&data).is_err() {
            return Err(Error::invalid_encoding());
        }

        Ok(Event {
            event_type: into_string(self.event_type)?,
            id: into_string(self.id)?,
            retry: into_string(self.retry)?,
            data: Bytes::from(data),
            reset_id: self.reset_id,
        })
    }
}

fn into_string(value: Option<Vec<u8>>) -> Result<Option<String>> {
    value
        .map(|v| String::from_utf8(v).map_err(|_| Error::invalid_encoding()))
        .transpose()
}

fn strip_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
