//! Serializes [`Event`]s onto an [`AsyncWrite`] sink in `text/event-stream`
//! format.

use crate::error::{is_peer_gone, Error, ErrorKind, Result};
use crate::event::Event;
use bytes::{BufMut, BytesMut};
use log::*;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Type-erased sink used when encoders for different transports live side by
/// side (e.g. in the connection registry).
pub type BoxedSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Writes events to one connection.
///
/// A whole record is rendered and validated before any byte reaches the sink,
/// so an `InvalidEncoding` failure never leaves a partial record on the wire.
/// The sink is held for the duration of one write, which keeps the lines of a
/// record together; the order in which concurrent writers get through is not
/// defined, so each connection should still have a single writer.
pub struct Encoder<W> {
    sink: Mutex<W>,
    closed: AtomicBool,
}

impl<W> Encoder<W>
where
    W: AsyncWrite + Send + Unpin,
{
    pub fn new(sink: W) -> Self {
        Self {
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
        }
    }

    /// Writes one field. A value containing line breaks is emitted as one
    /// record per line.
    pub async fn write_field(&self, name: &str, value: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let mut buf = BytesMut::new();
        render_field(&mut buf, name, value)?;
        self.write(&buf, false).await
    }

    /// Writes the terminating blank line and flushes the sink.
    pub async fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.write(b"\n", true).await
    }

    /// Writes a complete event followed by a blank line, then flushes.
    pub async fn encode(&self, event: &Event) -> Result<()> {
        self.ensure_open()?;
        let buf = render_event(event)?;
        self.write(&buf, true).await
    }

    /// Writes a record group produced by [`render_event`] and flushes. Lets a
    /// fan-out render an event once for many connections.
    pub(crate) async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.write(frame, true).await
    }

    /// Sends a standalone `retry` record so the client adopts a new
    /// reconnection interval.
    pub async fn set_retry(&self, milliseconds: u64) -> Result<()> {
        self.ensure_open()?;
        let mut buf = BytesMut::new();
        render_field(&mut buf, "retry", milliseconds.to_string().as_bytes())?;
        buf.put_u8(b'\n');
        self.write(&buf, true).await
    }

    /// Marks the encoder closed and shuts the sink down. Calling it again is
    /// a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut sink = self.sink.lock().await;
        match sink.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if is_peer_gone(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::new(ErrorKind::ConnectionClosed, "encoder closed"));
        }
        Ok(())
    }

    async fn write(&self, bytes: &[u8], flush: bool) -> Result<()> {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.write_all(bytes).await {
            return Err(self.write_failed(e));
        }
        if flush {
            if let Err(e) = sink.flush().await {
                return Err(self.write_failed(e));
            }
        }
        Ok(())
    }

    fn write_failed(&self, err: io::Error) -> Error {
        if is_peer_gone(&err) {
            debug!("Peer went away while writing event: {err}");
            self.closed.store(true, Ordering::SeqCst);
            Error::with_source(ErrorKind::ConnectionClosed, err)
        } else {
            err.into()
        }
    }
}

/// Renders a full record group: fields in `id`, `retry`, `event`, `data`
/// order, then the blank terminator line.
pub fn render_event(event: &Event) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(event.data.len() + 32);

    if event.reset_id {
        buf.put_slice(b"id:\n");
    } else if let Some(id) = event.id.as_deref().filter(|id| !id.is_empty()) {
        render_field(&mut buf, "id", id.as_bytes())?;
    }

    if let Some(retry) = event.retry.as_deref().filter(|r| !r.is_empty()) {
        render_field(&mut buf, "retry", retry.as_bytes())?;
    }

    if let Some(event_type) = event.event_type.as_deref().filter(|t| !t.is_empty()) {
        render_field(&mut buf, "event", event_type.as_bytes())?;
    }

    // Always present, even when empty: an empty data record is a keep-alive.
    render_field(&mut buf, "data", &event.data)?;
    buf.put_u8(b'\n');

    Ok(buf)
}

/// Renders `name: line` records for every line of `value`.
///
/// Empty lines are dropped unless they are the first or last segment, which
/// keeps intentional leading and trailing blank payload lines.
pub fn render_field(buf: &mut BytesMut, name: &str, value: &[u8]) -> Result<()> {
    if std::str::from_utf8(value).is_err() {
        return Err(Error::invalid_encoding());
    }

    let lines: Vec<&[u8]> = value.split(|b| *b == b'\n').collect();
    let last = lines.len() - 1;

    for (i, line) in lines.into_iter().enumerate() {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() && i > 0 && i < last {
            continue;
        }

        buf.put_slice(name.as_bytes());
        if !line.is_empty() {
            buf.put_slice(b": ");
            buf.put_slice(line);
        }
        buf.put_u8(b'\n');
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    fn rendered(event: &Event) -> String {
        String::from_utf8(render_event(event).unwrap().to_vec()).unwrap()
    }

    #[test]
    fn test_render_full_event_field_order() {
        let event = Event::new("hello")
            .with_type("greeting")
            .with_id("42")
            .with_retry(Duration::from_millis(2000));

        assert_eq!(
            rendered(&event),
            "id: 42\nretry: 2000\nevent: greeting\ndata: hello\n\n"
        );
    }

    #[test]
    fn test_render_multiline_data() {
        assert_eq!(
            rendered(&Event::new("line1\nline2")),
            "data: line1\ndata: line2\n\n"
        );
    }

    #[test]
    fn test_render_reset_id_is_literal() {
        let event = Event::new("x").reset_id();
        assert_eq!(rendered(&event), "id:\ndata: x\n\n");
    }

    #[test]
    fn test_render_empty_data_is_keep_alive() {
        assert_eq!(rendered(&Event::keep_alive()), "data\n\n");
    }

    #[test]
    fn test_render_strips_carriage_returns_and_inner_blank_lines() {
        assert_eq!(
            rendered(&Event::new("a\r\n\r\nb\r")),
            "data: a\ndata: b\n\n"
        );
    }

    #[test]
    fn test_render_keeps_leading_and_trailing_blank_segments() {
        assert_eq!(
            rendered(&Event::new("\nbody\n")),
            "data\ndata: body\ndata\n\n"
        );
    }

    #[test]
    fn test_render_rejects_invalid_utf8() {
        let event = Event::new(vec![0x66, 0xff, 0x6f]);
        let err = render_event(&event).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidEncoding);
    }

    #[tokio::test]
    async fn test_encode_writes_and_flushes() {
        let encoder = Encoder::new(Vec::new());
        encoder.encode(&Event::new("one").with_id("1")).await.unwrap();
        encoder.set_retry(500).await.unwrap();

        let sink = encoder.sink.lock().await;
        assert_eq!(
            String::from_utf8(sink.clone()).unwrap(),
            "id: 1\ndata: one\n\nretry: 500\n\n"
        );
    }

    #[tokio::test]
    async fn test_write_field_then_flush() {
        let encoder = Encoder::new(Vec::new());
        encoder.write_field("event", b"ping").await.unwrap();
        encoder.flush().await.unwrap();

        let sink = encoder.sink.lock().await;
        assert_eq!(sink.as_slice(), b"event: ping\n\n");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_writes() {
        let encoder = Encoder::new(Vec::new());
        encoder.close().await.unwrap();
        encoder.close().await.unwrap();

        assert!(encoder.is_closed());
        let err = encoder.encode(&Event::new("late")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionClosed);
    }

    struct GoneSink;

    impl AsyncWrite for GoneSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_peer_gone_latches_closed() {
        let encoder = Encoder::new(GoneSink);
        let err = encoder.encode(&Event::new("x")).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConnectionClosed);
        assert!(encoder.is_closed());
    }

    #[tokio::test]
    async fn test_dropped_duplex_reader_reports_connection_closed() {
        let (writer, reader) = tokio::io::duplex(64);
        drop(reader);

        let encoder = Encoder::new(writer);
        let err = encoder.encode(&Event::new("x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionClosed);
    }
}
