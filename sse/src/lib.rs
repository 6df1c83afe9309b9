//! Server-Sent Events (SSE) protocol support for both ends of a stream.
//!
//! The crate speaks the `text/event-stream` wire format and provides the
//! pieces a server and a client need around it.
//!
//! # Architecture
//!
//! - **Codec**: [`Encoder`] renders events onto any `AsyncWrite`; [`Decoder`]
//!   parses them back from any `AsyncBufRead`. A record group is rendered in
//!   full before it is written, so invalid payloads never reach the wire.
//! - **Server registry**: [`ConnectionRegistry`] tracks live output streams by
//!   [`ConnectionId`] and fans events out to all (or a filtered subset) of
//!   them. Connections whose writes fail are pruned during the broadcast.
//! - **Client**: [`EventSource`] keeps a logical subscription alive across
//!   reconnects, resuming from the last seen event id and honoring the
//!   server's `retry` hints. HTTP is behind the [`Transport`] trait.
//!
//! # Wire format
//!
//! ```text
//! id: 42
//! retry: 2000
//! event: greeting
//! data: first line
//! data: second line
//!
//! ```
//!
//! An empty `data` record (`data\n\n`) is a keep-alive and is reported to
//! client callers as [`ErrorKind::EmptyData`]. A bare `id:` line resets the
//! client's resume cursor.
//!
//! # Example: Reading a stream
//!
//! ```rust,ignore
//! use sse::EventSource;
//!
//! let source = EventSource::builder("http://localhost:4000/events")
//!     .last_event_id("41")
//!     .build()?;
//!
//! loop {
//!     match source.read().await {
//!         Ok(event) => println!("{:?}", event.data_str()),
//!         Err(e) if e.kind() == sse::ErrorKind::EmptyData => continue,
//!         Err(e) if e.is_terminal() => break,
//!         Err(e) => log::warn!("stream interrupted: {e}"),
//!     }
//! }
//! ```
//!
//! # Modules
//!
//! - `client`: reconnecting [`EventSource`], its observer hooks and HTTP transport
//! - `connection`: [`ConnectionRegistry`] and type-safe [`ConnectionId`]
//! - `decoder` / `encoder`: the wire codec
//! - `error`: crate error type with [`ErrorKind`] classification
//! - `event`: the [`Event`] value shared by both ends

pub mod client;
pub mod connection;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod event;

pub use client::observer::Observer;
pub use client::transport::{HttpTransport, Transport};
pub use client::{ConnectionState, EventSource, EventSourceBuilder};
pub use connection::{
    Connection, ConnectionId, ConnectionInfo, ConnectionObserver, ConnectionRegistry,
};
pub use decoder::Decoder;
pub use encoder::Encoder;
pub use error::{Error, ErrorKind, Result};
pub use event::Event;
