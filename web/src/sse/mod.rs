//! SSE HTTP handler for the web layer.
//!
//! This module contains the Axum glue that turns an HTTP request into a
//! registered event stream. The wire codec and the `ConnectionRegistry` live
//! in the `sse` crate.

pub mod handler;
pub mod keep_alive;
pub mod negotiate;
