//! HTTP surface of the event server: content negotiation, the event-stream
//! endpoint, publishing and introspection routes.

pub use service::AppState;

mod controller;
mod error;
pub mod router;
pub mod sse;

pub use error::{Error, Result};
pub use router::define_routes;
