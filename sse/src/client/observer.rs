use crate::error::Error;

/// Receives lifecycle notifications from an [`EventSource`](super::EventSource).
///
/// Every method has a no-op default so implementations only override what
/// they care about. Observers are informational: the values returned by
/// `read` and `connect` do not depend on them. Callbacks run on the reading
/// task and must not call back into the same source.
///
/// Every error `read` or `connect` returns is also offered here, except
/// `EmptyData`: a keep-alive is not a failure, so it is only returned to the
/// caller.
pub trait Observer: Send + Sync {
    /// A stream was established.
    fn on_connect(&self, _url: &str) {}

    /// An established stream was lost, or the server told us to stop.
    fn on_disconnect(&self, _url: &str, _err: &Error) {}

    /// A connection attempt failed or an event could not be decoded.
    fn on_error(&self, _url: &str, _err: &Error) {}
}
