use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::{Instant, Sleep};

/// Fails a read with `io::ErrorKind::TimedOut` when the inner reader stays
/// silent for longer than `timeout`.
///
/// The deadline is armed when a read starts and disarmed when it completes,
/// so time spent by the caller between reads never counts against the
/// stream. A zero timeout disables the check.
pub struct IdleTimeout<R> {
    inner: R,
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    armed: bool,
}

impl<R> IdleTimeout<R> {
    pub fn new(inner: R, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: Box::pin(tokio::time::sleep(timeout)),
            armed: false,
        }
    }
}

impl<R> AsyncRead for IdleTimeout<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.timeout.is_zero() {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        if !this.armed {
            this.deadline.as_mut().reset(Instant::now() + this.timeout);
            this.armed = true;
        }

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.armed = false;
                Poll::Ready(result)
            }
            Poll::Pending => match this.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    this.armed = false;
                    Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no data received for {:?}", this.timeout),
                    )))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
