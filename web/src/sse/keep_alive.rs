use log::*;
use sse::{ConnectionRegistry, Event};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Broadcasts an empty-data event to every open stream once per `period`
/// until `cancel` fires. Keeps proxies and client idle timeouts from
/// closing quiet streams.
pub fn spawn(
    registry: Arc<ConnectionRegistry>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if registry.count() == 0 {
                        continue;
                    }
                    trace!("Sending keep-alive to {} SSE connection(s)", registry.count());
                    if let Err(e) = registry.broadcast(&Event::keep_alive()).await {
                        debug!("Keep-alive dropped a connection: {e}");
                    }
                }
            }
        }

        debug!("SSE keep-alive task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sse::{Connection, ConnectionInfo};
    use tokio::io::AsyncReadExt;

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_reaches_open_streams() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (writer, mut reader) = tokio::io::duplex(1024);
        registry.register_new(Connection::new(writer, ConnectionInfo::new("/events")));

        let cancel = CancellationToken::new();
        let task = spawn(registry.clone(), Duration::from_secs(15), cancel.clone());

        let started = Instant::now();
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();

        assert_eq!(&buf[..n], b"data\n\n");
        assert!(started.elapsed() >= Duration::from_secs(15));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_prunes_dead_streams() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (writer, reader) = tokio::io::duplex(1024);
        registry.register_new(Connection::new(writer, ConnectionInfo::new("/events")));
        drop(reader);

        let cancel = CancellationToken::new();
        let task = spawn(registry.clone(), Duration::from_secs(1), cancel.clone());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(registry.count(), 0);

        cancel.cancel();
        task.await.unwrap();
    }
}
