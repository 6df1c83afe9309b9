use crate::encoder::{render_event, BoxedSink, Encoder};
use crate::error::Result;
use crate::event::Event;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use log::*;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

/// Encoder shared between a connection's writer and the registry.
pub type SharedEncoder = Arc<Encoder<BoxedSink>>;

/// Unique identifier for a connection (server-generated)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request metadata captured when a stream is accepted.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub remote_addr: Option<SocketAddr>,
    pub path: String,
    /// `Last-Event-Id` sent by the client; empty on a fresh subscription.
    pub last_event_id: String,
    /// Cancelled when the hosting request goes away.
    pub cancel: CancellationToken,
}

impl ConnectionInfo {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_remote_addr(mut self, remote_addr: SocketAddr) -> Self {
        self.remote_addr = Some(remote_addr);
        self
    }

    pub fn with_last_event_id(mut self, last_event_id: impl Into<String>) -> Self {
        self.last_event_id = last_event_id.into();
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A live output stream and what we know about the request behind it.
#[derive(Clone)]
pub struct Connection {
    pub encoder: SharedEncoder,
    pub info: Arc<ConnectionInfo>,
}

impl Connection {
    pub fn new<W>(sink: W, info: ConnectionInfo) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            encoder: Arc::new(Encoder::new(Box::new(sink) as BoxedSink)),
            info: Arc::new(info),
        }
    }
}

/// Notified when connections enter or leave a [`ConnectionRegistry`].
///
/// Callbacks run after the registry has released the entry, so they may call
/// back into the registry.
pub trait ConnectionObserver: Send + Sync {
    fn on_connect(&self, _id: &ConnectionId, _info: &ConnectionInfo) {}
    fn on_disconnect(&self, _id: &ConnectionId, _info: &ConnectionInfo) {}
}

/// Registry of live event-stream connections.
///
/// The map is only ever touched for as long as it takes to insert, remove or
/// copy out handles; writes to connections happen after the snapshot is
/// taken, so a slow client never blocks registration or other broadcasts.
/// The registry does not serialize writers of one connection: whoever owns a
/// connection's writer must not race it against broadcasts.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Connection>,
    observers: RwLock<Vec<Arc<dyn ConnectionObserver>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observer);
    }

    /// Register a connection under `id`. Registering an id that is already
    /// present changes nothing and returns `false`.
    pub fn register(&self, id: ConnectionId, connection: Connection) -> bool {
        let info = connection.info.clone();
        let inserted = match self.connections.entry(id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(connection);
                true
            }
        };

        if inserted {
            info!(
                "Registered SSE connection {} for {} ({} active)",
                id,
                info.path,
                self.connections.len()
            );
            for observer in self.observers() {
                observer.on_connect(&id, &info);
            }
        }
        inserted
    }

    /// Register a connection under a freshly generated id.
    pub fn register_new(&self, connection: Connection) -> ConnectionId {
        let id = ConnectionId::new();
        self.register(id.clone(), connection);
        id
    }

    /// Remove a connection. Unknown ids are ignored; observers only hear
    /// about connections that were actually present.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Connection> {
        let (_, connection) = self.connections.remove(id)?;

        info!("Unregistered SSE connection {}", id);
        for observer in self.observers() {
            observer.on_disconnect(id, &connection.info);
        }
        Some(connection)
    }

    /// Send `event` to every connection registered at the time of the call.
    ///
    /// Connections whose write fails are unregistered. If any of them failed
    /// because the peer was gone, the last such error is returned; earlier
    /// ones are only logged. An event that cannot be encoded is rejected up
    /// front and no connection is touched.
    pub async fn broadcast(&self, event: &Event) -> Result<()> {
        let targets = self.snapshot(|_| true);
        self.deliver(event, targets).await
    }

    /// Like [`broadcast`](Self::broadcast), restricted to connections whose
    /// info satisfies `predicate`. The predicate runs while the registry is
    /// being iterated and must not call back into it.
    pub async fn broadcast_to<F>(&self, event: &Event, predicate: F) -> Result<()>
    where
        F: Fn(&ConnectionInfo) -> bool,
    {
        let targets = self.snapshot(predicate);
        self.deliver(event, targets).await
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn list(&self) -> Vec<(ConnectionId, Arc<ConnectionInfo>)> {
        self.connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().info.clone()))
            .collect()
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Connection> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Remove every connection and close its encoder.
    ///
    /// Each entry is taken out under its shard lock in a single pass, so no
    /// connection present when the call starts survives it. A connection
    /// registered into a shard that was already swept is kept.
    pub async fn close_all(&self) {
        let mut drained: Vec<(ConnectionId, Connection)> = Vec::new();
        self.connections.retain(|id, connection| {
            drained.push((id.clone(), connection.clone()));
            false
        });

        info!("Closing {} SSE connection(s)", drained.len());
        join_all(drained.iter().map(|(id, connection)| async move {
            if let Err(e) = connection.encoder.close().await {
                debug!("Error closing SSE connection {}: {}", id, e);
            }
        }))
        .await;

        let observers = self.observers();
        for (id, connection) in &drained {
            for observer in &observers {
                observer.on_disconnect(id, &connection.info);
            }
        }
    }

    fn snapshot<F>(&self, predicate: F) -> Vec<(ConnectionId, SharedEncoder)>
    where
        F: Fn(&ConnectionInfo) -> bool,
    {
        self.connections
            .iter()
            .filter(|entry| predicate(&entry.value().info))
            .map(|entry| (entry.key().clone(), entry.value().encoder.clone()))
            .collect()
    }

    async fn deliver(
        &self,
        event: &Event,
        targets: Vec<(ConnectionId, SharedEncoder)>,
    ) -> Result<()> {
        let frame = render_event(event)?;

        let results = join_all(targets.into_iter().map(|(id, encoder)| {
            let frame = &frame;
            async move { (id, encoder.write_frame(frame).await) }
        }))
        .await;

        let mut last_error = None;
        for (id, result) in results {
            if let Err(e) = result {
                warn!(
                    "Failed to send event to connection {}: {}. Connection will be removed.",
                    id, e
                );
                self.unregister(&id);
                if e.is_connection_error() {
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn observers(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        self.observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, DuplexStream};

    #[derive(Default)]
    struct CountingObserver {
        connects: AtomicUsize,
        disconnects: AtomicUsize,
    }

    impl ConnectionObserver for CountingObserver {
        fn on_connect(&self, _id: &ConnectionId, _info: &ConnectionInfo) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn on_disconnect(&self, _id: &ConnectionId, _info: &ConnectionInfo) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn connection(path: &str) -> (Connection, DuplexStream) {
        let (writer, reader) = tokio::io::duplex(4096);
        (Connection::new(writer, ConnectionInfo::new(path)), reader)
    }

    async fn read_frame(reader: &mut DuplexStream) -> String {
        let mut buf = vec![0u8; 4096];
        let n = reader.read(&mut buf).await.unwrap();
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_connection() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_rx) = connection("/events");
        let (second, mut second_rx) = connection("/events");
        registry.register_new(first);
        registry.register_new(second);

        registry
            .broadcast(&Event::new("hello").with_id("1"))
            .await
            .unwrap();

        assert_eq!(read_frame(&mut first_rx).await, "id: 1\ndata: hello\n\n");
        assert_eq!(read_frame(&mut second_rx).await, "id: 1\ndata: hello\n\n");
    }

    #[tokio::test]
    async fn test_failed_connection_is_pruned() {
        let registry = ConnectionRegistry::new();
        let (alive, mut alive_rx) = connection("/events");
        let (gone, gone_rx) = connection("/events");
        registry.register_new(alive);
        let gone_id = registry.register_new(gone);
        drop(gone_rx);

        let err = registry.broadcast(&Event::new("x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionClosed);

        assert_eq!(registry.count(), 1);
        assert!(registry.list().iter().all(|(id, _)| *id != gone_id));
        assert!(registry.get(&gone_id).is_none());
        assert_eq!(read_frame(&mut alive_rx).await, "data: x\n\n");
    }

    #[tokio::test]
    async fn test_broadcast_to_filters_on_info() {
        let registry = ConnectionRegistry::new();
        let (news, mut news_rx) = connection("/events/news");
        let (sports, mut sports_rx) = connection("/events/sports");
        registry.register_new(news);
        registry.register_new(sports);

        registry
            .broadcast_to(&Event::new("goal"), |info| info.path == "/events/sports")
            .await
            .unwrap();
        registry.broadcast(&Event::new("all")).await.unwrap();

        assert_eq!(read_frame(&mut sports_rx).await, "data: goal\n\ndata: all\n\n");
        assert_eq!(read_frame(&mut news_rx).await, "data: all\n\n");
    }

    #[tokio::test]
    async fn test_invalid_event_leaves_connections_alone() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = connection("/events");
        registry.register_new(conn);

        let err = registry
            .broadcast(&Event::new(vec![0xff]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidEncoding);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_register_and_unregister_are_idempotent() {
        let registry = ConnectionRegistry::new();
        let observer = Arc::new(CountingObserver::default());
        registry.add_observer(observer.clone());

        let (conn, _rx) = connection("/events");
        let id = ConnectionId::new();
        assert!(registry.register(id.clone(), conn.clone()));
        assert!(!registry.register(id.clone(), conn));
        assert_eq!(registry.count(), 1);
        assert_eq!(observer.connects.load(Ordering::SeqCst), 1);

        assert!(registry.unregister(&id).is_some());
        assert!(registry.unregister(&id).is_none());
        assert!(registry.unregister(&ConnectionId::new()).is_none());
        assert_eq!(registry.count(), 0);
        assert_eq!(observer.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pruned_connection_fires_disconnect_once() {
        let registry = ConnectionRegistry::new();
        let observer = Arc::new(CountingObserver::default());
        registry.add_observer(observer.clone());

        let (gone, gone_rx) = connection("/events");
        let id = registry.register_new(gone);
        drop(gone_rx);

        let _ = registry.broadcast(&Event::new("x")).await;
        registry.unregister(&id);
        assert_eq!(observer.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_all_closes_encoders_and_empties_registry() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_rx) = connection("/events");
        let (second, _second_rx) = connection("/events");
        let first_encoder = first.encoder.clone();
        registry.register_new(first);
        registry.register_new(second);

        registry.close_all().await;

        assert_eq!(registry.count(), 0);
        assert!(first_encoder.is_closed());
        let mut buf = [0u8; 8];
        assert_eq!(first_rx.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_all_notifies_each_drained_connection_once() {
        let registry = ConnectionRegistry::new();
        let observer = Arc::new(CountingObserver::default());
        registry.add_observer(observer.clone());

        let mut readers = Vec::new();
        for _ in 0..5 {
            let (conn, rx) = connection("/events");
            registry.register_new(conn);
            readers.push(rx);
        }

        registry.close_all().await;
        registry.close_all().await;

        assert_eq!(registry.count(), 0);
        assert_eq!(observer.disconnects.load(Ordering::SeqCst), 5);

        let (late, _late_rx) = connection("/events");
        let late_id = registry.register_new(late);
        assert!(registry.get(&late_id).is_some());
    }

    #[test]
    fn test_observer_may_reenter_registry() {
        struct Reentrant(Arc<ConnectionRegistry>);

        impl ConnectionObserver for Reentrant {
            fn on_connect(&self, _id: &ConnectionId, _info: &ConnectionInfo) {
                assert_eq!(self.0.count(), 1);
            }
        }

        let registry = Arc::new(ConnectionRegistry::new());
        registry.add_observer(Arc::new(Reentrant(registry.clone())));
        let (conn, _rx) = connection("/events");
        registry.register_new(conn);
    }
}
