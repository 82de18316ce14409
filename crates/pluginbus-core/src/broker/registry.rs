//! Connection registry: plugin name to the broker's handle on its connection.
//!
//! The registry guarantees at most one live connection per name. Registering
//! a name that is already taken evicts the previous connection and signals it
//! to close, which also clears out zombie entries left by a plugin that
//! crashed and restarted.

use crate::cancel::CancellationToken;
use crate::config::BrokerConfig;
use crate::error::{BusError, Result};
use crate::protocol::write_frame;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The broker's side of one registered plugin connection.
///
/// Reads happen in the connection's own forwarding loop; this handle owns the
/// write half so other loops can forward into it. Writes are serialized by a
/// per-connection lock so frames from different sources never interleave.
pub struct PluginConnection {
    id: u64,
    name: String,
    version: String,
    peer: String,
    writer: Mutex<BoxedWriter>,
    write_timeout: Duration,
    closed: CancellationToken,
}

impl PluginConnection {
    pub fn new<W>(
        id: u64,
        name: impl Into<String>,
        version: impl Into<String>,
        peer: impl Into<String>,
        writer: W,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id,
            name: name.into(),
            version: version.into(),
            peer: peer.into(),
            writer: Mutex::new(Box::new(writer)),
            write_timeout: BrokerConfig::WRITE_TIMEOUT,
            closed: CancellationToken::new(),
        }
    }

    /// Bound how long a single forward may block on this connection.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write one already-encoded frame body to this connection.
    ///
    /// Gives up with `ConnectionClosed` as soon as the connection is closed.
    /// A write that does not finish within the write timeout may have left a
    /// partial frame behind, so the connection is closed and `Timeout` is
    /// returned.
    pub async fn send_frame(&self, frame: &[u8]) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(BusError::ConnectionClosed);
        }

        let write = async {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, frame).await
        };

        tokio::select! {
            result = tokio::time::timeout(self.write_timeout, write) => match result {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        "Write to {} (conn {}) stalled for {:?}; closing it",
                        self.name, self.id, self.write_timeout
                    );
                    self.close();
                    Err(BusError::Timeout(self.write_timeout))
                }
            },
            _ = self.closed.cancelled() => Err(BusError::ConnectionClosed),
        }
    }

    /// Signal the connection's forwarding loop to stop.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once `close()` has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Flush and shut down the write half. Errors are ignored: the peer may
    /// already be gone.
    pub async fn shutdown_writer(&self) {
        let shutdown = async {
            let mut writer = self.writer.lock().await;
            writer.shutdown().await
        };
        match tokio::time::timeout(self.write_timeout, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Shutdown of {} (conn {}) failed: {}", self.name, self.id, e),
            Err(_) => debug!("Shutdown of {} (conn {}) timed out", self.name, self.id),
        }
    }
}

impl std::fmt::Debug for PluginConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginConnection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Snapshot of a registered plugin, for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisteredPlugin {
    pub name: String,
    pub version: String,
    pub peer: String,
    pub connection_id: u64,
}

/// Thread-safe name → connection map.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    plugins: RwLock<HashMap<String, Arc<PluginConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `connection` under its name.
    ///
    /// Any connection already registered under that name is removed and
    /// closed before the new one is installed; it is returned to the caller.
    pub fn register(&self, connection: Arc<PluginConnection>) -> Option<Arc<PluginConnection>> {
        let mut plugins = self.plugins.write().unwrap_or_else(PoisonError::into_inner);

        let evicted = plugins.remove(connection.name());
        if let Some(old) = &evicted {
            warn!(
                "Plugin {} re-registered; closing previous connection {} from {}",
                old.name(),
                old.id(),
                old.peer()
            );
            old.close();
        }

        info!(
            "Plugin registered: {} (version: {}, conn {})",
            connection.name(),
            connection.version(),
            connection.id()
        );
        plugins.insert(connection.name().to_string(), connection);

        evicted
    }

    /// Look up the live connection for `name`.
    pub fn resolve(&self, name: &str) -> Result<Arc<PluginConnection>> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| BusError::RouteNotFound {
                name: name.to_string(),
            })
    }

    /// Remove `name` only if it still maps to `connection`.
    ///
    /// Returns false when a newer registration already replaced it, in which
    /// case the newer entry is left alone.
    pub fn unregister(&self, name: &str, connection: &Arc<PluginConnection>) -> bool {
        let mut plugins = self.plugins.write().unwrap_or_else(PoisonError::into_inner);
        match plugins.get(name) {
            Some(current) if Arc::ptr_eq(current, connection) => {
                plugins.remove(name);
                true
            }
            _ => false,
        }
    }

    /// Registered plugins, sorted by name.
    pub fn list(&self) -> Vec<RegisteredPlugin> {
        let plugins = self.plugins.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<RegisteredPlugin> = plugins
            .values()
            .map(|conn| RegisteredPlugin {
                name: conn.name().to_string(),
                version: conn.version().to_string(),
                peer: conn.peer().to_string(),
                connection_id: conn.id(),
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn len(&self) -> usize {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every registered connection and empty the map.
    pub fn close_all(&self) {
        let mut plugins = self.plugins.write().unwrap_or_else(PoisonError::into_inner);
        for (_, conn) in plugins.drain() {
            conn.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::read_frame;

    fn connection(id: u64, name: &str) -> (Arc<PluginConnection>, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(4096);
        let conn = PluginConnection::new(id, name, "1.0.0", format!("test:{}", id), ours);
        (Arc::new(conn), theirs)
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = ConnectionRegistry::new();
        let (conn, _peer) = connection(1, "PingPlugin");

        assert!(registry.register(conn.clone()).is_none());

        let resolved = registry.resolve("PingPlugin").unwrap();
        assert!(Arc::ptr_eq(&resolved, &conn));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_resolve_unknown_name() {
        let registry = ConnectionRegistry::new();
        match registry.resolve("nobody") {
            Err(BusError::RouteNotFound { name }) => assert_eq!(name, "nobody"),
            other => panic!("Expected RouteNotFound, got: {:?}", other),
        }
    }

    #[test]
    fn test_reregistration_evicts_and_closes_old_connection() {
        let registry = ConnectionRegistry::new();
        let (old, _old_peer) = connection(1, "PongPlugin");
        let (new, _new_peer) = connection(2, "PongPlugin");

        registry.register(old.clone());
        let evicted = registry.register(new.clone()).expect("old entry evicted");

        assert!(Arc::ptr_eq(&evicted, &old));
        assert!(old.is_closed());
        assert!(!new.is_closed());
        assert!(Arc::ptr_eq(&registry.resolve("PongPlugin").unwrap(), &new));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_unregister_is_noop() {
        let registry = ConnectionRegistry::new();
        let (old, _old_peer) = connection(1, "PongPlugin");
        let (new, _new_peer) = connection(2, "PongPlugin");

        registry.register(old.clone());
        registry.register(new.clone());

        // The old connection's teardown fires after the replacement.
        assert!(!registry.unregister("PongPlugin", &old));
        assert!(Arc::ptr_eq(&registry.resolve("PongPlugin").unwrap(), &new));

        assert!(registry.unregister("PongPlugin", &new));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_registration_leaves_single_owner() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut conns = Vec::new();
        let mut peers = Vec::new();
        for id in 0..16 {
            let (conn, peer) = connection(id, "Contended");
            conns.push(conn);
            peers.push(peer);
        }

        let threads: Vec<_> = conns
            .iter()
            .cloned()
            .map(|conn| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry.register(conn);
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(registry.len(), 1);
        let live = registry.resolve("Contended").unwrap();
        let open: Vec<_> = conns.iter().filter(|c| !c.is_closed()).collect();
        assert_eq!(open.len(), 1);
        assert!(Arc::ptr_eq(open[0], &live));
    }

    #[test]
    fn test_list_is_sorted() {
        let registry = ConnectionRegistry::new();
        let (b, _pb) = connection(1, "B");
        let (a, _pa) = connection(2, "A");
        registry.register(b);
        registry.register(a);

        let names: Vec<_> = registry.list().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_send_frame_reaches_peer() {
        let (conn, mut peer) = connection(1, "B");
        conn.send_frame(b"{\"x\":1}").await.unwrap();

        let frame = read_frame(&mut peer, 1024).await.unwrap().unwrap();
        assert_eq!(frame, b"{\"x\":1}");
    }

    #[tokio::test]
    async fn test_send_frame_after_close_fails() {
        let (conn, _peer) = connection(1, "B");
        conn.close();
        assert!(matches!(
            conn.send_frame(b"{}").await,
            Err(BusError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_stalled_write_times_out_and_closes() {
        // The peer never reads, so the duplex buffer fills and the write parks.
        let (ours, _peer) = tokio::io::duplex(64);
        let conn = PluginConnection::new(1, "Stuck", "1.0.0", "test:1", ours)
            .with_write_timeout(Duration::from_millis(50));

        let started = std::time::Instant::now();
        let result = conn.send_frame(&[b'x'; 1024]).await;

        assert!(matches!(result, Err(BusError::Timeout(_))));
        assert!(conn.is_closed());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            conn.send_frame(b"{}").await,
            Err(BusError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_releases_blocked_writer() {
        let (ours, _peer) = tokio::io::duplex(64);
        let conn = Arc::new(
            PluginConnection::new(1, "Stuck", "1.0.0", "test:1", ours)
                .with_write_timeout(Duration::from_secs(30)),
        );

        let sender = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send_frame(&[b'x'; 1024]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.close();

        let result = tokio::time::timeout(Duration::from_secs(2), sender)
            .await
            .expect("blocked write released by close")
            .unwrap();
        assert!(matches!(result, Err(BusError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_shutdown_writer_does_not_hang_on_stalled_peer() {
        let (ours, _peer) = tokio::io::duplex(64);
        let conn = Arc::new(
            PluginConnection::new(1, "Stuck", "1.0.0", "test:1", ours)
                .with_write_timeout(Duration::from_millis(50)),
        );
        let _ = conn.send_frame(&[b'x'; 1024]).await;

        tokio::time::timeout(Duration::from_secs(2), conn.shutdown_writer())
            .await
            .expect("shutdown bounded by write timeout");
    }

    #[test]
    fn test_close_all() {
        let registry = ConnectionRegistry::new();
        let (a, _pa) = connection(1, "A");
        registry.register(a.clone());
        registry.close_all();
        assert!(registry.is_empty());
        assert!(a.is_closed());
    }
}
