//! TCP broker server.
//!
//! Accepts plugin connections, reads one registration record from each, and
//! then forwards every envelope the plugin sends to the connection registered
//! under the envelope's `to` name.
//!
//! # Thread Safety
//!
//! Each connection is handled in its own spawned task. The registry is shared
//! via `Arc` and guarded by a single lock; writes to a destination connection
//! are serialized by that connection's own write lock.

use super::registry::{ConnectionRegistry, PluginConnection};
use crate::config::BrokerSettings;
use crate::error::{BusError, Result};
use crate::protocol::{read_frame, read_message, Envelope, Registration};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handle to a running broker. Dropping it shuts the broker down.
pub struct BrokerHandle {
    pub addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl BrokerHandle {
    /// Get the address the broker is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The broker's connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Shut down the broker.
    ///
    /// Stops accepting new connections and signals every connection loop to
    /// close.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
        self.registry.close_all();
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

struct BrokerState {
    registry: Arc<ConnectionRegistry>,
    settings: BrokerSettings,
    next_connection_id: AtomicU64,
    active_connections: AtomicUsize,
}

/// Broker server that accepts plugin connections.
pub struct BrokerServer;

impl BrokerServer {
    /// Bind the listening address and start accepting plugins.
    ///
    /// Failing to bind is the only error that stops the broker; everything
    /// after this point is contained to individual connections.
    pub async fn start(settings: BrokerSettings) -> Result<BrokerHandle> {
        let listener = TcpListener::bind(&settings.bind_addr).await?;
        let addr = listener.local_addr()?;

        info!("Master listening on {}", addr);

        let registry = Arc::new(ConnectionRegistry::new());
        let state = Arc::new(BrokerState {
            registry: registry.clone(),
            settings,
            next_connection_id: AtomicU64::new(1),
            active_connections: AtomicUsize::new(0),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            state,
            shutdown_rx,
            conn_shutdown_rx,
        ));

        Ok(BrokerHandle {
            addr,
            registry,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        state: Arc<BrokerState>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Master shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = state.active_connections.load(Ordering::Relaxed);
                            if current >= state.settings.max_connections {
                                warn!(
                                    "Rejecting connection from {}: at max capacity ({})",
                                    peer_addr,
                                    state.settings.max_connections
                                );
                                continue;
                            }

                            state.active_connections.fetch_add(1, Ordering::Relaxed);
                            let state = state.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("Connection from {}", peer_addr);
                                if let Err(e) =
                                    Self::handle_connection(stream, peer_addr, &state, &mut conn_shutdown).await
                                {
                                    warn!("Connection {} ended: {}", peer_addr, e);
                                }
                                state.active_connections.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        state: &BrokerState,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, writer) = stream.into_split();

        let registration = Self::read_registration(&mut reader, state).await?;

        let id = state.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(
            PluginConnection::new(
                id,
                registration.name,
                registration.version,
                peer_addr.to_string(),
                writer,
            )
            .with_write_timeout(state.settings.write_timeout),
        );
        state.registry.register(conn.clone());

        let result = Self::forward_loop(&mut reader, &conn, state, shutdown_rx).await;

        state.registry.unregister(conn.name(), &conn);
        conn.close();
        conn.shutdown_writer().await;
        info!("Plugin disconnected: {} (conn {})", conn.name(), conn.id());

        result
    }

    async fn read_registration<R: AsyncRead + Unpin>(
        reader: &mut R,
        state: &BrokerState,
    ) -> Result<Registration> {
        let read = read_message::<Registration, _>(reader, state.settings.max_message_size);
        let registration = match tokio::time::timeout(state.settings.registration_timeout, read).await
        {
            Err(_) => {
                return Err(BusError::Registration {
                    message: format!(
                        "no registration record within {:?}",
                        state.settings.registration_timeout
                    ),
                })
            }
            Ok(Ok(Some(registration))) => registration,
            Ok(Ok(None)) => {
                return Err(BusError::Registration {
                    message: "connection closed before registration".to_string(),
                })
            }
            Ok(Err(e)) => {
                return Err(BusError::Registration {
                    message: format!("failed to decode register message: {}", e),
                })
            }
        };

        if registration.name.trim().is_empty() {
            return Err(BusError::Registration {
                message: "plugin name must not be empty".to_string(),
            });
        }

        Ok(registration)
    }

    /// Decode envelopes from one plugin, in order, and forward each of them.
    ///
    /// Returns `Ok` on clean EOF, eviction or broker shutdown; decode and read
    /// failures are returned as errors. Either way the connection is done.
    async fn forward_loop<R: AsyncRead + Unpin>(
        reader: &mut R,
        conn: &PluginConnection,
        state: &BrokerState,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            let frame = tokio::select! {
                result = read_frame(reader, state.settings.max_message_size) => {
                    match result? {
                        Some(f) => f,
                        None => return Ok(()),
                    }
                }
                _ = conn.closed() => {
                    debug!("Connection {} for {} closed by registry", conn.id(), conn.name());
                    return Ok(());
                }
                _ = shutdown_rx.changed() => {
                    return Ok(());
                }
            };

            let envelope: Envelope = serde_json::from_slice(&frame).map_err(|e| BusError::Json {
                message: format!("Failed to decode message from {}: {}", conn.name(), e),
                source: Some(e),
            })?;

            Self::forward(&state.registry, &envelope, &frame).await;
        }
    }

    /// Forward the original frame bytes to the envelope's destination.
    async fn forward(registry: &ConnectionRegistry, envelope: &Envelope, frame: &[u8]) {
        let target = match registry.resolve(&envelope.to) {
            Ok(target) => target,
            Err(e) => {
                warn!(
                    "{} (dropping {:?} {} id={} from {})",
                    e, envelope.kind, envelope.method, envelope.id, envelope.from
                );
                return;
            }
        };

        debug!(
            "Forwarding {:?} {} id={} {} -> {}",
            envelope.kind, envelope.method, envelope.id, envelope.from, envelope.to
        );

        if let Err(e) = target.send_frame(frame).await {
            warn!("Failed to forward message to {}: {}", envelope.to, e);
        }
    }
}
