//! Plugin runtime: connects to the master and exchanges envelopes.
//!
//! A [`Plugin`] dials the master, sends its registration record, and runs a
//! single read loop. Requests from other plugins are dispatched to the
//! registered handlers, each on its own task; responses are handed to the
//! request correlator, which wakes the matching `send` call.
//!
//! # Thread Safety
//!
//! `Plugin` is a cheap `Arc` clone. Outgoing frames are serialized through a
//! tokio `Mutex` around the write half, so handlers and callers may write
//! concurrently.

use super::call::CallContext;
use super::correlator::RequestCorrelator;
use super::dispatcher::{Handler, HandlerDispatcher};
use crate::config::PluginConfig;
use crate::error::{BusError, Result};
use crate::protocol::{
    encode_message, read_message, write_frame, Envelope, MessageKind, Registration,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

struct PluginInner {
    name: String,
    version: String,
    dispatcher: HandlerDispatcher,
    correlator: Arc<RequestCorrelator>,
    max_message_size: AtomicUsize,
    writer: Mutex<Option<OwnedWriteHalf>>,
    connected: watch::Sender<bool>,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// A named participant on the bus.
#[derive(Clone)]
pub struct Plugin {
    inner: Arc<PluginInner>,
}

impl Plugin {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            inner: Arc::new(PluginInner {
                name: name.into(),
                version: version.into(),
                dispatcher: HandlerDispatcher::new(),
                correlator: Arc::new(RequestCorrelator::new()),
                max_message_size: AtomicUsize::new(PluginConfig::MAX_MESSAGE_SIZE),
                writer: Mutex::new(None),
                connected,
                reader_task: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Set the largest frame this plugin sends or accepts. Keep it equal to
    /// the master's limit.
    pub fn with_max_message_size(self, size: usize) -> Self {
        self.set_max_message_size(size);
        self
    }

    pub fn set_max_message_size(&self, size: usize) {
        self.inner.max_message_size.store(size, Ordering::Relaxed);
    }

    pub fn max_message_size(&self) -> usize {
        self.inner.max_message_size.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn version(&self) -> &str {
        &self.inner.version
    }

    /// Install a handler for `method`. May be called before or after connecting.
    pub fn handle(&self, method: impl Into<String>, handler: impl Handler) {
        self.inner.dispatcher.handle(method, handler);
    }

    /// Install the handler used for methods with no registered handler.
    pub fn set_no_route(&self, handler: impl Handler) {
        self.inner.dispatcher.set_no_route(handler);
    }

    pub fn methods(&self) -> Vec<String> {
        self.inner.dispatcher.methods()
    }

    /// Number of outgoing requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Connect to the master named by the `MASTER_ADDR` environment variable,
    /// taking the frame limit from `PLUGINBUS_MAX_MESSAGE_SIZE` when set.
    pub async fn start(&self) -> Result<()> {
        let addr = PluginConfig::master_addr_from_env()?;
        if let Some(size) = PluginConfig::max_message_size_from_env()? {
            self.set_max_message_size(size);
        }
        self.connect(&addr).await
    }

    /// Dial the master at `addr`, register, and start the read loop.
    ///
    /// Dial and registration failures are returned as-is; nothing is retried.
    pub async fn connect(&self, addr: &str) -> Result<()> {
        if self.is_connected() {
            return Err(BusError::Config {
                message: format!("plugin {} is already connected", self.inner.name),
            });
        }

        let stream = tokio::time::timeout(PluginConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| BusError::Connect {
                addr: addr.to_string(),
                message: format!("timed out after {:?}", PluginConfig::CONNECT_TIMEOUT),
            })?
            .map_err(|e| {
                error!("Failed to connect to master: {}", e);
                BusError::Connect {
                    addr: addr.to_string(),
                    message: e.to_string(),
                }
            })?;

        let (reader, mut writer) = stream.into_split();

        let registration = encode_message(&Registration::new(
            self.inner.name.clone(),
            self.inner.version.clone(),
        ))?;
        write_frame(&mut writer, &registration)
            .await
            .map_err(|e| BusError::Registration {
                message: format!("failed to send register message: {}", e),
            })?;

        *self.inner.writer.lock().await = Some(writer);
        self.inner.connected.send_replace(true);
        info!("Plugin {} started (master {})", self.inner.name, addr);

        let plugin = self.clone();
        let task = tokio::spawn(async move { plugin.read_loop(reader).await }.in_current_span());
        *self
            .inner
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        Ok(())
    }

    /// Close the connection to the master. Outstanding calls fail with
    /// `ConnectionClosed`.
    pub async fn disconnect(&self) {
        let task = self
            .inner
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.mark_disconnected().await;
    }

    /// Wait until the connection to the master is gone.
    pub async fn wait_closed(&self) {
        let mut rx = self.inner.connected.subscribe();
        let _ = rx.wait_for(|connected| !*connected).await;
    }

    /// Send `payload` to `method` on plugin `to` and wait for the response.
    ///
    /// Returns the response payload, `Remote` if the responder reported an
    /// error, `Timeout`/`Cancelled` if the call context fired first,
    /// `FrameTooLarge` if the request does not fit in one frame, or
    /// `ConnectionClosed` if the link to the master went away. In every
    /// failure case the pending entry is removed and a late response is
    /// discarded.
    pub async fn send(
        &self,
        to: &str,
        method: &str,
        payload: impl Into<Vec<u8>>,
        call: &CallContext,
    ) -> Result<Vec<u8>> {
        call.token().check()?;

        let mut pending = self.inner.correlator.begin();
        let request = Envelope::request(
            pending.id(),
            self.inner.name.clone(),
            to,
            method,
            payload.into(),
        );
        let id = request.id;

        // Written from its own task so a caller dropping this future cannot
        // leave half a frame on the wire.
        let write = {
            let plugin = self.clone();
            tokio::spawn(async move { plugin.write_envelope(&request).await }.in_current_span())
        };

        let exchange = async {
            match write.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(BusError::Other(format!("write task failed: {}", e))),
            }
            pending.response().await.ok_or(BusError::ConnectionClosed)
        };

        let response = tokio::select! {
            result = exchange => result?,
            _ = call.token().cancelled() => {
                debug!("Request {} to {}.{} cancelled", id, to, method);
                return Err(BusError::Cancelled);
            }
            _ = call.expired() => {
                debug!("Request {} to {}.{} timed out", id, to, method);
                return Err(BusError::Timeout(call.timeout().unwrap_or_default()));
            }
        };

        if let Some(message) = response.error_message() {
            return Err(BusError::Remote {
                plugin: response.from.clone(),
                message: message.to_string(),
            });
        }

        Ok(response.payload)
    }

    /// JSON-encode `request`, send it, and decode the response payload.
    pub async fn call<Req, Resp>(
        &self,
        to: &str,
        method: &str,
        request: &Req,
        call: &CallContext,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = encode_message(request)?;
        let response = self.send(to, method, payload, call).await?;
        Ok(serde_json::from_slice(&response)?)
    }

    /// Oversized frames are refused here rather than sent; the master would
    /// drop the whole connection for them.
    async fn write_envelope(&self, envelope: &Envelope) -> Result<()> {
        let frame = encode_message(envelope)?;
        let max = self.max_message_size();
        if frame.len() > max {
            return Err(BusError::FrameTooLarge {
                size: frame.len(),
                max,
            });
        }
        let mut writer = self.inner.writer.lock().await;
        let writer = writer.as_mut().ok_or(BusError::NotConnected)?;
        write_frame(writer, &frame).await
    }

    async fn read_loop(self, mut reader: OwnedReadHalf) {
        loop {
            match read_message::<Envelope, _>(&mut reader, self.max_message_size()).await {
                Ok(Some(envelope)) => self.route(envelope),
                Ok(None) => {
                    info!("Master closed the connection to {}", self.inner.name);
                    break;
                }
                Err(e) => {
                    error!("Failed to decode message for {}: {}", self.inner.name, e);
                    break;
                }
            }
        }
        self.mark_disconnected().await;
    }

    fn route(&self, envelope: Envelope) {
        match envelope.kind {
            MessageKind::Request => {
                let plugin = self.clone();
                tokio::spawn(async move { plugin.handle_request(envelope).await }.in_current_span());
            }
            MessageKind::Response => {
                self.inner.correlator.resolve(envelope);
            }
        }
    }

    async fn handle_request(self, request: Envelope) {
        let mut response = self.inner.dispatcher.dispatch(request, self.clone()).await;
        let mut result = self.write_envelope(&response).await;

        if let Err(BusError::FrameTooLarge { size, max }) = result {
            warn!(
                "Response for {} id={} is {} bytes, over the {} byte limit",
                response.method, response.id, size, max
            );
            response.payload = Vec::new();
            response.error = Some(format!(
                "response of {} bytes exceeds maximum frame size {}",
                size, max
            ));
            result = self.write_envelope(&response).await;
        }

        if let Err(e) = result {
            error!(
                "Failed to send response for {} id={} to {}: {}",
                response.method, response.id, response.to, e
            );
        }
    }

    async fn mark_disconnected(&self) {
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let failed = self.inner.correlator.fail_all();
        if failed > 0 {
            warn!(
                "{} pending request(s) of {} failed: connection closed",
                failed, self.inner.name
            );
        }
        self.inner.connected.send_replace(false);
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.inner.name)
            .field("version", &self.inner.version)
            .field("connected", &self.is_connected())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::read_frame;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let plugin = Plugin::new("A", "1.0.0");
        let result = plugin.send("B", "ping", b"ping".to_vec(), &CallContext::new()).await;
        assert!(matches!(result, Err(BusError::NotConnected)));
        assert_eq!(plugin.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_connect_refused_is_surfaced() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let plugin = Plugin::new("A", "1.0.0");
        let result = plugin.connect(&addr.to_string()).await;
        assert!(matches!(result, Err(BusError::Connect { .. })));
        assert!(!plugin.is_connected());
    }

    #[tokio::test]
    async fn test_connect_sends_registration_first() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let plugin = Plugin::new("PongPlugin", "1.2.3");
        plugin.connect(&addr.to_string()).await.unwrap();
        assert!(plugin.is_connected());

        let (mut master, _) = listener.accept().await.unwrap();
        let frame = read_frame(&mut master, 1024).await.unwrap().unwrap();
        let registration: Registration = serde_json::from_slice(&frame).unwrap();
        assert_eq!(registration, Registration::new("PongPlugin", "1.2.3"));
    }

    #[tokio::test]
    async fn test_oversized_request_is_refused_and_link_stays_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let plugin = Plugin::new("A", "1.0.0").with_max_message_size(1024);
        plugin.connect(&addr.to_string()).await.unwrap();
        let (mut master, _) = listener.accept().await.unwrap();
        read_frame(&mut master, 1024).await.unwrap().unwrap();

        let result = plugin
            .send("B", "blob", vec![7u8; 4096], &CallContext::new())
            .await;
        assert!(matches!(
            result,
            Err(BusError::FrameTooLarge { max: 1024, .. })
        ));
        assert!(plugin.is_connected());
        assert_eq!(plugin.pending_requests(), 0);

        // Nothing of the oversized request reached the wire; the next frame
        // is the small one.
        let caller = {
            let plugin = plugin.clone();
            tokio::spawn(async move {
                plugin
                    .send("B", "ping", b"ping".to_vec(), &CallContext::new())
                    .await
            })
        };
        let frame = read_frame(&mut master, 1024).await.unwrap().unwrap();
        let request: Envelope = serde_json::from_slice(&frame).unwrap();
        assert_eq!(request.method, "ping");

        let response = request.response_to().with_payload(b"pong".to_vec());
        write_frame(&mut master, &encode_message(&response).unwrap())
            .await
            .unwrap();
        assert_eq!(caller.await.unwrap().unwrap(), b"pong".to_vec());
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_short_circuits() {
        let plugin = Plugin::new("A", "1.0.0");
        let call = CallContext::new();
        call.token().cancel();

        let result = plugin.send("B", "ping", Vec::new(), &call).await;
        assert!(matches!(result, Err(BusError::Cancelled)));
    }

    #[tokio::test]
    async fn test_master_closing_fails_pending_and_marks_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let plugin = Plugin::new("A", "1.0.0");
        plugin.connect(&addr.to_string()).await.unwrap();
        let (mut master, _) = listener.accept().await.unwrap();

        let caller = {
            let plugin = plugin.clone();
            tokio::spawn(async move {
                plugin
                    .send("B", "ping", Vec::new(), &CallContext::new())
                    .await
            })
        };

        // Registration, then the request itself.
        read_frame(&mut master, 1024).await.unwrap().unwrap();
        let frame = read_frame(&mut master, 1024).await.unwrap().unwrap();
        let request: Envelope = serde_json::from_slice(&frame).unwrap();
        assert_eq!(request.method, "ping");
        assert_eq!(plugin.pending_requests(), 1);
        drop(master);

        let result = caller.await.unwrap();
        assert!(matches!(result, Err(BusError::ConnectionClosed)));
        plugin.wait_closed().await;
        assert!(!plugin.is_connected());
        assert_eq!(plugin.pending_requests(), 0);
    }
}
