//! Pluginbus Core - name-routed request/response messaging between processes.
//!
//! A broker (the "master") accepts TCP connections from plugin processes.
//! Each plugin registers under a unique name and then exchanges envelopes
//! addressed by that name; the master forwards every envelope verbatim to
//! the connection registered for its destination. Correlation of responses
//! to requests happens entirely inside the calling plugin.
//!
//! # Example
//!
//! ```rust,ignore
//! use pluginbus_core::{BrokerServer, BrokerSettings, CallContext, Plugin, RequestContext};
//!
//! #[tokio::main]
//! async fn main() -> pluginbus_core::Result<()> {
//!     let mut broker = BrokerServer::start(BrokerSettings::new("127.0.0.1:7777")).await?;
//!
//!     let pong = Plugin::new("PongPlugin", "1.0.0");
//!     pong.handle("ping", |ctx: &mut RequestContext| ctx.reply_data(b"pong"));
//!     pong.connect("127.0.0.1:7777").await?;
//!
//!     let ping = Plugin::new("PingPlugin", "1.0.0");
//!     ping.connect("127.0.0.1:7777").await?;
//!     let reply = ping
//!         .send("PongPlugin", "ping", b"ping".to_vec(), &CallContext::with_default_timeout())
//!         .await?;
//!     assert_eq!(reply, b"pong");
//!
//!     broker.shutdown();
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod cancel;
pub mod config;
pub mod error;
pub mod plugin;
pub mod protocol;

// Re-export commonly used types
pub use broker::{BrokerHandle, BrokerServer, ConnectionRegistry, RegisteredPlugin};
pub use cancel::{CancellationToken, CancelledError};
pub use config::{BrokerConfig, BrokerSettings, PluginConfig};
pub use error::{BusError, Result};
pub use plugin::{handler_fn, CallContext, Handler, Plugin, RequestContext};
pub use protocol::{Envelope, MessageKind, Registration};
