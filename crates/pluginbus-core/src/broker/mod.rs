//! Broker ("master") side of pluginbus.
//!
//! # Architecture
//!
//! - **Registry**: name → connection map, one live connection per name
//! - **Server**: accept loop plus one forwarding loop per plugin connection

pub mod registry;
pub mod server;

pub use registry::{ConnectionRegistry, PluginConnection, RegisteredPlugin};
pub use server::{BrokerHandle, BrokerServer};
