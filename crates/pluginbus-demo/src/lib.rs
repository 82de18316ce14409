//! Demo plugins for pluginbus.
//!
//! `pong-plugin` answers `ping` with `pong` and sums two integers for `add`.
//! `ping-plugin` calls it, either periodically or as a QPS load test.

pub mod load;

use pluginbus_core::{Plugin, RequestContext};
use serde::{Deserialize, Serialize};
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

pub const PING_PLUGIN: &str = "PingPlugin";
pub const PONG_PLUGIN: &str = "PongPlugin";
pub const DEMO_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddRequest {
    pub a: i64,
    pub b: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddResponse {
    pub result: i64,
}

/// Build the pong plugin with its `ping` and `add` handlers installed.
pub fn pong_plugin() -> Plugin {
    let plugin = Plugin::new(PONG_PLUGIN, DEMO_VERSION);

    plugin.handle("ping", |ctx: &mut RequestContext| {
        debug!("Received ping from {}", ctx.from());
        ctx.reply_data(b"pong");
    });

    plugin.handle("add", |ctx: &mut RequestContext| {
        let req: AddRequest = match ctx.bind() {
            Ok(req) => req,
            Err(e) => {
                ctx.set_error(e);
                return;
            }
        };
        match req.a.checked_add(req.b) {
            Some(result) => {
                debug!("Calculated {} + {} = {}", req.a, req.b, result);
                ctx.reply(&AddResponse { result });
            }
            None => ctx.set_error(format!("{} + {} overflows", req.a, req.b)),
        }
    });

    plugin
}

/// Install the compact stdout subscriber used by the demo binaries.
pub fn init_tracing(debug: bool) {
    let log_level = if debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}
