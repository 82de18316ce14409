//! Ping plugin: calls the pong plugin periodically or runs a QPS load test.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use pluginbus_core::{CallContext, Plugin};
use pluginbus_demo::load::{add_once, ping_once, QpsTest};
use pluginbus_demo::{init_tracing, DEMO_VERSION, PING_PLUGIN};
use std::time::Duration;
use tracing::{error, info, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Send one ping and one add every interval
    Periodic,
    /// Saturate the pong plugin with concurrent add requests
    Qps,
}

#[derive(Parser, Debug)]
#[command(name = "ping-plugin")]
#[command(about = "Demo plugin calling the pong plugin")]
struct Args {
    /// Master address (defaults to $MASTER_ADDR)
    #[arg(long)]
    master: Option<String>,

    #[arg(long, value_enum, default_value_t = Mode::Qps)]
    mode: Mode,

    /// Seconds between calls in periodic mode
    #[arg(long, default_value_t = 3)]
    interval_secs: u64,

    /// Length of the load test in seconds
    #[arg(long, default_value_t = 30)]
    duration_secs: u64,

    /// Concurrent workers in the load test
    #[arg(long, default_value_t = 100)]
    concurrency: usize,

    /// Per-request timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    run(args).instrument(info_span!("plugin", name = PING_PLUGIN)).await
}

async fn run(args: Args) -> Result<()> {
    let plugin = Plugin::new(PING_PLUGIN, DEMO_VERSION);
    match &args.master {
        Some(addr) => plugin.connect(addr).await?,
        None => plugin.start().await?,
    }

    let timeout = Duration::from_millis(args.timeout_ms);
    match args.mode {
        Mode::Periodic => {
            let mut tick = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = plugin.wait_closed() => {
                        info!("Master connection closed, exiting");
                        break;
                    }
                    result = tokio::signal::ctrl_c() => {
                        result?;
                        break;
                    }
                }

                let call = CallContext::with_timeout(timeout);
                match ping_once(&plugin, &call).await {
                    Ok(reply) => info!("Ping result: {}", reply),
                    Err(e) => error!("Failed to send ping: {}", e),
                }
                match add_once(&plugin, 1, 1, &call).await {
                    Ok(result) => info!("Add result: {}", result),
                    Err(e) => error!("Failed to send add: {}", e),
                }
            }
        }
        Mode::Qps => {
            let test = QpsTest {
                duration: Duration::from_secs(args.duration_secs),
                concurrency: args.concurrency.max(1),
                request_timeout: timeout,
                ..QpsTest::default()
            };
            test.run(&plugin).await;
        }
    }

    plugin.disconnect().await;
    Ok(())
}
