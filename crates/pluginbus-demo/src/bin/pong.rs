//! Pong plugin: answers `ping` and `add` requests routed through the master.

use anyhow::Result;
use clap::Parser;
use pluginbus_demo::{init_tracing, pong_plugin, PONG_PLUGIN};
use tracing::{info, info_span, Instrument};

#[derive(Parser, Debug)]
#[command(name = "pong-plugin")]
#[command(about = "Demo plugin answering ping and add")]
struct Args {
    /// Master address (defaults to $MASTER_ADDR)
    #[arg(long)]
    master: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    run(args).instrument(info_span!("plugin", name = PONG_PLUGIN)).await
}

async fn run(args: Args) -> Result<()> {
    let plugin = pong_plugin();
    match &args.master {
        Some(addr) => plugin.connect(addr).await?,
        None => plugin.start().await?,
    }
    info!("Serving methods {:?}", plugin.methods());

    tokio::select! {
        _ = plugin.wait_closed() => {
            info!("Master connection closed, exiting");
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received, exiting");
            plugin.disconnect().await;
        }
    }

    Ok(())
}
