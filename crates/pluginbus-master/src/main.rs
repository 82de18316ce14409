//! Pluginbus Master - routes envelopes between plugin processes.
//!
//! Starts the broker, then launches the configured plugin executables with
//! `MASTER_ADDR` pointing back at it. Runs until Ctrl-C.

mod launcher;
mod manifest;

use anyhow::{Context, Result};
use clap::Parser;
use launcher::PluginLauncher;
use manifest::PluginManifest;
use pluginbus_core::{BrokerConfig, BrokerServer, BrokerSettings};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "pluginbus-master")]
#[command(about = "Message broker for pluginbus plugins")]
struct Args {
    /// Host to bind to
    #[arg(long, default_value = BrokerConfig::DEFAULT_HOST)]
    host: String,

    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value_t = BrokerConfig::DEFAULT_PORT)]
    port: u16,

    /// Plugin executable to launch (repeatable)
    #[arg(long = "plugin", value_name = "PATH")]
    plugins: Vec<PathBuf>,

    /// Directory of plugin manifest files (*.json)
    #[arg(long, value_name = "DIR")]
    plugins_dir: Option<PathBuf>,

    /// Delay between the broker starting and plugins being launched
    #[arg(long, default_value_t = 1000)]
    launch_delay_ms: u64,

    /// Maximum size of a single frame in bytes
    #[arg(long, default_value_t = BrokerConfig::MAX_MESSAGE_SIZE)]
    max_message_size: usize,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let manifests = collect_manifests(&args)?;

    let settings = BrokerSettings::new(format!("{}:{}", args.host, args.port))
        .with_max_message_size(args.max_message_size);
    let mut broker = BrokerServer::start(settings)
        .await
        .context("Master failed to start")?;

    let master_addr = dial_addr(broker.addr());
    let mut launcher =
        PluginLauncher::new(master_addr.to_string()).with_max_message_size(args.max_message_size);

    if !manifests.is_empty() {
        tokio::time::sleep(Duration::from_millis(args.launch_delay_ms)).await;
        for manifest in &manifests {
            if let Err(e) = launcher.launch(manifest) {
                warn!("{}", e);
            }
        }
        info!(
            "Launched {} of {} plugins (MASTER_ADDR={})",
            launcher.running(),
            manifests.len(),
            launcher.master_addr()
        );
    }

    let mut tick = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Shutdown signal received, exiting");
                break;
            }
            _ = tick.tick() => {
                launcher.reap();
                debug!(
                    "Registered plugins: {:?}",
                    broker
                        .registry()
                        .list()
                        .iter()
                        .map(|p| p.name.as_str())
                        .collect::<Vec<_>>()
                );
            }
        }
    }

    launcher.stop_all().await;
    broker.shutdown();

    Ok(())
}

fn collect_manifests(args: &Args) -> Result<Vec<PluginManifest>> {
    let mut manifests: Vec<PluginManifest> = args
        .plugins
        .iter()
        .map(PluginManifest::from_executable)
        .collect();

    if let Some(dir) = &args.plugins_dir {
        let loaded = manifest::load_dir(dir)
            .with_context(|| format!("Failed to load manifests from {}", dir.display()))?;
        manifests.extend(loaded);
    }

    Ok(manifests)
}

/// Address plugins should dial; a wildcard bind is reached over loopback.
fn dial_addr(bound: SocketAddr) -> SocketAddr {
    if bound.ip().is_unspecified() {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), bound.port())
    } else {
        bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = Args::parse_from(["pluginbus-master"]);
        assert_eq!(args.host, "127.0.0.1");
        assert_eq!(args.port, 7777);
        assert_eq!(args.launch_delay_ms, 1000);
        assert!(args.plugins.is_empty());
        assert!(!args.debug);
    }

    #[test]
    fn test_repeatable_plugin_flag() {
        let args = Args::parse_from([
            "pluginbus-master",
            "--plugin",
            "./build/ping-plugin",
            "--plugin",
            "./build/pong-plugin",
            "--port",
            "0",
        ]);
        let manifests = collect_manifests(&args).unwrap();
        let names: Vec<_> = manifests.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["ping-plugin", "pong-plugin"]);
        assert_eq!(args.port, 0);
    }

    #[test]
    fn test_wildcard_bind_dials_loopback() {
        let bound: SocketAddr = "0.0.0.0:7777".parse().unwrap();
        assert_eq!(dial_addr(bound), "127.0.0.1:7777".parse().unwrap());

        let bound: SocketAddr = "10.1.2.3:7000".parse().unwrap();
        assert_eq!(dial_addr(bound), bound);
    }
}
