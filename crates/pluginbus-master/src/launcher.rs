//! Plugin process launching.
//!
//! Each plugin runs as a child process with `MASTER_ADDR` pointing at the
//! broker and `PLUGINBUS_MAX_MESSAGE_SIZE` set to the broker's frame limit.
//! Its stdout and stderr are inherited so plugin logs appear beside
//! the master's. Children are killed when the launcher stops or is dropped.

use crate::manifest::PluginManifest;
use pluginbus_core::{BusError, PluginConfig, Result};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// A launched plugin process.
#[derive(Debug)]
pub struct LaunchedPlugin {
    pub name: String,
    pub pid: Option<u32>,
    child: Child,
}

/// Starts plugin executables and keeps track of them.
#[derive(Debug)]
pub struct PluginLauncher {
    master_addr: String,
    max_message_size: usize,
    running: Vec<LaunchedPlugin>,
}

impl PluginLauncher {
    pub fn new(master_addr: impl Into<String>) -> Self {
        Self {
            master_addr: master_addr.into(),
            max_message_size: PluginConfig::MAX_MESSAGE_SIZE,
            running: Vec::new(),
        }
    }

    /// Frame limit handed to plugins; use the broker's.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn master_addr(&self) -> &str {
        &self.master_addr
    }

    /// Build the command for `manifest` without spawning it.
    pub fn command(&self, manifest: &PluginManifest) -> Command {
        let mut cmd = Command::new(&manifest.executable);
        cmd.args(&manifest.args);
        for (key, value) in &manifest.env {
            cmd.env(key, value);
        }
        cmd.env(PluginConfig::MASTER_ADDR_ENV, &self.master_addr);
        cmd.env(
            PluginConfig::MAX_MESSAGE_SIZE_ENV,
            self.max_message_size.to_string(),
        );
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Spawn the plugin described by `manifest`.
    pub fn launch(&mut self, manifest: &PluginManifest) -> Result<Option<u32>> {
        info!(
            "Launching plugin {} from {}",
            manifest.name,
            manifest.executable.display()
        );

        let child = self.command(manifest).spawn().map_err(|e| {
            error!("Failed to start plugin {}: {}", manifest.name, e);
            BusError::Io {
                message: format!(
                    "Failed to start plugin {} ({}): {}",
                    manifest.name,
                    manifest.executable.display(),
                    e
                ),
                source: Some(e),
            }
        })?;

        let pid = child.id();
        debug!("Plugin {} running with PID {:?}", manifest.name, pid);
        self.running.push(LaunchedPlugin {
            name: manifest.name.clone(),
            pid,
            child,
        });
        Ok(pid)
    }

    /// Forget children that have already exited, logging their status.
    pub fn reap(&mut self) -> usize {
        let mut exited = 0;
        self.running.retain_mut(|plugin| match plugin.child.try_wait() {
            Ok(Some(status)) => {
                if status.success() {
                    info!("Plugin {} exited", plugin.name);
                } else {
                    warn!("Plugin {} exited with {}", plugin.name, status);
                }
                exited += 1;
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("Failed to poll plugin {}: {}", plugin.name, e);
                true
            }
        });
        exited
    }

    /// Number of children not yet known to have exited.
    pub fn running(&self) -> usize {
        self.running.len()
    }

    /// Kill every child and wait for it to exit.
    pub async fn stop_all(&mut self) {
        for mut plugin in self.running.drain(..) {
            if let Err(e) = plugin.child.start_kill() {
                debug!("Plugin {} already gone: {}", plugin.name, e);
            }
            match plugin.child.wait().await {
                Ok(status) => info!("Stopped plugin {} ({})", plugin.name, status),
                Err(e) => warn!("Failed to wait for plugin {}: {}", plugin.name, e),
            }
        }
    }
}
