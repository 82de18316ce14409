//! Plugin manifest loading.
//!
//! A manifest is a JSON file describing one plugin executable the master
//! should launch:
//!
//! ```json
//! { "name": "PongPlugin", "version": "1.0.0", "executable": "./pong-plugin",
//!   "args": [], "env": { "RUST_LOG": "debug" } }
//! ```
//!
//! Relative executable paths are resolved against the manifest's directory.

use pluginbus_core::{BusError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One plugin the master launches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Name the plugin registers under. Informational; the plugin picks its own.
    pub name: String,
    #[serde(default)]
    pub version: String,
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl PluginManifest {
    /// Manifest for a bare executable given on the command line.
    pub fn from_executable(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Self {
            name,
            version: String::new(),
            executable: path.to_path_buf(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    /// Read and validate a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| BusError::Io {
            message: format!("Failed to read manifest {}: {}", path.display(), e),
            source: Some(e),
        })?;

        let mut manifest: PluginManifest =
            serde_json::from_str(&content).map_err(|e| BusError::Json {
                message: format!("Failed to parse manifest {}: {}", path.display(), e),
                source: Some(e),
            })?;

        if manifest.name.is_empty() {
            return Err(BusError::Config {
                message: format!("Manifest {} has empty name", path.display()),
            });
        }
        if manifest.executable.as_os_str().is_empty() {
            return Err(BusError::Config {
                message: format!("Plugin '{}' has empty executable", manifest.name),
            });
        }

        if manifest.executable.is_relative() {
            if let Some(dir) = path.parent() {
                manifest.executable = dir.join(&manifest.executable);
            }
        }

        Ok(manifest)
    }
}

/// Load every `*.json` manifest in `dir`, sorted by name.
///
/// Files that fail to parse or validate are skipped with a warning.
pub fn load_dir(dir: &Path) -> Result<Vec<PluginManifest>> {
    let entries = std::fs::read_dir(dir).map_err(|e| BusError::Io {
        message: format!("Failed to read plugins directory {}: {}", dir.display(), e),
        source: Some(e),
    })?;

    let mut manifests = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().map(|e| e != "json").unwrap_or(true) {
            continue;
        }

        match PluginManifest::load(&path) {
            Ok(manifest) => {
                info!("Loaded plugin manifest: {} ({})", manifest.name, path.display());
                manifests.push(manifest);
            }
            Err(e) => warn!("Skipping manifest {}: {}", path.display(), e),
        }
    }

    manifests.sort_by(|a, b| a.name.cmp(&b.name));
    debug!("Loaded {} manifests from {}", manifests.len(), dir.display());
    Ok(manifests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, file: &str, content: &str) -> PathBuf {
        let path = dir.path().join(file);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_full_manifest() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "pong.json",
            r#"{"name":"PongPlugin","version":"1.0.0","executable":"bin/pong",
                "args":["--fast"],"env":{"RUST_LOG":"debug"}}"#,
        );

        let manifest = PluginManifest::load(&path).unwrap();
        assert_eq!(manifest.name, "PongPlugin");
        assert_eq!(manifest.version, "1.0.0");
        assert_eq!(manifest.executable, dir.path().join("bin/pong"));
        assert_eq!(manifest.args, vec!["--fast".to_string()]);
        assert_eq!(manifest.env.get("RUST_LOG").map(String::as_str), Some("debug"));
    }

    #[test]
    fn test_absolute_executable_is_kept() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "p.json", r#"{"name":"P","executable":"/usr/bin/true"}"#);

        let manifest = PluginManifest::load(&path).unwrap();
        assert_eq!(manifest.executable, PathBuf::from("/usr/bin/true"));
        assert!(manifest.args.is_empty());
        assert!(manifest.env.is_empty());
    }

    #[test]
    fn test_empty_name_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "bad.json", r#"{"name":"","executable":"x"}"#);
        assert!(matches!(
            PluginManifest::load(&path),
            Err(BusError::Config { .. })
        ));
    }

    #[test]
    fn test_invalid_json_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "bad.json", "{ nope");
        assert!(matches!(
            PluginManifest::load(&path),
            Err(BusError::Json { .. })
        ));
    }

    #[test]
    fn test_load_dir_skips_bad_and_non_json() {
        let dir = TempDir::new().unwrap();
        write(&dir, "b.json", r#"{"name":"B","executable":"b"}"#);
        write(&dir, "a.json", r#"{"name":"A","executable":"a"}"#);
        write(&dir, "broken.json", "not json");
        write(&dir, "readme.txt", "ignored");

        let manifests = load_dir(dir.path()).unwrap();
        let names: Vec<_> = manifests.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn test_load_dir_missing_is_error() {
        let result = load_dir(Path::new("/nonexistent/pluginbus/plugins"));
        assert!(matches!(result, Err(BusError::Io { .. })));
    }

    #[test]
    fn test_from_executable_uses_file_stem() {
        let manifest = PluginManifest::from_executable("./build/plugins/pong-plugin");
        assert_eq!(manifest.name, "pong-plugin");
        assert_eq!(manifest.executable, PathBuf::from("./build/plugins/pong-plugin"));
    }
}
