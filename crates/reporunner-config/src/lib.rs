//! Configuration loading for every worker (§6). Recognised options:
//! `stream.connectionString`, `documentStore.connectionString`,
//! `documentStore.database`, `cache.connectionString`,
//! `builder.workDirectory`, `runner.namespaceTTLHours`, `runner.cpuLimit`,
//! `runner.memoryLimit`, `runner.nodePort`, `flushStreamsOnStartup`.
//!
//! Loaded from `reporunner.toml` in the current directory, or from the path
//! named by `REPORUNNER_CONFIG` when set. Missing files fall back to
//! defaults — every worker runs out of the box against a local broker.
//! The three connection strings additionally accept an environment
//! override (`REPORUNNER_STREAM_CONNECTION_STRING`,
//! `REPORUNNER_DOCUMENT_STORE_CONNECTION_STRING`,
//! `REPORUNNER_CACHE_CONNECTION_STRING`), applied after the file so a
//! secret doesn't have to live on disk.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default config file name, checked in the current directory.
pub const CONFIG_FILE: &str = "reporunner.toml";

/// Environment variable naming an explicit config file path, checked before
/// `CONFIG_FILE`.
pub const CONFIG_ENV_VAR: &str = "REPORUNNER_CONFIG";

/// Per-field environment overrides for the three connection strings, so a
/// secret doesn't have to sit in `reporunner.toml` on disk. Applied after
/// the file (or defaults) is loaded, so an env var always wins.
pub const STREAM_CONNECTION_ENV_VAR: &str = "REPORUNNER_STREAM_CONNECTION_STRING";
pub const DOCUMENT_STORE_CONNECTION_ENV_VAR: &str = "REPORUNNER_DOCUMENT_STORE_CONNECTION_STRING";
pub const CACHE_CONNECTION_ENV_VAR: &str = "REPORUNNER_CACHE_CONNECTION_STRING";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stream: StreamConfig,
    pub document_store: DocumentStoreConfig,
    pub cache: CacheConfig,
    pub builder: BuilderConfig,
    pub runner: RunnerConfig,
    pub flush_streams_on_startup: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            document_store: DocumentStoreConfig::default(),
            cache: CacheConfig::default(),
            builder: BuilderConfig::default(),
            runner: RunnerConfig::default(),
            flush_streams_on_startup: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamConfig {
    pub connection_string: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            connection_string: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DocumentStoreConfig {
    pub connection_string: String,
    pub database: String,
}

impl Default for DocumentStoreConfig {
    fn default() -> Self {
        Self {
            connection_string: "./reporunner.sqlite3".to_string(),
            database: "reporunner".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub connection_string: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            connection_string: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuilderConfig {
    pub work_directory: PathBuf,
    /// Image-build CLI binary (§6: "tool-specific, not part of this spec").
    pub image_build_binary: String,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            work_directory: PathBuf::from("./work"),
            image_build_binary: "docker".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerConfig {
    pub namespace_ttl_hours: u32,
    pub cpu_limit: String,
    pub memory_limit: String,
    pub cpu_request: String,
    pub memory_request: String,
    pub node_port: u16,
    /// Cluster CLI binary.
    pub cluster_binary: String,
    /// Cluster image-loader binary (e.g. `kind`, `k3d`).
    pub image_loader_binary: String,
    /// Local cluster name passed to the image loader.
    pub cluster_name: String,
    /// Path to cluster credentials; unset uses the cluster CLI's own default.
    pub kubeconfig_path: Option<PathBuf>,
    /// How often the TTL reaper sweeps for expired tenant namespaces.
    #[serde(with = "humantime_serde")]
    pub ttl_reaper_interval: std::time::Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            namespace_ttl_hours: 2,
            cpu_limit: "200m".to_string(),
            memory_limit: "256Mi".to_string(),
            cpu_request: "50m".to_string(),
            memory_request: "64Mi".to_string(),
            node_port: 30_080,
            cluster_binary: "kubectl".to_string(),
            image_loader_binary: "kind".to_string(),
            cluster_name: "kind".to_string(),
            kubeconfig_path: None,
            ttl_reaper_interval: std::time::Duration::from_secs(15 * 60),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Resolve the config path: `REPORUNNER_CONFIG` env var if set, else
/// `reporunner.toml` in `dir`.
pub fn resolve_path(dir: &Path) -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        return PathBuf::from(path);
    }
    dir.join(CONFIG_FILE)
}

/// Load configuration, falling back to defaults when the file is absent.
pub fn load_config(dir: &Path) -> Result<Config> {
    let path = resolve_path(dir);
    load_config_from_file(&path)
}

pub fn load_config_from_file(path: &Path) -> Result<Config> {
    let mut config = if !path.exists() {
        Config::default()
    } else {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse config file: {}", path.display()))?
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Layered config resolution's last step: explicit file (or defaults) loses
/// to an environment override for any of the three connection strings.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(value) = std::env::var(STREAM_CONNECTION_ENV_VAR) {
        config.stream.connection_string = value;
    }
    if let Ok(value) = std::env::var(DOCUMENT_STORE_CONNECTION_ENV_VAR) {
        config.document_store.connection_string = value;
    }
    if let Ok(value) = std::env::var(CACHE_CONNECTION_ENV_VAR) {
        config.cache.connection_string = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_spec() {
        let config = Config::new();
        assert_eq!(config.runner.namespace_ttl_hours, 2);
        assert_eq!(config.runner.cpu_limit, "200m");
        assert_eq!(config.runner.memory_limit, "256Mi");
        assert_eq!(config.runner.node_port, 30_080);
        assert_eq!(config.builder.work_directory, PathBuf::from("./work"));
        assert!(!config.flush_streams_on_startup);
    }

    #[test]
    fn missing_file_returns_defaults() {
        let td = tempdir().expect("tempdir");
        let config = load_config(td.path()).expect("load");
        assert_eq!(config.runner.namespace_ttl_hours, 2);
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
flushStreamsOnStartup = true

[runner]
nodePort = 31000
"#,
        )
        .expect("write");

        let config = load_config(td.path()).expect("load");
        assert!(config.flush_streams_on_startup);
        assert_eq!(config.runner.node_port, 31_000);
        assert_eq!(config.runner.cpu_limit, "200m");
    }

    #[test]
    fn full_toml_round_trips() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
[stream]
connectionString = "redis://stream-host:6379"

[documentStore]
connectionString = "./data/runner.sqlite3"
database = "runner_prod"

[cache]
connectionString = "redis://cache-host:6379"

[builder]
workDirectory = "/var/lib/reporunner/work"

[runner]
namespaceTTLHours = 4
cpuLimit = "500m"
memoryLimit = "512Mi"
nodePort = 32000

flushStreamsOnStartup = false
"#,
        )
        .expect("write");

        let config = load_config_from_file(&path).expect("load");
        assert_eq!(config.stream.connection_string, "redis://stream-host:6379");
        assert_eq!(config.document_store.database, "runner_prod");
        assert_eq!(config.builder.work_directory, PathBuf::from("/var/lib/reporunner/work"));
        assert_eq!(config.runner.namespace_ttl_hours, 4);
    }

    #[test]
    fn env_override_wins_over_file_value() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
[cache]
connectionString = "redis://cache-host:6379"
"#,
        )
        .expect("write");

        std::env::set_var(CACHE_CONNECTION_ENV_VAR, "redis://secret-host:6380");
        let config = load_config_from_file(&path).expect("load");
        std::env::remove_var(CACHE_CONNECTION_ENV_VAR);

        assert_eq!(config.cache.connection_string, "redis://secret-host:6380");
        assert_eq!(config.document_store.connection_string, "./reporunner.sqlite3");
    }
}
