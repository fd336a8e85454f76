//! Cluster configuration: TOML file plus `CLUSTER_*` environment overrides
//! (§6).
//!
//! Grounded in `forwarder/src/config.rs`'s raw-optional-field TOML pattern
//! and `server/src/main.rs`'s direct `env::var` reads, merged here instead
//! of living in two places.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub namespace: String,
    pub port: u16,
    pub path: String,
    pub auth: Option<String>,
    pub discovery: DiscoveryConfig,
    pub max_ready_after: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryConfig {
    pub service: Option<String>,
    pub nodes: Vec<String>,
    pub fetch: Option<String>,
    pub timer: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: "quty".to_owned(),
            port: 7300,
            path: "/".to_owned(),
            auth: None,
            discovery: DiscoveryConfig { timer: Duration::from_millis(3000), ..Default::default() },
            max_ready_after: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {path:?}: {reason}")]
    Io { path: String, reason: String },
    #[error("parsing config file: {0}")]
    Parse(String),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    namespace: Option<String>,
    port: Option<u16>,
    path: Option<String>,
    auth: Option<String>,
    discovery: Option<RawDiscovery>,
    max_ready_after_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDiscovery {
    service: Option<String>,
    nodes: Option<Vec<String>>,
    fetch: Option<String>,
    timer_ms: Option<u64>,
}

/// Loads config from a TOML file, falling back to defaults when the file is
/// absent entirely, then applies `CLUSTER_*` environment overrides.
pub fn load(path: Option<&std::path::Path>) -> Result<ClusterConfig, ConfigError> {
    let raw = match path {
        Some(p) => {
            let text = std::fs::read_to_string(p)
                .map_err(|e| ConfigError::Io { path: p.display().to_string(), reason: e.to_string() })?;
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?
        }
        None => RawConfig::default(),
    };
    let mut config = from_raw(raw)?;
    apply_env_overrides(&mut config)?;
    Ok(config)
}

fn from_raw(raw: RawConfig) -> Result<ClusterConfig, ConfigError> {
    let defaults = ClusterConfig::default();
    let discovery = match raw.discovery {
        Some(d) => DiscoveryConfig {
            service: d.service,
            nodes: d.nodes.unwrap_or_default(),
            fetch: d.fetch,
            timer: d.timer_ms.map(Duration::from_millis).unwrap_or(defaults.discovery.timer),
        },
        None => defaults.discovery,
    };
    Ok(ClusterConfig {
        namespace: raw.namespace.unwrap_or(defaults.namespace),
        port: raw.port.unwrap_or(defaults.port),
        path: raw.path.unwrap_or(defaults.path),
        auth: raw.auth,
        discovery,
        max_ready_after: raw.max_ready_after_ms.map(Duration::from_millis).unwrap_or(defaults.max_ready_after),
    })
}

fn apply_env_overrides(config: &mut ClusterConfig) -> Result<(), ConfigError> {
    if let Ok(v) = std::env::var("CLUSTER_NAMESPACE") {
        config.namespace = v;
    }
    if let Ok(v) = std::env::var("CLUSTER_PORT") {
        config.port = v
            .parse()
            .map_err(|_| ConfigError::InvalidValue { field: "CLUSTER_PORT".to_owned(), reason: v })?;
    }
    if let Ok(v) = std::env::var("CLUSTER_AUTH") {
        config.auth = if v.is_empty() { None } else { Some(v) };
    }
    if let Ok(v) = std::env::var("CLUSTER_DISCOVERY_SERVICE") {
        config.discovery.service = if v.is_empty() { None } else { Some(v) };
    }
    if let Ok(v) = std::env::var("CLUSTER_DISCOVERY_FETCH") {
        config.discovery.fetch = if v.is_empty() { None } else { Some(v) };
    }
    if let Ok(v) = std::env::var("CLUSTER_DISCOVERY_NODES") {
        config.discovery.nodes =
            v.split([',', ' ']).map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned).collect();
    }
    // CLUSTER_DEBUG is read directly by main.rs's logger init, not stored here.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_no_file_given() {
        let config = from_raw(RawConfig::default()).unwrap();
        assert_eq!(config.namespace, "quty");
        assert_eq!(config.port, 7300);
        assert_eq!(config.path, "/");
        assert!(config.auth.is_none());
        assert_eq!(config.discovery.timer, Duration::from_millis(3000));
        assert_eq!(config.max_ready_after, Duration::from_millis(5000));
    }

    #[test]
    fn raw_toml_overrides_defaults() {
        let toml_str = r#"
            namespace = "fleet"
            port = 9100
            auth = "s3cr3t"

            [discovery]
            nodes = ["10.0.0.4:7300", "10.0.0.5"]
            timer_ms = 1500
        "#;
        let raw: RawConfig = toml::from_str(toml_str).unwrap();
        let config = from_raw(raw).unwrap();
        assert_eq!(config.namespace, "fleet");
        assert_eq!(config.port, 9100);
        assert_eq!(config.auth.as_deref(), Some("s3cr3t"));
        assert_eq!(config.discovery.nodes, vec!["10.0.0.4:7300".to_owned(), "10.0.0.5".to_owned()]);
        assert_eq!(config.discovery.timer, Duration::from_millis(1500));
    }

    #[test]
    fn env_override_parses_discovery_nodes_list() {
        let mut config = ClusterConfig::default();
        unsafe {
            std::env::set_var("CLUSTER_DISCOVERY_NODES", "10.0.0.1, 10.0.0.2 10.0.0.3");
        }
        apply_env_overrides(&mut config).unwrap();
        unsafe {
            std::env::remove_var("CLUSTER_DISCOVERY_NODES");
        }
        assert_eq!(
            config.discovery.nodes,
            vec!["10.0.0.1".to_owned(), "10.0.0.2".to_owned(), "10.0.0.3".to_owned()]
        );
    }

    #[test]
    fn env_override_rejects_invalid_port() {
        let mut config = ClusterConfig::default();
        unsafe {
            std::env::set_var("CLUSTER_PORT", "not-a-port");
        }
        let result = apply_env_overrides(&mut config);
        unsafe {
            std::env::remove_var("CLUSTER_PORT");
        }
        assert!(result.is_err());
    }
}
