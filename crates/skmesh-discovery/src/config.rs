//! Coordination client configuration

use std::time::Duration;

use serde::Deserialize;
use skmesh_common::{DEFAULT_ROOT_PATH, MeshError, Result};

/// Default session timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 30000;

/// Configuration shared by the registrar and the subscriber
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Coordination store servers (`host:port`)
    pub servers: Vec<String>,
    /// Session timeout in milliseconds; 0 selects the default
    pub timeout_ms: u64,
    /// Root of the service tree; empty selects the default
    pub root_path: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            root_path: DEFAULT_ROOT_PATH.to_string(),
        }
    }
}

impl DiscoveryConfig {
    pub fn with_servers(servers: Vec<String>) -> Self {
        Self {
            servers,
            ..Default::default()
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_root_path(mut self, root_path: &str) -> Self {
        self.root_path = root_path.to_string();
        self
    }

    /// Validate the server list and normalize root path and timeout.
    pub fn init(&mut self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(MeshError::config("empty coordination server list"));
        }
        if self.servers.iter().any(|server| server.is_empty()) {
            return Err(MeshError::config("empty address of coordination server"));
        }

        if self.root_path.is_empty() {
            self.root_path = DEFAULT_ROOT_PATH.to_string();
        } else if self.root_path.len() > 1 && self.root_path.ends_with('/') {
            self.root_path.pop();
        }

        if self.timeout_ms == 0 {
            self.timeout_ms = DEFAULT_TIMEOUT_MS;
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// `{root}/{service}/service`
    pub fn service_path(&self, service: &str) -> String {
        format!("{}/{}/service", self.root_path, service)
    }

    /// `{root}/{service}/nodes`
    pub fn nodes_path(&self, service: &str) -> String {
        format!("{}/{}/nodes", self.root_path, service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_rejects_empty_servers() {
        let mut config = DiscoveryConfig::default();
        assert!(matches!(config.init(), Err(MeshError::Config(_))));

        let mut config = DiscoveryConfig::with_servers(vec!["zk:2181".to_string(), String::new()]);
        assert!(matches!(config.init(), Err(MeshError::Config(_))));
    }

    #[test]
    fn test_init_normalizes() {
        let mut config = DiscoveryConfig::with_servers(vec!["zk:2181".to_string()])
            .with_timeout_ms(0)
            .with_root_path("/games/prod/");
        config.init().unwrap();
        assert_eq!(config.root_path, "/games/prod");
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.nodes_path("orders"), "/games/prod/orders/nodes");

        let mut config = DiscoveryConfig::with_servers(vec!["zk:2181".to_string()]).with_root_path("");
        config.init().unwrap();
        assert_eq!(config.service_path("orders"), "/sk.org/server/orders/service");
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: DiscoveryConfig = serde_json::from_str(r#"{"servers":["zk:2181"]}"#).unwrap();
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.root_path, DEFAULT_ROOT_PATH);
    }
}
