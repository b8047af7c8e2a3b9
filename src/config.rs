//! Process/CLI configuration: backend selection, domain layout, and quota
//! defaults. Distinct from the settings resolver (C1), which governs
//! per-admission quota values at runtime; this module governs the values
//! fixed for the lifetime of one running process.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which backend driver this process drives sandboxes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Docker,
    Cluster,
}

/// One subdomain flavor: a sandbox kind routed to a fixed internal port,
/// with its own subdomain prefix and internal credential scheme.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlavorConfig {
    pub name: String,
    pub subdomain_prefix: String,
    pub internal_port: u16,
    #[serde(default)]
    pub auth_scheme: AuthScheme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    Basic,
    #[default]
    Bearer,
}

/// Root configuration structure matching `sandboxd.toml` schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendKind,
    pub base_domain: String,
    pub asset_domain: String,
    #[serde(default = "default_flavors")]
    pub flavors: Vec<FlavorConfig>,
    #[serde(default = "default_workspace_drive_gb")]
    pub workspace_drive_gb: u64,
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_base_url")]
    pub base_url: String,
    #[serde(default = "default_upstream_header_name")]
    pub header_name: String,
    #[serde(default = "default_upstream_version_header")]
    pub version_header_name: String,
    #[serde(default = "default_upstream_version_value")]
    pub version_header_value: String,
}

fn default_flavors() -> Vec<FlavorConfig> {
    vec![
        FlavorConfig {
            name: "agent".into(),
            subdomain_prefix: "agent".into(),
            internal_port: 4096,
            auth_scheme: AuthScheme::Bearer,
        },
        FlavorConfig {
            name: "shell".into(),
            subdomain_prefix: "shell".into(),
            internal_port: 18789,
            auth_scheme: AuthScheme::Basic,
        },
    ]
}

fn default_workspace_drive_gb() -> u64 {
    10
}

fn default_upstream_base_url() -> String {
    "https://api.anthropic.com".into()
}

fn default_upstream_header_name() -> String {
    "x-api-key".into()
}

fn default_upstream_version_header() -> String {
    "anthropic-version".into()
}

fn default_upstream_version_value() -> String {
    "2023-06-01".into()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_base_url(),
            header_name: default_upstream_header_name(),
            version_header_name: default_upstream_version_header(),
            version_header_value: default_upstream_version_value(),
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_str(&content)
    }

    /// Parses configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML configuration")
    }

    /// A minimal config suitable for local development: docker backend,
    /// `localhost` domains, default flavors.
    pub fn minimal() -> Self {
        Self {
            backend: BackendKind::Docker,
            base_domain: "sandboxes.localhost".into(),
            asset_domain: "app.localhost".into(),
            flavors: default_flavors(),
            workspace_drive_gb: default_workspace_drive_gb(),
            upstream: UpstreamConfig::default(),
        }
    }

    pub fn flavor(&self, name: &str) -> Option<&FlavorConfig> {
        self.flavors.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml = r#"
            base_domain = "sandboxes.example.com"
            asset_domain = "app.example.com"
        "#;
        let config = Config::from_str(toml).unwrap();
        assert_eq!(config.base_domain, "sandboxes.example.com");
        assert_eq!(config.backend, BackendKind::Docker);
        assert_eq!(config.flavors.len(), 2);
        assert_eq!(config.upstream.header_name, "x-api-key");
    }

    #[test]
    fn parses_full_config() {
        let toml = r#"
            backend = "cluster"
            base_domain = "sandboxes.example.com"
            asset_domain = "app.example.com"
            workspace_drive_gb = 20

            [[flavors]]
            name = "agent"
            subdomain_prefix = "a"
            internal_port = 4096
            auth_scheme = "bearer"

            [upstream]
            base_url = "https://api.example.com"
            header_name = "x-api-key"
            version_header_name = "x-api-version"
            version_header_value = "2025-01-01"
        "#;
        let config = Config::from_str(toml).unwrap();
        assert_eq!(config.backend, BackendKind::Cluster);
        assert_eq!(config.workspace_drive_gb, 20);
        assert_eq!(config.flavors.len(), 1);
        assert_eq!(config.upstream.base_url, "https://api.example.com");
    }
}
