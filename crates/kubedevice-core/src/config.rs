//! Configuration types for kubedevice

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{DeviceError, DeviceResult};

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Local node and its device plugins
    pub node: NodeConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> DeviceResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DeviceError::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> DeviceResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| DeviceError::Config(format!("Failed to parse config: {}", e)))?;
        config.node.validate()?;
        Ok(config)
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub address: String,
    /// Port for the REST API server
    pub port: u16,
    /// Enable CORS
    pub cors_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9190,
            cors_enabled: false,
        }
    }
}

/// What node registration does when a plugin fails to come up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegistrationPolicy {
    /// Abort registration of the whole node
    FailNode,
    /// Leave the device kind out of the node and continue
    #[default]
    ExcludeDevice,
}

/// A node and the plugins that report into it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique node name
    pub name: String,
    pub registration_policy: RegistrationPolicy,
    pub plugins: Vec<PluginSpec>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "localhost".to_string(),
            registration_policy: RegistrationPolicy::default(),
            plugins: Vec::new(),
        }
    }
}

impl NodeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a plugin of the given kind with its settings
    pub fn with_plugin(mut self, spec: PluginSpec) -> Self {
        self.plugins.push(spec);
        self
    }

    /// Node name must be set and plugin instance names unique
    pub fn validate(&self) -> DeviceResult<()> {
        if self.name.trim().is_empty() {
            return Err(DeviceError::Config("node name must not be empty".to_string()));
        }
        let mut seen = BTreeSet::new();
        for spec in &self.plugins {
            if !seen.insert(spec.instance_name()) {
                return Err(DeviceError::Config(format!(
                    "plugin instance {} is configured twice on node {}",
                    spec.instance_name(),
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// One configured plugin instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSpec {
    /// Device kind, the registry key
    pub kind: String,
    /// Instance name, defaults to the kind
    #[serde(default)]
    pub name: Option<String>,
    /// Plugin-specific settings
    #[serde(default)]
    pub settings: toml::Table,
}

impl PluginSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: None,
            settings: toml::Table::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_setting(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.settings.insert(key.to_string(), value.into());
        self
    }

    pub fn instance_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.kind)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: LogFormat,
    /// Highest leveled-log verbosity that is emitted
    pub verbosity: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            verbosity: 2,
        }
    }
}
