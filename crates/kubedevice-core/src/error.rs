//! Error types for kubedevice

use thiserror::Error;

/// Main error type for kubedevice
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Hardware discovery or plugin construction failed
    #[error("Init error: {0}")]
    Init(String),

    /// Logical initialization of a constructed plugin failed
    #[error("Start error: {0}")]
    Start(String),

    /// Plugin could not determine its current capacity
    #[error("Report error: {0}")]
    Report(String),

    /// Plugin is not in the ready state
    #[error("Plugin not ready: {0}")]
    NotReady(String),

    /// Request cannot be satisfied from the available pool
    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    /// Conflicting configuration or allocation results
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A mutation would break used <= allocatable <= capacity
    #[error("Ledger invariant violated: {0}")]
    LedgerInvariant(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Node not found
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// No factory registered for a device kind
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for kubedevice operations
pub type DeviceResult<T> = Result<T, DeviceError>;

impl DeviceError {
    /// Errors that end a plugin's participation in node capacity.
    pub fn is_plugin_fatal(&self) -> bool {
        matches!(
            self,
            DeviceError::Init(_) | DeviceError::Start(_) | DeviceError::Report(_)
        )
    }

    /// Errors that reject a workload without indicating a system fault.
    pub fn is_admission_failure(&self) -> bool {
        matches!(self, DeviceError::InsufficientResources(_))
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(err: serde_json::Error) -> Self {
        DeviceError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for DeviceError {
    fn from(err: toml::de::Error) -> Self {
        DeviceError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeviceError::InsufficientResources("gpu: requested 3, available 2".to_string());
        assert_eq!(
            err.to_string(),
            "Insufficient resources: gpu: requested 3, available 2"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DeviceError = io_err.into();
        assert!(matches!(err, DeviceError::Io(_)));
    }

    #[test]
    fn test_error_classification() {
        assert!(DeviceError::Init("no driver".into()).is_plugin_fatal());
        assert!(DeviceError::Report("sysfs gone".into()).is_plugin_fatal());
        assert!(!DeviceError::LedgerInvariant("x".into()).is_plugin_fatal());
        assert!(DeviceError::InsufficientResources("x".into()).is_admission_failure());
        assert!(!DeviceError::Conflict("x".into()).is_admission_failure());
    }
}
