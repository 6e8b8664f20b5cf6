//! Error types for utterflow.
//!
//! Only programmer and configuration errors live here. Contention, staleness,
//! cancellation and timeouts are expressed as typed outcomes by the subsystem
//! that produces them.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // GPU arbitration errors
    #[error("Unknown GPU key: {gpu_key}")]
    UnknownGpuKey { gpu_key: String },

    // Collaborator failures
    #[error("Secondary decode failed: {message}")]
    SecondaryDecode { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_file_not_found_display() {
        let error = OrchestratorError::ConfigFileNotFound {
            path: "/path/to/utterflow.toml".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Configuration file not found at /path/to/utterflow.toml"
        );
    }

    #[test]
    fn test_config_invalid_value_display() {
        let error = OrchestratorError::ConfigInvalidValue {
            key: "gpu.default_queue_limit".to_string(),
            message: "must be positive".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid configuration value for gpu.default_queue_limit: must be positive"
        );
    }

    #[test]
    fn test_unknown_gpu_key_display() {
        let error = OrchestratorError::UnknownGpuKey {
            gpu_key: "gpu:7".to_string(),
        };
        assert_eq!(error.to_string(), "Unknown GPU key: gpu:7");
    }

    #[test]
    fn test_secondary_decode_display() {
        let error = OrchestratorError::SecondaryDecode {
            message: "model not loaded".to_string(),
        };
        assert_eq!(error.to_string(), "Secondary decode failed: model not loaded");
    }

    #[test]
    fn test_other_display() {
        let error = OrchestratorError::Other("unexpected error".to_string());
        assert_eq!(error.to_string(), "unexpected error");
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: OrchestratorError = io_error.into();
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_toml_error() {
        let toml_error = toml::from_str::<toml::Value>("invalid = toml = syntax").unwrap_err();
        let error: OrchestratorError = toml_error.into();
        assert!(error.to_string().contains("Configuration error"));

        let error_trait: &dyn std::error::Error = &error;
        assert!(error_trait.source().is_some());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<OrchestratorError>();
        assert_sync::<OrchestratorError>();
    }
}
