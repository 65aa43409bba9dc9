//! Error types for configuration management

use std::path::PathBuf;
use thiserror::Error;
use zfs_sync_types::Error as SyncError;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error when reading or writing a configuration file
    #[error("I/O error on config file '{path}': {source}")]
    Io {
        /// Path to the configuration file
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Configuration file parsing error
    #[error("Failed to parse config file '{path}': {message}")]
    Parse {
        /// Path to the configuration file
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    Validation {
        /// Validation error message
        message: String,
    },

    /// Missing required configuration
    #[error("Missing required configuration: {key}")]
    MissingRequired {
        /// Configuration key that is missing
        key: String,
    },

    /// Invalid configuration value
    #[error("Invalid value for '{key}': {message}")]
    InvalidValue {
        /// Configuration key
        key: String,
        /// Error message
        message: String,
    },

    /// Job name not present in the configuration
    #[error("Unknown job '{name}'")]
    UnknownJob {
        /// Requested job name
        name: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message
        message: String,
    },

    /// Generic configuration error
    #[error("Configuration error: {message}")]
    Other {
        /// Error message
        message: String,
    },
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(error: serde_yaml::Error) -> Self {
        Self::Serialization {
            message: error.to_string(),
        }
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(error: config::ConfigError) -> Self {
        Self::Other {
            message: error.to_string(),
        }
    }
}

impl From<ConfigError> for SyncError {
    fn from(error: ConfigError) -> Self {
        match error {
            ConfigError::Validation { .. }
            | ConfigError::MissingRequired { .. }
            | ConfigError::InvalidValue { .. }
            | ConfigError::UnknownJob { .. } => SyncError::validation(error.to_string()),
            other => SyncError::config(other.to_string()),
        }
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

impl ConfigError {
    /// Create a new validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a new missing required error
    pub fn missing_required<S: Into<String>>(key: S) -> Self {
        Self::MissingRequired { key: key.into() }
    }

    /// Create a new invalid value error
    pub fn invalid_value<K: Into<String>, S: Into<String>>(key: K, message: S) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a new other error
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zfs_sync_types::ErrorKind;

    #[test]
    fn test_missing_required_maps_to_validation() {
        let error: SyncError = ConfigError::missing_required("jobs.nightly.dest_dataset").into();

        assert_eq!(error.kind(), ErrorKind::Validation);
        assert!(error.to_string().contains("jobs.nightly.dest_dataset"));
    }

    #[test]
    fn test_parse_error_maps_to_config() {
        let error: SyncError = ConfigError::Parse {
            path: PathBuf::from("zfs-sync.yaml"),
            message: "bad indentation".to_string(),
        }
        .into();

        assert_eq!(error.kind(), ErrorKind::Config);
    }
}
