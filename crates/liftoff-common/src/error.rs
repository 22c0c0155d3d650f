//! Error types shared across the liftoff workspace.
//!
//! - [`ConfigError`]: Profile selection and configuration loading failures
//! - [`SupportError`]: Failures while building cache, limiter or reporter

use thiserror::Error;

/// Configuration errors.
///
/// Every variant is fatal at startup: the process never serves traffic with
/// a configuration it could not load.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The environment discriminator names no known profile.
    #[error("Unknown configuration profile '{name}' (expected dev, prod or test)")]
    UnknownProfile {
        /// The rejected discriminator.
        name: String,
    },

    /// A configuration source could not be read or deserialized.
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// The loaded values violate a constraint.
    #[error("Invalid configuration: {reason}")]
    Invalid {
        /// Description of the violated constraint.
        reason: String,
    },

    /// No option exists under the requested name.
    #[error("Configuration key not found: {key}")]
    MissingKey {
        /// The dotted option name.
        key: String,
    },

    /// The option exists but has a different type.
    #[error("Configuration key '{key}' has an unexpected type: {message}")]
    Type {
        /// The dotted option name.
        key: String,
        /// Conversion failure description.
        message: String,
    },
}

impl ConfigError {
    /// Create a new `Invalid` error.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }
}

/// Errors raised while initializing support services.
#[derive(Error, Debug)]
pub enum SupportError {
    /// Reporting is enabled but no DSN was configured.
    #[error("Error reporting is enabled but reporting.dsn is not set")]
    MissingDsn,

    /// The configured DSN is not a valid URL.
    #[error("Invalid reporting DSN '{dsn}': {reason}")]
    InvalidDsn {
        /// The rejected DSN.
        dsn: String,
        /// Parse failure description.
        reason: String,
    },

    /// The outbound HTTP client could not be built.
    #[error("Failed to build HTTP client: {reason}")]
    HttpClient {
        /// Description of the failure.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigError::UnknownProfile {
            name: "bogus".into(),
        };
        assert_eq!(
            err.to_string(),
            "Unknown configuration profile 'bogus' (expected dev, prod or test)"
        );

        let err = ConfigError::invalid("tasks.workers must be at least 1");
        assert_eq!(
            err.to_string(),
            "Invalid configuration: tasks.workers must be at least 1"
        );
    }

    #[test]
    fn test_support_error_display() {
        assert_eq!(
            SupportError::MissingDsn.to_string(),
            "Error reporting is enabled but reporting.dsn is not set"
        );
    }
}
