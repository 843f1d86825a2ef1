#![forbid(unsafe_code)]

//! Errors returned synchronously by the operation registry.

use std::fmt;

use pfe_core::config::ConfigError;

use crate::operation::OperationId;

/// Errors that can occur when starting operations or building a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The requested id is already in use (or was used before).
    DuplicateOperationId(OperationId),
    /// The parent id is unknown, purged, or no longer running.
    ParentNotFound(OperationId),
    /// Environment configuration could not be loaded.
    Config(ConfigError),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateOperationId(id) => write!(f, "duplicate operation id: {id}"),
            RegistryError::ParentNotFound(id) => {
                write!(f, "no running parent operation with id {id}")
            }
            RegistryError::Config(e) => write!(f, "configuration error: {e}"),
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistryError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for RegistryError {
    fn from(e: ConfigError) -> Self {
        RegistryError::Config(e)
    }
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn display_messages() {
        assert_eq!(
            RegistryError::DuplicateOperationId("op-1".into()).to_string(),
            "duplicate operation id: op-1"
        );
        assert_eq!(
            RegistryError::ParentNotFound("p".into()).to_string(),
            "no running parent operation with id p"
        );
    }

    #[test]
    fn config_error_is_source() {
        let err: RegistryError = ConfigError::InvalidValue {
            key: "K".into(),
            value: "v".into(),
        }
        .into();
        assert!(err.source().is_some());
        assert!(RegistryError::ParentNotFound("x".into()).source().is_none());
    }
}
