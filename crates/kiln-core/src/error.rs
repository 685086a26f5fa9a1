// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for kiln-core.
//!
//! "Not found" conditions are dedicated variants so callers can branch
//! create-vs-update without inspecting messages.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors returned by the persistence layer.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// No build-version row exists for the given identity.
    BuildVersionNotFound {
        /// Plugin (or service) ID.
        plugin_id: String,
        /// Version ID.
        version_id: String,
    },

    /// No service event exists with the given ID.
    ServiceEventNotFound {
        /// The event ID that was not found.
        event_id: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BuildVersionNotFound { .. } => "BUILD_VERSION_NOT_FOUND",
            Self::ServiceEventNotFound { .. } => "SERVICE_EVENT_NOT_FOUND",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// True for any "record does not exist" variant.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BuildVersionNotFound { .. } | Self::ServiceEventNotFound { .. }
        )
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BuildVersionNotFound {
                plugin_id,
                version_id,
            } => {
                write!(
                    f,
                    "Build version '{}' not found for plugin '{}'",
                    version_id, plugin_id
                )
            }
            Self::ServiceEventNotFound { event_id } => {
                write!(f, "Service event '{}' not found", event_id)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases = vec![
            (
                CoreError::BuildVersionNotFound {
                    plugin_id: "p".to_string(),
                    version_id: "v".to_string(),
                },
                "BUILD_VERSION_NOT_FOUND",
            ),
            (
                CoreError::ServiceEventNotFound {
                    event_id: "e".to_string(),
                },
                "SERVICE_EVENT_NOT_FOUND",
            ),
            (
                CoreError::ValidationError {
                    field: "plugin_id".to_string(),
                    message: "empty".to_string(),
                },
                "VALIDATION_ERROR",
            ),
            (
                CoreError::DatabaseError {
                    operation: "insert".to_string(),
                    details: "connection refused".to_string(),
                },
                "DATABASE_ERROR",
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.error_code(), expected);
        }
    }

    #[test]
    fn test_not_found_is_distinguishable() {
        let missing = CoreError::BuildVersionNotFound {
            plugin_id: "plugin-1".to_string(),
            version_id: "v1".to_string(),
        };
        assert!(missing.is_not_found());
        assert_eq!(
            missing.to_string(),
            "Build version 'v1' not found for plugin 'plugin-1'"
        );

        let db = CoreError::DatabaseError {
            operation: "query".to_string(),
            details: "boom".to_string(),
        };
        assert!(!db.is_not_found());
    }

    #[test]
    fn test_from_sqlx_error() {
        let err: CoreError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.error_code(), "DATABASE_ERROR");
    }
}
