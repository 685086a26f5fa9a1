// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for kiln-builder.

use thiserror::Error;

/// Builder errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Store operation failed.
    #[error("Store error: {0}")]
    Core(#[from] kiln_core::CoreError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Fetching source code failed.
    #[error("Source error: {0}")]
    Source(#[from] crate::sources::SourceError),

    /// Container image operation failed.
    #[error("Image error: {0}")]
    Image(#[from] crate::sources::ImageError),

    /// Queue operation failed.
    #[error("Queue error: {0}")]
    Queue(#[from] redis::RedisError),

    /// HTTP transport failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The task type string matched no known task.
    #[error("unsupported task type: {0}")]
    UnsupportedTaskType(String),

    /// Structural input problem that retrying cannot fix.
    #[error("Invalid task: {0}")]
    Validation(String),

    /// Compile script or produced artifact failed.
    #[error("Compile error: {0}")]
    Compile(String),

    /// Legacy task script failed.
    #[error("Script error: {0}")]
    Script(String),

    /// The upgrade callback was rejected.
    #[error("Upgrade callback failed: {0}")]
    Callback(String),

    /// The dispatcher no longer accepts tasks.
    #[error("Dispatcher is shutting down")]
    ShuttingDown,

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether another attempt of the same task could succeed.
    ///
    /// Malformed input, missing required files and unsupported types fail
    /// immediately.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Validation(_)
                | Self::UnsupportedTaskType(_)
                | Self::Json(_)
                | Self::Config(_)
                | Self::ShuttingDown
        )
    }
}

/// Result type using builder Error.
pub type Result<T> = std::result::Result<T, Error>;
