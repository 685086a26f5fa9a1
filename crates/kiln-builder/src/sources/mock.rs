// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock image client for testing.
//!
//! Records every call and succeeds unless configured otherwise, so executor
//! tests can assert the exact pull/tag/push sequence without a docker daemon.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::image::{ImageBuildOptions, ImageClient, ImageError, ImageMetadata, RegistryAuth};
use crate::event::{Logger, attrs};

/// One call observed by [`MockImageClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageCall {
    /// `pull(image)`, with whether credentials were supplied.
    Pull {
        /// Image reference.
        image: String,
        /// Credentials were passed.
        authenticated: bool,
    },
    /// `tag(source, target)`.
    Tag {
        /// Source reference.
        source: String,
        /// Target reference.
        target: String,
    },
    /// `push(image)`, with whether credentials were supplied.
    Push {
        /// Image reference.
        image: String,
        /// Credentials were passed.
        authenticated: bool,
    },
    /// `build(options)`.
    Build {
        /// Tag of the built image.
        tag: String,
        /// Build context.
        context: String,
        /// `--no-cache` requested.
        no_cache: bool,
    },
    /// `inspect(image)`.
    Inspect {
        /// Image reference.
        image: String,
    },
}

#[derive(Default)]
struct MockState {
    calls: Vec<ImageCall>,
    fail_all: bool,
    fail_operations: HashSet<&'static str>,
    missing_images: HashSet<String>,
    metadata: HashMap<String, ImageMetadata>,
    delays: HashMap<&'static str, Duration>,
}

/// Recording [`ImageClient`].
#[derive(Clone, Default)]
pub struct MockImageClient {
    state: Arc<Mutex<MockState>>,
}

impl MockImageClient {
    /// Client whose operations all succeed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Client whose operations all fail.
    pub fn failing() -> Self {
        let client = Self::default();
        client.with_state(|s| s.fail_all = true);
        client
    }

    /// Make one operation (`pull`, `tag`, `push`, `build`, `inspect`) fail.
    pub fn fail_operation(self, operation: &'static str) -> Self {
        self.with_state(|s| {
            s.fail_operations.insert(operation);
        });
        self
    }

    /// Make one operation take `delay` before it completes.
    pub fn delay_operation(self, operation: &'static str, delay: Duration) -> Self {
        self.with_state(|s| {
            s.delays.insert(operation, delay);
        });
        self
    }

    /// Report `image` as not existing on pull and inspect.
    pub fn with_missing_image(self, image: impl Into<String>) -> Self {
        let image = image.into();
        self.with_state(|s| {
            s.missing_images.insert(image);
        });
        self
    }

    /// Metadata returned by `inspect(image)`.
    pub fn with_metadata(self, image: impl Into<String>, metadata: ImageMetadata) -> Self {
        let image = image.into();
        self.with_state(|s| {
            s.metadata.insert(image, metadata);
        });
        self
    }

    /// Calls observed so far, in order.
    pub fn calls(&self) -> Vec<ImageCall> {
        self.state
            .lock()
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }

    /// Number of calls of one operation.
    pub fn count(&self, operation: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| operation_of(c) == operation)
            .count()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> Option<R> {
        self.state.lock().ok().map(|mut s| f(&mut s))
    }

    async fn pause(&self, operation: &'static str) {
        if let Some(delay) = self.with_state(|s| s.delays.get(operation).copied()).flatten() {
            tokio::time::sleep(delay).await;
        }
    }

    fn record(&self, call: ImageCall) -> Result<(), ImageError> {
        let operation = operation_of(&call);
        let image = match &call {
            ImageCall::Pull { image, .. }
            | ImageCall::Push { image, .. }
            | ImageCall::Inspect { image } => image.clone(),
            ImageCall::Tag { source, .. } => source.clone(),
            ImageCall::Build { tag, .. } => tag.clone(),
        };

        let outcome = self.with_state(|s| {
            s.calls.push(call);
            if matches!(operation, "pull" | "inspect") && s.missing_images.contains(&image) {
                return Err(ImageError::NotFound {
                    image: image.clone(),
                });
            }
            if s.fail_all || s.fail_operations.contains(operation) {
                return Err(ImageError::CommandFailed {
                    operation,
                    image: image.clone(),
                    exit_code: Some(1),
                    output: "mock failure".to_string(),
                });
            }
            Ok(())
        });
        outcome.unwrap_or(Ok(()))
    }
}

fn operation_of(call: &ImageCall) -> &'static str {
    match call {
        ImageCall::Pull { .. } => "pull",
        ImageCall::Tag { .. } => "tag",
        ImageCall::Push { .. } => "push",
        ImageCall::Build { .. } => "build",
        ImageCall::Inspect { .. } => "inspect",
    }
}

#[async_trait]
impl ImageClient for MockImageClient {
    async fn pull(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
        logger: &dyn Logger,
        _timeout: Duration,
    ) -> Result<(), ImageError> {
        logger.debug(&format!("Pulling {}", image), attrs([("step", "progress")]));
        self.pause("pull").await;
        self.record(ImageCall::Pull {
            image: image.to_string(),
            authenticated: auth.is_some(),
        })
    }

    async fn tag(&self, source: &str, target: &str) -> Result<(), ImageError> {
        self.pause("tag").await;
        self.record(ImageCall::Tag {
            source: source.to_string(),
            target: target.to_string(),
        })
    }

    async fn push(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
        logger: &dyn Logger,
        _timeout: Duration,
    ) -> Result<(), ImageError> {
        logger.debug(&format!("Pushing {}", image), attrs([("step", "progress")]));
        self.pause("push").await;
        self.record(ImageCall::Push {
            image: image.to_string(),
            authenticated: auth.is_some(),
        })
    }

    async fn build(
        &self,
        options: &ImageBuildOptions,
        _logger: &dyn Logger,
        _timeout: Duration,
    ) -> Result<(), ImageError> {
        self.pause("build").await;
        self.record(ImageCall::Build {
            tag: options.tag.clone(),
            context: options.context.to_string_lossy().into_owned(),
            no_cache: options.no_cache,
        })
    }

    async fn inspect(&self, image: &str) -> Result<ImageMetadata, ImageError> {
        self.pause("inspect").await;
        self.record(ImageCall::Inspect {
            image: image.to_string(),
        })?;
        Ok(self
            .with_state(|s| s.metadata.get(image).cloned())
            .flatten()
            .unwrap_or_default())
    }
}
