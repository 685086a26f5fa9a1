// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for kiln-builder.
//!
//! [`BuilderRuntime`] wires the dispatcher, the Redis queue consumer and the
//! checkout cleanup worker together so the builder can run inside an existing
//! tokio application as well as from the `kiln-builder` binary.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kiln_builder::callback::HttpUpgradeClient;
//! use kiln_builder::queue::QueueConsumerConfig;
//! use kiln_builder::runtime::BuilderRuntime;
//! use kiln_core::persistence::SqlitePersistence;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqlitePersistence::connect("sqlite:kiln.db", 5).await?);
//!     let callback = Arc::new(HttpUpgradeClient::new("http://127.0.0.1:8888", None)?);
//!
//!     let runtime = BuilderRuntime::builder()
//!         .persistence(store)
//!         .callback(callback)
//!         .queue(QueueConsumerConfig::default())
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use kiln_core::persistence::Persistence;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::callback::UpgradeCallback;
use crate::cleanup_worker::{CleanupWorker, CleanupWorkerConfig};
use crate::config::BuildSettings;
use crate::context::BuildContext;
use crate::dispatcher::Dispatcher;
use crate::event::{EventLogManager, PersistedEventLogManager};
use crate::queue::{QueueConsumer, QueueConsumerConfig};
use crate::sources::{DockerCli, ImageClient};

/// Builder for creating a [`BuilderRuntime`].
pub struct BuilderRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    events: Option<Arc<dyn EventLogManager>>,
    images: Option<Arc<dyn ImageClient>>,
    callback: Option<Arc<dyn UpgradeCallback>>,
    settings: BuildSettings,
    queue: Option<QueueConsumerConfig>,
    cleanup_poll_interval: Duration,
    cleanup_max_age: Duration,
}

impl Default for BuilderRuntimeBuilder {
    fn default() -> Self {
        let cleanup = CleanupWorkerConfig::default();
        Self {
            persistence: None,
            events: None,
            images: None,
            callback: None,
            settings: BuildSettings::default(),
            queue: None,
            cleanup_poll_interval: cleanup.poll_interval,
            cleanup_max_age: cleanup.max_age,
        }
    }
}

impl BuilderRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the build store (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the event log manager.
    ///
    /// Default: a [`PersistedEventLogManager`] writing into the build store.
    pub fn events(mut self, events: Arc<dyn EventLogManager>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the image client.
    ///
    /// Default: [`DockerCli`] using `docker` from `PATH`
    pub fn images(mut self, images: Arc<dyn ImageClient>) -> Self {
        self.images = Some(images);
        self
    }

    /// Set the upgrade callback client (required).
    pub fn callback(mut self, callback: Arc<dyn UpgradeCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Set the pipeline settings.
    ///
    /// Default: [`BuildSettings::default()`]
    pub fn settings(mut self, settings: BuildSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Consume tasks from a Redis list.
    ///
    /// Default: no consumer; tasks are submitted through
    /// [`BuilderRuntime::dispatcher`] only.
    pub fn queue(mut self, config: QueueConsumerConfig) -> Self {
        self.queue = Some(config);
        self
    }

    /// Set the cleanup worker poll interval.
    ///
    /// Default: 1 hour
    pub fn cleanup_poll_interval(mut self, interval: Duration) -> Self {
        self.cleanup_poll_interval = interval;
        self
    }

    /// Set the maximum age of a checkout before cleanup.
    ///
    /// Default: 6 hours
    pub fn cleanup_max_age(mut self, max_age: Duration) -> Self {
        self.cleanup_max_age = max_age;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<BuilderRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let callback = self
            .callback
            .ok_or_else(|| anyhow::anyhow!("callback is required"))?;

        Ok(BuilderRuntimeConfig {
            persistence,
            events: self.events,
            images: self.images.unwrap_or_else(|| Arc::new(DockerCli::default())),
            callback,
            settings: self.settings,
            queue: self.queue,
            cleanup_poll_interval: self.cleanup_poll_interval,
            cleanup_max_age: self.cleanup_max_age,
        })
    }
}

/// Configuration for a [`BuilderRuntime`].
pub struct BuilderRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    events: Option<Arc<dyn EventLogManager>>,
    images: Arc<dyn ImageClient>,
    callback: Arc<dyn UpgradeCallback>,
    settings: BuildSettings,
    queue: Option<QueueConsumerConfig>,
    cleanup_poll_interval: Duration,
    cleanup_max_age: Duration,
}

impl BuilderRuntimeConfig {
    /// Start the runtime, spawning the queue consumer and cleanup worker.
    pub async fn start(self) -> Result<BuilderRuntime> {
        let (events, persisted): (Arc<dyn EventLogManager>, _) = match self.events {
            Some(events) => (events, None),
            None => {
                let persisted = Arc::new(PersistedEventLogManager::new(self.persistence.clone()));
                (persisted.clone(), Some(persisted))
            }
        };

        let cache_dir = self.settings.cache_dir.clone();
        let ctx = Arc::new(BuildContext::new(
            self.settings,
            self.persistence,
            events,
            self.images,
            self.callback,
        ));
        let workdirs = ctx.workdirs.clone();
        let dispatcher = Arc::new(Dispatcher::new(ctx));

        // Create cleanup worker
        let cleanup_worker = CleanupWorker::new(
            CleanupWorkerConfig {
                cache_dir: cache_dir.clone(),
                poll_interval: self.cleanup_poll_interval,
                max_age: self.cleanup_max_age,
            },
            workdirs,
        );
        let cleanup_shutdown = cleanup_worker.shutdown_handle();
        let cleanup_handle = tokio::spawn(async move {
            cleanup_worker.run().await;
        });

        // Create queue consumer
        let (queue_handle, queue_shutdown) = match self.queue {
            Some(config) => {
                let queue = config.queue_key.clone();
                let consumer = QueueConsumer::new(config, dispatcher.clone());
                let shutdown = consumer.shutdown_handle();
                let handle = tokio::spawn(async move {
                    if let Err(e) = consumer.run().await {
                        error!(queue = %queue, error = %e, "Queue consumer failed");
                    }
                });
                (Some(handle), Some(shutdown))
            }
            None => (None, None),
        };

        info!(
            cache_dir = %cache_dir.display(),
            queue = queue_handle.is_some(),
            "BuilderRuntime started"
        );

        Ok(BuilderRuntime {
            dispatcher,
            persisted_events: persisted,
            queue_handle,
            queue_shutdown,
            cleanup_handle,
            cleanup_shutdown,
        })
    }
}

/// A running builder.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct BuilderRuntime {
    dispatcher: Arc<Dispatcher>,
    persisted_events: Option<Arc<PersistedEventLogManager>>,
    queue_handle: Option<JoinHandle<()>>,
    queue_shutdown: Option<Arc<Notify>>,
    cleanup_handle: JoinHandle<()>,
    cleanup_shutdown: Arc<Notify>,
}

impl BuilderRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> BuilderRuntimeBuilder {
        BuilderRuntimeBuilder::new()
    }

    /// The dispatcher tasks are submitted to.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops consuming the queue, waits for admitted tasks to finish, stops
    /// the cleanup worker and flushes pending event log entries.
    pub async fn shutdown(self) -> Result<()> {
        info!("BuilderRuntime shutting down...");

        // Stop taking tasks off the queue
        if let Some(shutdown) = &self.queue_shutdown {
            shutdown.notify_one();
        }
        if let Some(handle) = self.queue_handle
            && let Err(e) = handle.await
        {
            error!("Queue consumer task panicked: {}", e);
        }

        // Let admitted tasks finish
        self.dispatcher.shutdown().await;

        // Signal cleanup worker shutdown
        self.cleanup_shutdown.notify_one();
        if let Err(e) = self.cleanup_handle.await {
            error!("Cleanup worker task panicked: {}", e);
        }

        if let Some(events) = &self.persisted_events {
            events.flush().await;
        }

        info!("BuilderRuntime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        let queue_running = self.queue_handle.as_ref().is_none_or(|h| !h.is_finished());
        self.dispatcher.is_accepting() && !self.cleanup_handle.is_finished() && queue_running
    }
}
