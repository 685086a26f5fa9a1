// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis task queue consumer.
//!
//! Producers `LPUSH` JSON envelopes onto a list; the consumer `BRPOP`s them
//! one at a time and hands each to the [`Dispatcher`]. An envelope that
//! cannot be decoded, or names an unknown task type, is logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::task::TaskEnvelope;

/// Configuration for the queue consumer.
#[derive(Debug, Clone)]
pub struct QueueConsumerConfig {
    /// Redis URL.
    pub redis_url: String,
    /// List the envelopes are popped from.
    pub queue_key: String,
    /// How long one `BRPOP` blocks before the loop checks for shutdown again.
    pub block_timeout: Duration,
    /// Pause after a Redis error before popping again.
    pub retry_delay: Duration,
}

impl Default for QueueConsumerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            queue_key: "kiln:builder:tasks".to_string(),
            block_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Pops task envelopes and dispatches them.
pub struct QueueConsumer {
    config: QueueConsumerConfig,
    dispatcher: Arc<Dispatcher>,
    shutdown: Arc<Notify>,
}

impl QueueConsumer {
    /// Create a new consumer.
    pub fn new(config: QueueConsumerConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            dispatcher,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the consumer loop until shutdown is signalled.
    ///
    /// Fails only if the first connection cannot be established; later Redis
    /// errors are logged and the loop keeps going.
    pub async fn run(&self) -> Result<()> {
        let client = redis::Client::open(self.config.redis_url.as_str())?;
        let mut conn = ConnectionManager::new(client).await?;

        info!(
            queue = %self.config.queue_key,
            block_timeout_secs = self.config.block_timeout.as_secs(),
            "Queue consumer started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Queue consumer received shutdown signal");
                    break;
                }

                popped = self.pop(&mut conn) => match popped {
                    Ok(Some(raw)) => {
                        handle_message(&self.dispatcher, &raw);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(error = %e, "Failed to pop task from queue");
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        info!("Queue consumer stopped");
        Ok(())
    }

    async fn pop(&self, conn: &mut ConnectionManager) -> Result<Option<String>> {
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&self.config.queue_key)
            .arg(self.config.block_timeout.as_secs().max(1))
            .query_async(conn)
            .await?;
        Ok(popped.map(|(_, raw)| raw))
    }
}

/// Decode one envelope and dispatch it. Returns the task ID if admitted.
pub fn handle_message(dispatcher: &Dispatcher, raw: &str) -> Option<String> {
    let envelope = match TaskEnvelope::parse(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Dropping malformed task envelope");
            return None;
        }
    };
    let body = match envelope.body_bytes() {
        Ok(body) => body,
        Err(e) => {
            warn!(task_type = %envelope.task_type, error = %e, "Dropping task with unreadable body");
            return None;
        }
    };

    match dispatcher.dispatch(&envelope.task_type, &body) {
        Ok(task_id) => {
            debug!(
                task_id = %task_id,
                producer_task_id = ?envelope.task_id,
                task_type = %envelope.task_type,
                "Task dispatched from queue"
            );
            Some(task_id)
        }
        Err(Error::UnsupportedTaskType(task_type)) => {
            warn!(task_type = %task_type, "Dropping task of unsupported type");
            None
        }
        Err(e) => {
            warn!(task_type = %envelope.task_type, error = %e, "Dropping task that could not be dispatched");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::RecordingCallback;
    use crate::config::BuildSettings;
    use crate::executor::testing::harness;
    use crate::sources::MockImageClient;

    async fn dispatcher() -> Dispatcher {
        let h = harness(BuildSettings::default(), MockImageClient::new(), RecordingCallback::new()).await;
        Dispatcher::new(Arc::new(h.ctx))
    }

    #[test]
    fn test_config_default() {
        let config = QueueConsumerConfig::default();
        assert_eq!(config.queue_key, "kiln:builder:tasks");
        assert_eq!(config.block_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_dropped() {
        let dispatcher = dispatcher().await;
        assert!(handle_message(&dispatcher, "not json").is_none());
        assert!(dispatcher.running_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_type_is_dropped() {
        let dispatcher = dispatcher().await;
        let raw = r#"{"task_type":"deploy","task_body":{"event_id":"e1"}}"#;
        assert!(handle_message(&dispatcher, raw).is_none());
    }

    #[tokio::test]
    async fn test_valid_envelope_is_dispatched() {
        let dispatcher = dispatcher().await;
        let raw = r#"{
            "task_id": "q-1",
            "task_type": "service_check",
            "task_body": {
                "event_id": "e1",
                "check_uuid": "c1",
                "source_type": "docker-compose",
                "source_body": "services:\n  web:\n    image: nginx\n",
                "tenant_id": "t1"
            }
        }"#;

        assert!(handle_message(&dispatcher, raw).is_some());
        dispatcher.shutdown().await;
        assert!(dispatcher.running_tasks().is_empty());
    }
}
