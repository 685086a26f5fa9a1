// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task dispatcher.
//!
//! [`Dispatcher::dispatch`] decodes a task, opens its event logger and hands
//! the work to a bounded pool, returning as soon as the task is admitted.
//! Only an unknown task type or an undecodable body fail synchronously.
//!
//! ```text
//! dispatch(type, body)
//!   ├─ decode ──────────────► Err(UnsupportedTaskType | Validation)
//!   ├─ get_logger(event_id)
//!   ├─ spawn event timeout watcher
//!   └─ spawn task ─► admit ─► spawn building timeout watcher (plugin builds)
//!                      └─► acquire permit ─► prepare ─► attempt x N ─► on_success / on_failure
//!                                                                         └─ release_logger
//! ```
//!
//! Admission writes the plugin version row as `building` before the task
//! waits for a pool slot, so the building timeout counts from admission and
//! covers time spent queued behind other tasks.
//!
//! The watchers share nothing with the task but the store; their writes are
//! conditional, so whichever side finishes first decides the status.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::BuildSettings;
use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::event::{Logger, LoggerLease, attrs};
use crate::executor;
use crate::task::{BuildTask, PluginBuildTask, TaskType};
use crate::watcher;

/// How often, and how far apart, a task is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// A single attempt.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }

    /// Run `attempt` until it succeeds, fails with a non-retryable error, or
    /// the attempts are used up. The attempt number (from 1) is passed in.
    ///
    /// Every failure that is followed by another attempt is logged with
    /// `step=builder-exector, status=failure`.
    pub async fn run<T, F, Fut>(&self, name: &str, logger: &dyn Logger, mut attempt: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut number = 1;
        loop {
            match attempt(number).await {
                Ok(value) => return Ok(value),
                Err(e) if number < max_attempts && e.is_retryable() => {
                    warn!(task = name, attempt = number, error = %e, "Attempt failed, retrying");
                    logger.error(
                        &format!("{} failed, retrying: {}", name, e),
                        attrs([("step", "builder-exector"), ("status", "failure")]),
                    );
                    if !self.delay.is_zero() {
                        tokio::time::sleep(self.delay).await;
                    }
                    number += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// One kind of task work.
///
/// [`execute`] drives the lifecycle: `prepare` once, `attempt` under the
/// retry policy, then exactly one of `on_success` / `on_failure`.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// What a successful attempt produces.
    type Output: Send;

    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Attempts allowed for this task.
    fn retry_policy(&self, settings: &BuildSettings) -> RetryPolicy {
        settings.retry.clone()
    }

    /// One-time setup before the first attempt.
    async fn prepare(&self, _ctx: &BuildContext, _logger: &Arc<dyn Logger>) -> Result<()> {
        Ok(())
    }

    /// One attempt.
    async fn attempt(
        &self,
        ctx: &BuildContext,
        logger: &Arc<dyn Logger>,
        attempt: u32,
    ) -> Result<Self::Output>;

    /// Record a successful outcome.
    async fn on_success(
        &self,
        ctx: &BuildContext,
        logger: &Arc<dyn Logger>,
        output: Self::Output,
    ) -> Result<()>;

    /// Record a terminal failure.
    async fn on_failure(&self, ctx: &BuildContext, logger: &Arc<dyn Logger>, error: &Error) -> Result<()>;
}

/// Run one executor to completion.
pub async fn execute<E: TaskExecutor>(
    executor: &E,
    ctx: &BuildContext,
    logger: &Arc<dyn Logger>,
) -> Result<()> {
    let outcome = match executor.prepare(ctx, logger).await {
        Ok(()) => {
            executor
                .retry_policy(&ctx.settings)
                .run(executor.name(), logger.as_ref(), |n| executor.attempt(ctx, logger, n))
                .await
        }
        Err(e) => Err(e),
    };

    match outcome {
        Ok(output) => executor.on_success(ctx, logger, output).await,
        Err(e) => {
            logger.error(
                &format!("{} failed: {}", executor.name(), e),
                attrs([("step", "callback"), ("status", "failure")]),
            );
            if let Err(record) = executor.on_failure(ctx, logger, &e).await {
                warn!(task = executor.name(), error = %record, "Failed to record task failure");
            }
            Err(e)
        }
    }
}

/// A task admitted by the dispatcher and not finished yet.
#[derive(Debug, Clone)]
pub struct RunningTask {
    /// Dispatcher-assigned ID.
    pub task_id: String,
    /// Task type.
    pub task_type: TaskType,
    /// Correlation ID.
    pub event_id: String,
    /// When the task was admitted.
    pub accepted_at: DateTime<Utc>,
}

/// Removes a task from the running table when the task ends, however it ends.
struct RunningGuard {
    running: Arc<DashMap<String, RunningTask>>,
    task_id: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.remove(&self.task_id);
    }
}

/// Admits tasks and runs them on a bounded pool.
pub struct Dispatcher {
    ctx: Arc<BuildContext>,
    permits: Arc<Semaphore>,
    running: Arc<DashMap<String, RunningTask>>,
    tasks: TaskTracker,
    watchers: TaskTracker,
    cancel_watchers: CancellationToken,
    accepting: AtomicBool,
}

impl Dispatcher {
    /// Dispatcher running at most `settings.max_concurrent_tasks` tasks at once.
    pub fn new(ctx: Arc<BuildContext>) -> Self {
        let permits = ctx.settings.max_concurrent_tasks.max(1);
        Self {
            ctx,
            permits: Arc::new(Semaphore::new(permits)),
            running: Arc::new(DashMap::new()),
            tasks: TaskTracker::new(),
            watchers: TaskTracker::new(),
            cancel_watchers: CancellationToken::new(),
            accepting: AtomicBool::new(true),
        }
    }

    /// Shared executor context.
    pub fn context(&self) -> &Arc<BuildContext> {
        &self.ctx
    }

    /// Decode and admit a task. Returns the assigned task ID.
    pub fn dispatch(&self, task_type: &str, body: &[u8]) -> Result<String> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let task = BuildTask::decode(task_type, body)?;
        self.submit(task)
    }

    /// Admit an already decoded task. Returns the assigned task ID.
    pub fn submit(&self, task: BuildTask) -> Result<String> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let task_id = uuid::Uuid::new_v4().to_string();
        let task_type = task.task_type();
        let event_id = task.event_id().to_string();

        let lease = LoggerLease::acquire(self.ctx.events.clone(), &event_id);
        self.spawn_event_watcher(&event_id);

        self.running.insert(
            task_id.clone(),
            RunningTask {
                task_id: task_id.clone(),
                task_type,
                event_id: event_id.clone(),
                accepted_at: Utc::now(),
            },
        );
        let guard = RunningGuard {
            running: self.running.clone(),
            task_id: task_id.clone(),
        };

        info!(task_id = %task_id, task_type = %task_type, event_id = %event_id, "Task accepted");

        let ctx = self.ctx.clone();
        let permits = self.permits.clone();
        let watchers = self.watchers.clone();
        let cancel = self.cancel_watchers.clone();
        let id = task_id.clone();
        self.tasks.spawn(async move {
            let _guard = guard;
            let logger = lease.logger();

            if let Err(e) = executor::admit(&task, &ctx, logger.as_ref()).await {
                warn!(task_id = %id, task_type = %task_type, error = %e, "Task admission failed");
                logger.error(
                    &format!("{} failed: {}", task_type, e),
                    attrs([("step", "callback"), ("status", "failure")]),
                );
                return;
            }
            if let Some(plugin) = task.plugin_build() {
                spawn_building_watcher(&watchers, cancel, &ctx, &event_id, plugin);
            }

            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(task_id = %id, "Task pool closed before the task could start");
                    return;
                }
            };

            match executor::run(task, &ctx, &logger).await {
                Ok(()) => info!(task_id = %id, task_type = %task_type, "Task finished"),
                Err(e) => warn!(task_id = %id, task_type = %task_type, error = %e, "Task failed"),
            }
            // The lease drops here and releases the logger.
        });

        Ok(task_id)
    }

    fn spawn_event_watcher(&self, event_id: &str) {
        let settings = &self.ctx.settings;
        let store = self.ctx.store.clone();
        let cancel = self.cancel_watchers.clone();
        let event_id = event_id.to_string();
        let deadlines = watcher::EventDeadlines {
            build: settings.build_event_timeout,
            other: settings.event_timeout,
        };
        self.watchers.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = watcher::watch_event_timeout(store, &event_id, deadlines) => {}
            }
        });
    }

    /// Tasks admitted and not yet finished.
    pub fn running_tasks(&self) -> Vec<RunningTask> {
        self.running.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Whether new tasks are admitted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Stop admitting tasks, wait for admitted ones, then stop the watchers.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        info!(running = self.running.len(), "Dispatcher shutting down");

        self.tasks.close();
        self.tasks.wait().await;

        self.cancel_watchers.cancel();
        self.watchers.close();
        self.watchers.wait().await;

        info!("Dispatcher stopped");
    }
}

/// Start the building timeout of a registered plugin version.
fn spawn_building_watcher(
    watchers: &TaskTracker,
    cancel: CancellationToken,
    ctx: &BuildContext,
    event_id: &str,
    plugin: &PluginBuildTask,
) {
    let store = ctx.store.clone();
    let events = ctx.events.clone();
    let plugin_id = plugin.plugin_id.clone();
    let version_id = plugin.version_id.clone();
    let event_id = event_id.to_string();
    let after = ctx.settings.building_timeout;
    watchers.spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(plugin_id = %plugin_id, version_id = %version_id, "Building timeout watcher cancelled");
            }
            _ = watcher::watch_building_timeout(store, events, &event_id, &plugin_id, &version_id, after) => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RecordingEventLogManager;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_retry_stops_on_success() {
        let events = RecordingEventLogManager::new();
        let logger = crate::event::EventLogManager::get_logger(&events, "e1");
        let calls = AtomicU32::new(0);

        let result = RetryPolicy::default()
            .run("build", logger.as_ref(), |n| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::Other("push failed".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(events.tagged("e1", "builder-exector", "failure").len(), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let events = RecordingEventLogManager::new();
        let logger = crate::event::EventLogManager::get_logger(&events, "e1");
        let calls = AtomicU32::new(0);

        let result: Result<()> = RetryPolicy::default()
            .run("build", logger.as_ref(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Other("push failed".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(events.tagged("e1", "builder-exector", "failure").len(), 2);
    }

    #[tokio::test]
    async fn test_validation_error_is_not_retried() {
        let events = RecordingEventLogManager::new();
        let logger = crate::event::EventLogManager::get_logger(&events, "e1");
        let calls = AtomicU32::new(0);

        let result: Result<()> = RetryPolicy::default()
            .run("build", logger.as_ref(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Validation("no Dockerfile".into())) }
            })
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_between_attempts() {
        let events = RecordingEventLogManager::new();
        let logger = crate::event::EventLogManager::get_logger(&events, "e1");
        let policy = RetryPolicy {
            max_attempts: 2,
            delay: Duration::from_secs(5),
        };
        let started = tokio::time::Instant::now();

        let _: Result<()> = policy
            .run("build", logger.as_ref(), |_| async { Err(Error::Other("x".into())) })
            .await;

        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[test]
    fn test_once_policy() {
        assert_eq!(RetryPolicy::once().max_attempts, 1);
        assert_eq!(RetryPolicy::default().max_attempts, 3);
    }
}
