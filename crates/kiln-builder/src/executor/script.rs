// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Legacy task types handled by external plugin scripts.
//!
//! The script `<plugin_dir>/<name>.pyc` is run by the configured
//! interpreter with the task body on stdin. Its output is streamed into the
//! event log.
//!
//! | Task type | Script |
//! |-----------|--------|
//! | `app_image` | `app_image.pyc` |
//! | `app_slug` | `app_slug.pyc` |
//! | `app_build` | `build_work.pyc` |
//! | `code_check` | `code_check.pyc` |
//! | `image_manual` | `image_manual.pyc` |

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::config::BuildSettings;
use crate::context::BuildContext;
use crate::dispatcher::TaskExecutor;
use crate::error::{Error, Result};
use crate::event::{Logger, attrs};
use crate::process::run_streaming;
use crate::task::{ScriptTask, TaskType};

/// Executor of script tasks.
pub struct ScriptRun {
    task: ScriptTask,
}

impl ScriptRun {
    /// Executor for `task`.
    pub fn new(task: ScriptTask) -> Self {
        Self { task }
    }

    /// Script run for this task type.
    pub fn script_path(&self, settings: &BuildSettings) -> PathBuf {
        settings
            .plugin_dir
            .join(format!("{}.pyc", script_name(self.task.task_type)))
    }
}

fn script_name(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::AppBuild => "build_work",
        other => other.as_str(),
    }
}

#[async_trait]
impl TaskExecutor for ScriptRun {
    type Output = ();

    fn name(&self) -> &'static str {
        self.task.task_type.as_str()
    }

    async fn attempt(&self, ctx: &BuildContext, logger: &Arc<dyn Logger>, _attempt: u32) -> Result<()> {
        let settings = &ctx.settings;
        let script = self.script_path(settings);
        let body = serde_json::to_vec(&self.task.body)?;

        let mut command = Command::new(&settings.script_interpreter);
        command.arg(&script);
        let output = run_streaming(&mut command, Some(&body), Some(logger.as_ref()), settings.script_timeout)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::TimedOut => Error::Script(format!(
                    "{} did not finish within {}s",
                    script.display(),
                    settings.script_timeout.as_secs()
                )),
                _ => Error::Script(format!("cannot run {}: {}", script.display(), e)),
            })?;

        if !output.status.success() {
            return Err(Error::Script(format!(
                "{} exited with {:?}: {}",
                script.display(),
                output.status.code(),
                output.tail
            )));
        }
        info!(task_type = %self.task.task_type, event_id = %self.task.event_id, "Script task finished");
        Ok(())
    }

    async fn on_success(&self, _ctx: &BuildContext, logger: &Arc<dyn Logger>, _output: ()) -> Result<()> {
        logger.info(
            &format!("{} finished", self.task.task_type),
            attrs([("step", "last"), ("status", "success")]),
        );
        Ok(())
    }

    async fn on_failure(&self, _ctx: &BuildContext, _logger: &Arc<dyn Logger>, _error: &Error) -> Result<()> {
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::super::testing::harness;
    use super::*;
    use crate::callback::RecordingCallback;
    use crate::dispatcher::{RetryPolicy, execute};
    use crate::event::EventLogManager;
    use crate::sources::MockImageClient;
    use std::time::Duration;
    use tempfile::TempDir;

    fn settings(plugin_dir: &std::path::Path) -> BuildSettings {
        BuildSettings {
            plugin_dir: plugin_dir.to_path_buf(),
            script_interpreter: "sh".into(),
            retry: RetryPolicy::once(),
            script_timeout: Duration::from_secs(10),
            ..Default::default()
        }
    }

    fn task() -> ScriptTask {
        ScriptTask {
            task_type: TaskType::AppSlug,
            event_id: "e1".into(),
            body: serde_json::json!({"event_id": "e1", "service_id": "s1"}),
        }
    }

    #[tokio::test]
    async fn test_body_reaches_script_stdin() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("app_slug.pyc"), "cat\n").unwrap();
        let h = harness(settings(dir.path()), MockImageClient::new(), RecordingCallback::new()).await;
        let logger = h.events.get_logger("e1");

        execute(&ScriptRun::new(task()), &h.ctx, &logger).await.unwrap();

        let entries = h.events.entries_for("e1");
        assert!(entries.iter().any(|e| e.message.contains("\"service_id\":\"s1\"")));
        assert_eq!(h.events.tagged("e1", "last", "success").len(), 1);
    }

    #[tokio::test]
    async fn test_failing_script_is_script_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("app_slug.pyc"), "echo broken >&2\nexit 2\n").unwrap();
        let h = harness(settings(dir.path()), MockImageClient::new(), RecordingCallback::new()).await;
        let logger = h.events.get_logger("e1");

        let err = execute(&ScriptRun::new(task()), &h.ctx, &logger).await.unwrap_err();

        assert!(matches!(err, Error::Script(ref m) if m.contains("broken")));
        assert_eq!(h.events.tagged("e1", "callback", "failure").len(), 1);
    }

    #[tokio::test]
    async fn test_app_build_runs_build_work_script() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("build_work.pyc"), "echo built\n").unwrap();
        let h = harness(settings(dir.path()), MockImageClient::new(), RecordingCallback::new()).await;
        let logger = h.events.get_logger("e1");
        let mut task = task();
        task.task_type = TaskType::AppBuild;
        let run = ScriptRun::new(task);

        assert_eq!(run.script_path(&h.ctx.settings), dir.path().join("build_work.pyc"));
        execute(&run, &h.ctx, &logger).await.unwrap();

        assert!(h.events.entries_for("e1").iter().any(|e| e.message.contains("built")));
    }
}
