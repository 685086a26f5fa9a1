// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Child processes with streamed output and a hard time limit.

use std::collections::VecDeque;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::event::{Logger, attrs};

/// Lines of combined output kept for error messages.
const TAIL_LINES: usize = 20;

/// Result of a finished process.
#[derive(Debug)]
pub struct ProcessOutput {
    /// Exit status.
    pub status: ExitStatus,
    /// Everything written to stdout.
    pub stdout: String,
    /// Last lines of stdout and stderr, interleaved as read.
    pub tail: String,
}

/// Run `command` to completion.
///
/// `stdin` is written and closed before output is read. Every non-empty
/// output line is forwarded to `logger` at debug level with `step=progress`.
/// When `timeout` elapses the process is killed and an error of kind
/// [`io::ErrorKind::TimedOut`] is returned.
pub async fn run_streaming(
    command: &mut Command,
    stdin: Option<&[u8]>,
    logger: Option<&dyn Logger>,
    timeout: Duration,
) -> io::Result<ProcessOutput> {
    let mut child = command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input).await?;
        pipe.shutdown().await?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("stderr not captured"))?;

    let mut captured = String::new();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);

    let outcome = tokio::time::timeout(timeout, async {
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut out_open = true;
        let mut err_open = true;

        while out_open || err_open {
            let line = tokio::select! {
                line = out_lines.next_line(), if out_open => match line? {
                    Some(line) => {
                        captured.push_str(&line);
                        captured.push('\n');
                        line
                    }
                    None => {
                        out_open = false;
                        continue;
                    }
                },
                line = err_lines.next_line(), if err_open => match line? {
                    Some(line) => line,
                    None => {
                        err_open = false;
                        continue;
                    }
                },
            };

            if let Some(logger) = logger
                && !line.trim().is_empty()
            {
                logger.debug(line.trim(), attrs([("step", "progress")]));
            }
            if tail.len() == TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        child.wait().await
    })
    .await;

    match outcome {
        Ok(status) => Ok(ProcessOutput {
            status: status?,
            stdout: captured,
            tail: Vec::from(tail).join("\n"),
        }),
        Err(_) => {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "Failed to kill timed out process");
            }
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("process did not finish within {}s", timeout.as_secs()),
            ))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::event::{EventLogManager, RecordingEventLogManager};

    #[tokio::test]
    async fn test_streams_both_pipes() {
        let events = RecordingEventLogManager::new();
        let logger = events.get_logger("e1");

        let output = run_streaming(
            Command::new("sh").arg("-c").arg("echo out; echo err >&2"),
            None,
            Some(logger.as_ref()),
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        assert!(output.status.success());
        assert_eq!(output.stdout, "out\n");
        assert!(output.tail.contains("err"));
        let messages: Vec<_> = events.entries().into_iter().map(|e| e.message).collect();
        assert!(messages.contains(&"out".to_string()));
        assert!(messages.contains(&"err".to_string()));
    }

    #[tokio::test]
    async fn test_stdin_is_delivered() {
        let output = run_streaming(
            &mut Command::new("cat"),
            Some(b"{\"event_id\":\"e1\"}"),
            None,
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(output.stdout.trim(), "{\"event_id\":\"e1\"}");
    }

    #[tokio::test]
    async fn test_timeout_kills() {
        let err = run_streaming(
            Command::new("sleep").arg("30"),
            None,
            None,
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
