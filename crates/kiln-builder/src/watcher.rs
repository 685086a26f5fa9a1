// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deadline watchers.
//!
//! Both watchers sleep once and then attempt a conditional store update.
//! Neither cancels the work it watches.

use std::sync::Arc;
use std::time::Duration;

use kiln_core::persistence::Persistence;
use tracing::{debug, info, warn};

use crate::event::{EventLogManager, LoggerLease, attrs};

/// Flag a plugin build that is still `building` after `after`.
///
/// Returns true if this watcher moved the build to `timeout`. A failure entry
/// is written to the event log only in that case.
pub async fn watch_building_timeout(
    store: Arc<dyn Persistence>,
    events: Arc<dyn EventLogManager>,
    event_id: &str,
    plugin_id: &str,
    version_id: &str,
    after: Duration,
) -> bool {
    tokio::time::sleep(after).await;

    match store.mark_build_version_timeout(plugin_id, version_id).await {
        Ok(true) => {
            info!(plugin_id, version_id, "Plugin build timed out");
            let lease = LoggerLease::acquire(events, event_id);
            lease.logger().error(
                &format!("Build timed out after {}s", after.as_secs()),
                attrs([("step", "callback"), ("status", "failure")]),
            );
            true
        }
        Ok(false) => {
            debug!(plugin_id, version_id, "Plugin build finished before its deadline");
            false
        }
        Err(e) => {
            warn!(plugin_id, version_id, error = %e, "Failed to check plugin build deadline");
            false
        }
    }
}

/// Deadlines of the event timeout watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDeadlines {
    /// Events whose operation type starts with `build`.
    pub build: Duration,
    /// Every other event.
    pub other: Duration,
}

impl Default for EventDeadlines {
    fn default() -> Self {
        Self {
            build: Duration::from_secs(180),
            other: Duration::from_secs(30),
        }
    }
}

impl EventDeadlines {
    /// Deadline of an operation type.
    pub fn for_operation(&self, opt_type: &str) -> Duration {
        if opt_type.starts_with("build") {
            self.build
        } else {
            self.other
        }
    }
}

/// Mark the event `timeout` if it is still in flight after its deadline.
///
/// Events that do not exist are ignored. Returns true if this watcher set the
/// terminal status.
pub async fn watch_event_timeout(store: Arc<dyn Persistence>, event_id: &str, deadlines: EventDeadlines) -> bool {
    let event = match store.get_service_event(event_id).await {
        Ok(event) => event,
        Err(e) if e.is_not_found() => {
            debug!(event_id, "No service event to watch");
            return false;
        }
        Err(e) => {
            warn!(event_id, error = %e, "Failed to load service event");
            return false;
        }
    };
    if !event.is_in_flight() {
        return false;
    }

    tokio::time::sleep(deadlines.for_operation(&event.opt_type)).await;

    match store.mark_service_event_timeout(event_id).await {
        Ok(true) => {
            info!(event_id, opt_type = %event.opt_type, "Service event timed out");
            true
        }
        Ok(false) => false,
        Err(e) => {
            warn!(event_id, error = %e, "Failed to mark service event timeout");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RecordingEventLogManager;
    use kiln_core::persistence::{BuildKind, BuildStatus, BuildVersionRecord, ServiceEventRecord, SqlitePersistence};

    async fn store() -> Arc<dyn Persistence> {
        Arc::new(SqlitePersistence::in_memory().await.unwrap())
    }

    #[test]
    fn test_deadline_by_operation() {
        let deadlines = EventDeadlines::default();
        assert_eq!(deadlines.for_operation("build-service"), Duration::from_secs(180));
        assert_eq!(deadlines.for_operation("upgrade"), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_building_version_times_out() {
        let store = store().await;
        let events = RecordingEventLogManager::new();
        store
            .upsert_build_version(&BuildVersionRecord::new("p1", "v1", BuildKind::Image))
            .await
            .unwrap();

        let flagged =
            watch_building_timeout(store.clone(), Arc::new(events.clone()), "e1", "p1", "v1", Duration::from_millis(10))
                .await;

        assert!(flagged);
        let record = store.get_build_version("p1", "v1").await.unwrap();
        assert_eq!(record.build_status(), Some(BuildStatus::Timeout));
        assert_eq!(events.tagged("e1", "callback", "failure").len(), 1);
        assert_eq!(events.acquired(), events.released());
    }

    #[tokio::test]
    async fn test_finished_version_is_left_alone() {
        let store = store().await;
        let events = RecordingEventLogManager::new();
        store
            .upsert_build_version(&BuildVersionRecord::new("p1", "v1", BuildKind::Image))
            .await
            .unwrap();
        store
            .finish_build_version("p1", "v1", BuildStatus::Complete, Some("goodrain.me/nginx:1_p1"))
            .await
            .unwrap();

        let flagged =
            watch_building_timeout(store.clone(), Arc::new(events.clone()), "e1", "p1", "v1", Duration::from_millis(10))
                .await;

        assert!(!flagged);
        let record = store.get_build_version("p1", "v1").await.unwrap();
        assert_eq!(record.build_status(), Some(BuildStatus::Complete));
        assert!(events.entries().is_empty());
    }

    #[tokio::test]
    async fn test_event_timeout() {
        let store = store().await;
        store
            .create_service_event(&ServiceEventRecord::new("e1", "t1", "s1", "upgrade"))
            .await
            .unwrap();
        let deadlines = EventDeadlines {
            build: Duration::from_secs(60),
            other: Duration::from_millis(10),
        };

        assert!(watch_event_timeout(store.clone(), "e1", deadlines).await);
        assert_eq!(store.get_service_event("e1").await.unwrap().final_status, "timeout");
        // Terminal status is never overwritten.
        assert!(!watch_event_timeout(store.clone(), "e1", deadlines).await);
        assert!(!watch_event_timeout(store, "missing", deadlines).await);
    }
}
