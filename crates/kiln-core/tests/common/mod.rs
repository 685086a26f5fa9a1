// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for kiln-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use kiln_core::persistence::{
    BuildKind, BuildVersionRecord, Persistence, ServiceEventRecord, SqlitePersistence,
};

/// Fresh in-memory store with migrations applied.
pub async fn store() -> Arc<dyn Persistence> {
    Arc::new(
        SqlitePersistence::in_memory()
            .await
            .expect("Failed to create in-memory store"),
    )
}

/// Image build version for `plugin_id`/`version_id` in `building` state.
pub fn image_build(plugin_id: &str, version_id: &str, base_image: &str) -> BuildVersionRecord {
    let mut record = BuildVersionRecord::new(plugin_id, version_id, BuildKind::Image);
    record.base_image = Some(base_image.to_string());
    record.deploy_version = "20250301120000".to_string();
    record.info = Some("first build".to_string());
    record
}

/// In-flight build event.
pub fn build_event(event_id: &str, service_id: &str) -> ServiceEventRecord {
    let mut event = ServiceEventRecord::new(event_id, "tenant-1", service_id, "build-service");
    event.deploy_version = "20250301120000".to_string();
    event.old_deploy_version = "20250201090000".to_string();
    event
}
