// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Collaborators shared by every executor.

use std::sync::Arc;

use kiln_core::persistence::Persistence;

use crate::callback::UpgradeCallback;
use crate::config::BuildSettings;
use crate::event::EventLogManager;
use crate::sources::ImageClient;
use crate::workdir::WorkDirLocks;

/// Everything an executor needs besides its task.
///
/// Each collaborator sits behind a trait object so tests can substitute
/// in-memory implementations.
#[derive(Clone)]
pub struct BuildContext {
    /// Pipeline settings.
    pub settings: BuildSettings,
    /// Build store.
    pub store: Arc<dyn Persistence>,
    /// Event log streams.
    pub events: Arc<dyn EventLogManager>,
    /// Image operations.
    pub images: Arc<dyn ImageClient>,
    /// Upgrade callback.
    pub callback: Arc<dyn UpgradeCallback>,
    /// Working directory locks.
    pub workdirs: Arc<WorkDirLocks>,
}

impl BuildContext {
    /// Context with a fresh lock table.
    pub fn new(
        settings: BuildSettings,
        store: Arc<dyn Persistence>,
        events: Arc<dyn EventLogManager>,
        images: Arc<dyn ImageClient>,
        callback: Arc<dyn UpgradeCallback>,
    ) -> Self {
        Self {
            settings,
            store,
            events,
            images,
            callback,
            workdirs: Arc::new(WorkDirLocks::new()),
        }
    }
}
