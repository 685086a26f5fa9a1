// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for kiln-builder integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use kiln_builder::Dispatcher;
use kiln_builder::callback::RecordingCallback;
use kiln_builder::config::BuildSettings;
use kiln_builder::context::BuildContext;
use kiln_builder::event::RecordingEventLogManager;
use kiln_builder::sources::MockImageClient;
use kiln_core::persistence::{Persistence, ServiceEventRecord, SqlitePersistence};

/// A dispatcher wired to in-memory collaborators.
pub struct Stack {
    pub dispatcher: Dispatcher,
    pub store: Arc<dyn Persistence>,
    pub events: RecordingEventLogManager,
    pub images: MockImageClient,
    pub callback: RecordingCallback,
}

impl Stack {
    /// Dispatch a JSON body and panic if it is not admitted.
    pub fn dispatch(&self, task_type: &str, body: serde_json::Value) -> String {
        self.dispatcher
            .dispatch(task_type, body.to_string().as_bytes())
            .expect("task should be admitted")
    }

    /// Wait for every admitted task to finish.
    pub async fn drain(&self) {
        self.dispatcher.shutdown().await;
    }

    /// Terminal status of a service event.
    pub async fn event_status(&self, event_id: &str) -> String {
        self.store
            .get_service_event(event_id)
            .await
            .expect("event should exist")
            .final_status
    }
}

pub async fn stack(settings: BuildSettings, images: MockImageClient, callback: RecordingCallback) -> Stack {
    let store: Arc<dyn Persistence> = Arc::new(
        SqlitePersistence::in_memory()
            .await
            .expect("Failed to create in-memory store"),
    );
    let events = RecordingEventLogManager::new();
    let ctx = BuildContext::new(
        settings,
        store.clone(),
        Arc::new(events.clone()),
        Arc::new(images.clone()),
        Arc::new(callback.clone()),
    );
    Stack {
        dispatcher: Dispatcher::new(Arc::new(ctx)),
        store,
        events,
        images,
        callback,
    }
}

/// Store an in-flight event.
pub async fn create_event(store: &Arc<dyn Persistence>, event_id: &str, service_id: &str, opt_type: &str) {
    store
        .create_service_event(&ServiceEventRecord::new(event_id, "t1", service_id, opt_type))
        .await
        .expect("Failed to create service event");
}

/// Initialise a repository at `dir` with one commit on `HEAD` and a
/// `release` branch pointing at it.
pub fn commit_files(dir: &Path, files: &[(&str, &str)]) {
    std::fs::create_dir_all(dir).unwrap();
    let repo = git2::Repository::init(dir).unwrap();
    for (name, content) in files {
        std::fs::write(dir.join(name), content).unwrap();
    }
    let mut index = repo.index().unwrap();
    for (name, _) in files {
        index.add_path(Path::new(name)).unwrap();
    }
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = git2::Signature::now("dev", "dev@example.com").unwrap();
    let commit = repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[]).unwrap();
    let commit = repo.find_commit(commit).unwrap();
    repo.branch("release", &commit, false).unwrap();
}

/// Write an executable shell script.
pub fn write_script(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}
