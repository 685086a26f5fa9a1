// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatcher admission, retries and log stream bookkeeping.

mod common;

use std::time::Duration;

use kiln_builder::Error;
use kiln_builder::callback::RecordingCallback;
use kiln_builder::config::BuildSettings;
use kiln_builder::dispatcher::RetryPolicy;
use kiln_builder::sources::{ImageCall, MockImageClient};
use kiln_core::persistence::BuildStatus;
use serde_json::json;

fn image_body(event_id: &str) -> serde_json::Value {
    json!({
        "event_id": event_id,
        "tenant_id": "t1",
        "tenant_name": "acme",
        "service_id": "s1",
        "service_alias": "web",
        "deploy_version": "20250301120000",
        "image": "nginx:1.25"
    })
}

#[tokio::test]
async fn test_unknown_task_type_is_rejected() {
    let stack = common::stack(BuildSettings::default(), MockImageClient::new(), RecordingCallback::new()).await;

    let err = stack.dispatcher.dispatch("deploy", b"{\"event_id\":\"e1\"}").unwrap_err();

    assert!(matches!(err, Error::UnsupportedTaskType(ref t) if t == "deploy"));
    assert!(stack.dispatcher.running_tasks().is_empty());
    assert_eq!(stack.events.acquired(), 0);
}

#[tokio::test]
async fn test_body_without_event_id_is_rejected() {
    let stack = common::stack(BuildSettings::default(), MockImageClient::new(), RecordingCallback::new()).await;

    let err = stack
        .dispatcher
        .dispatch("build_from_image", b"{\"service_id\":\"s1\"}")
        .unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_no_tasks_admitted_after_shutdown() {
    let stack = common::stack(BuildSettings::default(), MockImageClient::new(), RecordingCallback::new()).await;
    stack.drain().await;

    let err = stack
        .dispatcher
        .dispatch("build_from_image", image_body("e1").to_string().as_bytes())
        .unwrap_err();

    assert!(matches!(err, Error::ShuttingDown));
    assert!(!stack.dispatcher.is_accepting());
}

#[tokio::test]
async fn test_image_build_end_to_end() {
    let stack = common::stack(BuildSettings::default(), MockImageClient::new(), RecordingCallback::new()).await;
    common::create_event(&stack.store, "e1", "s1", "build-service").await;

    stack.dispatch("build_from_image", image_body("e1"));
    stack.drain().await;

    assert_eq!(stack.event_status("e1").await, "success");
    assert_eq!(stack.images.count("push"), 1);
    let requests = stack.callback.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].service_alias, "web");
    assert_eq!(stack.events.acquired(), stack.events.released());
}

#[tokio::test]
async fn test_retries_exhausted_fail_the_build() {
    let settings = BuildSettings {
        retry: RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(5),
        },
        ..Default::default()
    };
    let stack = common::stack(
        settings,
        MockImageClient::new().with_missing_image("nginx:1.25"),
        RecordingCallback::new(),
    )
    .await;
    common::create_event(&stack.store, "e1", "s1", "build-service").await;

    stack.dispatch("build_from_image", image_body("e1"));
    stack.drain().await;

    assert_eq!(stack.images.count("pull"), 3);
    assert_eq!(stack.images.count("push"), 0);
    assert!(stack.callback.requests().is_empty());
    assert_eq!(stack.event_status("e1").await, "failure");
    let info = stack
        .store
        .get_version_info("s1", "20250301120000")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.final_status, "failure");
    assert_eq!(stack.events.tagged("e1", "callback", "failure").len(), 1);
}

#[tokio::test]
async fn test_plugin_image_build_through_dispatcher() {
    let stack = common::stack(BuildSettings::default(), MockImageClient::new(), RecordingCallback::new()).await;
    common::create_event(&stack.store, "e2", "", "build-plugin").await;

    stack.dispatch(
        "plugin_image_build",
        json!({
            "event_id": "e2",
            "tenant_id": "t1",
            "plugin_id": "p1",
            "version_id": "v1",
            "deploy_version": "20250301120000",
            "image_url": "nginx:1.21",
            "info": "first"
        }),
    );
    stack.drain().await;

    let record = stack.store.get_build_version("p1", "v1").await.unwrap();
    assert_eq!(record.build_status(), Some(BuildStatus::Complete));
    assert_eq!(record.build_local_image.as_deref(), Some("goodrain.me/nginx:1.21_p1"));
    assert!(stack.images.calls().iter().any(|c| matches!(
        c,
        ImageCall::Push { image, .. } if image == "goodrain.me/nginx:1.21_p1"
    )));
    assert_eq!(stack.event_status("e2").await, "success");
    assert!(stack.callback.requests().is_empty());
}

#[tokio::test]
async fn test_loggers_released_on_every_path() {
    let stack = common::stack(
        BuildSettings {
            retry: RetryPolicy::once(),
            ..Default::default()
        },
        MockImageClient::new().with_missing_image("redis:7"),
        RecordingCallback::failing(),
    )
    .await;
    for event_id in ["built", "missing", "checked"] {
        common::create_event(&stack.store, event_id, "s1", "build-service").await;
    }

    // Rejected callback, failed pull, unknown check source.
    stack.dispatch("build_from_image", image_body("built"));
    let mut missing = image_body("missing");
    missing["image"] = json!("redis:7");
    stack.dispatch("build_from_image", missing);
    stack.dispatch(
        "service_check",
        json!({
            "event_id": "checked",
            "check_uuid": "c1",
            "source_type": "unknown",
            "source_body": "",
            "tenant_id": "t1"
        }),
    );
    stack.drain().await;

    assert!(stack.events.acquired() >= 3);
    assert_eq!(stack.events.acquired(), stack.events.released());
    assert!(stack.dispatcher.running_tasks().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_event_watcher_does_not_wait_for_the_task() {
    let plugins = tempfile::TempDir::new().unwrap();
    std::fs::write(plugins.path().join("app_slug.pyc"), "sleep 1\ncat\n").unwrap();
    let settings = BuildSettings {
        plugin_dir: plugins.path().to_path_buf(),
        script_interpreter: "sh".into(),
        retry: RetryPolicy::once(),
        event_timeout: Duration::from_millis(50),
        script_timeout: Duration::from_secs(30),
        ..Default::default()
    };
    let stack = common::stack(settings, MockImageClient::new(), RecordingCallback::new()).await;
    common::create_event(&stack.store, "e1", "s1", "app-slug").await;

    stack.dispatch("app_slug", json!({"event_id": "e1", "service_id": "s1"}));
    tokio::time::sleep(Duration::from_millis(500)).await;

    // The deadline passed while the script was still sleeping.
    assert_eq!(stack.dispatcher.running_tasks().len(), 1);
    assert_eq!(stack.event_status("e1").await, "timeout");

    stack.drain().await;
    assert_eq!(stack.events.tagged("e1", "last", "success").len(), 1);
    assert_eq!(stack.event_status("e1").await, "timeout");
}

#[tokio::test]
async fn test_building_timeout_covers_time_queued_for_a_slot() {
    let settings = BuildSettings {
        max_concurrent_tasks: 1,
        building_timeout: Duration::from_millis(200),
        retry: RetryPolicy::once(),
        ..Default::default()
    };
    let images = MockImageClient::new().delay_operation("push", Duration::from_millis(500));
    let stack = common::stack(settings, images, RecordingCallback::new()).await;
    for (event_id, plugin_id) in [("ea", "pa"), ("eb", "pb")] {
        common::create_event(&stack.store, event_id, "", "build-plugin").await;
        stack.dispatch(
            "plugin_image_build",
            json!({
                "event_id": event_id,
                "tenant_id": "t1",
                "plugin_id": plugin_id,
                "version_id": "v1",
                "deploy_version": "20250301120000",
                "image_url": "nginx:1.21"
            }),
        );
    }
    tokio::time::sleep(Duration::from_millis(350)).await;

    // The second build is still waiting behind the first one's push.
    assert_eq!(stack.images.count("tag"), 1);
    let queued = stack.store.get_build_version("pb", "v1").await.unwrap();
    assert_eq!(queued.build_status(), Some(BuildStatus::Timeout));
    assert_eq!(stack.events.tagged("eb", "callback", "failure").len(), 1);

    stack.drain().await;
    let finished = stack.store.get_build_version("pb", "v1").await.unwrap();
    assert_eq!(finished.build_status(), Some(BuildStatus::Complete));
    assert_eq!(stack.images.count("push"), 2);
}

#[tokio::test]
async fn test_plugin_build_names_its_operator() {
    let stack = common::stack(BuildSettings::default(), MockImageClient::new(), RecordingCallback::new()).await;
    common::create_event(&stack.store, "e3", "", "build-plugin").await;

    stack.dispatch(
        "plugin_image_build",
        json!({
            "event_id": "e3",
            "tenant_id": "t1",
            "plugin_id": "p1",
            "version_id": "v1",
            "deploy_version": "20250301120000",
            "image_url": "nginx:1.21",
            "operator": "alice"
        }),
    );
    stack.drain().await;

    assert!(
        stack
            .events
            .entries_for("e3")
            .iter()
            .any(|e| e.message.contains("by alice"))
    );
}
