// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service event, version info, deploy version and event log tests.

mod common;

use chrono::Utc;
use kiln_core::persistence::{EventLogRecord, VersionInfoRecord};

#[tokio::test]
async fn test_final_status_is_set_exactly_once() {
    let store = common::store().await;
    store
        .create_service_event(&common::build_event("event-1", "service-1"))
        .await
        .unwrap();

    assert!(
        store
            .finish_service_event("event-1", "success", Some("Build success"))
            .await
            .unwrap()
    );
    // A late timeout must not revise the terminal status.
    assert!(!store.mark_service_event_timeout("event-1").await.unwrap());

    let event = store.get_service_event("event-1").await.unwrap();
    assert_eq!(event.final_status, "success");
    assert_eq!(event.message.as_deref(), Some("Build success"));
    assert!(event.end_time.is_some());
}

#[tokio::test]
async fn test_timeout_marks_in_flight_event() {
    let store = common::store().await;
    store
        .create_service_event(&common::build_event("event-2", "service-1"))
        .await
        .unwrap();

    assert!(store.mark_service_event_timeout("event-2").await.unwrap());
    assert!(!store.finish_service_event("event-2", "success", None).await.unwrap());

    let event = store.get_service_event("event-2").await.unwrap();
    assert_eq!(event.final_status, "timeout");
}

#[tokio::test]
async fn test_missing_event_is_not_found() {
    let store = common::store().await;
    let err = store.get_service_event("nope").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(!store.mark_service_event_timeout("nope").await.unwrap());
}

#[tokio::test]
async fn test_version_info_upsert_replaces_delivery() {
    let store = common::store().await;

    let mut info = VersionInfoRecord {
        service_id: "service-1".to_string(),
        build_version: "20250301120000".to_string(),
        event_id: "event-1".to_string(),
        delivered_type: "slug".to_string(),
        delivered_path: "/grdata/build/tenant/t/slug/service-1/20250301120000.tgz".to_string(),
        image_name: None,
        repo_url: Some("https://github.com/acme/web.git".to_string()),
        code_version: Some("abc1234".to_string()),
        commit_msg: Some("initial".to_string()),
        author: Some("dev".to_string()),
        final_status: "failure".to_string(),
        finish_time: None,
    };
    store.upsert_version_info(&info).await.unwrap();

    info.final_status = "success".to_string();
    info.code_version = None;
    info.finish_time = Some(Utc::now());
    store.upsert_version_info(&info).await.unwrap();

    let loaded = store
        .get_version_info("service-1", "20250301120000")
        .await
        .unwrap()
        .expect("version info present");
    assert_eq!(loaded.final_status, "success");
    assert_eq!(loaded.code_version.as_deref(), Some("abc1234"));
    assert!(loaded.finish_time.is_some());
}

#[tokio::test]
async fn test_deploy_version_and_share_status() {
    let store = common::store().await;

    assert_eq!(store.get_service_deploy_version("service-1").await.unwrap(), None);
    store
        .set_service_deploy_version("service-1", "v1")
        .await
        .unwrap();
    store
        .set_service_deploy_version("service-1", "v2")
        .await
        .unwrap();
    assert_eq!(
        store.get_service_deploy_version("service-1").await.unwrap().as_deref(),
        Some("v2")
    );

    store.update_share_status("share-1", "failure").await.unwrap();
    store.update_share_status("share-1", "success").await.unwrap();
    assert_eq!(
        store.get_share_status("share-1").await.unwrap().as_deref(),
        Some("success")
    );
}

#[tokio::test]
async fn test_event_logs_are_returned_in_append_order() {
    let store = common::store().await;

    for (i, step) in ["builder-exector", "progress", "last"].iter().enumerate() {
        store
            .append_event_log(&EventLogRecord {
                id: None,
                event_id: "event-1".to_string(),
                level: "info".to_string(),
                message: format!("line {}", i),
                step: Some(step.to_string()),
                status: None,
                attributes: format!(r#"{{"step":"{}"}}"#, step),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    let logs = store.list_event_logs("event-1").await.unwrap();
    let messages: Vec<_> = logs.iter().map(|l| l.message.as_str()).collect();
    assert_eq!(messages, vec!["line 0", "line 1", "line 2"]);
    assert!(logs.iter().all(|l| l.id.is_some()));
    assert!(store.list_event_logs("other").await.unwrap().is_empty());
}
