// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Upgrade callback.
//!
//! After a service build succeeds the builder asks the API to roll the
//! service onto the new deploy version:
//!
//! ```text
//! POST <api_url>/v2/tenants/<tenant>/services/<alias>/upgrade
//! Authorization: Token <token>
//! {"deploy_version": "...", "event_id": "..."}
//! ```
//!
//! Only a `200 OK` answer counts as success.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::AUTHORIZATION;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Timeout of one callback request.
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// One upgrade request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradeRequest {
    /// Tenant name, part of the URL.
    #[serde(skip)]
    pub tenant_name: String,
    /// Service alias, part of the URL.
    #[serde(skip)]
    pub service_alias: String,
    /// Deploy version to roll onto.
    pub deploy_version: String,
    /// Event the upgrade is correlated with.
    pub event_id: String,
}

/// Triggers a rolling upgrade of a service.
#[async_trait]
pub trait UpgradeCallback: Send + Sync {
    /// Ask for `request.service_alias` to be upgraded to `request.deploy_version`.
    async fn trigger_upgrade(&self, request: &UpgradeRequest) -> Result<()>;
}

/// [`UpgradeCallback`] calling the API over HTTP.
#[derive(Debug, Clone)]
pub struct HttpUpgradeClient {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl HttpUpgradeClient {
    /// Client for the API at `api_url`.
    pub fn new(api_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(CALLBACK_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn upgrade_url(&self, request: &UpgradeRequest) -> String {
        format!(
            "{}/v2/tenants/{}/services/{}/upgrade",
            self.api_url, request.tenant_name, request.service_alias
        )
    }
}

#[async_trait]
impl UpgradeCallback for HttpUpgradeClient {
    async fn trigger_upgrade(&self, request: &UpgradeRequest) -> Result<()> {
        let url = self.upgrade_url(request);
        debug!(url = %url, event_id = %request.event_id, "Sending upgrade callback");

        let mut builder = self.client.post(&url).json(request);
        if let Some(token) = &self.token {
            builder = builder.header(AUTHORIZATION, format!("Token {}", token));
        }

        let response = builder.send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Callback(format!(
                "{} answered {}: {}",
                url,
                status.as_u16(),
                body.trim()
            )));
        }

        info!(
            service_alias = %request.service_alias,
            deploy_version = %request.deploy_version,
            "Upgrade callback accepted"
        );
        Ok(())
    }
}

/// [`UpgradeCallback`] that records requests, for tests.
#[derive(Clone, Default)]
pub struct RecordingCallback {
    requests: Arc<Mutex<Vec<UpgradeRequest>>>,
    fail: bool,
}

impl RecordingCallback {
    /// Callback that accepts every request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback that rejects every request (after recording it).
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<UpgradeRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl UpgradeCallback for RecordingCallback {
    async fn trigger_upgrade(&self, request: &UpgradeRequest) -> Result<()> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if self.fail {
            return Err(Error::Callback("upgrade rejected".to_string()));
        }
        Ok(())
    }
}
