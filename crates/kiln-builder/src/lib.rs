// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kiln Builder - Build Task Worker
//!
//! This crate runs the asynchronous build pipeline: it takes task messages
//! off a queue, turns source code, images and market slugs into deployable
//! artifacts, records the outcome and asks the API to roll the service out.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   BRPOP    ┌──────────────┐  decode   ┌───────────────────────┐
//! │ Redis list   │──────────►│ QueueConsumer │─────────►│      Dispatcher       │
//! └──────────────┘            └──────────────┘           │ bounded pool, retries │
//!                                                        └───────────┬───────────┘
//!                                  ┌────────────────────┬────────────┼──────────────┐
//!                                  ▼                    ▼            ▼              ▼
//!                           source / image /      plugin builds   service      shares,
//!                           market-slug builds                     checks      scripts
//!                                  │                    │
//!                                  ▼                    ▼
//!                     git clone, docker, build script   │
//!                                  │                    │
//!                                  ▼                    ▼
//!                ┌─────────────────────────────────────────────────────┐
//!                │ kiln-core store: versions, events, logs, shares     │
//!                └─────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//!                         upgrade callback (HTTP)
//! ```
//!
//! Deadline watchers run beside every task and only ever write through
//! conditional store updates, so they never race an executor into an
//! inconsistent status.
//!
//! # Task Types
//!
//! | Task type | Outcome |
//! |-----------|---------|
//! | `build_from_source_code` | Dockerfile image or compiled slug |
//! | `build_from_image` | Image retagged into the platform registry |
//! | `build_from_market_slug` | Market slug installed as the build output |
//! | `plugin_image_build` | Plugin image retagged with a plugin suffix |
//! | `plugin_dockerfile_build` | Plugin image built from a repository |
//! | `service_check` | Service metadata and a list of problems |
//! | `share-slug`, `share-image` | Build published to the app market |
//! | `app_image`, `app_slug`, `image_manual`, `code_check`, `app_build` | External plugin script |
//!
//! # Modules
//!
//! - [`dispatcher`]: task admission, the worker pool and the retry loop
//! - [`executor`]: one executor per task type and the shared finalisation
//! - [`watcher`]: plugin build and service event deadlines
//! - [`sources`]: git checkouts and container image operations
//! - [`parser`]: service checks
//! - [`event`]: per-event log streams
//! - [`runtime`]: embeddable runtime wiring it all together

#![deny(missing_docs)]

/// Upgrade callback to the API.
pub mod callback;

/// Cleanup of stale checkout directories.
pub mod cleanup_worker;

/// Process configuration.
pub mod config;

/// Collaborators shared by executors.
pub mod context;

/// Task admission and retries.
pub mod dispatcher;

/// Builder error types.
pub mod error;

/// Per-event log streams.
pub mod event;

/// Task executors.
pub mod executor;

/// Service source checks.
pub mod parser;

/// Child processes with streamed output.
pub mod process;

/// Redis queue consumer.
pub mod queue;

/// Embeddable runtime.
pub mod runtime;

/// Slug compilation.
pub mod slug;

/// Git and image sources.
pub mod sources;

/// Task payloads.
pub mod task;

/// Deadline watchers.
pub mod watcher;

/// Working directory layout and locks.
pub mod workdir;

pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use task::{BuildTask, TaskType};
