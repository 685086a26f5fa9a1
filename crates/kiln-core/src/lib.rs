// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kiln Core - Build Pipeline Persistence
//!
//! This crate owns every piece of state the build pipeline shares between
//! concurrent workers: build-version rows, service events, version info,
//! deploy versions, share results and the per-event log stream.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        kiln-builder                          │
//! │   Dispatcher ─► Executors ─► Watchers ─► Event Logger        │
//! └──────────────────────────────────────────────────────────────┘
//!                               │ Arc<dyn Persistence>
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   kiln-core (This Crate)                     │
//! │       SqlitePersistence            PostgresPersistence       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Status Transitions
//!
//! ```text
//!            upsert                 finish(complete|failure)
//!   (none) ─────────► building ─────────────────────────────► complete / failure
//!                        │
//!                        │ mark_build_version_timeout (only while building)
//!                        ▼
//!                     timeout
//! ```
//!
//! Service events follow the same shape: `final_status` starts empty and is
//! set exactly once, either by the executor or by the event timeout watcher.
//!
//! # Modules
//!
//! - [`error`]: `CoreError` and its error codes
//! - [`migrations`]: embedded SQLite and PostgreSQL migrations
//! - [`persistence`]: record types, the [`persistence::Persistence`] trait and its backends

#![deny(missing_docs)]

/// Error types for persistence operations.
pub mod error;

/// Embedded database migrations.
pub mod migrations;

/// Record types, the store contract and its backends.
pub mod persistence;

pub use error::CoreError;
pub use persistence::Persistence;
