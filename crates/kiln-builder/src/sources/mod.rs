// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Source inputs of a build: git repositories and container images.

pub mod git;
pub mod image;
pub mod mock;

pub use git::{ClonedRepository, CloneOptions, CodeSource, CommitInfo, SourceError, clone_repository};
pub use image::{
    DockerCli, ImageBuildOptions, ImageClient, ImageError, ImageMetadata, ImageName, RegistryAuth,
};
pub use mock::{ImageCall, MockImageClient};
