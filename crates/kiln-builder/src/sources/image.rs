// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container image operations.
//!
//! [`ImageClient`] is the seam executors use to pull, tag, push, build and
//! inspect images. [`DockerCli`] implements it by driving the `docker`
//! binary; command output is streamed line by line into the event log.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::event::Logger;
use crate::process::run_streaming;

/// Time allowed for metadata-only commands (`tag`, `inspect`, `login`).
const QUICK_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Registry credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    /// User name.
    pub username: String,
    /// Password or token.
    pub password: String,
}

impl RegistryAuth {
    /// Credentials from optional parts; `None` when no user is given.
    pub fn from_parts(username: Option<&str>, password: Option<&str>) -> Option<Self> {
        let username = username.filter(|u| !u.is_empty())?;
        Some(Self {
            username: username.to_string(),
            password: password.unwrap_or_default().to_string(),
        })
    }
}

/// Options of an image build.
#[derive(Debug, Clone, Default)]
pub struct ImageBuildOptions {
    /// Reference the built image is tagged with.
    pub tag: String,
    /// Build context directory.
    pub context: PathBuf,
    /// Dockerfile, if not `<context>/Dockerfile`.
    pub dockerfile: Option<PathBuf>,
    /// `--build-arg` values.
    pub build_args: BTreeMap<String, String>,
    /// Ignore the layer cache.
    pub no_cache: bool,
}

/// Configuration read from an image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageMetadata {
    /// Environment variables.
    pub envs: BTreeMap<String, String>,
    /// Exposed ports as `<port>/<proto>`.
    pub exposed_ports: Vec<String>,
    /// Declared volume paths.
    pub volumes: Vec<String>,
    /// Default command, space joined.
    pub cmd: Option<String>,
}

impl ImageMetadata {
    /// Parse the output of `docker image inspect --format '{{json .Config}}'`.
    pub fn from_config_json(raw: &str) -> Result<Self, serde_json::Error> {
        let config: serde_json::Value = serde_json::from_str(raw.trim())?;
        let mut metadata = Self::default();

        if let Some(envs) = config.get("Env").and_then(|v| v.as_array()) {
            for entry in envs.iter().filter_map(|e| e.as_str()) {
                let (key, value) = entry.split_once('=').unwrap_or((entry, ""));
                metadata.envs.insert(key.to_string(), value.to_string());
            }
        }
        if let Some(ports) = config.get("ExposedPorts").and_then(|v| v.as_object()) {
            metadata.exposed_ports = ports.keys().cloned().collect();
        }
        if let Some(volumes) = config.get("Volumes").and_then(|v| v.as_object()) {
            metadata.volumes = volumes.keys().cloned().collect();
        }
        if let Some(cmd) = config.get("Cmd").and_then(|v| v.as_array()) {
            let parts: Vec<&str> = cmd.iter().filter_map(|c| c.as_str()).collect();
            if !parts.is_empty() {
                metadata.cmd = Some(parts.join(" "));
            }
        }
        Ok(metadata)
    }
}

/// Image operation failure.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    /// The image does not exist or is not readable with the given credentials.
    #[error("image {image} not found")]
    NotFound {
        /// Image reference.
        image: String,
    },
    /// The operation exceeded its time limit and was killed.
    #[error("{operation} {image} timed out after {}s", .timeout.as_secs())]
    Timeout {
        /// `pull`, `push`, `build`, ...
        operation: &'static str,
        /// Image reference.
        image: String,
        /// Limit that was exceeded.
        timeout: Duration,
    },
    /// The command exited unsuccessfully.
    #[error("{operation} {image} failed (exit code {exit_code:?}): {output}")]
    CommandFailed {
        /// `pull`, `push`, `build`, ...
        operation: &'static str,
        /// Image reference.
        image: String,
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Last lines of output.
        output: String,
    },
    /// The reference cannot be parsed.
    #[error("invalid image reference '{0}'")]
    InvalidReference(String),
    /// Image configuration could not be read.
    #[error("cannot inspect image {image}: {message}")]
    Inspect {
        /// Image reference.
        image: String,
        /// Details.
        message: String,
    },
    /// Spawning or talking to the process failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parsed image reference: `[host/]name[:tag]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageName {
    /// Registry host, if the reference names one.
    pub host: Option<String>,
    /// Repository path.
    pub name: String,
    /// Tag, `latest` when omitted.
    pub tag: String,
}

impl ImageName {
    /// Parse a reference. A digest suffix is ignored.
    pub fn parse(reference: &str) -> Result<Self, ImageError> {
        let trimmed = reference.trim();
        if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
            return Err(ImageError::InvalidReference(reference.to_string()));
        }
        let base = trimmed.split_once('@').map(|(b, _)| b).unwrap_or(trimmed);

        let (host, rest) = match base.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_string()), rest)
            }
            _ => (None, base),
        };

        let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => (&rest[..last_slash + i], &rest[last_slash + i + 1..]),
            None => (rest, "latest"),
        };

        if name.is_empty() || name.ends_with('/') || tag.is_empty() {
            return Err(ImageError::InvalidReference(reference.to_string()));
        }

        Ok(Self {
            host,
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Last path segment of the repository.
    pub fn simple_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    /// Reference without the tag.
    pub fn repository(&self) -> String {
        match &self.host {
            Some(host) => format!("{}/{}", host, self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository(), self.tag)
    }
}

/// Image operations used by the executors.
#[async_trait]
pub trait ImageClient: Send + Sync {
    /// Pull `image`, optionally authenticating first.
    async fn pull(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
        logger: &dyn Logger,
        timeout: Duration,
    ) -> Result<(), ImageError>;

    /// Tag a local image with another reference.
    async fn tag(&self, source: &str, target: &str) -> Result<(), ImageError>;

    /// Push `image`, optionally authenticating first.
    async fn push(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
        logger: &dyn Logger,
        timeout: Duration,
    ) -> Result<(), ImageError>;

    /// Build an image from a context directory.
    async fn build(
        &self,
        options: &ImageBuildOptions,
        logger: &dyn Logger,
        timeout: Duration,
    ) -> Result<(), ImageError>;

    /// Read the configuration of a local image.
    async fn inspect(&self, image: &str) -> Result<ImageMetadata, ImageError>;
}

/// [`ImageClient`] driving the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    /// Client using the given docker binary.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn login(&self, image: &str, auth: &RegistryAuth) -> Result<(), ImageError> {
        let mut args = vec![
            "login".to_string(),
            "--username".to_string(),
            auth.username.clone(),
            "--password-stdin".to_string(),
        ];
        if let Some(host) = ImageName::parse(image)?.host {
            args.push(host);
        }
        self.run("login", image, &args, Some(&auth.password), None, QUICK_COMMAND_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Run one docker command, streaming its output into `logger`.
    ///
    /// Returns the captured stdout.
    async fn run(
        &self,
        operation: &'static str,
        image: &str,
        args: &[String],
        stdin: Option<&str>,
        logger: Option<&dyn Logger>,
        timeout: Duration,
    ) -> Result<String, ImageError> {
        debug!(operation, image, "Running docker {}", args.join(" "));

        let mut command = Command::new(&self.binary);
        command.args(args);
        let output = match run_streaming(&mut command, stdin.map(str::as_bytes), logger, timeout).await {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                return Err(ImageError::Timeout {
                    operation,
                    image: image.to_string(),
                    timeout,
                });
            }
            Err(e) => return Err(ImageError::Io(e)),
        };

        if output.status.success() {
            return Ok(output.stdout);
        }
        if is_missing_image(&output.tail) {
            return Err(ImageError::NotFound {
                image: image.to_string(),
            });
        }
        Err(ImageError::CommandFailed {
            operation,
            image: image.to_string(),
            exit_code: output.status.code(),
            output: output.tail,
        })
    }
}

fn is_missing_image(output: &str) -> bool {
    let output = output.to_lowercase();
    output.contains("does not exist or no pull access")
        || output.contains("manifest unknown")
        || output.contains("repository does not exist")
        || output.contains("no such image")
}

#[async_trait]
impl ImageClient for DockerCli {
    async fn pull(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
        logger: &dyn Logger,
        timeout: Duration,
    ) -> Result<(), ImageError> {
        if let Some(auth) = auth {
            self.login(image, auth).await?;
        }
        let args = ["pull".to_string(), image.to_string()];
        self.run("pull", image, &args, None, Some(logger), timeout)
            .await?;
        info!(image, "Pulled image");
        Ok(())
    }

    async fn tag(&self, source: &str, target: &str) -> Result<(), ImageError> {
        let args = ["tag".to_string(), source.to_string(), target.to_string()];
        self.run("tag", source, &args, None, None, QUICK_COMMAND_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn push(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
        logger: &dyn Logger,
        timeout: Duration,
    ) -> Result<(), ImageError> {
        if let Some(auth) = auth {
            self.login(image, auth).await?;
        }
        let args = ["push".to_string(), image.to_string()];
        self.run("push", image, &args, None, Some(logger), timeout)
            .await?;
        info!(image, "Pushed image");
        Ok(())
    }

    async fn build(
        &self,
        options: &ImageBuildOptions,
        logger: &dyn Logger,
        timeout: Duration,
    ) -> Result<(), ImageError> {
        let mut args = vec!["build".to_string(), "-t".to_string(), options.tag.clone()];
        if let Some(dockerfile) = &options.dockerfile {
            args.push("-f".to_string());
            args.push(dockerfile.to_string_lossy().into_owned());
        }
        for (key, value) in &options.build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }
        if options.no_cache {
            args.push("--no-cache".to_string());
        }
        args.push(options.context.to_string_lossy().into_owned());

        self.run("build", &options.tag, &args, None, Some(logger), timeout)
            .await?;
        info!(image = %options.tag, "Built image");
        Ok(())
    }

    async fn inspect(&self, image: &str) -> Result<ImageMetadata, ImageError> {
        let args = [
            "image".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{json .Config}}".to_string(),
            image.to_string(),
        ];
        let output = self
            .run("inspect", image, &args, None, None, QUICK_COMMAND_TIMEOUT)
            .await?;
        ImageMetadata::from_config_json(&output).map_err(|e| ImageError::Inspect {
            image: image.to_string(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_name() {
        let name = ImageName::parse("nginx").unwrap();
        assert_eq!(name.host, None);
        assert_eq!(name.name, "nginx");
        assert_eq!(name.tag, "latest");
        assert_eq!(name.to_string(), "nginx:latest");
    }

    #[test]
    fn test_parse_registry_with_port() {
        let name = ImageName::parse("registry.local:5000/team/api:1.2").unwrap();
        assert_eq!(name.host.as_deref(), Some("registry.local:5000"));
        assert_eq!(name.name, "team/api");
        assert_eq!(name.tag, "1.2");
        assert_eq!(name.simple_name(), "api");
        assert_eq!(name.repository(), "registry.local:5000/team/api");
    }

    #[test]
    fn test_parse_hub_namespace_is_not_host() {
        let name = ImageName::parse("library/nginx:1.21").unwrap();
        assert_eq!(name.host, None);
        assert_eq!(name.simple_name(), "nginx");
    }

    #[test]
    fn test_parse_localhost_and_digest() {
        let name = ImageName::parse("localhost/app@sha256:abcd").unwrap();
        assert_eq!(name.host.as_deref(), Some("localhost"));
        assert_eq!(name.tag, "latest");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ImageName::parse("").is_err());
        assert!(ImageName::parse("has space:1").is_err());
        assert!(ImageName::parse("nginx:").is_err());
    }

    #[test]
    fn test_metadata_from_config_json() {
        let raw = r#"{"Env":["PATH=/usr/bin","MODE"],"ExposedPorts":{"80/tcp":{}},"Volumes":{"/data":{}},"Cmd":["nginx","-g","daemon off;"]}"#;
        let metadata = ImageMetadata::from_config_json(raw).unwrap();
        assert_eq!(metadata.envs.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert_eq!(metadata.envs.get("MODE").map(String::as_str), Some(""));
        assert_eq!(metadata.exposed_ports, vec!["80/tcp".to_string()]);
        assert_eq!(metadata.volumes, vec!["/data".to_string()]);
        assert_eq!(metadata.cmd.as_deref(), Some("nginx -g daemon off;"));
    }

    #[test]
    fn test_metadata_tolerates_null_sections() {
        let metadata = ImageMetadata::from_config_json(r#"{"Env":null,"Volumes":null}"#).unwrap();
        assert_eq!(metadata, ImageMetadata::default());
    }

    #[test]
    fn test_registry_auth_requires_user() {
        assert!(RegistryAuth::from_parts(None, Some("pw")).is_none());
        assert!(RegistryAuth::from_parts(Some(""), Some("pw")).is_none());
        let auth = RegistryAuth::from_parts(Some("bob"), None).unwrap();
        assert_eq!(auth.password, "");
    }

    #[test]
    fn test_missing_image_detection() {
        assert!(is_missing_image(
            "Error response from daemon: pull access denied for nope, repository does not exist or no pull access"
        ));
        assert!(!is_missing_image("net/http: TLS handshake timeout"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_command_reports_output() {
        let client = DockerCli::new("false");
        let err = client.tag("a:1", "b:1").await.unwrap_err();
        assert!(matches!(err, ImageError::CommandFailed { operation: "tag", exit_code: Some(1), .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_timeout_kills_process() {
        use crate::event::{EventLogManager, RecordingEventLogManager};
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("docker");
        std::fs::write(&script, "#!/bin/sh\necho \"Step 1/2\"\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let client = DockerCli::new(&script);
        let events = RecordingEventLogManager::new();
        let logger = events.get_logger("e1");

        let started = std::time::Instant::now();
        let err = client
            .pull("nginx:1.21", None, logger.as_ref(), Duration::from_millis(500))
            .await
            .unwrap_err();

        assert!(matches!(err, ImageError::Timeout { operation: "pull", .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(events.entries_for("e1")[0].message, "Step 1/2");
    }
}
