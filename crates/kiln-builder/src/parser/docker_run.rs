// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `docker run` command (or bare image name) check.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::debug;

use super::{CheckResult, Env, ParseError, Port, ServiceInfo, Volume, deploy_type, read_memory};
use crate::event::Logger;
use crate::sources::{ImageClient, ImageError, ImageName, RegistryAuth};

/// Flags that take no value.
const BOOLEAN_FLAGS: &[&str] = &[
    "d",
    "i",
    "t",
    "it",
    "P",
    "rm",
    "init",
    "interactive",
    "detach",
    "no-healthcheck",
    "oom-kill-disable",
    "privileged",
    "read-only",
    "tty",
    "sig-proxy",
];

/// Memory reported when the command does not set one.
const DEFAULT_MEMORY: u32 = 512;

/// What a `docker run` command declares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DockerRunSpec {
    /// Image token.
    pub image: Option<String>,
    /// Arguments after the image.
    pub args: Vec<String>,
    /// `--name`.
    pub name: Option<String>,
    /// Ports by container port.
    pub ports: BTreeMap<u16, Port>,
    /// Volumes by container path.
    pub volumes: BTreeMap<String, Volume>,
    /// Environment by name.
    pub envs: BTreeMap<String, String>,
    /// Memory in MiB, 0 when unset.
    pub memory: u32,
}

/// Split a command line into tokens, honouring quotes and line continuations.
pub fn split_args(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut has_token = false;

    for c in command.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                has_token = true;
            }
            (None, '\\') => {}
            (None, c) if c.is_whitespace() => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            (None, c) => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }
    tokens
}

fn is_boolean_flag(flag: &str, single_dash: bool) -> bool {
    BOOLEAN_FLAGS.contains(&flag) || (single_dash && !flag.is_empty() && flag.chars().all(|c| "ditP".contains(c)))
}

impl DockerRunSpec {
    /// Parse a `docker run ...` command.
    pub fn parse(command: &str) -> Self {
        let mut spec = Self::default();
        let tokens = split_args(command);
        let mut pending: Option<String> = None;
        let mut positional_start = 0;

        for (i, token) in tokens.iter().enumerate() {
            if pending.is_none() && (token == "docker" || token == "run" || token == "container") {
                continue;
            }

            if let Some(flag) = pending.take() {
                spec.apply(&flag, token);
                continue;
            }

            if let Some(stripped) = token.strip_prefix('-') {
                let single_dash = !stripped.starts_with('-');
                let flag = stripped.trim_start_matches('-');
                match flag.split_once('=') {
                    Some((name, value)) if !value.is_empty() => spec.apply(name, value),
                    _ if is_boolean_flag(flag, single_dash) => {}
                    _ => pending = Some(flag.to_string()),
                }
                continue;
            }

            spec.image = Some(token.clone());
            positional_start = i + 1;
            break;
        }

        if spec.image.is_some() {
            spec.args = tokens[positional_start..].to_vec();
        }
        spec
    }

    fn apply(&mut self, flag: &str, value: &str) {
        match flag {
            "e" | "env" => {
                if let Some((name, val)) = value.split_once('=') {
                    self.envs.insert(name.to_string(), val.to_string());
                }
            }
            "p" | "publish" => {
                let (mapping, proto) = match value.split_once('/') {
                    Some((m, p)) => (m, Some(p)),
                    None => (value, None),
                };
                if let Some(port) = mapping.rsplit(':').next().and_then(|p| p.parse::<u16>().ok())
                    && port != 0
                {
                    self.ports.insert(port, Port::new(port, proto));
                }
            }
            "v" | "volume" => {
                let parts: Vec<&str> = value.split(':').collect();
                let path = if parts.len() >= 2 { parts[1] } else { parts[0] };
                if !path.is_empty() {
                    self.volumes.insert(path.to_string(), Volume::share_file(path));
                }
            }
            "m" | "memory" => self.memory = read_memory(value),
            "name" => self.name = Some(value.to_string()),
            _ => {}
        }
    }
}

fn normalize(source: &str) -> String {
    source
        .replace("\\\n", " ")
        .replace(['\n', '\r', '\t'], " ")
        .trim()
        .to_string()
}

/// Check a `docker run` command or a bare image name.
///
/// The image is pulled (authenticating with `auth` when given) and its
/// configuration merged into the result; values declared on the command
/// line win over the image's.
pub async fn check(
    source: &str,
    auth: Option<&RegistryAuth>,
    images: &dyn ImageClient,
    logger: &dyn Logger,
    timeout: Duration,
) -> CheckResult {
    let source = normalize(source);
    if source.is_empty() {
        return CheckResult::fatal("source can not be empty", "provide a docker run command or image name");
    }

    let spec = if source.starts_with("docker ") {
        let spec = DockerRunSpec::parse(&source);
        if spec.image.is_none() {
            return CheckResult::fatal(
                "image name could not be recognised",
                "check that the docker run command is correct",
            );
        }
        spec
    } else {
        DockerRunSpec {
            image: Some(source.clone()),
            ..Default::default()
        }
    };

    let raw_image = spec.image.clone().unwrap_or_default();
    let image = match ImageName::parse(&raw_image) {
        Ok(image) => image,
        Err(_) => {
            return CheckResult::fatal(
                format!("image name ({}) is invalid", raw_image),
                "check the image name",
            );
        }
    };
    let reference = image.to_string();

    if let Err(e) = images.pull(&reference, auth, logger, timeout).await {
        debug!(image = %reference, error = %e, "Service check pull failed");
        return match e {
            ImageError::NotFound { .. } => CheckResult::fatal(
                format!("image ({}) does not exist", reference),
                "check the image name",
            ),
            _ => CheckResult::fatal(
                format!("image ({}) could not be pulled", reference),
                "check that the image can be pulled",
            ),
        };
    }

    let mut ports = spec.ports;
    let mut volumes = spec.volumes;
    let mut envs = spec.envs;
    let mut errors = Vec::new();

    match images.inspect(&reference).await {
        Ok(metadata) => {
            for (name, value) in metadata.envs {
                envs.entry(name).or_insert(value);
            }
            for path in metadata.volumes {
                volumes
                    .entry(path.clone())
                    .or_insert_with(|| Volume::share_file(path));
            }
            for exposed in metadata.exposed_ports {
                let (port, proto) = exposed.split_once('/').unwrap_or((&exposed, "tcp"));
                if let Ok(port) = port.parse::<u16>() {
                    ports.insert(port, Port::new(port, Some(proto)));
                }
            }
        }
        Err(e) => errors.push(ParseError::negligible(
            format!("image ({}) metadata could not be read: {}", reference, e),
            "ports, volumes and environment may need to be set manually",
        )),
    }

    let service = ServiceInfo {
        name: spec.name,
        ports: ports.into_values().collect(),
        envs: envs
            .into_iter()
            .map(|(name, value)| Env { name, value })
            .collect(),
        volumes: volumes.into_values().collect(),
        deploy_type: Some(deploy_type(image.simple_name()).to_string()),
        image: Some(reference),
        args: spec.args,
        memory: if spec.memory == 0 { DEFAULT_MEMORY } else { spec.memory },
        ..Default::default()
    };

    CheckResult {
        errors,
        services: vec![service],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventLogManager, RecordingEventLogManager};
    use crate::sources::{ImageCall, ImageMetadata, MockImageClient};

    #[test]
    fn test_split_args_quotes() {
        assert_eq!(
            split_args(r#"docker run -e "GREETING=hello world" nginx"#),
            vec!["docker", "run", "-e", "GREETING=hello world", "nginx"]
        );
        assert_eq!(split_args("a  \\\n b"), vec!["a", "b"]);
    }

    #[test]
    fn test_parse_full_command() {
        let spec = DockerRunSpec::parse(
            "docker run -d --name web -p 8080:80 -p 53:53/udp -v /srv/data:/data -e MODE=prod -m 1g --restart=always nginx:1.21 -g daemon",
        );
        assert_eq!(spec.image.as_deref(), Some("nginx:1.21"));
        assert_eq!(spec.name.as_deref(), Some("web"));
        assert_eq!(spec.ports[&80].protocol, "http");
        assert_eq!(spec.ports[&53].protocol, "udp");
        assert!(spec.volumes.contains_key("/data"));
        assert_eq!(spec.envs["MODE"], "prod");
        assert_eq!(spec.memory, 1024);
        assert_eq!(spec.args, vec!["-g", "daemon"]);
    }

    #[test]
    fn test_parse_combined_short_flags() {
        let spec = DockerRunSpec::parse("docker run -itd --rm redis");
        assert_eq!(spec.image.as_deref(), Some("redis"));
    }

    #[test]
    fn test_parse_without_image() {
        assert_eq!(DockerRunSpec::parse("docker run -d").image, None);
    }

    #[tokio::test]
    async fn test_check_merges_image_metadata() {
        let mut metadata = ImageMetadata::default();
        metadata.envs.insert("MODE".into(), "dev".into());
        metadata.envs.insert("PATH".into(), "/usr/bin".into());
        metadata.exposed_ports.push("3306/tcp".into());
        metadata.volumes.push("/var/lib/mysql".into());

        let images = MockImageClient::new().with_metadata("mysql:5.7", metadata);
        let events = RecordingEventLogManager::new();
        let logger = events.get_logger("e1");

        let result = check(
            "docker run -e MODE=prod mysql:5.7",
            None,
            &images,
            logger.as_ref(),
            Duration::from_secs(60),
        )
        .await;

        assert_eq!(result.status(), "success");
        let service = &result.services[0];
        assert_eq!(service.deploy_type.as_deref(), Some("stateful"));
        assert_eq!(service.memory, 512);
        assert!(service.envs.contains(&Env {
            name: "MODE".into(),
            value: "prod".into()
        }));
        assert_eq!(service.ports[0].protocol, "mysql");
        assert_eq!(service.volumes[0].volume_path, "/var/lib/mysql");
        assert_eq!(images.count("pull"), 1);
    }

    #[tokio::test]
    async fn test_check_missing_image_is_fatal() {
        let images = MockImageClient::new().with_missing_image("ghost:latest");
        let events = RecordingEventLogManager::new();
        let logger = events.get_logger("e1");

        let result = check("ghost", None, &images, logger.as_ref(), Duration::from_secs(60)).await;

        assert!(result.is_failure());
        assert!(result.errors[0].error_info.contains("does not exist"));
        assert_eq!(
            images.calls(),
            vec![ImageCall::Pull {
                image: "ghost:latest".into(),
                authenticated: false
            }]
        );
    }

    #[tokio::test]
    async fn test_check_empty_source() {
        let images = MockImageClient::new();
        let events = RecordingEventLogManager::new();
        let logger = events.get_logger("e1");
        let result = check("  ", None, &images, logger.as_ref(), Duration::from_secs(60)).await;
        assert!(result.is_failure());
        assert!(images.calls().is_empty());
    }
}
