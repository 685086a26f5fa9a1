// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service source checks.
//!
//! A check inspects a service source descriptor and returns the metadata the
//! platform needs to create the service, together with a list of problems.
//! Each problem is either fatal (the service cannot be created from this
//! source) or negligible (advisory).
//!
//! | `source_type` | Parser |
//! |---------------|--------|
//! | `docker-run` | [`docker_run`]: `docker run ...` command or bare image name |
//! | `docker-compose` | [`docker_compose`]: compose YAML |
//! | `sourcecode` | [`source_code`]: git repository |

pub mod docker_compose;
pub mod docker_run;
pub mod dockerfile;
pub mod lang;
pub mod source_code;

use serde::{Deserialize, Serialize};

/// Severity of a check problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseErrorType {
    /// The source cannot be used.
    FatalError,
    /// Advisory only.
    NegligibleError,
}

/// One problem found by a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseError {
    /// Severity.
    pub error_type: ParseErrorType,
    /// What is wrong.
    pub error_info: String,
    /// What the user can do about it.
    pub solve_advice: String,
}

impl ParseError {
    /// A fatal problem.
    pub fn fatal(info: impl Into<String>, advice: impl Into<String>) -> Self {
        Self {
            error_type: ParseErrorType::FatalError,
            error_info: info.into(),
            solve_advice: advice.into(),
        }
    }

    /// An advisory problem.
    pub fn negligible(info: impl Into<String>, advice: impl Into<String>) -> Self {
        Self {
            error_type: ParseErrorType::NegligibleError,
            error_info: info.into(),
            solve_advice: advice.into(),
        }
    }

    /// True for [`ParseErrorType::FatalError`].
    pub fn is_fatal(&self) -> bool {
        self.error_type == ParseErrorType::FatalError
    }
}

/// A container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    /// Port inside the container.
    pub container_port: u16,
    /// `http`, `https`, `tcp`, `udp`, `mysql`.
    pub protocol: String,
}

impl Port {
    /// Port with the protocol guessed from its number, unless it is UDP.
    pub fn new(container_port: u16, declared_protocol: Option<&str>) -> Self {
        let protocol = match declared_protocol {
            Some(p) if p.eq_ignore_ascii_case("udp") => "udp".to_string(),
            _ => port_protocol(container_port).to_string(),
        };
        Self {
            container_port,
            protocol,
        }
    }
}

/// An environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Env {
    /// Name.
    pub name: String,
    /// Value.
    pub value: String,
}

/// Volume type of plain data volumes.
pub const SHARE_FILE_VOLUME: &str = "share-file";

/// A container volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Mount path inside the container.
    pub volume_path: String,
    /// Volume type.
    pub volume_type: String,
}

impl Volume {
    /// Data volume mounted at `path`.
    pub fn share_file(path: impl Into<String>) -> Self {
        Self {
            volume_path: path.into(),
            volume_type: SHARE_FILE_VOLUME.to_string(),
        }
    }
}

/// Metadata of one service found by a check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Service name (compose services).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Container ports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<Port>,
    /// Environment variables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub envs: Vec<Env>,
    /// Volumes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    /// Image reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Start arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Services this one depends on.
    #[serde(default, rename = "depends", skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<String>,
    /// `stateless` or `stateful`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_type: Option<String>,
    /// Repository branches (source checks).
    #[serde(default, rename = "branchs", skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<String>,
    /// Memory in MiB.
    #[serde(default)]
    pub memory: u32,
    /// Detected language (source checks).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Outcome of a check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Problems found.
    pub errors: Vec<ParseError>,
    /// Services found.
    pub services: Vec<ServiceInfo>,
}

impl CheckResult {
    /// Result holding a single fatal problem.
    pub fn fatal(info: impl Into<String>, advice: impl Into<String>) -> Self {
        Self {
            errors: vec![ParseError::fatal(info, advice)],
            services: Vec::new(),
        }
    }

    /// True iff any problem is fatal.
    pub fn is_failure(&self) -> bool {
        self.errors.iter().any(ParseError::is_fatal)
    }

    /// `failure` or `success`.
    pub fn status(&self) -> &'static str {
        if self.is_failure() { "failure" } else { "success" }
    }
}

/// Protocol guessed from a well-known port number.
pub fn port_protocol(port: u16) -> &'static str {
    match port {
        80 | 8080 | 3128 => "http",
        22 | 6379 => "tcp",
        3306 => "mysql",
        443 => "https",
        1080 => "udp",
        p if p > 1 && p < 5000 => "tcp",
        _ => "http",
    }
}

/// Memory in MiB from a `docker run -m` style value.
///
/// `512m` is 512, `2g` is 2048; anything else is 128.
pub fn read_memory(value: &str) -> u32 {
    let value = value.trim().to_ascii_lowercase();
    if let Some(n) = value.strip_suffix('m') {
        return n.parse().unwrap_or(128);
    }
    if let Some(n) = value.strip_suffix('g') {
        return n.parse::<u32>().map(|n| n.saturating_mul(1024)).unwrap_or(128);
    }
    128
}

const STATEFUL_IMAGES: &[&str] = &[
    "mysql",
    "mariadb",
    "mongo",
    "redis",
    "tidb",
    "zookeeper",
    "kafka",
    "mysqldb",
    "mongodb",
    "memcached",
    "cockroachdb",
    "cockroach",
    "etcd",
    "postgres",
    "postgresql",
    "elasticsearch",
    "consul",
    "percona",
    "mysql-server",
    "mysql-cluster",
];

/// `stateful` for well-known database images, otherwise `stateless`.
pub fn deploy_type(simple_image_name: &str) -> &'static str {
    let name = simple_image_name.to_ascii_lowercase();
    if STATEFUL_IMAGES.contains(&name.as_str()) {
        "stateful"
    } else {
        "stateless"
    }
}
