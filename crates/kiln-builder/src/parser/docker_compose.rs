// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! docker-compose file check.
//!
//! Version 2 and 3 files keep their services under `services`; version 1
//! files put them at the top level.

use std::collections::BTreeMap;

use serde_yaml::Value;

use super::{CheckResult, Env, ParseError, Port, ServiceInfo, Volume, deploy_type, read_memory};
use crate::sources::ImageName;

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Sequence(items)) => items.iter().filter_map(as_string).collect(),
        Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
        Some(Value::Mapping(map)) => map.keys().filter_map(as_string).collect(),
        _ => Vec::new(),
    }
}

fn parse_port(value: &Value) -> Option<Port> {
    let (raw, declared) = match value {
        Value::Number(n) => (n.to_string(), None),
        Value::String(s) => match s.split_once('/') {
            Some((p, proto)) => (p.to_string(), Some(proto.to_string())),
            None => (s.clone(), None),
        },
        Value::Mapping(map) => (
            map.get("target").and_then(as_string)?,
            map.get("protocol").and_then(as_string),
        ),
        _ => return None,
    };
    let container = raw.rsplit(':').next()?;
    // Ranges map to their first port.
    let container = container.split('-').next()?;
    let port = container.trim().parse::<u16>().ok()?;
    Some(Port::new(port, declared.as_deref()))
}

fn parse_volume(value: &Value) -> Option<Volume> {
    match value {
        Value::String(s) => {
            let parts: Vec<&str> = s.split(':').collect();
            let path = if parts.len() >= 2 { parts[1] } else { parts[0] };
            Some(Volume::share_file(path))
        }
        Value::Mapping(map) => map
            .get("target")
            .and_then(as_string)
            .map(Volume::share_file),
        _ => None,
    }
}

fn parse_environment(value: Option<&Value>) -> BTreeMap<String, String> {
    let mut envs = BTreeMap::new();
    match value {
        Some(Value::Sequence(items)) => {
            for item in items.iter().filter_map(as_string) {
                let (k, v) = item.split_once('=').unwrap_or((&item, ""));
                envs.insert(k.to_string(), v.to_string());
            }
        }
        Some(Value::Mapping(map)) => {
            for (k, v) in map {
                if let Some(k) = as_string(k) {
                    envs.insert(k, as_string(v).unwrap_or_default());
                }
            }
        }
        _ => {}
    }
    envs
}

fn service_info(name: &str, service: &Value, errors: &mut Vec<ParseError>) -> Option<ServiceInfo> {
    let image = match service.get("image").and_then(as_string) {
        Some(image) if !image.trim().is_empty() => image,
        _ => {
            errors.push(ParseError::fatal(
                format!("service {} has no image", name),
                format!("specify an image for {}", name),
            ));
            return None;
        }
    };
    let parsed = match ImageName::parse(&image) {
        Ok(parsed) => parsed,
        Err(_) => {
            errors.push(ParseError::fatal(
                format!("service {} image ({}) is invalid", name, image),
                "check the image name",
            ));
            return None;
        }
    };

    let mut ports: BTreeMap<u16, Port> = BTreeMap::new();
    if let Some(Value::Sequence(items)) = service.get("ports") {
        for port in items.iter().filter_map(parse_port) {
            ports.insert(port.container_port, port);
        }
    }
    if let Some(Value::Sequence(items)) = service.get("expose") {
        for port in items.iter().filter_map(parse_port) {
            ports.entry(port.container_port).or_insert(port);
        }
    }

    let volumes = match service.get("volumes") {
        Some(Value::Sequence(items)) => items.iter().filter_map(parse_volume).collect(),
        _ => Vec::new(),
    };

    let memory = service
        .get("mem_limit")
        .or_else(|| {
            service
                .get("deploy")
                .and_then(|d| d.get("resources"))
                .and_then(|r| r.get("limits"))
                .and_then(|l| l.get("memory"))
        })
        .and_then(as_string)
        .map(|m| read_memory(&m.to_ascii_lowercase().replace("b", "")))
        .unwrap_or(0);

    Some(ServiceInfo {
        name: Some(
            service
                .get("container_name")
                .and_then(as_string)
                .unwrap_or_else(|| name.to_string()),
        ),
        ports: ports.into_values().collect(),
        envs: parse_environment(service.get("environment"))
            .into_iter()
            .map(|(name, value)| Env { name, value })
            .collect(),
        volumes,
        deploy_type: Some(deploy_type(parsed.simple_name()).to_string()),
        image: Some(parsed.to_string()),
        args: string_list(service.get("command")),
        depends: string_list(service.get("depends_on")),
        memory: if memory == 0 { 512 } else { memory },
        ..Default::default()
    })
}

/// Check a compose file.
pub fn check(source: &str) -> CheckResult {
    if source.trim().is_empty() {
        return CheckResult::fatal("source can not be empty", "provide a docker compose file");
    }

    let document: Value = match serde_yaml::from_str(source) {
        Ok(document) => document,
        Err(e) => {
            return CheckResult::fatal(
                format!("compose file could not be parsed: {}", e),
                "check the docker compose file format",
            );
        }
    };

    let services = match document.get("services") {
        Some(Value::Mapping(services)) => services,
        Some(_) => {
            return CheckResult::fatal("compose services must be a mapping", "check the docker compose file format");
        }
        None => match &document {
            Value::Mapping(top) if document.get("version").is_none() => top,
            _ => {
                return CheckResult::fatal("compose file declares no services", "add at least one service");
            }
        },
    };

    let mut result = CheckResult::default();
    for (name, service) in services {
        let Some(name) = as_string(name) else {
            continue;
        };
        if let Some(info) = service_info(&name, service, &mut result.errors) {
            result.services.push(info);
        }
    }
    if result.services.is_empty() && result.errors.is_empty() {
        result
            .errors
            .push(ParseError::fatal("compose file declares no services", "add at least one service"));
    }
    result
}
