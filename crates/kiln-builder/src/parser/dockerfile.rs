// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Minimal Dockerfile reader.
//!
//! Understands enough of the format to validate a file before handing it to
//! the image builder and to extract `ENV`, `EXPOSE`, `VOLUME` and `FROM`.

use std::collections::BTreeMap;

use super::Port;

const INSTRUCTIONS: &[&str] = &[
    "ADD",
    "ARG",
    "CMD",
    "COPY",
    "ENTRYPOINT",
    "ENV",
    "EXPOSE",
    "FROM",
    "HEALTHCHECK",
    "LABEL",
    "MAINTAINER",
    "ONBUILD",
    "RUN",
    "SHELL",
    "STOPSIGNAL",
    "USER",
    "VOLUME",
    "WORKDIR",
];

/// Problems that make a Dockerfile unusable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DockerfileError {
    /// No instructions at all.
    #[error("Dockerfile is empty")]
    Empty,
    /// The first instruction is not `FROM` (or `ARG` before it).
    #[error("Dockerfile must start with FROM")]
    MissingFrom,
    /// A line names an unknown instruction.
    #[error("unknown instruction '{instruction}' on line {line}")]
    UnknownInstruction {
        /// The instruction word.
        instruction: String,
        /// 1-based line number.
        line: usize,
    },
}

/// What a Dockerfile declares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DockerfileInfo {
    /// Base images, in stage order.
    pub base_images: Vec<String>,
    /// `ENV` values.
    pub envs: BTreeMap<String, String>,
    /// `EXPOSE` ports by number.
    pub ports: BTreeMap<u16, Port>,
    /// `VOLUME` paths.
    pub volumes: Vec<String>,
    /// `ARG` names with their defaults.
    pub args: BTreeMap<String, Option<String>>,
}

/// Logical instructions with their 1-based starting line.
fn instructions(content: &str) -> Vec<(usize, String)> {
    let mut result = Vec::new();
    let mut current = String::new();
    let mut start = 0;

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if current.is_empty() && (line.is_empty() || line.starts_with('#')) {
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        if current.is_empty() {
            start = index + 1;
        }
        match line.strip_suffix('\\') {
            Some(head) => {
                current.push_str(head.trim_end());
                current.push(' ');
            }
            None => {
                current.push_str(line);
                result.push((start, std::mem::take(&mut current).trim().to_string()));
            }
        }
    }
    if !current.trim().is_empty() {
        result.push((start, current.trim().to_string()));
    }
    result
}

fn json_or_words(value: &str) -> Vec<String> {
    if value.starts_with('[')
        && let Ok(list) = serde_json::from_str::<Vec<String>>(value)
    {
        return list;
    }
    value.split_whitespace().map(str::to_string).collect()
}

fn unquote(value: &str) -> String {
    value.trim_matches(|c| c == '"' || c == '\'').to_string()
}

/// Parse and validate a Dockerfile.
pub fn parse_dockerfile(content: &str) -> Result<DockerfileInfo, DockerfileError> {
    let instructions = instructions(content);
    if instructions.is_empty() {
        return Err(DockerfileError::Empty);
    }

    let mut info = DockerfileInfo::default();
    for (line, instruction) in &instructions {
        let (word, rest) = instruction
            .split_once(char::is_whitespace)
            .unwrap_or((instruction.as_str(), ""));
        let keyword = word.to_ascii_uppercase();
        let rest = rest.trim();

        if !INSTRUCTIONS.contains(&keyword.as_str()) {
            return Err(DockerfileError::UnknownInstruction {
                instruction: word.to_string(),
                line: *line,
            });
        }
        if info.base_images.is_empty() && keyword != "FROM" && keyword != "ARG" {
            return Err(DockerfileError::MissingFrom);
        }

        match keyword.as_str() {
            "FROM" => {
                let image = rest
                    .split_whitespace()
                    .find(|w| !w.starts_with("--"))
                    .unwrap_or_default();
                info.base_images.push(image.to_string());
            }
            "ARG" => {
                let (name, default) = match rest.split_once('=') {
                    Some((n, d)) => (n, Some(unquote(d))),
                    None => (rest, None),
                };
                info.args.insert(name.to_string(), default);
            }
            "ENV" => {
                if rest.contains('=') {
                    for pair in super::docker_run::split_args(rest) {
                        if let Some((k, v)) = pair.split_once('=') {
                            info.envs.insert(k.to_string(), v.to_string());
                        }
                    }
                } else if let Some((k, v)) = rest.split_once(char::is_whitespace) {
                    info.envs.insert(k.to_string(), unquote(v.trim()));
                }
            }
            "EXPOSE" => {
                for entry in rest.split_whitespace() {
                    let (port, proto) = match entry.split_once('/') {
                        Some((p, proto)) => (p, Some(proto)),
                        None => (entry, None),
                    };
                    if let Ok(port) = port.parse::<u16>() {
                        info.ports.insert(port, Port::new(port, proto));
                    }
                }
            }
            "VOLUME" => info.volumes.extend(json_or_words(rest)),
            _ => {}
        }
    }

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_common_instructions() {
        let content = r#"
# build stage
ARG PY=3.11
FROM python:${PY}-slim AS base
ENV APP_HOME=/app MODE="prod"
ENV LEGACY value with spaces
EXPOSE 8000 53/udp
VOLUME ["/data", "/logs"]
RUN pip install \
    flask \
    gunicorn
CMD ["gunicorn", "app:app"]
"#;
        let info = parse_dockerfile(content).unwrap();
        assert_eq!(info.base_images, vec!["python:${PY}-slim"]);
        assert_eq!(info.args["PY"].as_deref(), Some("3.11"));
        assert_eq!(info.envs["APP_HOME"], "/app");
        assert_eq!(info.envs["MODE"], "prod");
        assert_eq!(info.envs["LEGACY"], "value with spaces");
        assert_eq!(info.ports[&8000].protocol, "http");
        assert_eq!(info.ports[&53].protocol, "udp");
        assert_eq!(info.volumes, vec!["/data", "/logs"]);
    }

    #[test]
    fn test_rejects_invalid_files() {
        assert_eq!(parse_dockerfile("# nothing\n\n"), Err(DockerfileError::Empty));
        assert_eq!(parse_dockerfile("RUN echo hi"), Err(DockerfileError::MissingFrom));
        assert_eq!(
            parse_dockerfile("FROM alpine\nBUILDME now"),
            Err(DockerfileError::UnknownInstruction {
                instruction: "BUILDME".into(),
                line: 2
            })
        );
    }

    #[test]
    fn test_lowercase_and_multistage() {
        let info = parse_dockerfile("from golang:1.22 as build\nfrom --platform=linux/amd64 alpine:3.19\n").unwrap();
        assert_eq!(info.base_images, vec!["golang:1.22", "alpine:3.19"]);
    }
}
