// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Language detection by marker files.

use std::fmt;
use std::path::Path;

/// Languages the slug builder knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lang {
    /// Built from the repository's Dockerfile.
    Dockerfile,
    /// Maven project.
    JavaMaven,
    /// Gradle project.
    Gradle,
    /// Prebuilt jar.
    JavaJar,
    /// Prebuilt war.
    JavaWar,
    /// Python.
    Python,
    /// PHP.
    Php,
    /// Node.js.
    NodeJs,
    /// Ruby.
    Ruby,
    /// Go.
    Go,
    /// .NET Core.
    NetCore,
    /// Static files.
    Static,
}

impl Lang {
    /// Name passed to the build script.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dockerfile => "dockerfile",
            Self::JavaMaven => "Java-maven",
            Self::Gradle => "Gradle",
            Self::JavaJar => "Java-jar",
            Self::JavaWar => "Java-war",
            Self::Python => "Python",
            Self::Php => "PHP",
            Self::NodeJs => "Node.js",
            Self::Ruby => "Ruby",
            Self::Go => "Go",
            Self::NetCore => "NetCore",
            Self::Static => "static",
        }
    }

    /// Memory (MiB) recommended for services in this language.
    pub fn recommended_memory(&self) -> u32 {
        match self {
            Self::JavaMaven | Self::Gradle | Self::JavaJar | Self::JavaWar => 1024,
            _ => 512,
        }
    }
}

impl fmt::Display for Lang {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered marker table; the first match wins.
const MARKERS: &[(Lang, &[&str])] = &[
    (Lang::Dockerfile, &["Dockerfile"]),
    (Lang::JavaMaven, &["pom.xml"]),
    (Lang::Gradle, &["build.gradle", "build.gradle.kts"]),
    (Lang::Python, &["requirements.txt", "setup.py", "Pipfile", "pyproject.toml"]),
    (Lang::Php, &["composer.json", "index.php"]),
    (Lang::NodeJs, &["package.json"]),
    (Lang::Ruby, &["Gemfile"]),
    (Lang::Go, &["go.mod", "Godeps/Godeps.json", "glide.yaml"]),
    (Lang::Static, &["index.html"]),
];

fn has_extension(dir: &Path, extension: &str) -> bool {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries.filter_map(|e| e.ok()).any(|e| {
                e.path()
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
            })
        })
        .unwrap_or(false)
}

/// Detect the language of the checkout at `dir`.
pub fn detect(dir: &Path) -> Option<Lang> {
    if let Some((lang, _)) = MARKERS
        .iter()
        .find(|(_, files)| files.iter().any(|f| dir.join(f).is_file()))
    {
        return Some(*lang);
    }
    if has_extension(dir, "csproj") || has_extension(dir, "sln") {
        return Some(Lang::NetCore);
    }
    if has_extension(dir, "war") {
        return Some(Lang::JavaWar);
    }
    if has_extension(dir, "jar") {
        return Some(Lang::JavaJar);
    }
    None
}
