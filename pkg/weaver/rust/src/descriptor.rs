// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::errors::{Error, Result};

pub const DEFAULT_MEMORY_BYTES: u64 = 536_870_912;
pub const DEFAULT_CPU_SHARES: u32 = 1024;
pub const DEFAULT_PIDS_LIMIT: u32 = 1000;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Node,
    #[serde(rename = "nodejs")]
    NodeJS,
    Java,
    CSharp,
    Go,
    C,
    #[serde(rename = "c++")]
    CPlusPlus,
    TypeScript,
    JavaScript,
}

impl Language {
    pub const ALL: [Language; 10] = [
        Self::Python,
        Self::Node,
        Self::NodeJS,
        Self::Java,
        Self::CSharp,
        Self::Go,
        Self::C,
        Self::CPlusPlus,
        Self::TypeScript,
        Self::JavaScript,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Node => "node",
            Self::NodeJS => "nodejs",
            Self::Java => "java",
            Self::CSharp => "csharp",
            Self::Go => "go",
            Self::C => "c",
            Self::CPlusPlus => "c++",
            Self::TypeScript => "typescript",
            Self::JavaScript => "javascript",
        }
    }

    /// Case-insensitive lookup against the supported set.
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_lowercase();
        Self::ALL.into_iter().find(|lang| lang.as_str() == lower)
    }

    pub fn supported_names() -> String {
        Self::ALL
            .iter()
            .map(Language::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource limits with memory already normalized to bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    #[serde(rename = "memory")]
    pub memory_bytes: u64,
    pub cpu_shares: u32,
    pub pids_limit: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: DEFAULT_MEMORY_BYTES,
            cpu_shares: DEFAULT_CPU_SHARES,
            pids_limit: DEFAULT_PIDS_LIMIT,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub language: Language,
    pub port: Option<u16>,
    pub source: PathBuf,
    /// `None` lets the runtime decide how to start the service.
    pub command: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub limits: ResourceLimits,
}

/// A compiled manifest. Only `version` may change after compilation, and
/// only once.
#[derive(Clone, Debug, PartialEq)]
pub struct DeploymentDescriptor {
    name: String,
    description: String,
    version: String,
    version_overridden: bool,
    /// Manifest order; names are unique.
    services: Vec<ServiceDescriptor>,
}

impl DeploymentDescriptor {
    pub(crate) fn new(
        name: String,
        description: String,
        version: String,
        services: Vec<ServiceDescriptor>,
    ) -> Self {
        Self {
            name,
            description,
            version,
            version_overridden: false,
            services,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    pub fn service(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Replace the manifest (or synthetic) version before submission.
    pub fn override_version(&mut self, version: impl Into<String>) -> Result<()> {
        if self.version_overridden {
            return Err(Error::validation(format!(
                "version of '{}' was already overridden to {}",
                self.name, self.version
            )));
        }
        let version = version.into();
        if version.trim().is_empty() {
            return Err(Error::validation("version override must not be empty"));
        }
        self.version = version;
        self.version_overridden = true;
        Ok(())
    }
}
