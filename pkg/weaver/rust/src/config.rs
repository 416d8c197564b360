// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::kernel::DEFAULT_KERNEL_PORT;

pub const DEFAULT_API_URL: &str = "http://localhost:8080";
pub const DEFAULT_USERNAME: &str = "admin";
pub const DEFAULT_PASSWORD: &str = "admin";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Loopback address on [`DEFAULT_KERNEL_PORT`].
pub fn default_kernel_addr() -> String {
    format!("127.0.0.1:{DEFAULT_KERNEL_PORT}")
}

/// Connection settings for both the control plane and the kernel.
///
/// Missing fields take their defaults, so an empty YAML document is a valid
/// configuration. Environment lookup is left to the binary.
#[derive(Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub api_url: String,
    pub username: String,
    pub password: String,
    pub kernel_addr: String,
    #[serde(rename = "timeout_secs", deserialize_with = "duration_from_secs")]
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(
        api_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            api_url: api_url.into(),
            username: username.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    pub fn with_kernel_addr(mut self, addr: impl Into<String>) -> Self {
        self.kernel_addr = addr.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            username: DEFAULT_USERNAME.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            kernel_addr: default_kernel_addr(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_url", &self.api_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("kernel_addr", &self.kernel_addr)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn duration_from_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}
