// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything the manifest compiler and the two transports can fail with.
///
/// Nothing here is retried internally; callers own retry and backoff.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing manifest fields, or an unparseable unit string.
    #[error("invalid manifest: {0}")]
    Validation(String),

    #[error("authentication failed: invalid credentials")]
    Authentication,

    #[error("resource not found")]
    NotFound,

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// A complete message envelope could not be read off the wire.
    #[error("framing error: {context}")]
    Framing { context: String },

    /// The envelope was complete but its contents could not be interpreted.
    #[error("decode error: {context}")]
    Decode { context: String },

    #[error("{operation} timed out after {}s", after.as_secs_f64())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("kernel connection to {addr} failed")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Socket I/O failed mid-exchange for a reason other than the peer
    /// closing early.
    #[error("kernel socket I/O failed while {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A caller-supplied value that cannot be put on the wire, such as an
    /// unusable base URL or a resource id that is not a path segment.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("request to control plane failed")]
    Request(#[source] reqwest::Error),

    /// 2xx JSON that is neither a deployment record nor a list of them.
    #[error("unexpected response body: {0}")]
    UnexpectedBody(String),
}

impl Error {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub(crate) fn framing(context: impl Into<String>) -> Self {
        Error::Framing {
            context: context.into(),
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn decode(context: impl Into<String>) -> Self {
        Error::Decode {
            context: context.into(),
        }
    }
}
