// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::time::Duration;

use log::{debug, info};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::errors::{Error, Result};
use crate::protocol::{self, KernelRequest, MessageType, ProtocolMessage};

pub const DEFAULT_KERNEL_PORT: u16 = 50051;

const ERROR_PREFIX: &str = "ERROR:";

/// Text the kernel sent back for one request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KernelReply {
    pub message_type: MessageType,
    pub text: String,
}

impl KernelReply {
    /// The reference kernel prefixes failures with `ERROR:`. This is advisory:
    /// the frame itself carries no status, and other kernels may differ.
    pub fn error_text(&self) -> Option<&str> {
        self.text.strip_prefix(ERROR_PREFIX).map(str::trim)
    }
}

impl From<ProtocolMessage> for KernelReply {
    fn from(message: ProtocolMessage) -> Self {
        Self {
            message_type: message.message_type,
            text: message.payload,
        }
    }
}

/// Client for the kernel's framed TCP protocol.
///
/// Each call opens its own connection, writes one request, reads one reply
/// and closes. There is no pooling, pipelining or reconnection.
#[derive(Clone, Debug)]
pub struct KernelClient {
    addr: String,
}

impl KernelClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// One request/response exchange. `limit` bounds the connect and, separately,
    /// the write-then-read of the reply.
    pub async fn call(&self, message: &ProtocolMessage, limit: Duration) -> Result<ProtocolMessage> {
        debug!(
            "kernel {}: sending {} ({} payload bytes)",
            self.addr,
            message.message_type,
            message.payload.len()
        );

        let mut stream = timeout(limit, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| Error::Timeout {
                operation: "kernel connect",
                after: limit,
            })?
            .map_err(|source| Error::Connect {
                addr: self.addr.clone(),
                source,
            })?;

        let reply = timeout(limit, async {
            protocol::write_message(&mut stream, message).await?;
            protocol::read_message(&mut stream).await
        })
        .await
        .map_err(|_| Error::Timeout {
            operation: "kernel request",
            after: limit,
        })??;

        debug!(
            "kernel {}: received {} ({} payload bytes)",
            self.addr,
            reply.message_type,
            reply.payload.len()
        );
        Ok(reply)
    }

    pub async fn send(&self, request: &KernelRequest, limit: Duration) -> Result<KernelReply> {
        info!("kernel {}: {}", self.addr, request.message_type());
        self.call(&request.to_message(), limit)
            .await
            .map(KernelReply::from)
    }
}
