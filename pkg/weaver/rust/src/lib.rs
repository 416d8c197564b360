// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

// Correctness
#![deny(clippy::indexing_slicing)]
#![deny(clippy::string_slice)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::undocumented_unsafe_blocks)]
// Panicking code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unimplemented)]
#![deny(clippy::todo)]
// Debug code that shouldn't be in production
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]

pub mod config;
pub mod descriptor;
mod errors;
pub mod kernel;
pub mod manifest;
pub mod orchestrator;
pub mod protocol;
pub mod rest;

// Re-export the public API
pub use config::ClientConfig;
pub use descriptor::{DeploymentDescriptor, Language, ResourceLimits, ServiceDescriptor};
pub use errors::{Error, Result};
pub use kernel::{KernelClient, KernelReply};
pub use manifest::{compile, load_manifest, parse_memory};
pub use orchestrator::Orchestrator;
pub use protocol::{KernelRequest, MessageType, ProtocolMessage};
pub use rest::{
    ApiResponse, ApplicationRecord, DeploymentRecord, DeploymentStatus, RestClient, ServiceRecord,
};
