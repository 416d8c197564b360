// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::time::Duration;

use crate::config::ClientConfig;
use crate::descriptor::DeploymentDescriptor;
use crate::errors::Result;
use crate::kernel::{KernelClient, KernelReply};
use crate::protocol::KernelRequest;
use crate::rest::{ApiResponse, ApplicationRecord, RestClient};

/// Single entry point over both transports.
///
/// Deployment lifecycle goes over the control-plane REST API. Process
/// lifecycle goes over the kernel's framed TCP protocol, one connection per
/// call.
#[derive(Clone, Debug)]
pub struct Orchestrator {
    rest: RestClient,
    kernel: KernelClient,
    timeout: Duration,
}

impl Orchestrator {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            rest: RestClient::new(config)?,
            kernel: KernelClient::new(config.kernel_addr.clone()),
            timeout: config.timeout,
        })
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    pub fn kernel(&self) -> &KernelClient {
        &self.kernel
    }

    pub async fn deploy(&self, descriptor: DeploymentDescriptor) -> Result<ApiResponse> {
        self.rest.create_deployment(descriptor).await
    }

    pub async fn list_deployments(
        &self,
        app_name: Option<&str>,
        status: Option<&str>,
    ) -> Result<ApiResponse> {
        self.rest.list_deployments(app_name, status).await
    }

    pub async fn get_deployment(&self, id: &str) -> Result<ApiResponse> {
        self.rest.get_deployment(id).await
    }

    pub async fn stop(&self, id: &str) -> Result<ApiResponse> {
        self.rest.stop_deployment(id).await
    }

    pub async fn start(&self, id: &str) -> Result<ApiResponse> {
        self.rest.start_deployment(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.rest.delete_deployment(id).await
    }

    pub async fn list_applications(&self) -> Result<ApiResponse<ApplicationRecord>> {
        self.rest.list_applications().await
    }

    pub async fn get_application(&self, id: &str) -> Result<ApiResponse<ApplicationRecord>> {
        self.rest.get_application(id).await
    }

    pub async fn delete_application(&self, id: &str) -> Result<()> {
        self.rest.delete_application(id).await
    }

    /// `command` is the literal command line, forwarded without splitting.
    pub async fn start_process(
        &self,
        process_id: &str,
        process_name: &str,
        command: &str,
    ) -> Result<KernelReply> {
        self.send(KernelRequest::StartProcess {
            process_id: process_id.to_string(),
            process_name: process_name.to_string(),
            command: command.to_string(),
        })
        .await
    }

    pub async fn stop_process(&self, process_id: &str) -> Result<KernelReply> {
        self.send(KernelRequest::StopProcess {
            process_id: process_id.to_string(),
        })
        .await
    }

    pub async fn get_process(&self, process_id: &str) -> Result<KernelReply> {
        self.send(KernelRequest::GetProcess {
            process_id: process_id.to_string(),
        })
        .await
    }

    pub async fn list_processes(&self) -> Result<KernelReply> {
        self.send(KernelRequest::ListProcesses).await
    }

    pub async fn health_check(&self) -> Result<KernelReply> {
        self.send(KernelRequest::HealthCheck).await
    }

    async fn send(&self, request: KernelRequest) -> Result<KernelReply> {
        self.kernel.send(&request, self.timeout).await
    }
}
