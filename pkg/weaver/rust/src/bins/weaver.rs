// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::{debug, info};
use serde::Serialize;
use uuid::Uuid;
use weaver::manifest::DEFAULT_MANIFEST;
use weaver::rest::DeploymentStatus;
use weaver::{ApiResponse, ClientConfig, KernelReply, Orchestrator};

/// Deploy multi-service applications to the control plane and drive the
/// process kernel directly.
#[derive(Parser, Debug)]
#[command(name = "weaver", version)]
struct Args {
    /// Control-plane base URL
    #[arg(long, env = "WEAVER_API_URL", default_value = weaver::config::DEFAULT_API_URL)]
    api_url: String,

    #[arg(long, env = "WEAVER_USERNAME", default_value = weaver::config::DEFAULT_USERNAME)]
    username: String,

    #[arg(long, env = "WEAVER_PASSWORD", default_value = weaver::config::DEFAULT_PASSWORD, hide_env_values = true)]
    password: String,

    /// Kernel address as host:port
    #[arg(long, env = "WEAVER_KERNEL_ADDR", default_value_t = weaver::config::default_kernel_addr())]
    kernel_addr: String,

    /// Connect and request timeout for both transports
    #[arg(long, env = "WEAVER_TIMEOUT_SECS", default_value_t = weaver::config::DEFAULT_TIMEOUT.as_secs())]
    timeout_secs: u64,

    #[arg(long, default_value = "warn", global = true)]
    log_level: log::Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a starter manifest in the current directory
    Init {
        #[arg(long, default_value = "my-app")]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Overwrite an existing manifest
        #[arg(long)]
        force: bool,
    },
    /// Compile a manifest and submit it as a new deployment
    Deploy {
        #[arg(short = 'f', long = "file", default_value = DEFAULT_MANIFEST)]
        file: PathBuf,
        /// Replace the manifest's version
        #[arg(short = 'v', long)]
        version: Option<String>,
    },
    /// List deployments
    List {
        /// Only deployments of this application (case-insensitive)
        #[arg(long)]
        app: Option<String>,
        #[arg(long)]
        status: Option<DeploymentStatus>,
    },
    /// Show one deployment
    Status { id: String },
    Stop { id: String },
    Start { id: String },
    Delete { id: String },
    /// Application catalogue
    #[command(subcommand)]
    Apps(AppsCommand),
    /// Talk to the process kernel directly
    #[command(subcommand)]
    Kernel(KernelCommand),
}

#[derive(Subcommand, Debug)]
enum AppsCommand {
    List,
    Get { id: String },
    Delete { id: String },
}

#[derive(Subcommand, Debug)]
enum KernelCommand {
    Health,
    List,
    Get {
        id: String,
    },
    Stop {
        id: String,
    },
    Start {
        /// Process id; a random 8-character id when omitted
        #[arg(long)]
        id: Option<String>,
        name: String,
        /// Command line, passed to the kernel unsplit
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
}

const MANIFEST_TEMPLATE: &str = r#"name: {name}
description: {description}
version: 1.0.0

services:
  web:
    language: python
    port: 8000
    source: .
    command: python app.py
    environment:
      LOG_LEVEL: info
    limits:
      memory: 512M
      cpu_shares: 1024
      pids_limit: 1000
"#;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    simple_logger::init_with_level(args.log_level)?;
    debug!("Log level set to: {:?}", args.log_level);

    let config = ClientConfig::new(&args.api_url, &args.username, &args.password)
        .with_kernel_addr(&args.kernel_addr)
        .with_timeout(Duration::from_secs(args.timeout_secs));

    match args.command {
        Command::Init {
            name,
            description,
            force,
        } => {
            write_template(Path::new(DEFAULT_MANIFEST), &name, &description, force)?;
            println!("Created {DEFAULT_MANIFEST}");
            Ok(ExitCode::SUCCESS)
        }
        command => {
            let orchestrator = Orchestrator::new(&config).context("failed to build client")?;
            run(&orchestrator, command).await
        }
    }
}

async fn run(orchestrator: &Orchestrator, command: Command) -> Result<ExitCode> {
    match command {
        Command::Init { .. } => bail!("init does not talk to the control plane"),
        Command::Deploy { file, version } => {
            let raw = weaver::load_manifest(&file)?;
            let mut descriptor = weaver::compile(&raw)?;
            if let Some(version) = version {
                descriptor.override_version(version)?;
            }
            info!(
                "deploying {} {} from {}",
                descriptor.name(),
                descriptor.version(),
                file.display()
            );
            print_response(orchestrator.deploy(descriptor).await?)?;
        }
        Command::List { app, status } => {
            let response = orchestrator
                .list_deployments(app.as_deref(), status.as_ref().map(DeploymentStatus::as_str))
                .await?;
            print_response(response)?;
        }
        Command::Status { id } => print_response(orchestrator.get_deployment(&id).await?)?,
        Command::Stop { id } => print_response(orchestrator.stop(&id).await?)?,
        Command::Start { id } => print_response(orchestrator.start(&id).await?)?,
        Command::Delete { id } => {
            orchestrator.delete(&id).await?;
            println!("Deleted deployment {id}");
        }
        Command::Apps(AppsCommand::List) => {
            print_response(orchestrator.list_applications().await?)?
        }
        Command::Apps(AppsCommand::Get { id }) => {
            print_response(orchestrator.get_application(&id).await?)?
        }
        Command::Apps(AppsCommand::Delete { id }) => {
            orchestrator.delete_application(&id).await?;
            println!("Deleted application {id}");
        }
        Command::Kernel(cmd) => return kernel(orchestrator, cmd).await,
    }
    Ok(ExitCode::SUCCESS)
}

async fn kernel(orchestrator: &Orchestrator, command: KernelCommand) -> Result<ExitCode> {
    let reply = match command {
        KernelCommand::Health => orchestrator.health_check().await?,
        KernelCommand::List => orchestrator.list_processes().await?,
        KernelCommand::Get { id } => orchestrator.get_process(&id).await?,
        KernelCommand::Stop { id } => orchestrator.stop_process(&id).await?,
        KernelCommand::Start { id, name, command } => {
            let id = id.unwrap_or_else(short_id);
            orchestrator
                .start_process(&id, &name, &command.join(" "))
                .await?
        }
    };
    Ok(print_reply(&reply))
}

fn print_reply(reply: &KernelReply) -> ExitCode {
    println!("{}", reply.text);
    if reply.error_text().is_some() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn print_response<T: Serialize>(response: ApiResponse<T>) -> Result<()> {
    let rendered = match response {
        ApiResponse::Record(record) => serde_json::to_string_pretty(&record)?,
        ApiResponse::RecordList(records) => serde_json::to_string_pretty(&records)?,
        ApiResponse::RawText(text) => text,
    };
    println!("{rendered}");
    Ok(())
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string().chars().take(8).collect()
}

fn write_template(path: &Path, name: &str, description: &str, force: bool) -> Result<()> {
    // JSON strings are valid YAML scalars, so quoting is handled for us.
    let contents = MANIFEST_TEMPLATE
        .replace("{name}", &serde_json::to_string(name)?)
        .replace("{description}", &serde_json::to_string(description)?);
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .create(force)
        .create_new(!force)
        .open(path)
        .with_context(|| {
            format!(
                "cannot create {} (use --force to overwrite an existing file)",
                path.display()
            )
        })?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))
}
