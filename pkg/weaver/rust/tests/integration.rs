// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

mod helpers;

use std::io::Write;
use std::time::Duration;

use helpers::{BASIC_AUTH, FakeKernel, MockControlPlane, Route, is_failure};
use hyper::Method;
use weaver::protocol::{KernelRequest, MessageType, ProtocolMessage};
use weaver::rest::DeploymentStatus;
use weaver::{ApiResponse, Error, Orchestrator};

const DEPLOYED: &str = r#"{"id":"d1","status":"DEPLOYED","applicationName":"shop","version":"1.0",
    "createdAt":"2024-05-01T10:00:00","services":[{"id":"s1","name":"api","status":"RUNNING","port":8000}]}"#;

const MANIFEST: &str = r#"
name: shop
description: demo shop
services:
  api:
    language: Python
    port: 8000
    source: ./api
    command: python app.py
    environment:
      MODE: prod
    limits:
      memory: 1G
      cpu_shares: 512
  worker:
    language: go
"#;

async fn control_plane(routes: Vec<(Method, &str, Route)>) -> (MockControlPlane, Orchestrator) {
    let mock = MockControlPlane::start(routes).await;
    let orchestrator = Orchestrator::new(&mock.config()).unwrap();
    (mock, orchestrator)
}

// ===========================================================================
// Group 1: Deployment lifecycle over REST
// ===========================================================================

#[tokio::test]
async fn test_deploy_sends_compiled_manifest() {
    let (mock, orchestrator) = control_plane(vec![(
        Method::POST,
        "/api/v1/deployments",
        Route::new(201, DEPLOYED),
    )])
    .await;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(MANIFEST.as_bytes()).unwrap();
    let raw = weaver::load_manifest(file.path()).unwrap();
    let mut descriptor = weaver::compile(&raw).unwrap();
    descriptor.override_version("2.0.0").unwrap();

    let record = orchestrator
        .deploy(descriptor)
        .await
        .unwrap()
        .into_record()
        .unwrap();
    assert_eq!(record.id, "d1");
    assert_eq!(record.parsed_status(), Some(DeploymentStatus::Deployed));

    let request = mock.only_request();
    assert_eq!(request.method, Method::POST);
    assert_eq!(request.authorization.as_deref(), Some(BASIC_AUTH));
    assert_eq!(request.content_type.as_deref(), Some("application/json"));
    assert_eq!(request.accept.as_deref(), Some("application/json"));

    let body = request.json();
    assert_eq!(body["applicationName"], "shop");
    assert_eq!(body["description"], "demo shop");
    assert_eq!(body["version"], "2.0.0");
    let services = body["services"].as_array().unwrap();
    assert_eq!(services.len(), 2);
    assert_eq!(services[0]["name"], "api");
    assert_eq!(services[0]["language"], "python");
    assert_eq!(services[0]["source"], "./api");
    assert_eq!(services[0]["limits"]["memory"], 1_073_741_824u64);
    assert_eq!(services[0]["limits"]["cpuShares"], 512);
    assert_eq!(services[0]["limits"]["pidsLimit"], 1000);
    assert_eq!(services[1]["name"], "worker");
    assert_eq!(services[1]["limits"]["memory"], 536_870_912u64);
}

#[tokio::test]
async fn test_get_deployment_classification() {
    let (_mock, orchestrator) = control_plane(vec![
        (Method::GET, "/api/v1/deployments/d1", Route::new(200, DEPLOYED)),
        (
            Method::GET,
            "/api/v1/deployments/locked",
            Route::new(401, r#"{"detail":"bad credentials"}"#),
        ),
    ])
    .await;

    let record = orchestrator
        .get_deployment("d1")
        .await
        .unwrap()
        .into_record()
        .unwrap();
    assert_eq!(record.status, "DEPLOYED");
    assert_eq!(record.services[0].name.as_deref(), Some("api"));

    let err = orchestrator.get_deployment("missing").await.unwrap_err();
    assert!(matches!(err, Error::NotFound), "{err:?}");

    let err = orchestrator.get_deployment("locked").await.unwrap_err();
    assert!(matches!(err, Error::Authentication), "{err:?}");
}

#[tokio::test]
async fn test_api_errors_carry_status_and_message() {
    let (_mock, orchestrator) = control_plane(vec![
        (
            Method::POST,
            "/api/v1/deployments/d1/stop",
            Route::new(500, r#"{"title":"Internal","detail":"kernel unreachable"}"#),
        ),
        (
            Method::POST,
            "/api/v1/deployments/d1/start",
            Route::new(502, "<html>Bad Gateway</html>"),
        ),
    ])
    .await;

    match orchestrator.stop("d1").await {
        Err(Error::Api { status, message }) => {
            assert_eq!(status, 500);
            assert_eq!(message, "kernel unreachable");
        }
        other => panic!("unexpected: {other:?}"),
    }

    match orchestrator.start("d1").await {
        Err(Error::Api { status, message }) => {
            assert_eq!(status, 502);
            assert_eq!(message, "<html>Bad Gateway</html>");
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn test_stop_and_start_paths() {
    let stopped = DEPLOYED.replace("DEPLOYED", "TERMINATED");
    let (mock, orchestrator) = control_plane(vec![
        (
            Method::POST,
            "/api/v1/deployments/d1/stop",
            Route::new(200, &stopped),
        ),
        (
            Method::POST,
            "/api/v1/deployments/d1/start",
            Route::new(200, DEPLOYED),
        ),
    ])
    .await;

    let record = orchestrator.stop("d1").await.unwrap().into_record().unwrap();
    assert_eq!(record.parsed_status(), Some(DeploymentStatus::Terminated));
    let record = orchestrator.start("d1").await.unwrap().into_record().unwrap();
    assert_eq!(record.parsed_status(), Some(DeploymentStatus::Deployed));

    let paths: Vec<String> = mock.requests().into_iter().map(|r| r.path).collect();
    assert_eq!(
        paths,
        ["/api/v1/deployments/d1/stop", "/api/v1/deployments/d1/start"]
    );
}

#[tokio::test]
async fn test_list_filters_by_application_client_side() {
    let list = r#"[
        {"id":"1","status":"DEPLOYED","applicationName":"FOO"},
        {"id":"2","status":"DEPLOYED","applicationName":"Bar"}
    ]"#;
    let (mock, orchestrator) = control_plane(vec![(
        Method::GET,
        "/api/v1/deployments",
        Route::new(200, list),
    )])
    .await;

    let records = orchestrator
        .list_deployments(Some("Foo"), Some("DEPLOYED"))
        .await
        .unwrap()
        .into_records()
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "1");

    // The application name never reaches the server.
    let request = mock.only_request();
    assert_eq!(request.query.as_deref(), Some("status=DEPLOYED"));
}

#[tokio::test]
async fn test_list_without_filters() {
    let (mock, orchestrator) = control_plane(vec![(
        Method::GET,
        "/api/v1/deployments",
        Route::new(200, "[]"),
    )])
    .await;

    let response = orchestrator.list_deployments(None, None).await.unwrap();
    assert_eq!(response, ApiResponse::RecordList(Vec::new()));
    assert_eq!(mock.only_request().query, None);
}

#[tokio::test]
async fn test_delete_deployment() {
    let (mock, orchestrator) = control_plane(vec![
        (Method::DELETE, "/api/v1/deployments/d1", Route::new(204, "")),
        (
            Method::DELETE,
            "/api/v1/deployments/d2",
            Route::new(200, r#"{"deleted":true}"#),
        ),
        (
            Method::DELETE,
            "/api/v1/deployments/d3",
            Route::new(409, r#"{"detail":"deployment is running"}"#),
        ),
    ])
    .await;

    orchestrator.delete("d1").await.unwrap();
    // Non-204 success is routed through classification and discarded.
    orchestrator.delete("d2").await.unwrap();

    let err = orchestrator.delete("gone").await.unwrap_err();
    assert!(matches!(err, Error::NotFound), "{err:?}");

    let err = orchestrator.delete("d3").await.unwrap_err();
    assert!(
        matches!(err, Error::Api { status: 409, ref message } if message == "deployment is running"),
        "{err:?}"
    );
    assert_eq!(mock.requests().len(), 4);
}

#[tokio::test]
async fn test_non_json_success_is_raw_text() {
    let (_mock, orchestrator) = control_plane(vec![(
        Method::POST,
        "/api/v1/deployments/d1/start",
        Route::new(202, "queued"),
    )])
    .await;

    let response = orchestrator.start("d1").await.unwrap();
    assert_eq!(response, ApiResponse::RawText("queued".into()));
}

#[tokio::test]
async fn test_rest_timeout() {
    let mock = MockControlPlane::start(vec![(
        Method::GET,
        "/api/v1/deployments/slow",
        Route::new(200, DEPLOYED).delayed(Duration::from_secs(3)),
    )])
    .await;
    let config = mock.config().with_timeout(Duration::from_millis(200));
    let orchestrator = Orchestrator::new(&config).unwrap();

    let err = orchestrator.get_deployment("slow").await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "{err:?}");
}

#[tokio::test]
async fn test_errors_are_not_retried() {
    let (mock, orchestrator) = control_plane(vec![(
        Method::GET,
        "/api/v1/deployments/d1",
        Route::new(503, "unavailable"),
    )])
    .await;

    assert!(orchestrator.get_deployment("d1").await.is_err());
    assert_eq!(mock.requests().len(), 1);
}

#[tokio::test]
async fn test_null_fields_decode_as_empty() {
    let body = r#"{"id":"d1","status":null,"applicationName":"shop","services":null,"updatedAt":null}"#;
    let (_mock, orchestrator) = control_plane(vec![
        (Method::GET, "/api/v1/deployments/d1", Route::new(200, body)),
        (Method::GET, "/api/v1/deployments", Route::new(200, &format!("[{body}]"))),
    ])
    .await;

    let record = orchestrator
        .get_deployment("d1")
        .await
        .unwrap()
        .into_record()
        .unwrap();
    assert_eq!(record.status, "");
    assert!(record.services.is_empty());
    assert_eq!(record.updated_at, None);

    let records = orchestrator
        .list_deployments(Some("SHOP"), None)
        .await
        .unwrap()
        .into_records()
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "d1");
}

#[tokio::test]
async fn test_ids_stay_inside_their_path_segment() {
    let (mock, orchestrator) = control_plane(vec![
        (
            Method::DELETE,
            "/api/v1/deployments/x%2F..%2F..%2Fapplications%2Fa1",
            Route::new(204, ""),
        ),
        (
            Method::GET,
            "/api/v1/deployments/d1%3Fstatus=FAILED",
            Route::new(200, DEPLOYED),
        ),
        (Method::DELETE, "/api/v1/applications/a1", Route::new(204, "")),
    ])
    .await;

    orchestrator
        .delete("x/../../applications/a1")
        .await
        .unwrap();
    orchestrator.get_deployment("d1?status=FAILED").await.unwrap();
    orchestrator.stop("a/b").await.unwrap_err();

    let requests = mock.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(
        requests[0].path,
        "/api/v1/deployments/x%2F..%2F..%2Fapplications%2Fa1"
    );
    assert_eq!(requests[1].path, "/api/v1/deployments/d1%3Fstatus=FAILED");
    assert_eq!(requests[1].query, None);
    assert_eq!(requests[2].method, Method::POST);
    assert_eq!(requests[2].path, "/api/v1/deployments/a%2Fb/stop");
    assert!(
        requests.iter().all(|r| !r.path.starts_with("/api/v1/applications")),
        "{requests:?}"
    );
}

#[tokio::test]
async fn test_dot_ids_are_refused_locally() {
    let (mock, orchestrator) = control_plane(vec![]).await;

    for id in ["", ".", ".."] {
        let err = orchestrator.delete(id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{id:?}: {err:?}");
    }
    let err = orchestrator.delete_application("..").await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)), "{err:?}");
    assert!(mock.requests().is_empty());
}

// ===========================================================================
// Group 2: Applications API
// ===========================================================================

#[tokio::test]
async fn test_applications() {
    let apps = r#"[{"id":"a1","name":"shop","description":"demo","deploymentCount":3,
        "activeDeployments":1,"lastDeployedAt":"2024-05-01T10:00:00","languages":["python","go"]}]"#;
    let (mock, orchestrator) = control_plane(vec![
        (Method::GET, "/api/v1/applications", Route::new(200, apps)),
        (
            Method::GET,
            "/api/v1/applications/a1",
            Route::new(200, r#"{"id":"a1","name":"shop"}"#),
        ),
        (Method::DELETE, "/api/v1/applications/a1", Route::new(204, "")),
    ])
    .await;

    let list = orchestrator
        .list_applications()
        .await
        .unwrap()
        .into_records()
        .unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].deployment_count, 3);
    assert_eq!(list[0].languages, ["python", "go"]);

    let app = orchestrator
        .get_application("a1")
        .await
        .unwrap()
        .into_record()
        .unwrap();
    assert_eq!(app.name, "shop");
    assert_eq!(app.active_deployments, 0);

    orchestrator.delete_application("a1").await.unwrap();
    let err = orchestrator.get_application("a2").await.unwrap_err();
    assert!(matches!(err, Error::NotFound), "{err:?}");
    assert_eq!(mock.requests().len(), 4);
}

#[tokio::test]
async fn test_application_null_fields() {
    let apps = r#"[{"id":"a1","name":"shop","description":null,"deploymentCount":null,
        "activeDeployments":null,"lastDeployedAt":null,"languages":null}]"#;
    let (_mock, orchestrator) =
        control_plane(vec![(Method::GET, "/api/v1/applications", Route::new(200, apps))]).await;

    let list = orchestrator
        .list_applications()
        .await
        .unwrap()
        .into_records()
        .unwrap();
    assert_eq!(list.len(), 1);
    assert!(list[0].languages.is_empty());
    assert_eq!(list[0].deployment_count, 0);
    assert_eq!(list[0].description, None);
}

// ===========================================================================
// Group 3: Kernel protocol
// ===========================================================================

fn echo_kernel(request: &ProtocolMessage) -> ProtocolMessage {
    let text = match request.message_type {
        MessageType::StartProcess => {
            let id = request.payload.split(' ').next().unwrap_or_default();
            format!("Process started successfully: {id}")
        }
        MessageType::StopProcess => "ERROR: Process not found".to_string(),
        MessageType::ListProcesses => "Processes:\n".to_string(),
        MessageType::HealthCheck => "OK: Kernel is healthy".to_string(),
        MessageType::GetProcess => "ERROR: Unknown message type".to_string(),
    };
    ProtocolMessage::new(request.message_type, text)
}

#[tokio::test]
async fn test_start_process_keeps_command_intact() {
    let kernel = FakeKernel::replying(echo_kernel).await;
    let orchestrator = Orchestrator::new(&kernel.config(Duration::from_secs(5))).unwrap();

    let reply = orchestrator
        .start_process("p1", "svc-a", "python app.py --flag")
        .await
        .unwrap();
    assert_eq!(reply.message_type, MessageType::StartProcess);
    assert_eq!(reply.text, "Process started successfully: p1");
    assert!(!is_failure(&reply));

    let requests = kernel.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].payload, "p1 svc-a python app.py --flag");
    assert_eq!(
        KernelRequest::from_message(&requests[0]).unwrap(),
        KernelRequest::StartProcess {
            process_id: "p1".into(),
            process_name: "svc-a".into(),
            command: "python app.py --flag".into(),
        }
    );
}

#[tokio::test]
async fn test_kernel_failure_is_a_normal_reply() {
    let kernel = FakeKernel::replying(echo_kernel).await;
    let orchestrator = Orchestrator::new(&kernel.config(Duration::from_secs(5))).unwrap();

    let reply = orchestrator.stop_process("nope").await.unwrap();
    assert!(is_failure(&reply));
    assert_eq!(reply.error_text(), Some("Process not found"));

    let reply = orchestrator.get_process("p1").await.unwrap();
    assert_eq!(reply.error_text(), Some("Unknown message type"));
    assert_eq!(kernel.requests()[1].payload, "p1");
}

#[tokio::test]
async fn test_one_connection_per_call() {
    let kernel = FakeKernel::replying(echo_kernel).await;
    let orchestrator = Orchestrator::new(&kernel.config(Duration::from_secs(5))).unwrap();

    let health = orchestrator.health_check().await.unwrap();
    assert_eq!(health.text, "OK: Kernel is healthy");
    let list = orchestrator.list_processes().await.unwrap();
    assert_eq!(list.text, "Processes:\n");
    orchestrator.health_check().await.unwrap();

    assert_eq!(kernel.connections(), 3);
    let requests = kernel.requests();
    assert!(requests.iter().all(|r| r.payload.is_empty()));
    assert_eq!(requests[1].message_type, MessageType::ListProcesses);
}

#[tokio::test]
async fn test_truncated_reply_is_framing_error() {
    let kernel = FakeKernel::raw(vec![5, 0, 0, 0]).await;
    let orchestrator = Orchestrator::new(&kernel.config(Duration::from_secs(5))).unwrap();

    let err = orchestrator.health_check().await.unwrap_err();
    assert!(matches!(err, Error::Framing { .. }), "{err:?}");
}

#[tokio::test]
async fn test_short_payload_is_framing_error() {
    let kernel = FakeKernel::raw(vec![4, 0, 0, 0, 20, 0, 0, 0, b'P', b'r']).await;
    let orchestrator = Orchestrator::new(&kernel.config(Duration::from_secs(5))).unwrap();

    let err = orchestrator.list_processes().await.unwrap_err();
    assert!(matches!(err, Error::Framing { .. }), "{err:?}");
}

#[tokio::test]
async fn test_invalid_utf8_reply_is_decode_error() {
    let kernel = FakeKernel::raw(vec![5, 0, 0, 0, 2, 0, 0, 0, 0xff, 0xfe]).await;
    let orchestrator = Orchestrator::new(&kernel.config(Duration::from_secs(5))).unwrap();

    let err = orchestrator.health_check().await.unwrap_err();
    assert!(matches!(err, Error::Decode { .. }), "{err:?}");
}

#[tokio::test]
async fn test_silent_kernel_times_out() {
    let kernel = FakeKernel::silent().await;
    let orchestrator = Orchestrator::new(&kernel.config(Duration::from_millis(200))).unwrap();

    let err = orchestrator.health_check().await.unwrap_err();
    assert!(
        matches!(err, Error::Timeout { operation: "kernel request", .. }),
        "{err:?}"
    );
}

// ===========================================================================
// Group 4: CLI
// ===========================================================================

fn weaver_cmd() -> std::process::Command {
    let mut cmd = std::process::Command::new(env!("CARGO_BIN_EXE_weaver"));
    for var in [
        "WEAVER_API_URL",
        "WEAVER_USERNAME",
        "WEAVER_PASSWORD",
        "WEAVER_KERNEL_ADDR",
        "WEAVER_TIMEOUT_SECS",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_cli_init_writes_compilable_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let status = weaver_cmd()
        .args(["init", "--name", "my shop", "--description", "says \"hi\""])
        .current_dir(dir.path())
        .status()
        .unwrap();
    assert!(status.success());

    let path = dir.path().join("weaver.yml");
    let descriptor = weaver::compile(&weaver::load_manifest(&path).unwrap()).unwrap();
    assert_eq!(descriptor.name(), "my shop");
    assert_eq!(descriptor.description(), "says \"hi\"");
    assert_eq!(descriptor.version(), "1.0.0");
    assert_eq!(
        descriptor.service("web").unwrap().limits.memory_bytes,
        536_870_912
    );

    // A second init refuses to clobber the file unless forced.
    let status = weaver_cmd()
        .arg("init")
        .current_dir(dir.path())
        .status()
        .unwrap();
    assert!(!status.success());
    let status = weaver_cmd()
        .args(["init", "--force", "--name", "other"])
        .current_dir(dir.path())
        .status()
        .unwrap();
    assert!(status.success());
    let descriptor = weaver::compile(&weaver::load_manifest(&path).unwrap()).unwrap();
    assert_eq!(descriptor.name(), "other");
}

#[test]
fn test_cli_rejects_invalid_manifest() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("weaver.yml"),
        "name: x\nservices:\n  a:\n    language: ruby\n",
    )
    .unwrap();

    let output = weaver_cmd()
        .arg("deploy")
        .current_dir(dir.path())
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unsupported language: ruby"), "{stderr}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cli_kernel_exit_codes() {
    let kernel = FakeKernel::replying(echo_kernel).await;
    let addr = kernel.addr().to_string();

    let output = tokio::task::spawn_blocking(move || {
        let health = weaver_cmd()
            .args(["--kernel-addr", &addr, "kernel", "health"])
            .output()
            .unwrap();
        let stop = weaver_cmd()
            .args(["--kernel-addr", &addr, "kernel", "stop", "p9"])
            .output()
            .unwrap();
        let start = weaver_cmd()
            .args(["--kernel-addr", &addr, "kernel", "start", "svc", "sleep", "-n", "5"])
            .output()
            .unwrap();
        (health, stop, start)
    })
    .await
    .unwrap();
    let (health, stop, start) = output;

    assert!(health.status.success());
    assert_eq!(String::from_utf8_lossy(&health.stdout).trim(), "OK: Kernel is healthy");
    assert!(!stop.status.success());
    assert!(start.status.success());

    let requests = kernel.requests();
    assert_eq!(requests.len(), 3);
    match KernelRequest::from_message(&requests[2]).unwrap() {
        KernelRequest::StartProcess {
            process_id,
            process_name,
            command,
        } => {
            assert_eq!(process_id.len(), 8);
            assert_eq!(process_name, "svc");
            assert_eq!(command, "sleep -n 5");
        }
        other => panic!("unexpected request: {other:?}"),
    }
}
