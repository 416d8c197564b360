// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use weaver::protocol::{self, ProtocolMessage};
use weaver::{ClientConfig, KernelReply};

pub const USERNAME: &str = "admin";
pub const PASSWORD: &str = "secret";
/// `Basic base64(admin:secret)`
pub const BASIC_AUTH: &str = "Basic YWRtaW46c2VjcmV0";

/// Canned answer for one (method, path) pair.
#[derive(Clone, Debug)]
pub struct Route {
    pub status: u16,
    pub body: String,
    pub delay: Option<Duration>,
}

impl Route {
    pub fn new(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            delay: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// What the mock saw for one request.
#[derive(Clone, Debug)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub accept: Option<String>,
    pub body: String,
}

impl Recorded {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).expect("request body is not JSON")
    }
}

type Routes = Arc<HashMap<(Method, String), Route>>;
type Log = Arc<Mutex<Vec<Recorded>>>;

/// In-process control plane. Unknown routes answer 404 with an empty body.
pub struct MockControlPlane {
    addr: SocketAddr,
    requests: Log,
    task: JoinHandle<()>,
}

impl MockControlPlane {
    pub async fn start(routes: Vec<(Method, &str, Route)>) -> Self {
        let routes: Routes = Arc::new(
            routes
                .into_iter()
                .map(|(method, path, route)| ((method, path.to_string()), route))
                .collect(),
        );
        let requests: Log = Arc::new(Mutex::new(Vec::new()));
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock control plane");
        let addr = listener.local_addr().expect("no local addr");

        let log = Arc::clone(&requests);
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let io = TokioIo::new(stream);
                let routes = Arc::clone(&routes);
                let log = Arc::clone(&log);
                tokio::task::spawn(async move {
                    let service = service_fn(move |req| {
                        respond(req, Arc::clone(&routes), Arc::clone(&log))
                    });
                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        eprintln!("[mock] error serving connection: {err}");
                    }
                });
            }
        });

        Self {
            addr,
            requests,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn config(&self) -> ClientConfig {
        ClientConfig::new(self.url(), USERNAME, PASSWORD).with_timeout(Duration::from_secs(5))
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn only_request(&self) -> Recorded {
        let requests = self.requests();
        assert_eq!(requests.len(), 1, "expected exactly one request: {requests:?}");
        requests.into_iter().next().unwrap()
    }
}

impl Drop for MockControlPlane {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn respond(
    req: Request<Incoming>,
    routes: Routes,
    log: Log,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map(|b| String::from_utf8_lossy(&b.to_bytes()).into_owned())
        .unwrap_or_default();

    log.lock().unwrap().push(Recorded {
        method: parts.method.clone(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        authorization: header(&parts.headers, AUTHORIZATION),
        content_type: header(&parts.headers, CONTENT_TYPE),
        accept: header(&parts.headers, ACCEPT),
        body,
    });

    let route = routes
        .get(&(parts.method.clone(), parts.uri.path().to_string()))
        .cloned()
        .unwrap_or_else(|| Route::new(404, ""));
    if let Some(delay) = route.delay {
        tokio::time::sleep(delay).await;
    }

    let response = Response::builder()
        .status(StatusCode::from_u16(route.status).unwrap())
        .body(Full::new(Bytes::from(route.body)))
        .unwrap();
    Ok(response)
}

fn header(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

enum Behavior {
    Reply(Box<dyn Fn(&ProtocolMessage) -> ProtocolMessage + Send + Sync>),
    Raw(Vec<u8>),
    Silent,
}

/// Kernel stand-in on a local TCP port. Connections are served one at a time.
pub struct FakeKernel {
    addr: String,
    connections: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<ProtocolMessage>>>,
    task: JoinHandle<()>,
}

impl FakeKernel {
    /// Answer every request frame with `reply(request)`.
    pub async fn replying<F>(reply: F) -> Self
    where
        F: Fn(&ProtocolMessage) -> ProtocolMessage + Send + Sync + 'static,
    {
        Self::spawn(Behavior::Reply(Box::new(reply))).await
    }

    /// Read the request, write `bytes` verbatim, close.
    pub async fn raw(bytes: Vec<u8>) -> Self {
        Self::spawn(Behavior::Raw(bytes)).await
    }

    /// Read the request and never answer.
    pub async fn silent() -> Self {
        Self::spawn(Behavior::Silent).await
    }

    async fn spawn(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind fake kernel");
        let addr = listener.local_addr().expect("no local addr").to_string();
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let counter = Arc::clone(&connections);
        let seen = Arc::clone(&requests);
        let task = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let Ok(request) = protocol::read_message(&mut stream).await else {
                    continue;
                };
                seen.lock().unwrap().push(request.clone());
                match &behavior {
                    Behavior::Reply(reply) => {
                        let _ = protocol::write_message(&mut stream, &reply(&request)).await;
                    }
                    Behavior::Raw(bytes) => {
                        let _ = stream.write_all(bytes).await;
                    }
                    Behavior::Silent => {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    }
                }
            }
        });

        Self {
            addr,
            connections,
            requests,
            task,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ProtocolMessage> {
        self.requests.lock().unwrap().clone()
    }

    pub fn config(&self, timeout: Duration) -> ClientConfig {
        ClientConfig::default()
            .with_kernel_addr(self.addr.clone())
            .with_timeout(timeout)
    }
}

impl Drop for FakeKernel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn is_failure(reply: &KernelReply) -> bool {
    reply.error_text().is_some()
}
