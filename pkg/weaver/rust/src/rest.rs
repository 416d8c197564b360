// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! JSON/HTTP client for the control-plane API.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use log::{debug, info};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::config::ClientConfig;
use crate::descriptor::{DeploymentDescriptor, ServiceDescriptor};
use crate::errors::{Error, Result};

const API_PREFIX: [&str; 2] = ["api", "v1"];
const DEPLOYMENTS: &str = "deployments";
const APPLICATIONS: &str = "applications";
const JSON: &str = "application/json";

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Deployed,
    Failed,
    Terminating,
    Terminated,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Deploying => "DEPLOYING",
            Self::Deployed => "DEPLOYED",
            Self::Failed => "FAILED",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "DEPLOYING" => Ok(Self::Deploying),
            "DEPLOYED" => Ok(Self::Deployed),
            "FAILED" => Ok(Self::Failed),
            "TERMINATING" => Ok(Self::Terminating),
            "TERMINATED" => Ok(Self::Terminated),
            _ => Err(Error::decode(format!("unknown deployment status: {s}"))),
        }
    }
}

/// Missing and `null` both decode to the field's default.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: String,
    #[serde(default)]
    pub application_id: Option<String>,
    #[serde(default)]
    pub application_name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub services: Vec<ServiceRecord>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl DeploymentRecord {
    /// `None` for statuses outside the known vocabulary.
    pub fn parsed_status(&self) -> Option<DeploymentStatus> {
        self.status.parse().ok()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub process_id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub memory_limit: Option<u64>,
    #[serde(default)]
    pub cpu_shares: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub deployment_count: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub active_deployments: u32,
    #[serde(default)]
    pub last_deployed_at: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub languages: Vec<String>,
}

/// A successful response body, classified once at decode time.
#[derive(Clone, Debug, PartialEq)]
pub enum ApiResponse<T = DeploymentRecord> {
    Record(T),
    RecordList(Vec<T>),
    /// Body that is not JSON, or a bare JSON scalar, kept verbatim.
    RawText(String),
}

impl<T> ApiResponse<T> {
    pub fn into_record(self) -> Option<T> {
        match self {
            Self::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn into_records(self) -> Option<Vec<T>> {
        match self {
            Self::RecordList(records) => Some(records),
            _ => None,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentRequest<'a> {
    application_name: &'a str,
    description: &'a str,
    version: &'a str,
    services: &'a [ServiceDescriptor],
}

impl<'a> From<&'a DeploymentDescriptor> for DeploymentRequest<'a> {
    fn from(d: &'a DeploymentDescriptor) -> Self {
        Self {
            application_name: d.name(),
            description: d.description(),
            version: d.version(),
            services: d.services(),
        }
    }
}

/// Map a status and body onto a result.
///
/// 401 and 404 have dedicated errors; any other status >= 400 carries the
/// `detail` field of a JSON body, or the raw text. Anything else is decoded.
pub fn classify<T: DeserializeOwned>(status: StatusCode, body: String) -> Result<ApiResponse<T>> {
    match status.as_u16() {
        401 => Err(Error::Authentication),
        404 => Err(Error::NotFound),
        code if code >= 400 => Err(Error::Api {
            status: code,
            message: error_message(&body),
        }),
        _ => decode_body(body),
    }
}

fn error_message(body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| match v.get("detail") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        });
    detail.unwrap_or_else(|| body.to_string())
}

fn decode_body<T: DeserializeOwned>(body: String) -> Result<ApiResponse<T>> {
    let Ok(value) = serde_json::from_str::<Value>(&body) else {
        return Ok(ApiResponse::RawText(body));
    };
    match value {
        Value::Object(_) => serde_json::from_value(value)
            .map(ApiResponse::Record)
            .map_err(|e| Error::UnexpectedBody(format!("{e}: {body}"))),
        Value::Array(_) => serde_json::from_value(value)
            .map(ApiResponse::RecordList)
            .map_err(|e| Error::UnexpectedBody(format!("{e}: {body}"))),
        _ => Ok(ApiResponse::RawText(body)),
    }
}

/// Keep records whose `applicationName` equals `app`, ignoring case. The API
/// has no such filter, so this runs after decoding.
pub fn filter_by_application(records: Vec<DeploymentRecord>, app: &str) -> Vec<DeploymentRecord> {
    let wanted = app.to_lowercase();
    records
        .into_iter()
        .filter(|r| r.application_name.as_deref().unwrap_or_default().to_lowercase() == wanted)
        .collect()
}

/// Holds only static configuration; each call owns its request and response,
/// so one client can serve concurrent calls.
#[derive(Clone)]
pub struct RestClient {
    base: Url,
    username: String,
    password: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl RestClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .timeout(config.timeout)
            .build()
            .map_err(Error::Request)?;

        let base = Url::parse(&config.api_url).map_err(|e| {
            Error::InvalidArgument(format!("control-plane URL '{}': {e}", config.api_url))
        })?;
        if base.cannot_be_a_base() {
            return Err(Error::InvalidArgument(format!(
                "control-plane URL '{}' cannot carry a path",
                config.api_url
            )));
        }

        Ok(Self {
            base,
            username: config.username.clone(),
            password: config.password.clone(),
            timeout: config.timeout,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str().trim_end_matches('/')
    }

    pub async fn create_deployment(&self, descriptor: DeploymentDescriptor) -> Result<ApiResponse> {
        info!(
            "creating deployment of '{}' version {} ({} service(s))",
            descriptor.name(),
            descriptor.version(),
            descriptor.services().len()
        );
        let body = DeploymentRequest::from(&descriptor);
        let request = self.request(Method::POST, &[DEPLOYMENTS])?.json(&body);
        self.fetch(request, "create deployment").await
    }

    pub async fn list_deployments(
        &self,
        app_name: Option<&str>,
        status: Option<&str>,
    ) -> Result<ApiResponse> {
        let mut request = self.request(Method::GET, &[DEPLOYMENTS])?;
        if let Some(status) = status {
            request = request.query(&[("status", status)]);
        }
        let response = self.fetch(request, "list deployments").await?;
        Ok(match (app_name, response) {
            (Some(app), ApiResponse::RecordList(records)) => {
                ApiResponse::RecordList(filter_by_application(records, app))
            }
            (_, other) => other,
        })
    }

    pub async fn get_deployment(&self, id: &str) -> Result<ApiResponse> {
        let request = self.request(Method::GET, &[DEPLOYMENTS, segment(id)?])?;
        self.fetch(request, "get deployment").await
    }

    pub async fn stop_deployment(&self, id: &str) -> Result<ApiResponse> {
        info!("stopping deployment {id}");
        let request = self.request(Method::POST, &[DEPLOYMENTS, segment(id)?, "stop"])?;
        self.fetch(request, "stop deployment").await
    }

    pub async fn start_deployment(&self, id: &str) -> Result<ApiResponse> {
        info!("starting deployment {id}");
        let request = self.request(Method::POST, &[DEPLOYMENTS, segment(id)?, "start"])?;
        self.fetch(request, "start deployment").await
    }

    /// Succeeds on 204; any other status goes through [`classify`], whose
    /// success value is discarded.
    pub async fn delete_deployment(&self, id: &str) -> Result<()> {
        info!("deleting deployment {id}");
        let request = self.request(Method::DELETE, &[DEPLOYMENTS, segment(id)?])?;
        self.delete(request, "delete deployment").await
    }

    pub async fn list_applications(&self) -> Result<ApiResponse<ApplicationRecord>> {
        let request = self.request(Method::GET, &[APPLICATIONS])?;
        self.fetch(request, "list applications").await
    }

    pub async fn get_application(&self, id: &str) -> Result<ApiResponse<ApplicationRecord>> {
        let request = self.request(Method::GET, &[APPLICATIONS, segment(id)?])?;
        self.fetch(request, "get application").await
    }

    pub async fn delete_application(&self, id: &str) -> Result<()> {
        info!("deleting application {id}");
        let request = self.request(Method::DELETE, &[APPLICATIONS, segment(id)?])?;
        self.delete(request, "delete application").await
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        Ok(self
            .client
            .request(method, self.endpoint(segments)?)
            .basic_auth(&self.username, Some(&self.password))
            .header(CONTENT_TYPE, JSON)
            .header(ACCEPT, JSON))
    }

    /// Base URL plus `/api/v1/<segments>`. Each segment is percent-encoded,
    /// so `/`, `?` and `#` inside an id never change the route.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| Error::InvalidArgument(format!("'{}' cannot carry a path", self.base)))?
            .pop_if_empty()
            .extend(API_PREFIX)
            .extend(segments);
        Ok(url)
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        operation: &'static str,
    ) -> Result<ApiResponse<T>> {
        let (status, body) = self.execute(request, operation).await?;
        classify(status, body)
    }

    async fn delete(&self, request: RequestBuilder, operation: &'static str) -> Result<()> {
        let (status, body) = self.execute(request, operation).await?;
        if status != StatusCode::NO_CONTENT {
            classify::<Value>(status, body)?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        request: RequestBuilder,
        operation: &'static str,
    ) -> Result<(StatusCode, String)> {
        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(e, operation))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.transport_error(e, operation))?;
        debug!("{operation}: HTTP {status}, {} body bytes", body.len());
        Ok((status, body))
    }

    fn transport_error(&self, e: reqwest::Error, operation: &'static str) -> Error {
        if e.is_timeout() {
            Error::Timeout {
                operation,
                after: self.timeout,
            }
        } else {
            Error::Request(e)
        }
    }
}

/// Dot segments are dropped by URL normalization, and an empty one names the
/// collection, so none of them can address a single resource.
fn segment(id: &str) -> Result<&str> {
    match id {
        "" | "." | ".." => Err(Error::InvalidArgument(format!(
            "'{id}' is not a valid resource id"
        ))),
        _ => Ok(id),
    }
}

impl fmt::Debug for RestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url())
            .field("username", &self.username)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::manifest;

    fn record(id: &str, app: &str) -> DeploymentRecord {
        DeploymentRecord {
            id: id.into(),
            status: "DEPLOYED".into(),
            application_name: Some(app.into()),
            ..Default::default()
        }
    }

    fn classify_deployments(status: u16, body: &str) -> Result<ApiResponse> {
        classify(StatusCode::from_u16(status).unwrap(), body.to_string())
    }

    #[test]
    fn test_classify_401_and_404() {
        assert!(matches!(
            classify_deployments(401, "{\"detail\":\"nope\"}"),
            Err(Error::Authentication)
        ));
        assert!(matches!(classify_deployments(404, ""), Err(Error::NotFound)));
    }

    #[test]
    fn test_classify_api_error_uses_detail() {
        match classify_deployments(409, r#"{"title":"Invalid State","detail":"already stopped"}"#) {
            Err(Error::Api { status, message }) => {
                assert_eq!(status, 409);
                assert_eq!(message, "already stopped");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_classify_api_error_falls_back_to_text() {
        for body in ["upstream exploded", r#"{"title":"no detail here"}"#, "[1,2]"] {
            match classify_deployments(502, body) {
                Err(Error::Api { status, message }) => {
                    assert_eq!(status, 502);
                    assert_eq!(message, body);
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[test]
    fn test_classify_record() {
        let body = r#"{"id":"d1","status":"DEPLOYED","applicationName":"shop","version":"v1",
            "createdAt":"2024-01-01T00:00:00","services":[{"name":"api","port":8000,"memoryLimit":536870912}]}"#;
        let record = classify_deployments(200, body).unwrap().into_record().unwrap();
        assert_eq!(record.id, "d1");
        assert_eq!(record.status, "DEPLOYED");
        assert_eq!(record.parsed_status(), Some(DeploymentStatus::Deployed));
        assert_eq!(record.services[0].name.as_deref(), Some("api"));
        assert_eq!(record.services[0].memory_limit, Some(536_870_912));
    }

    #[test]
    fn test_classify_record_list() {
        let body = r#"[{"id":"a","status":"FAILED"},{"id":"b","status":"PENDING"}]"#;
        let records = classify_deployments(200, body).unwrap().into_records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].parsed_status(), Some(DeploymentStatus::Pending));
    }

    #[test]
    fn test_classify_raw_text() {
        assert_eq!(
            classify_deployments(200, "accepted").unwrap(),
            ApiResponse::RawText("accepted".into())
        );
        assert_eq!(
            classify_deployments(200, "").unwrap(),
            ApiResponse::RawText(String::new())
        );
        assert_eq!(
            classify_deployments(200, "\"ok\"").unwrap(),
            ApiResponse::RawText("\"ok\"".into())
        );
    }

    #[test]
    fn test_classify_record_with_null_fields() {
        let body = r#"{"id":"d1","status":null,"services":null,"version":null}"#;
        let record = classify_deployments(200, body).unwrap().into_record().unwrap();
        assert_eq!(record.id, "d1");
        assert_eq!(record.status, "");
        assert_eq!(record.parsed_status(), None);
        assert!(record.services.is_empty());
        assert_eq!(record.version, None);

        let body = r#"[{"id":"a1","name":"shop","languages":null,"deploymentCount":null,
            "activeDeployments":null,"description":null}]"#;
        let apps = classify::<ApplicationRecord>(StatusCode::OK, body.to_string())
            .unwrap()
            .into_records()
            .unwrap();
        assert_eq!(apps[0].name, "shop");
        assert!(apps[0].languages.is_empty());
        assert_eq!(apps[0].deployment_count, 0);
        assert_eq!(apps[0].active_deployments, 0);
    }

    #[test]
    fn test_classify_object_without_record_shape() {
        assert!(matches!(
            classify_deployments(200, r#"{"unexpected":true}"#),
            Err(Error::UnexpectedBody(_))
        ));
    }

    #[test]
    fn test_filter_by_application_is_case_insensitive() {
        let records = vec![record("1", "FOO"), record("2", "Bar"), record("3", "foobar")];
        let kept = filter_by_application(records, "Foo");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "1");
    }

    #[test]
    fn test_filter_skips_records_without_name() {
        let mut nameless = record("1", "x");
        nameless.application_name = None;
        assert!(filter_by_application(vec![nameless], "x").is_empty());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(
            "deployed".parse::<DeploymentStatus>().unwrap(),
            DeploymentStatus::Deployed
        );
        assert!("RUNNING".parse::<DeploymentStatus>().is_err());
        assert_eq!(DeploymentStatus::Terminating.to_string(), "TERMINATING");
    }

    #[test]
    fn test_deployment_request_body() {
        let raw = serde_yaml::from_str(
            r#"
name: shop
description: demo
version: "1.0"
services:
  api:
    language: Python
    port: 8000
    command: python app.py
    environment:
      MODE: prod
    limits:
      memory: 256M
      pids_limit: 50
  worker:
    language: go
"#,
        )
        .unwrap();
        let descriptor = manifest::compile(&raw).unwrap();
        let body = serde_json::to_value(DeploymentRequest::from(&descriptor)).unwrap();

        assert_eq!(body["applicationName"], "shop");
        assert_eq!(body["description"], "demo");
        assert_eq!(body["version"], "1.0");

        let api = &body["services"][0];
        assert_eq!(api["name"], "api");
        assert_eq!(api["language"], "python");
        assert_eq!(api["port"], 8000);
        assert_eq!(api["source"], ".");
        assert_eq!(api["command"], "python app.py");
        assert_eq!(api["environment"]["MODE"], "prod");
        assert_eq!(api["limits"]["memory"], 268_435_456);
        assert_eq!(api["limits"]["cpuShares"], 1024);
        assert_eq!(api["limits"]["pidsLimit"], 50);

        let worker = &body["services"][1];
        assert_eq!(worker["port"], Value::Null);
        assert_eq!(worker["command"], Value::Null);
        assert_eq!(worker["limits"]["memory"], 536_870_912);
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let config = ClientConfig::new("http://cp.example:8080/", "u", "p");
        let client = RestClient::new(&config).unwrap();
        assert_eq!(client.base_url(), "http://cp.example:8080");
    }

    fn client(api_url: &str) -> RestClient {
        RestClient::new(&ClientConfig::new(api_url, "u", "p")).unwrap()
    }

    #[test]
    fn test_endpoint_encodes_ids_as_one_segment() {
        let client = client("http://cp.example:8080");
        let url = client
            .endpoint(&[DEPLOYMENTS, "x/../../applications/a1"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://cp.example:8080/api/v1/deployments/x%2F..%2F..%2Fapplications%2Fa1"
        );

        let url = client.endpoint(&[DEPLOYMENTS, "d1?status=FAILED", "stop"]).unwrap();
        assert_eq!(url.path(), "/api/v1/deployments/d1%3Fstatus=FAILED/stop");
        assert_eq!(url.query(), None);

        let url = client.endpoint(&[APPLICATIONS, "a#1"]).unwrap();
        assert_eq!(url.path(), "/api/v1/applications/a%231");
        assert_eq!(url.fragment(), None);
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let url = client("http://gw.example/cp/").endpoint(&[DEPLOYMENTS]).unwrap();
        assert_eq!(url.as_str(), "http://gw.example/cp/api/v1/deployments");
    }

    #[test]
    fn test_dot_ids_are_rejected() {
        for id in ["", ".", ".."] {
            assert!(matches!(segment(id), Err(Error::InvalidArgument(_))), "{id:?}");
        }
        assert_eq!(segment("..a").unwrap(), "..a");
    }

    #[tokio::test]
    async fn test_dot_id_never_reaches_the_network() {
        // Nothing listens on port 9; a request attempt would fail differently.
        let client = client("http://127.0.0.1:9");
        assert!(matches!(
            client.delete_deployment("..").await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            client.get_application(".").await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_unusable_base_url() {
        for url in ["not a url", "mailto:ops@example.com"] {
            assert!(matches!(
                RestClient::new(&ClientConfig::new(url, "u", "p")),
                Err(Error::InvalidArgument(_))
            ));
        }
    }
}
