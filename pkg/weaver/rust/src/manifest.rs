// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Manifest compiler: untyped YAML document in, validated
//! [`DeploymentDescriptor`] out.
//!
//! Structural rules run first over the whole document, in document order,
//! and the first violation wins. Only once the structure is accepted are
//! service fields built and memory quantities normalized to bytes, so a
//! descriptor is either returned complete or not at all.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};
use serde_yaml::{Mapping, Value};

use crate::descriptor::{
    DEFAULT_CPU_SHARES, DEFAULT_MEMORY_BYTES, DEFAULT_PIDS_LIMIT, DeploymentDescriptor, Language,
    ResourceLimits, ServiceDescriptor,
};
use crate::errors::{Error, Result};

pub const DEFAULT_MANIFEST: &str = "weaver.yml";

const MEMORY_UNITS: [(char, u64); 3] = [('K', 1 << 10), ('M', 1 << 20), ('G', 1 << 30)];

/// Read a manifest file into an untyped document.
pub fn load_manifest(path: &Path) -> Result<Value> {
    let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => {
            Error::validation(format!("manifest file not found: {}", path.display()))
        }
        _ => Error::validation(format!("error reading manifest {}: {e}", path.display())),
    })?;
    debug!("read {} bytes from {}", contents.len(), path.display());
    serde_yaml::from_str(&contents)
        .map_err(|e| Error::validation(format!("invalid YAML in manifest: {e}")))
}

/// Compile a raw document, stamping `"v<unix seconds>"` when it carries no
/// version.
pub fn compile(doc: &Value) -> Result<DeploymentDescriptor> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    compile_at(doc, now)
}

fn compile_at(doc: &Value, unix_secs: u64) -> Result<DeploymentDescriptor> {
    let root = validate_document(doc)?;
    let services = root
        .get("services")
        .and_then(Value::as_mapping)
        .ok_or_else(|| Error::validation("services must be a dictionary"))?;

    let mut validated = Vec::with_capacity(services.len());
    for (key, value) in services {
        let name = service_name(key)?;
        let (config, language) = validate_service(&name, value)?;
        validated.push((name, config, language));
    }

    let mut compiled = Vec::with_capacity(validated.len());
    for (name, config, language) in validated {
        compiled.push(build_service(name, config, language)?);
    }

    let name = root.get("name").and_then(scalar_string).unwrap_or_default();
    let description = root
        .get("description")
        .and_then(scalar_string)
        .unwrap_or_default();
    let version = root
        .get("version")
        .and_then(scalar_string)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| format!("v{unix_secs}"));

    info!(
        "compiled manifest '{name}' version {version} with {} service(s)",
        compiled.len()
    );
    Ok(DeploymentDescriptor::new(name, description, version, compiled))
}

fn validate_document(doc: &Value) -> Result<&Mapping> {
    let root = match doc {
        Value::Null => return Err(Error::validation("empty manifest")),
        Value::Mapping(m) if m.is_empty() => return Err(Error::validation("empty manifest")),
        Value::Mapping(m) => m,
        _ => return Err(Error::validation("manifest must be a dictionary")),
    };

    match root.get("name") {
        None => return Err(Error::validation("manifest missing required field: name")),
        Some(v) if scalar_string(v).is_none_or(|s| s.is_empty()) => {
            return Err(Error::validation("manifest field 'name' must not be empty"));
        }
        Some(_) => {}
    }

    match root.get("services") {
        None => Err(Error::validation(
            "manifest missing required field: services",
        )),
        Some(Value::Mapping(services)) if services.is_empty() => Err(Error::validation(
            "at least one service must be defined",
        )),
        Some(Value::Mapping(_)) => Ok(root),
        Some(_) => Err(Error::validation("services must be a dictionary")),
    }
}

fn service_name(key: &Value) -> Result<String> {
    scalar_string(key)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::validation(format!("invalid service name: {}", render(key))))
}

fn validate_service<'a>(name: &str, value: &'a Value) -> Result<(&'a Mapping, Language)> {
    let Some(config) = value.as_mapping() else {
        return Err(Error::validation(format!(
            "service '{name}' must be a dictionary"
        )));
    };

    let Some(raw_language) = config.get("language") else {
        return Err(Error::validation(format!(
            "service '{name}' missing required field: language"
        )));
    };
    let Some(language) = raw_language.as_str().and_then(Language::from_name) else {
        return Err(Error::validation(format!(
            "service '{name}' has unsupported language: {}. Supported languages: {}",
            render(raw_language),
            Language::supported_names()
        )));
    };

    if let Some(port) = config.get("port")
        && port_number(port).is_none()
    {
        return Err(Error::validation(format!(
            "service '{name}' has invalid port: {}",
            render(port)
        )));
    }

    if let Some(limits) = config.get("limits")
        && !limits.is_mapping()
    {
        return Err(Error::validation(format!(
            "service '{name}' limits must be a dictionary"
        )));
    }

    Ok((config, language))
}

fn build_service(name: String, config: &Mapping, language: Language) -> Result<ServiceDescriptor> {
    let port = config.get("port").and_then(port_number);
    let source = config
        .get("source")
        .and_then(scalar_string)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let command = config.get("command").and_then(scalar_string);
    let environment = match config.get("environment") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(env) => environment(&name, env)?,
    };
    let limits = match config.get("limits").and_then(Value::as_mapping) {
        Some(limits) => resource_limits(&name, limits)?,
        None => ResourceLimits::default(),
    };

    Ok(ServiceDescriptor {
        name,
        language,
        port,
        source,
        command,
        environment,
        limits,
    })
}

fn environment(service: &str, value: &Value) -> Result<BTreeMap<String, String>> {
    let Some(vars) = value.as_mapping() else {
        return Err(Error::validation(format!(
            "service '{service}' environment must be a dictionary"
        )));
    };
    vars.iter()
        .map(|(k, v)| match (scalar_string(k), scalar_string(v)) {
            (Some(k), Some(v)) => Ok((k, v)),
            _ => Err(Error::validation(format!(
                "service '{service}' has non-scalar environment entry: {}",
                render(k)
            ))),
        })
        .collect()
}

fn resource_limits(service: &str, limits: &Mapping) -> Result<ResourceLimits> {
    let memory_bytes = match limits.get("memory") {
        None => DEFAULT_MEMORY_BYTES,
        Some(Value::Number(n)) => n.as_u64().ok_or_else(|| {
            Error::validation(format!("invalid memory format: {n}"))
        })?,
        Some(Value::String(s)) => parse_memory(s)?,
        Some(other) => {
            return Err(Error::validation(format!(
                "invalid memory format: {}",
                render(other)
            )));
        }
    };

    Ok(ResourceLimits {
        memory_bytes,
        cpu_shares: limit_u32(service, limits, "cpu_shares", DEFAULT_CPU_SHARES)?,
        pids_limit: limit_u32(service, limits, "pids_limit", DEFAULT_PIDS_LIMIT)?,
    })
}

fn limit_u32(service: &str, limits: &Mapping, key: &str, default: u32) -> Result<u32> {
    match limits.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| {
                Error::validation(format!(
                    "service '{service}' has invalid {key}: {}",
                    render(v)
                ))
            }),
    }
}

/// Parse a memory quantity into bytes.
///
/// Accepts a bare integer (bytes) or a decimal immediately followed by
/// `K`, `M` or `G` (any case, binary multiples). Surrounding whitespace is
/// ignored; fractional results are truncated to whole bytes.
pub fn parse_memory(raw: &str) -> Result<u64> {
    let invalid = || Error::validation(format!("invalid memory format: {raw}"));
    let normalized = raw.trim().to_uppercase();

    for (suffix, multiplier) in MEMORY_UNITS {
        if let Some(number) = normalized.strip_suffix(suffix) {
            return scale(number, multiplier).ok_or_else(invalid);
        }
    }

    if !normalized.is_empty() && normalized.bytes().all(|b| b.is_ascii_digit()) {
        return normalized.parse::<u64>().map_err(|_| invalid());
    }
    Err(invalid())
}

fn scale(number: &str, multiplier: u64) -> Option<u64> {
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    let digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if (whole.is_empty() && fraction.is_empty()) || !digits(whole) || !digits(fraction) {
        return None;
    }

    let whole_bytes = if whole.is_empty() {
        0
    } else {
        whole.parse::<u64>().ok()?.checked_mul(multiplier)?
    };
    whole_bytes.checked_add(scaled_fraction(fraction, multiplier))
}

/// `floor(0.<fraction> * multiplier)`, exact for any number of digits.
///
/// Folds digits from the least significant end:
/// `carry = (digit * multiplier + carry) / 10`, where `carry < multiplier`.
fn scaled_fraction(fraction: &str, multiplier: u64) -> u64 {
    fraction.bytes().rev().fold(0, |carry, digit| {
        (u64::from(digit - b'0') * multiplier + carry) / 10
    })
}

fn port_number(value: &Value) -> Option<u16> {
    value
        .as_u64()
        .and_then(|p| u16::try_from(p).ok())
        .filter(|p| *p >= 1)
}

/// Strings, numbers and booleans as text; anything else is not a scalar.
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn render(value: &Value) -> String {
    scalar_string(value).unwrap_or_else(|| match serde_yaml::to_string(value) {
        Ok(s) => s.trim_end().to_string(),
        Err(_) => format!("{value:?}"),
    })
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
    use std::fs;

    fn doc(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn validation_message(yaml: &str) -> String {
        match compile(&doc(yaml)) {
            Err(Error::Validation(msg)) => msg,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    const SHOP: &str = r#"
name: shop
description: Online shop
version: 1.2.0
services:
  api:
    language: Python
    port: 8000
    source: ./api
    command: python app.py --flag
    environment:
      DEBUG: "true"
      WORKERS: 4
    limits:
      memory: 1G
      cpu_shares: 512
  web:
    language: typescript
"#;

    // -- parse_memory --

    #[test]
    fn test_parse_memory_suffixes() {
        assert_eq!(parse_memory("512M").unwrap(), 536_870_912);
        assert_eq!(parse_memory("1G").unwrap(), 1_073_741_824);
        assert_eq!(parse_memory("64K").unwrap(), 65_536);
        assert_eq!(parse_memory("100").unwrap(), 100);
    }

    #[test]
    fn test_parse_memory_case_and_whitespace() {
        assert_eq!(parse_memory("512m").unwrap(), 536_870_912);
        assert_eq!(parse_memory("  2g \n").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory(" 42 ").unwrap(), 42);
    }

    #[test]
    fn test_parse_memory_decimal() {
        assert_eq!(parse_memory("1.5G").unwrap(), 1_610_612_736);
        assert_eq!(parse_memory("0.5K").unwrap(), 512);
        assert_eq!(parse_memory(".5M").unwrap(), 524_288);
        assert_eq!(parse_memory("0.1K").unwrap(), 102);
        assert_eq!(parse_memory("3.K").unwrap(), 3072);
    }

    #[test]
    fn test_parse_memory_decimal_is_exact() {
        assert_eq!(
            parse_memory("9007199254740993.5K").unwrap(),
            9_223_372_036_854_777_344
        );
        // Rounds down even when the fraction sits just under the next byte.
        assert_eq!(parse_memory("1.999999999999999999999K").unwrap(), 2047);
        assert_eq!(parse_memory("0.000000001G").unwrap(), 1);
    }

    #[test]
    fn test_parse_memory_rejects_malformed() {
        for bad in ["1X", "", "M", ".K", "12 M", "-1G", "1.2.3M", "abc", "1e3M", "1GB", "-5"] {
            match parse_memory(bad) {
                Err(Error::Validation(msg)) => assert!(msg.contains(bad), "{msg}"),
                other => panic!("{bad:?} should be rejected, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_parse_memory_overflow() {
        assert!(parse_memory("99999999999999999999").is_err());
        assert!(parse_memory("99999999999999G").is_err());
    }

    // -- compile: happy path --

    #[test]
    fn test_compile_full_manifest() {
        let d = compile(&doc(SHOP)).unwrap();
        assert_eq!(d.name(), "shop");
        assert_eq!(d.description(), "Online shop");
        assert_eq!(d.version(), "1.2.0");

        let names: Vec<&str> = d.services().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["api", "web"]);

        let api = d.service("api").unwrap();
        assert_eq!(api.language, Language::Python);
        assert_eq!(api.port, Some(8000));
        assert_eq!(api.source, PathBuf::from("./api"));
        assert_eq!(api.command.as_deref(), Some("python app.py --flag"));
        assert_eq!(api.environment["DEBUG"], "true");
        assert_eq!(api.environment["WORKERS"], "4");
        assert_eq!(api.limits.memory_bytes, 1_073_741_824);
        assert_eq!(api.limits.cpu_shares, 512);
        assert_eq!(api.limits.pids_limit, DEFAULT_PIDS_LIMIT);
    }

    #[test]
    fn test_compile_service_defaults() {
        let d = compile(&doc(SHOP)).unwrap();
        let web = d.service("web").unwrap();
        assert_eq!(web.port, None);
        assert_eq!(web.source, PathBuf::from("."));
        assert_eq!(web.command, None);
        assert!(web.environment.is_empty());
        assert_eq!(web.limits, ResourceLimits::default());
    }

    #[test]
    fn test_compile_synthetic_version() {
        let d = compile_at(
            &doc("name: a\nservices:\n  s:\n    language: go\n"),
            1_700_000_000,
        )
        .unwrap();
        assert_eq!(d.version(), "v1700000000");
        assert_eq!(d.description(), "");
    }

    #[test]
    fn test_compile_numeric_memory_is_bytes() {
        let d = compile(&doc(
            "name: a\nservices:\n  s:\n    language: go\n    limits:\n      memory: 2048\n",
        ))
        .unwrap();
        assert_eq!(d.services()[0].limits.memory_bytes, 2048);
    }

    #[test]
    fn test_compile_empty_limits_use_defaults() {
        let d = compile(&doc(
            "name: a\nservices:\n  s:\n    language: go\n    limits: {}\n",
        ))
        .unwrap();
        assert_eq!(d.services()[0].limits, ResourceLimits::default());
    }

    // -- compile: validation order --

    #[test]
    fn test_empty_document() {
        assert_eq!(validation_message(""), "empty manifest");
        assert_eq!(validation_message("{}"), "empty manifest");
    }

    #[test]
    fn test_non_mapping_document() {
        assert_eq!(validation_message("- a\n- b\n"), "manifest must be a dictionary");
    }

    #[test]
    fn test_missing_name() {
        let msg = validation_message("services:\n  s:\n    language: go\n");
        assert_eq!(msg, "manifest missing required field: name");
    }

    #[test]
    fn test_blank_name() {
        let msg = validation_message("name: ''\nservices:\n  s:\n    language: go\n");
        assert!(msg.contains("must not be empty"), "{msg}");
    }

    #[test]
    fn test_missing_services() {
        assert_eq!(
            validation_message("name: a\n"),
            "manifest missing required field: services"
        );
    }

    #[test]
    fn test_services_not_mapping() {
        assert_eq!(
            validation_message("name: a\nservices:\n  - api\n"),
            "services must be a dictionary"
        );
    }

    #[test]
    fn test_zero_services() {
        assert_eq!(
            validation_message("name: a\nservices: {}\n"),
            "at least one service must be defined"
        );
    }

    #[test]
    fn test_service_not_mapping() {
        let msg = validation_message("name: a\nservices:\n  api: python\n");
        assert_eq!(msg, "service 'api' must be a dictionary");
    }

    #[test]
    fn test_missing_language() {
        let msg = validation_message("name: a\nservices:\n  api:\n    port: 80\n");
        assert_eq!(msg, "service 'api' missing required field: language");
    }

    #[test]
    fn test_unsupported_language_names_service_and_value() {
        let msg = validation_message("name: a\nservices:\n  billing:\n    language: ruby\n");
        assert!(msg.starts_with("service 'billing' has unsupported language: ruby"), "{msg}");
        assert!(msg.contains("python, node, nodejs"), "{msg}");
    }

    #[test]
    fn test_invalid_ports() {
        for port in ["0", "65536", "-1", "'8080'", "80.5"] {
            let msg = validation_message(&format!(
                "name: a\nservices:\n  api:\n    language: go\n    port: {port}\n"
            ));
            assert!(msg.starts_with("service 'api' has invalid port"), "{msg}");
        }
    }

    #[test]
    fn test_port_bounds_accepted() {
        for port in [1, 65535] {
            let d = compile(&doc(&format!(
                "name: a\nservices:\n  api:\n    language: go\n    port: {port}\n"
            )))
            .unwrap();
            assert_eq!(d.services()[0].port, Some(port));
        }
    }

    #[test]
    fn test_limits_not_mapping() {
        let msg = validation_message(
            "name: a\nservices:\n  api:\n    language: go\n    limits: 512M\n",
        );
        assert_eq!(msg, "service 'api' limits must be a dictionary");
    }

    #[test]
    fn test_first_failure_wins_in_document_order() {
        let msg = validation_message(
            "name: a\nservices:\n  first:\n    language: cobol\n  second:\n    port: 0\n",
        );
        assert!(msg.contains("'first'"), "{msg}");
    }

    #[test]
    fn test_structure_checked_before_units() {
        // `a` has a bad memory string, `b` a bad language: the structural
        // error on `b` is reported first.
        let msg = validation_message(
            "name: x\nservices:\n  a:\n    language: go\n    limits:\n      memory: 1X\n  b:\n    language: ruby\n",
        );
        assert!(msg.contains("'b'"), "{msg}");
    }

    #[test]
    fn test_bad_memory_cites_raw_input() {
        let msg = validation_message(
            "name: x\nservices:\n  a:\n    language: go\n    limits:\n      memory: 12Q\n",
        );
        assert_eq!(msg, "invalid memory format: 12Q");
    }

    #[test]
    fn test_bad_cpu_shares() {
        let msg = validation_message(
            "name: x\nservices:\n  a:\n    language: go\n    limits:\n      cpu_shares: lots\n",
        );
        assert_eq!(msg, "service 'a' has invalid cpu_shares: lots");
    }

    #[test]
    fn test_environment_must_be_mapping() {
        let msg = validation_message(
            "name: x\nservices:\n  a:\n    language: go\n    environment: [A, B]\n",
        );
        assert_eq!(msg, "service 'a' environment must be a dictionary");
    }

    // -- load_manifest --

    #[test]
    fn test_load_manifest_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_MANIFEST);
        fs::write(&path, SHOP).unwrap();

        let d = compile(&load_manifest(&path).unwrap()).unwrap();
        assert_eq!(d.name(), "shop");
        assert_eq!(d.services().len(), 2);
    }

    #[test]
    fn test_load_manifest_missing_file() {
        let err = load_manifest(Path::new("/nonexistent/weaver.yml")).unwrap_err();
        match err {
            Error::Validation(msg) => assert!(msg.contains("not found"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_load_manifest_invalid_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yml");
        fs::write(&path, "not: valid: yaml: [").unwrap();
        assert!(matches!(load_manifest(&path), Err(Error::Validation(_))));
    }

    #[test]
    fn test_load_manifest_empty_file_fails_compile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.yml");
        fs::write(&path, "").unwrap();
        let raw = load_manifest(&path).unwrap();
        assert_eq!(validation_message_for(&raw), "empty manifest");
    }

    fn validation_message_for(raw: &Value) -> String {
        match compile(raw) {
            Err(Error::Validation(msg)) => msg,
            other => panic!("expected validation error, got {other:?}"),
        }
    }
}
