//! Schema validation of the current-version document.
//!
//! The embedded schema is expressed as explicit rule checks over the YAML
//! tree. Every violation is collected and reported together; validation
//! never stops at the first problem.

use k3c_types::{ClusterName, PortMapping, VolumeMount};
use serde_yaml::Value;

use crate::error::{ConfigError, Result, Violation};
use crate::filter::parse_filters;
use crate::parse_duration;
use crate::simple::{API_VERSION_CURRENT, KIND_SIMPLE};

const KNOWN_TOP_LEVEL: [&str; 14] = [
    "apiVersion",
    "kind",
    "metadata",
    "servers",
    "agents",
    "image",
    "network",
    "token",
    "kubeAPI",
    "ports",
    "volumes",
    "env",
    "files",
    "registries",
];
const KNOWN_OPTIONS: [&str; 1] = ["options"];

/// Validates a migrated document against the current schema.
///
/// # Errors
///
/// Returns [`ConfigError::SchemaViolation`] carrying every violation found.
pub fn validate(doc: &Value) -> Result<()> {
    let violations = check(doc);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::SchemaViolation(violations))
    }
}

/// Runs all checks, returning the collected violations.
#[must_use]
pub fn check(doc: &Value) -> Vec<Violation> {
    let mut v = Vec::new();

    check_envelope(doc, &mut v);
    check_name(doc, &mut v);
    check_counts(doc, &mut v);
    check_ports(doc, &mut v);
    check_scoped_list(doc, "volumes", "volume", &mut v);
    check_scoped_list(doc, "env", "envVar", &mut v);
    check_files(doc, &mut v);
    check_registries(doc, &mut v);
    check_options(doc, &mut v);
    check_unknown_fields(doc, &mut v);

    v
}

fn violation(v: &mut Vec<Violation>, code: &str, path: impl Into<String>, message: impl Into<String>) {
    v.push(Violation {
        code: code.to_string(),
        path: path.into(),
        message: message.into(),
    });
}

fn check_envelope(doc: &Value, v: &mut Vec<Violation>) {
    if doc.get("apiVersion").and_then(Value::as_str) != Some(API_VERSION_CURRENT) {
        violation(
            v,
            "api-version",
            "apiVersion",
            format!("must be {API_VERSION_CURRENT} after migration"),
        );
    }
    match doc.get("kind").and_then(Value::as_str) {
        Some(KIND_SIMPLE) | None => {}
        Some(other) => violation(v, "kind", "kind", format!("unknown kind '{other}'")),
    }
}

fn check_name(doc: &Value, v: &mut Vec<Violation>) {
    let name = doc
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str);
    match name {
        None | Some("") => violation(v, "name-missing", "metadata.name", "cluster name is required"),
        Some(name) => {
            if ClusterName::new(name).is_err() {
                violation(
                    v,
                    "name-invalid",
                    "metadata.name",
                    format!("'{name}' is not a DNS label of at most 32 characters"),
                );
            }
        }
    }
}

fn check_counts(doc: &Value, v: &mut Vec<Violation>) {
    if let Some(servers) = doc.get("servers") {
        match servers.as_u64() {
            Some(n) if n >= 1 => {}
            _ => violation(v, "servers-invalid", "servers", "must be an integer >= 1"),
        }
    }
    if let Some(agents) = doc.get("agents") {
        if agents.as_u64().is_none() {
            violation(v, "agents-invalid", "agents", "must be an integer >= 0");
        }
    }
}

fn check_node_filters(entry: &Value, path: &str, v: &mut Vec<Violation>) {
    let Some(filters) = entry.get("nodeFilters") else {
        return;
    };
    let Some(filters) = filters.as_sequence() else {
        violation(v, "filters-not-list", format!("{path}.nodeFilters"), "must be a list");
        return;
    };
    let raw: Vec<String> = filters
        .iter()
        .filter_map(Value::as_str)
        .map(ToString::to_string)
        .collect();
    if let Err(err) = parse_filters(&raw) {
        violation(v, "filter-invalid", format!("{path}.nodeFilters"), err.to_string());
    }
}

fn check_ports(doc: &Value, v: &mut Vec<Violation>) {
    let Some(ports) = doc.get("ports").and_then(Value::as_sequence) else {
        return;
    };
    let mut bound_host_ports: Vec<(String, u16)> = Vec::new();

    for (i, entry) in ports.iter().enumerate() {
        let path = format!("ports[{i}]");
        let Some(port) = entry.get("port").and_then(Value::as_str) else {
            violation(v, "port-missing", &path, "entry needs a 'port' string");
            continue;
        };
        match port.parse::<PortMapping>() {
            Ok(mapping) => {
                if let Some(host_port) = mapping.host_port {
                    let host_ip = mapping.host_ip.clone().unwrap_or_default();
                    if bound_host_ports.contains(&(host_ip.clone(), host_port)) {
                        violation(
                            v,
                            "port-duplicate",
                            &path,
                            format!("host port {host_port} bound more than once"),
                        );
                    }
                    bound_host_ports.push((host_ip, host_port));
                }
            }
            Err(_) => violation(v, "port-invalid", &path, format!("cannot parse '{port}'")),
        }
        check_node_filters(entry, &path, v);
    }
}

fn check_scoped_list(doc: &Value, key: &str, value_field: &str, v: &mut Vec<Violation>) {
    let Some(entries) = doc.get(key).and_then(Value::as_sequence) else {
        return;
    };
    for (i, entry) in entries.iter().enumerate() {
        let path = format!("{key}[{i}]");
        match entry.get(value_field).and_then(Value::as_str) {
            None | Some("") => {
                violation(
                    v,
                    "entry-missing",
                    &path,
                    format!("entry needs a '{value_field}' string"),
                );
            }
            Some(raw) => {
                if key == "volumes" && raw.parse::<VolumeMount>().is_err() {
                    violation(v, "volume-invalid", &path, format!("cannot parse '{raw}'"));
                }
                if key == "env" && !raw.contains('=') {
                    violation(v, "env-invalid", &path, "expected KEY=VALUE");
                }
            }
        }
        check_node_filters(entry, &path, v);
    }
}

fn check_files(doc: &Value, v: &mut Vec<Violation>) {
    let Some(files) = doc.get("files").and_then(Value::as_sequence) else {
        return;
    };
    for (i, entry) in files.iter().enumerate() {
        let path = format!("files[{i}]");
        for field in ["source", "destination"] {
            match entry.get(field).and_then(Value::as_str) {
                None | Some("") => {
                    violation(v, "file-field-missing", &path, format!("'{field}' is required"));
                }
                Some(_) => {}
            }
        }
        check_node_filters(entry, &path, v);
    }
}

fn check_registries(doc: &Value, v: &mut Vec<Violation>) {
    let Some(registries) = doc.get("registries") else {
        return;
    };
    if let Some(uses) = registries.get("use").and_then(Value::as_sequence) {
        for (i, entry) in uses.iter().enumerate() {
            if entry.as_str().map_or(true, str::is_empty) {
                violation(
                    v,
                    "registry-use-invalid",
                    format!("registries.use[{i}]"),
                    "must be a registry name",
                );
            }
        }
    }
    if let Some(config) = registries.get("config") {
        if let Some(raw) = config.as_str() {
            if serde_yaml::from_str::<Value>(raw).is_err() {
                violation(
                    v,
                    "registry-config-invalid",
                    "registries.config",
                    "must be a YAML document",
                );
            }
        }
    }
}

fn check_options(doc: &Value, v: &mut Vec<Violation>) {
    let Some(timeout) = doc
        .get("options")
        .and_then(|o| o.get("k3c"))
        .and_then(|k| k.get("timeout"))
        .and_then(Value::as_str)
    else {
        return;
    };
    if parse_duration(timeout).is_none() {
        violation(
            v,
            "timeout-invalid",
            "options.k3c.timeout",
            format!("cannot parse duration '{timeout}' (expected e.g. 90s, 5m)"),
        );
    }
}

fn check_unknown_fields(doc: &Value, v: &mut Vec<Violation>) {
    let Some(map) = doc.as_mapping() else {
        violation(v, "not-a-mapping", ".", "document must be a mapping");
        return;
    };
    for key in map.keys().filter_map(Value::as_str) {
        if !KNOWN_TOP_LEVEL.contains(&key) && !KNOWN_OPTIONS.contains(&key) {
            violation(v, "unknown-field", key, "unknown field");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_valid_document_passes() {
        let doc = yaml(
            r#"
apiVersion: k3c.io/v1alpha5
kind: Simple
metadata: {name: ok}
servers: 3
agents: 2
ports:
  - port: "8080:80"
    nodeFilters: ["loadbalancer"]
options:
  k3c:
    timeout: "90s"
"#,
        );
        assert!(validate(&doc).is_ok());
    }

    #[test]
    fn test_all_errors_reported_not_just_first() {
        let doc = yaml(
            r"
apiVersion: k3c.io/v1alpha5
kind: Simple
metadata: {name: 'Bad_Name'}
servers: 0
bogus: true
",
        );
        let violations = check(&doc);
        let codes: Vec<&str> = violations.iter().map(|v| v.code.as_str()).collect();
        assert!(codes.contains(&"name-invalid"));
        assert!(codes.contains(&"servers-invalid"));
        assert!(codes.contains(&"unknown-field"));
        assert!(violations.len() >= 3);
    }

    #[test]
    fn test_duplicate_port_binding() {
        let doc = yaml(
            r#"
apiVersion: k3c.io/v1alpha5
kind: Simple
metadata: {name: dup}
ports:
  - port: "8080:80"
  - port: "8080:90"
"#,
        );
        let violations = check(&doc);
        assert!(violations.iter().any(|v| v.code == "port-duplicate"));
    }

    #[test]
    fn test_same_port_different_interface_allowed() {
        let doc = yaml(
            r#"
apiVersion: k3c.io/v1alpha5
kind: Simple
metadata: {name: ifaces}
ports:
  - port: "127.0.0.1:8080:80"
  - port: "10.0.0.1:8080:80"
"#,
        );
        assert!(validate(&doc).is_ok());
    }

    #[test]
    fn test_bad_filter_reported() {
        let doc = yaml(
            r#"
apiVersion: k3c.io/v1alpha5
kind: Simple
metadata: {name: filters}
env:
  - envVar: A=b
    nodeFilters: ["master:0"]
"#,
        );
        let violations = check(&doc);
        assert!(violations.iter().any(|v| v.code == "filter-invalid"));
    }

    #[test]
    fn test_bad_timeout_reported() {
        let doc = yaml(
            r"
apiVersion: k3c.io/v1alpha5
kind: Simple
metadata: {name: t}
options:
  k3c:
    timeout: quick
",
        );
        let violations = check(&doc);
        assert!(violations.iter().any(|v| v.code == "timeout-invalid"));
    }
}
