//! Schema version migration.
//!
//! Documents migrate through the linear chain
//! v1alpha2 -> v1alpha3 -> v1alpha4 -> v1alpha5, each edge a transformation
//! over the raw YAML tree. Migration of an already-current document is the
//! identity, and every edge tolerates re-application.

use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::simple::{API_VERSIONS, API_VERSION_CURRENT};

/// Reads the `apiVersion` field of a document.
///
/// # Errors
///
/// Returns [`ConfigError::UnknownApiVersion`] when the field is absent or
/// not one of the accepted versions.
pub fn identify_version(doc: &Value) -> Result<&'static str> {
    let raw = doc
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or_default();
    API_VERSIONS
        .iter()
        .find(|v| **v == raw)
        .copied()
        .ok_or_else(|| ConfigError::UnknownApiVersion(raw.to_string()))
}

/// Migrates a document to the current schema version.
pub fn migrate(mut doc: Value) -> Result<Value> {
    let mut version = identify_version(&doc)?;

    while version != API_VERSION_CURRENT {
        let (next, step): (&str, fn(Value) -> Result<Value>) = match version {
            "k3c.io/v1alpha2" => ("k3c.io/v1alpha3", migrate_v2_to_v3),
            "k3c.io/v1alpha3" => ("k3c.io/v1alpha4", migrate_v3_to_v4),
            "k3c.io/v1alpha4" => (API_VERSION_CURRENT, migrate_v4_to_v5),
            other => return Err(ConfigError::UnknownApiVersion(other.to_string())),
        };
        debug!(from = version, to = next, "migrating config schema");
        doc = step(doc)?;
        set_version(&mut doc, next)?;
        version = next;
    }

    Ok(doc)
}

fn set_version(doc: &mut Value, version: &str) -> Result<()> {
    let map = as_mapping(doc, "document")?;
    map.insert(
        Value::from("apiVersion"),
        Value::from(version.to_string()),
    );
    Ok(())
}

fn as_mapping<'a>(value: &'a mut Value, what: &str) -> Result<&'a mut Mapping> {
    let type_name = value_type_name(value);
    value.as_mapping_mut().ok_or_else(|| ConfigError::MigrationFailure {
        from: String::new(),
        to: String::new(),
        message: format!("{what} is not a mapping (found {type_name})"),
    })
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged",
    }
}

/// v1alpha2 -> v1alpha3: the role-specific k3s argument lists
/// `options.k3s.extraServerArgs` and `options.k3s.extraAgentArgs` become one
/// `options.k3s.extraArgs` list of `{arg, nodeFilters}` records.
fn migrate_v2_to_v3(mut doc: Value) -> Result<Value> {
    let Some(k3s) = doc
        .get_mut("options")
        .and_then(|o| o.get_mut("k3s"))
        .and_then(Value::as_mapping_mut)
    else {
        return Ok(doc);
    };

    let mut extra_args: Vec<Value> = k3s
        .remove("extraArgs")
        .and_then(|v| v.as_sequence().cloned())
        .unwrap_or_default();

    for (legacy_key, filter) in [("extraServerArgs", "server:*"), ("extraAgentArgs", "agent:*")] {
        let Some(legacy) = k3s.remove(legacy_key) else {
            continue;
        };
        let args = legacy
            .as_sequence()
            .cloned()
            .ok_or_else(|| migration_error("v1alpha2", "v1alpha3", format!("{legacy_key} is not a list")))?;
        for arg in args {
            let mut record = Mapping::new();
            record.insert(Value::from("arg"), arg);
            record.insert(
                Value::from("nodeFilters"),
                Value::Sequence(vec![Value::from(filter)]),
            );
            extra_args.push(Value::Mapping(record));
        }
    }

    if !extra_args.is_empty() {
        k3s.insert(Value::from("extraArgs"), Value::Sequence(extra_args));
    }
    Ok(doc)
}

/// v1alpha3 -> v1alpha4: `exposeAPI {host, hostIP, port}` is renamed to
/// `kubeAPI {host, hostIP, hostPort}`.
fn migrate_v3_to_v4(mut doc: Value) -> Result<Value> {
    let map = as_mapping(&mut doc, "document")?;
    let Some(expose) = map.remove("exposeAPI") else {
        return Ok(doc);
    };

    let mut kube_api = Mapping::new();
    if let Some(expose) = expose.as_mapping() {
        for (key, value) in expose {
            let renamed = match key.as_str() {
                Some("port") => Value::from("hostPort"),
                _ => key.clone(),
            };
            kube_api.insert(renamed, value.clone());
        }
    }
    map.insert(Value::from("kubeAPI"), Value::Mapping(kube_api));
    Ok(doc)
}

/// v1alpha4 -> v1alpha5: top-level `clusterToken` is renamed to `token`.
fn migrate_v4_to_v5(mut doc: Value) -> Result<Value> {
    let map = as_mapping(&mut doc, "document")?;
    if let Some(token) = map.remove("clusterToken") {
        map.entry(Value::from("token")).or_insert(token);
    }
    Ok(doc)
}

fn migration_error(from: &str, to: &str, message: String) -> ConfigError {
    ConfigError::MigrationFailure {
        from: from.to_string(),
        to: to.to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_identify_version() {
        assert_eq!(
            identify_version(&yaml("apiVersion: k3c.io/v1alpha5")).unwrap(),
            API_VERSION_CURRENT
        );
        assert!(matches!(
            identify_version(&yaml("apiVersion: k3c.io/v1beta1")),
            Err(ConfigError::UnknownApiVersion(_))
        ));
        assert!(identify_version(&yaml("kind: Simple")).is_err());
    }

    #[test]
    fn test_migrate_v2_merges_role_args() {
        let doc = yaml(
            r"
apiVersion: k3c.io/v1alpha2
kind: Simple
metadata: {name: old}
options:
  k3s:
    extraServerArgs: ['--disable=traefik']
    extraAgentArgs: ['--node-taint=key=value:NoExecute']
",
        );
        let migrated = migrate(doc).unwrap();
        assert_eq!(
            migrated.get("apiVersion").unwrap().as_str().unwrap(),
            API_VERSION_CURRENT
        );

        let args = migrated["options"]["k3s"]["extraArgs"].as_sequence().unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(args[0]["arg"].as_str().unwrap(), "--disable=traefik");
        assert_eq!(args[0]["nodeFilters"][0].as_str().unwrap(), "server:*");
        assert_eq!(args[1]["nodeFilters"][0].as_str().unwrap(), "agent:*");
        assert!(migrated["options"]["k3s"].get("extraServerArgs").is_none());
    }

    #[test]
    fn test_migrate_v3_renames_expose_api() {
        let doc = yaml(
            r"
apiVersion: k3c.io/v1alpha3
kind: Simple
metadata: {name: old}
exposeAPI:
  host: api.example.com
  hostIP: 127.0.0.1
  port: 6550
",
        );
        let migrated = migrate(doc).unwrap();
        let kube_api = &migrated["kubeAPI"];
        assert_eq!(kube_api["host"].as_str().unwrap(), "api.example.com");
        assert_eq!(kube_api["hostPort"].as_u64().unwrap(), 6550);
        assert!(migrated.get("exposeAPI").is_none());
    }

    #[test]
    fn test_migrate_v4_renames_token() {
        let doc = yaml(
            r"
apiVersion: k3c.io/v1alpha4
kind: Simple
metadata: {name: old}
clusterToken: sekrit
",
        );
        let migrated = migrate(doc).unwrap();
        assert_eq!(migrated["token"].as_str().unwrap(), "sekrit");
        assert!(migrated.get("clusterToken").is_none());
    }

    #[test]
    fn test_migration_is_idempotent() {
        let doc = yaml(
            r"
apiVersion: k3c.io/v1alpha2
kind: Simple
metadata: {name: idem}
servers: 3
options:
  k3s:
    extraServerArgs: ['--disable=traefik']
",
        );
        let once = migrate(doc).unwrap();
        let twice = migrate(once.clone()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_migrated_v2_equals_native_v5() {
        let old = yaml(
            r"
apiVersion: k3c.io/v1alpha2
kind: Simple
metadata: {name: fixture}
servers: 1
clusterToken: tok
exposeAPI:
  hostPort: 6550
options:
  k3s:
    extraServerArgs: ['--disable=traefik']
",
        );
        let native = yaml(
            r"
apiVersion: k3c.io/v1alpha5
kind: Simple
metadata: {name: fixture}
servers: 1
token: tok
kubeAPI:
  hostPort: 6550
options:
  k3s:
    extraArgs:
      - arg: --disable=traefik
        nodeFilters: ['server:*']
",
        );

        let migrated = migrate(old).unwrap();
        let a: crate::simple::SimpleConfig = serde_yaml::from_value(migrated).unwrap();
        let b: crate::simple::SimpleConfig = serde_yaml::from_value(native).unwrap();
        assert_eq!(a, b);
    }
}
