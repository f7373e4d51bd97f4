//! Kubeconfig retrieval and host-side persistence.
//!
//! The kubeconfig is fetched from a server container, rewritten to point at
//! the cluster's published API endpoint with `k3c-<cluster>` names, and
//! either printed or merged into the user's kubeconfig file. File writes go
//! through a temp file and rename, so readers never see a torn document.

use std::path::{Path, PathBuf};

use k3c_config::KUBECONFIG_OUTPUT;
use k3c_runtime::DynRuntime;
use k3c_types::{Cluster, Role, NAME_PREFIX};
use serde_yaml::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{CoreError, Result};

/// Context, cluster and user name for a cluster's kubeconfig entries.
#[must_use]
pub fn context_name(cluster: &str) -> String {
    format!("{NAME_PREFIX}-{cluster}")
}

/// Default kubeconfig path: `$KUBECONFIG` or `~/.kube/config`.
#[must_use]
pub fn default_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("KUBECONFIG") {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    std::env::var("HOME")
        .ok()
        .map(|home| Path::new(&home).join(".kube").join("config"))
}

/// Fetches the kubeconfig from the cluster and rewrites it for host use.
pub async fn fetch(
    runtime: &DynRuntime,
    cluster: &Cluster,
    cancel: &CancellationToken,
) -> Result<String> {
    let server = cluster
        .init_server()
        .or_else(|| cluster.nodes_by_role(Role::Server).next())
        .ok_or_else(|| {
            CoreError::Common(k3c_error::CommonError::invalid_state(format!(
                "cluster {} has no server node",
                cluster.name
            )))
        })?;

    let raw = runtime
        .copy_from_container(server.name(), KUBECONFIG_OUTPUT, cancel)
        .await?;
    let doc: Value = serde_yaml::from_slice(&raw)
        .map_err(|e| CoreError::Common(k3c_error::CommonError::internal(e.to_string())))?;

    let rewritten = rewrite(doc, cluster)?;
    serde_yaml::to_string(&rewritten)
        .map_err(|e| CoreError::Common(k3c_error::CommonError::internal(e.to_string())))
}

/// Rewrites server URL and entry names in a raw k3s kubeconfig.
fn rewrite(mut doc: Value, cluster: &Cluster) -> Result<Value> {
    let name = context_name(cluster.name.as_str());
    let api = &cluster.kube_api;
    let host = api.host.clone().unwrap_or_else(|| {
        if api.host_ip == "0.0.0.0" {
            "127.0.0.1".to_string()
        } else {
            api.host_ip.clone()
        }
    });
    let server_url = format!("https://{host}:{}", api.host_port);

    for section in ["clusters", "users", "contexts"] {
        rename_entries(&mut doc, section, &name);
    }

    if let Some(clusters) = doc.get_mut("clusters").and_then(Value::as_sequence_mut) {
        for entry in clusters {
            if let Some(server) = entry
                .get_mut("cluster")
                .and_then(|c| c.get_mut("server"))
            {
                *server = Value::from(server_url.clone());
            }
        }
    }

    if let Some(contexts) = doc.get_mut("contexts").and_then(Value::as_sequence_mut) {
        for entry in contexts {
            if let Some(context) = entry.get_mut("context").and_then(Value::as_mapping_mut) {
                context.insert(Value::from("cluster"), Value::from(name.clone()));
                context.insert(Value::from("user"), Value::from(name.clone()));
            }
        }
    }

    if let Some(map) = doc.as_mapping_mut() {
        map.insert(Value::from("current-context"), Value::from(name));
    }

    Ok(doc)
}

fn rename_entries(doc: &mut Value, section: &str, name: &str) {
    if let Some(entries) = doc.get_mut(section).and_then(Value::as_sequence_mut) {
        for entry in entries {
            if let Some(map) = entry.as_mapping_mut() {
                map.insert(Value::from("name"), Value::from(name.to_string()));
            }
        }
    }
}

/// Merges a cluster's kubeconfig into the file at `path`, replacing entries
/// of the same name. Creates the file when absent. Optionally selects the
/// new context as current.
pub fn merge_into_file(
    path: &Path,
    rendered: &str,
    switch_context: bool,
) -> Result<()> {
    let incoming: Value = serde_yaml::from_str(rendered)
        .map_err(|e| CoreError::Common(k3c_error::CommonError::internal(e.to_string())))?;

    let mut existing: Value = match std::fs::read_to_string(path) {
        Ok(content) => serde_yaml::from_str(&content)
            .map_err(|e| CoreError::Common(k3c_error::CommonError::config(e.to_string())))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => empty_kubeconfig(),
        Err(err) => return Err(CoreError::Common(err.into())),
    };

    for section in ["clusters", "contexts", "users"] {
        merge_named_section(&mut existing, &incoming, section);
    }

    if switch_context {
        if let (Some(map), Some(current)) = (
            existing.as_mapping_mut(),
            incoming.get("current-context").cloned(),
        ) {
            map.insert(Value::from("current-context"), current);
        }
    }

    let rendered = serde_yaml::to_string(&existing)
        .map_err(|e| CoreError::Common(k3c_error::CommonError::internal(e.to_string())))?;
    write_atomic(path, rendered.as_bytes())?;
    info!(path = %path.display(), "kubeconfig updated");
    Ok(())
}

fn merge_named_section(existing: &mut Value, incoming: &Value, section: &str) {
    let incoming_entries = incoming
        .get(section)
        .and_then(Value::as_sequence)
        .cloned()
        .unwrap_or_default();
    if incoming_entries.is_empty() {
        return;
    }

    let Some(map) = existing.as_mapping_mut() else {
        return;
    };
    let entries = map
        .entry(Value::from(section))
        .or_insert_with(|| Value::Sequence(Vec::new()));
    let Some(entries) = entries.as_sequence_mut() else {
        return;
    };

    for new_entry in incoming_entries {
        let new_name = new_entry.get("name").cloned();
        entries.retain(|e| e.get("name").cloned() != new_name);
        entries.push(new_entry);
    }
}

fn empty_kubeconfig() -> Value {
    serde_yaml::from_str(
        "apiVersion: v1\nkind: Config\nclusters: []\ncontexts: []\nusers: []\npreferences: {}\n",
    )
    .expect("static document")
}

/// Removes a cluster's entries from the file at `path`.
pub fn remove_from_file(path: &Path, cluster: &str) -> Result<()> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(CoreError::Common(err.into())),
    };
    let mut doc: Value = serde_yaml::from_str(&content)
        .map_err(|e| CoreError::Common(k3c_error::CommonError::config(e.to_string())))?;

    let name = Value::from(context_name(cluster));
    for section in ["clusters", "contexts", "users"] {
        if let Some(entries) = doc.get_mut(section).and_then(Value::as_sequence_mut) {
            entries.retain(|e| e.get("name") != Some(&name));
        }
    }
    if doc.get("current-context") == Some(&name) {
        if let Some(map) = doc.as_mapping_mut() {
            map.insert(Value::from("current-context"), Value::from(""));
        }
    }

    let rendered = serde_yaml::to_string(&doc)
        .map_err(|e| CoreError::Common(k3c_error::CommonError::internal(e.to_string())))?;
    write_atomic(path, rendered.as_bytes())?;
    debug!(path = %path.display(), cluster, "kubeconfig entries removed");
    Ok(())
}

/// Atomic file write: temp file in the same directory, then rename.
fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| CoreError::Common(e.into()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| CoreError::Common(e.into()))?;
    std::io::Write::write_all(&mut tmp, content).map_err(|e| CoreError::Common(e.into()))?;
    tmp.persist(path)
        .map_err(|e| CoreError::Common(e.error.into()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k3c_config::{transform_simple_to_cluster, SimpleConfig, TransformEnv};

    fn sample_cluster() -> Cluster {
        let mut simple = SimpleConfig::current("kc");
        simple.token = Some("tok".to_string());
        transform_simple_to_cluster(&simple, &TransformEnv::default())
            .unwrap()
            .cluster
    }

    const RAW_K3S_KUBECONFIG: &str = r"
apiVersion: v1
kind: Config
clusters:
  - name: default
    cluster:
      server: https://127.0.0.1:6443
      certificate-authority-data: Zm9v
users:
  - name: default
    user:
      client-certificate-data: YmFy
contexts:
  - name: default
    context:
      cluster: default
      user: default
current-context: default
";

    #[test]
    fn test_rewrite_names_and_server() {
        let doc: Value = serde_yaml::from_str(RAW_K3S_KUBECONFIG).unwrap();
        let rewritten = rewrite(doc, &sample_cluster()).unwrap();

        assert_eq!(
            rewritten["clusters"][0]["name"].as_str().unwrap(),
            "k3c-kc"
        );
        assert_eq!(
            rewritten["clusters"][0]["cluster"]["server"].as_str().unwrap(),
            "https://127.0.0.1:6443"
        );
        assert_eq!(rewritten["contexts"][0]["context"]["cluster"].as_str().unwrap(), "k3c-kc");
        assert_eq!(rewritten["current-context"].as_str().unwrap(), "k3c-kc");
        // credentials pass through untouched
        assert_eq!(
            rewritten["users"][0]["user"]["client-certificate-data"].as_str().unwrap(),
            "YmFy"
        );
    }

    #[test]
    fn test_merge_into_file_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");

        let doc: Value = serde_yaml::from_str(RAW_K3S_KUBECONFIG).unwrap();
        let rewritten = rewrite(doc, &sample_cluster()).unwrap();
        let rendered = serde_yaml::to_string(&rewritten).unwrap();

        merge_into_file(&path, &rendered, true).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("k3c-kc"));
        assert!(written.contains("current-context: k3c-kc"));

        // merging again replaces rather than duplicates
        merge_into_file(&path, &rendered, false).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.matches("name: k3c-kc").count(), 3);

        remove_from_file(&path, "kc").unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(!written.contains("name: k3c-kc"));
    }
}
