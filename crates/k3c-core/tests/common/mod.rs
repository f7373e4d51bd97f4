#![allow(dead_code)]

//! In-memory mock runtime for orchestrator tests.
//!
//! Mimics the behavioral contract of the Docker adapter: label storage and
//! queries, network membership, log emission on start, exec conventions for
//! the probes the orchestrator issues. Tests inspect the journal and the
//! final object state.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k3c_runtime::{
    ContainerInfo, ExecResult, NetworkAttachment, NetworkInfo, NetworkMember, Runtime,
    RuntimeError, RuntimeHostInfo, RuntimeKind, VolumeInfo,
};
use k3c_types::{labels, NodeSpec, Role};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<k3c_types::VolumeMount>,
    pub networks: Vec<String>,
    pub running: bool,
    pub state: String,
    pub started_at: Option<DateTime<Utc>>,
    pub logs: String,
}

#[derive(Debug, Default)]
pub struct MockState {
    pub containers: BTreeMap<String, MockContainer>,
    pub networks: BTreeMap<String, (BTreeMap<String, String>, BTreeSet<String>)>,
    pub volumes: BTreeMap<String, BTreeMap<String, String>>,
    pub images: BTreeSet<String>,
    pub pull_counts: BTreeMap<String, usize>,
    pub files: BTreeMap<(String, String), Vec<u8>>,
    pub reload_count: usize,
    pub next_id: u64,
    pub next_ip: u8,
}

/// Failure injection knobs.
#[derive(Debug, Default)]
pub struct MockBehavior {
    /// Containers whose logs never show the readiness pattern.
    pub never_ready: Vec<String>,
    /// Container name whose create call fails.
    pub fail_create: Option<String>,
}

pub struct MockRuntime {
    pub state: Mutex<MockState>,
    pub behavior: MockBehavior,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::with_behavior(MockBehavior::default())
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            behavior,
        }
    }

    /// Seeds a pre-existing registry container, as if created earlier.
    pub fn seed_registry(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        let mut reg_labels = BTreeMap::new();
        reg_labels.insert(labels::LABEL_APP.to_string(), labels::APP_NAME.to_string());
        reg_labels.insert(
            labels::LABEL_ROLE.to_string(),
            Role::Registry.as_str().to_string(),
        );
        reg_labels.insert(labels::LABEL_REGISTRY_HOST.to_string(), name.to_string());
        state.containers.insert(
            name.to_string(),
            MockContainer {
                id: format!("seed-{name}"),
                name: name.to_string(),
                image: "registry:2".to_string(),
                labels: reg_labels,
                cmd: Vec::new(),
                env: BTreeMap::new(),
                volumes: Vec::new(),
                networks: vec!["bridge".to_string()],
                running: true,
                state: "running".to_string(),
                started_at: Some(Utc::now()),
                logs: "level=info msg=\"listening on [::]:5000\"\n".to_string(),
            },
        );
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state.lock().unwrap().containers.keys().cloned().collect()
    }

    pub fn file(&self, container: &str, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(&(container.to_string(), path.to_string()))
            .cloned()
    }

    fn ready_log(&self, container: &MockContainer) -> String {
        if self.behavior.never_ready.iter().any(|n| container.name.contains(n)) {
            return String::new();
        }
        match container.labels.get(labels::LABEL_ROLE).map(String::as_str) {
            Some("server") => "time=\"...\" level=info msg=\"k3s is up and running\"\n".to_string(),
            Some("agent") => "level=info msg=\"Successfully registered node\"\n".to_string(),
            Some("loadbalancer") => "nginx: start worker processes\n".to_string(),
            Some("registry") => "level=info msg=\"listening on [::]:5000\"\n".to_string(),
            _ => String::new(),
        }
    }

    fn matches(labels: &BTreeMap<String, String>, filters: &[(String, String)]) -> bool {
        filters
            .iter()
            .all(|(k, v)| labels.get(k).map(String::as_str) == Some(v.as_str()))
    }

    fn info_of(container: &MockContainer) -> ContainerInfo {
        ContainerInfo {
            id: container.id.clone(),
            name: container.name.clone(),
            image: container.image.clone(),
            labels: container.labels.clone(),
            cmd: container.cmd.clone(),
            env: container.env.clone(),
            mounts: container.volumes.clone(),
            state: container.state.clone(),
            running: container.running,
            started_at: container.started_at,
            networks: container
                .networks
                .iter()
                .enumerate()
                .map(|(i, network)| NetworkAttachment {
                    network: network.clone(),
                    ip: Some(format!("172.28.0.{}", i + 2)),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    fn id(&self) -> &'static str {
        "mock"
    }

    async fn container_create(
        &self,
        spec: &NodeSpec,
        _cancel: &CancellationToken,
    ) -> Result<String, RuntimeError> {
        if self.behavior.fail_create.as_deref() == Some(spec.name.as_str()) {
            return Err(RuntimeError::Daemon(format!(
                "injected create failure for {}",
                spec.name
            )));
        }
        let mut state = self.state.lock().unwrap();
        if state.containers.contains_key(&spec.name) {
            return Err(RuntimeError::already_exists(spec.name.clone()));
        }
        for network in &spec.networks {
            if let Some((_, members)) = state.networks.get_mut(network) {
                members.insert(spec.name.clone());
            }
        }
        state.next_id += 1;
        let id = format!("mock-{:08x}", state.next_id);
        state.containers.insert(
            spec.name.clone(),
            MockContainer {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                labels: spec.runtime_labels.clone(),
                // the daemon reports command plus arguments as one vector
                cmd: spec.cmd.iter().chain(spec.args.iter()).cloned().collect(),
                env: spec.env.clone(),
                volumes: spec.volumes.clone(),
                networks: spec.networks.clone(),
                running: false,
                state: "created".to_string(),
                started_at: None,
                logs: String::new(),
            },
        );
        Ok(id)
    }

    async fn container_start(
        &self,
        name: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::not_found(name))?;
        container.running = true;
        container.state = "running".to_string();
        container.started_at = Some(Utc::now());
        let ready = self.ready_log(container);
        let container = state.containers.get_mut(name).unwrap();
        container.logs.push_str(&ready);
        Ok(())
    }

    async fn container_stop(
        &self,
        name: &str,
        _grace: Duration,
        _cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::not_found(name))?;
        container.running = false;
        container.state = "exited".to_string();
        Ok(())
    }

    async fn container_delete(
        &self,
        name: &str,
        _force: bool,
        _cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .remove(name)
            .ok_or_else(|| RuntimeError::not_found(name))?;
        for network in &container.networks {
            if let Some((_, members)) = state.networks.get_mut(network) {
                members.remove(name);
            }
        }
        Ok(())
    }

    async fn container_inspect(
        &self,
        name: &str,
        _cancel: &CancellationToken,
    ) -> Result<ContainerInfo, RuntimeError> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .get(name)
            .map(Self::info_of)
            .ok_or_else(|| RuntimeError::not_found(name))
    }

    async fn container_list(
        &self,
        filters: &[(String, String)],
        _cancel: &CancellationToken,
    ) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .values()
            .filter(|c| Self::matches(&c.labels, filters))
            .map(Self::info_of)
            .collect())
    }

    async fn container_rename(
        &self,
        name: &str,
        new_name: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        let mut container = state
            .containers
            .remove(name)
            .ok_or_else(|| RuntimeError::not_found(name))?;
        container.name = new_name.to_string();
        state.containers.insert(new_name.to_string(), container);
        Ok(())
    }

    async fn copy_to_container(
        &self,
        name: &str,
        dest: &str,
        content: &[u8],
        _mode: u32,
        _cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if !state.containers.contains_key(name) {
            return Err(RuntimeError::not_found(name));
        }
        state
            .files
            .insert((name.to_string(), dest.to_string()), content.to_vec());
        Ok(())
    }

    async fn copy_from_container(
        &self,
        name: &str,
        src: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<u8>, RuntimeError> {
        let state = self.state.lock().unwrap();
        state
            .files
            .get(&(name.to_string(), src.to_string()))
            .cloned()
            .ok_or_else(|| RuntimeError::not_found(format!("{name}:{src}")))
    }

    async fn exec(
        &self,
        name: &str,
        cmd: &[String],
        _cancel: &CancellationToken,
    ) -> Result<ExecResult, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        let Some(container) = state.containers.get(name) else {
            return Err(RuntimeError::not_found(name));
        };
        if !container.running {
            return Ok(ExecResult {
                exit_code: 126,
                stdout: String::new(),
                stderr: "container not running".to_string(),
            });
        }

        let joined = cmd.join(" ");
        if joined.contains("nginx -s reload") {
            state.reload_count += 1;
            return Ok(ExecResult {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            });
        }
        if joined.contains("get nodes") {
            let cluster = container.labels.get(labels::LABEL_CLUSTER).cloned();
            let stdout = state
                .containers
                .values()
                .filter(|c| {
                    c.running
                        && c.labels.get(labels::LABEL_CLUSTER).cloned() == cluster
                        && matches!(
                            c.labels.get(labels::LABEL_ROLE).map(String::as_str),
                            Some("server" | "agent")
                        )
                })
                .map(|c| format!("{}   Ready    <none>   1m   v1.31.5+k3s1\n", c.name))
                .collect();
            return Ok(ExecResult {
                exit_code: 0,
                stdout,
                stderr: String::new(),
            });
        }
        if joined.contains("--raw=/readyz") {
            if self.behavior.never_ready.iter().any(|n| name.contains(n)) {
                return Ok(ExecResult {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: "apiserver not ready".to_string(),
                });
            }
            return Ok(ExecResult {
                exit_code: 0,
                stdout: "ok".to_string(),
                stderr: String::new(),
            });
        }
        Ok(ExecResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn exec_streaming(
        &self,
        _name: &str,
        _cmd: &[String],
        _cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<String>, RuntimeError> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn read_logs(
        &self,
        name: &str,
        _since: Option<DateTime<Utc>>,
        _cancel: &CancellationToken,
    ) -> Result<String, RuntimeError> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .get(name)
            .map(|c| c.logs.clone())
            .ok_or_else(|| RuntimeError::not_found(name))
    }

    async fn network_create_if_absent(
        &self,
        name: &str,
        net_labels: &BTreeMap<String, String>,
        _cancel: &CancellationToken,
    ) -> Result<(NetworkInfo, bool), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        let created = !state.networks.contains_key(name);
        if created {
            state
                .networks
                .insert(name.to_string(), (net_labels.clone(), BTreeSet::new()));
        }
        let (stored_labels, members) = &state.networks[name];
        Ok((
            NetworkInfo {
                id: format!("net-{name}"),
                name: name.to_string(),
                labels: stored_labels.clone(),
                subnet: Some("172.28.0.0/16".to_string()),
                gateway: Some("172.28.0.1".to_string()),
                containers: members
                    .iter()
                    .map(|m| NetworkMember {
                        name: m.clone(),
                        ip: None,
                    })
                    .collect(),
            },
            created,
        ))
    }

    async fn network_connect(
        &self,
        container: &str,
        network: &str,
        _ip: Option<IpAddr>,
        _cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if !state.networks.contains_key(network) {
            return Err(RuntimeError::not_found(network));
        }
        let Some(found) = state.containers.get_mut(container) else {
            return Err(RuntimeError::not_found(container));
        };
        if !found.networks.contains(&network.to_string()) {
            found.networks.push(network.to_string());
        }
        state
            .networks
            .get_mut(network)
            .unwrap()
            .1
            .insert(container.to_string());
        Ok(())
    }

    async fn network_disconnect(
        &self,
        container: &str,
        network: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if let Some(found) = state.containers.get_mut(container) {
            found.networks.retain(|n| n != network);
        }
        if let Some((_, members)) = state.networks.get_mut(network) {
            members.remove(container);
        }
        Ok(())
    }

    async fn network_delete(
        &self,
        name: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        match state.networks.get(name) {
            None => return Err(RuntimeError::not_found(name)),
            Some((_, members)) if !members.is_empty() => {
                return Err(RuntimeError::Daemon(format!(
                    "network {name} has active endpoints"
                )));
            }
            Some(_) => {}
        }
        state.networks.remove(name);
        Ok(())
    }

    async fn network_get(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<NetworkInfo, RuntimeError> {
        {
            let state = self.state.lock().unwrap();
            if !state.networks.contains_key(name) {
                return Err(RuntimeError::not_found(name));
            }
        }
        let (info, _) = self
            .network_create_if_absent(name, &BTreeMap::new(), cancel)
            .await?;
        Ok(info)
    }

    async fn network_list(
        &self,
        filters: &[(String, String)],
        _cancel: &CancellationToken,
    ) -> Result<Vec<NetworkInfo>, RuntimeError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .networks
            .iter()
            .filter(|(_, (net_labels, _))| Self::matches(net_labels, filters))
            .map(|(name, (net_labels, members))| NetworkInfo {
                id: format!("net-{name}"),
                name: name.clone(),
                labels: net_labels.clone(),
                subnet: Some("172.28.0.0/16".to_string()),
                gateway: Some("172.28.0.1".to_string()),
                containers: members
                    .iter()
                    .map(|m| NetworkMember {
                        name: m.clone(),
                        ip: None,
                    })
                    .collect(),
            })
            .collect())
    }

    async fn allocate_ip(
        &self,
        _network: &str,
        _cancel: &CancellationToken,
    ) -> Result<IpAddr, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.next_ip += 1;
        Ok(format!("172.28.0.{}", state.next_ip + 1).parse().unwrap())
    }

    async fn release_ip(
        &self,
        _network: &str,
        _ip: IpAddr,
        _cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn volume_create(
        &self,
        name: &str,
        vol_labels: &BTreeMap<String, String>,
        _cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.volumes.insert(name.to_string(), vol_labels.clone());
        Ok(())
    }

    async fn volume_delete(
        &self,
        name: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state
            .volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::not_found(name))
    }

    async fn volume_get(
        &self,
        name: &str,
        _cancel: &CancellationToken,
    ) -> Result<VolumeInfo, RuntimeError> {
        let state = self.state.lock().unwrap();
        state
            .volumes
            .get(name)
            .map(|vol_labels| VolumeInfo {
                name: name.to_string(),
                labels: vol_labels.clone(),
            })
            .ok_or_else(|| RuntimeError::not_found(name))
    }

    async fn volume_list(
        &self,
        filters: &[(String, String)],
        _cancel: &CancellationToken,
    ) -> Result<Vec<VolumeInfo>, RuntimeError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .volumes
            .iter()
            .filter(|(_, vol_labels)| Self::matches(vol_labels, filters))
            .map(|(name, vol_labels)| VolumeInfo {
                name: name.clone(),
                labels: vol_labels.clone(),
            })
            .collect())
    }

    async fn image_exists(
        &self,
        reference: &str,
        _cancel: &CancellationToken,
    ) -> Result<bool, RuntimeError> {
        let state = self.state.lock().unwrap();
        Ok(state.images.contains(reference))
    }

    async fn image_pull(
        &self,
        reference: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        {
            let mut state = self.state.lock().unwrap();
            *state.pull_counts.entry(reference.to_string()).or_default() += 1;
        }
        // overlap window so concurrent requesters hit the shared-wait path
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut state = self.state.lock().unwrap();
        state.images.insert(reference.to_string());
        Ok(())
    }

    async fn image_save(
        &self,
        _references: &[String],
        _dest: &Path,
        _cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn image_load(
        &self,
        _tar: &Path,
        _cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn host_info(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<RuntimeHostInfo, RuntimeError> {
        Ok(RuntimeHostInfo {
            kind: RuntimeKind::Native,
            os: "Ubuntu 24.04".to_string(),
            cgroup_v2: true,
        })
    }

    async fn host_gateway_ip(
        &self,
        _network: &str,
        _cancel: &CancellationToken,
    ) -> Result<Option<IpAddr>, RuntimeError> {
        Ok(Some("172.28.0.1".parse().unwrap()))
    }
}
