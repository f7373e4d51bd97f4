//! Cluster orchestration.
//!
//! The top-level state machine behind every cluster operation:
//! plan, prepare, create, start and configure, verify, commit, with a typed
//! rollback stack unwound in LIFO order on any failure. Labelled containers
//! are the only durable state; `get` and `list` rebuild the aggregate from
//! label queries alone.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k3c_config::{ClusterConfig, ClusterCreateOpts, HookFailurePolicy, TransformEnv};
use k3c_runtime::{ContainerInfo, DynRuntime};
use k3c_types::{
    labels, node_name, Cluster, ClusterName, ClusterNetwork, HookAction, HookStage, Ipam,
    KubeApi, LifecycleHook, Node, NodePhase, NodeSpec, NodeStatus, PortMapping, Role,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{CoreError, Result};
use crate::event::{Event, EventBus};
use crate::kubeconfig;
use crate::loadbalancer::LoadBalancer;
use crate::node::NodeManager;
use crate::pull::PullGate;
use crate::registry::{registries_hook, registries_yaml, RegistryManager, REGISTRIES_YAML_PATH};
use crate::tools::ToolsNode;

/// Per-node readiness bound when the run has no explicit timeout.
const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(300);
/// Bound on each individual rollback action.
const ROLLBACK_ACTION_TIMEOUT: Duration = Duration::from_secs(30);
/// Ceiling for the post-server-registration settling probe.
const NODE_SETTLE_CEILING: Duration = Duration::from_secs(30);
/// Poll interval of the settling probe.
const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// One undo step, pushed after the corresponding forward mutation.
#[derive(Debug, Clone)]
enum RollbackAction {
    DeleteContainer(String),
    DeleteVolume(String),
    DeleteNetwork(String),
    DisconnectRegistry { registry: String, network: String },
}

impl RollbackAction {
    fn describe(&self) -> String {
        match self {
            Self::DeleteContainer(name) => format!("container/{name}"),
            Self::DeleteVolume(name) => format!("volume/{name}"),
            Self::DeleteNetwork(name) => format!("network/{name}"),
            Self::DisconnectRegistry { registry, network } => {
                format!("registry/{registry}@{network}")
            }
        }
    }
}

/// Label filters selecting every object of one cluster.
fn cluster_filters(name: &str) -> Vec<(String, String)> {
    vec![
        (labels::LABEL_APP.to_string(), labels::APP_NAME.to_string()),
        (labels::LABEL_CLUSTER.to_string(), name.to_string()),
    ]
}

/// Orchestrates cluster lifecycle operations against one runtime.
pub struct ClusterManager {
    runtime: DynRuntime,
    nodes: NodeManager,
    registries: RegistryManager,
    pull_gate: Arc<PullGate>,
    events: EventBus,
    env: TransformEnv,
}

impl ClusterManager {
    /// Creates an orchestrator bound to a runtime.
    #[must_use]
    pub fn new(runtime: DynRuntime) -> Self {
        let events = EventBus::new();
        Self {
            nodes: NodeManager::new(runtime.clone(), events.clone()),
            registries: RegistryManager::new(runtime.clone(), events.clone()),
            pull_gate: Arc::new(PullGate::new()),
            events,
            env: TransformEnv::from_env(),
            runtime,
        }
    }

    /// Subscribes to orchestration events.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The public entry point: provisions the cluster described by `cfg`.
    ///
    /// Any failure after the first mutation unwinds the rollback stack under
    /// a detached context; the returned error always carries the original
    /// failure, wrapped in [`CoreError::RolledBack`] or
    /// [`CoreError::RollbackFailed`].
    pub async fn create(
        &self,
        cfg: ClusterConfig,
        cancel: &CancellationToken,
    ) -> Result<Cluster> {
        let mut cluster = cfg.cluster;
        let opts = cfg.create_opts;
        let name = cluster.name.as_str().to_string();

        let existing = self
            .runtime
            .container_list(&cluster_filters(&name), cancel)
            .await?;
        if !existing.is_empty() {
            return Err(CoreError::Common(k3c_error::CommonError::already_exists(
                format!("cluster {name}"),
            )));
        }

        self.events.publish(Event::ClusterCreating {
            cluster: name.clone(),
        });

        // the user timeout cancels the run context; rollback later runs
        // detached and is not affected
        let run = cancel.child_token();
        // per-node readiness waits are bounded by the same timeout and
        // report the offending node precisely, so the hard cancel gets a
        // short grace on top as a backstop
        let watchdog = opts.timeout.map(|timeout| {
            let run = run.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout + Duration::from_secs(1)).await;
                warn!("cluster create timed out after {}s", timeout.as_secs());
                run.cancel();
            })
        });

        let mut stack: Vec<RollbackAction> = Vec::new();
        let outcome = self
            .create_inner(&mut cluster, &opts, &mut stack, &run)
            .await;

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        match outcome {
            Ok(()) => {
                if cfg.kubeconfig_opts.update_default {
                    if let Err(err) = self.write_kubeconfig(&cluster, &cfg.kubeconfig_opts, &run).await {
                        warn!(error = %err, "cluster is up but kubeconfig update failed");
                    }
                }
                self.events.publish(Event::ClusterCreated {
                    cluster: name.clone(),
                });
                info!(cluster = %name, "cluster created");
                Ok(cluster)
            }
            Err(original) => Err(self.rollback(&name, stack, original).await),
        }
    }

    async fn create_inner(
        &self,
        cluster: &mut Cluster,
        opts: &ClusterCreateOpts,
        stack: &mut Vec<RollbackAction>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let node_timeout = opts.timeout.unwrap_or(DEFAULT_NODE_TIMEOUT);

        // --- prepare ---
        self.prepare_network(cluster, stack, cancel).await?;
        self.prepare_image_volume(cluster, stack, cancel).await?;
        self.prepare_registries(cluster, opts, stack, cancel).await?;
        self.prepull_images(cluster, cancel).await?;

        // --- create & start, in dependency order ---
        let init_name = cluster
            .init_server()
            .map(|n| n.name().to_string())
            .ok_or_else(|| {
                CoreError::Common(k3c_error::CommonError::invalid_state(format!(
                    "cluster {} has no server node",
                    cluster.name
                )))
            })?;

        // init server first; everything else joins through it. The wait is
        // unconditional: joining nodes need a serving API.
        {
            let spec = cluster
                .node(&init_name)
                .map(|n| n.spec.clone())
                .ok_or_else(|| {
                    CoreError::Common(k3c_error::CommonError::not_found(init_name.clone()))
                })?;
            let since = Utc::now();
            self.nodes.create(&spec, cancel).await?;
            stack.push(RollbackAction::DeleteContainer(init_name.clone()));
            self.events.publish(Event::NodeCreated {
                cluster: cluster.name.as_str().to_string(),
                node: init_name.clone(),
                role: Role::Server,
            });
            self.nodes
                .run_hooks(&spec, HookStage::PreStart, opts.hook_failure_policy, cancel)
                .await?;
            self.nodes.start(&spec, cancel).await?;
            self.events.publish(Event::NodeStarted {
                cluster: cluster.name.as_str().to_string(),
                node: init_name.clone(),
            });
            self.nodes
                .wait_ready(&spec, since, node_timeout, opts.node_wait_logs, cancel)
                .await?;
            self.events.publish(Event::NodeReady {
                cluster: cluster.name.as_str().to_string(),
                node: init_name.clone(),
            });
        }
        self.mark_phase(cluster, &init_name, NodePhase::Ready);

        // remaining servers and agents are created in parallel once the
        // init node is ready
        let secondary: Vec<String> = cluster
            .nodes
            .iter()
            .filter(|n| n.role().is_k3s() && n.name() != init_name)
            .map(|n| n.name().to_string())
            .collect();
        self.create_batch(cluster, &secondary, stack, cancel).await?;

        // all servers ready happens-before any agent start
        let servers: Vec<String> = cluster
            .nodes_by_role(Role::Server)
            .filter(|n| n.name() != init_name)
            .map(|n| n.name().to_string())
            .collect();
        self.start_batch(cluster, &servers, opts, node_timeout, cancel)
            .await?;
        if opts.wait_for_ready {
            self.settle_servers(cluster, &init_name, cancel).await;
        }

        let agents: Vec<String> = cluster
            .nodes_by_role(Role::Agent)
            .map(|n| n.name().to_string())
            .collect();
        self.start_batch(cluster, &agents, opts, node_timeout, cancel)
            .await?;

        // the LB is synthesized and started last
        if let Some(lb) = cluster.loadbalancer().map(|n| n.spec.clone()) {
            let since = Utc::now();
            self.nodes.create(&lb, cancel).await?;
            stack.push(RollbackAction::DeleteContainer(lb.name.clone()));
            self.events.publish(Event::NodeCreated {
                cluster: cluster.name.as_str().to_string(),
                node: lb.name.clone(),
                role: Role::LoadBalancer,
            });
            self.nodes
                .run_hooks(&lb, HookStage::PreStart, opts.hook_failure_policy, cancel)
                .await?;
            let balancer = LoadBalancer::new(self.runtime.clone());
            balancer.install(cluster, &opts.lb_extra_ports, cancel).await?;
            self.nodes.start(&lb, cancel).await?;
            if opts.wait_for_ready {
                self.nodes
                    .wait_ready(&lb, since, node_timeout, opts.node_wait_logs, cancel)
                    .await?;
                // the LB readiness criterion: the configured upstream
                // reload completes without error
                balancer.sync(cluster, &opts.lb_extra_ports, cancel).await?;
            }
            self.mark_phase(cluster, &lb.name, NodePhase::Ready);
        }

        // --- post-start hooks, uniformly collected across roles ---
        self.run_post_start(cluster, opts, cancel).await?;

        self.refresh_observed_state(cluster, cancel).await;
        Ok(())
    }

    async fn prepare_network(
        &self,
        cluster: &mut Cluster,
        stack: &mut Vec<RollbackAction>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cluster.network.external {
            // adopted networks must already exist and are never deleted
            let info = self.runtime.network_get(&cluster.network.name, cancel).await?;
            cluster.network.ipam.ip_prefix = info.subnet;
            return Ok(());
        }

        let mut net_labels = labels::standard(
            cluster.name.as_str(),
            Role::Server,
            &cluster.kube_api.url(),
            &cluster.token,
        );
        net_labels.remove(labels::LABEL_ROLE);
        let (info, created) = self
            .runtime
            .network_create_if_absent(&cluster.network.name, &net_labels, cancel)
            .await?;
        cluster.network.ipam = Ipam {
            managed: true,
            ip_prefix: info.subnet,
            ips_used: Vec::new(),
        };
        if created {
            stack.push(RollbackAction::DeleteNetwork(cluster.network.name.clone()));
        }
        Ok(())
    }

    async fn prepare_image_volume(
        &self,
        cluster: &Cluster,
        stack: &mut Vec<RollbackAction>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(volume) = &cluster.image_volume else {
            return Ok(());
        };
        let mut vol_labels = labels::standard(
            cluster.name.as_str(),
            Role::Server,
            &cluster.kube_api.url(),
            &cluster.token,
        );
        vol_labels.remove(labels::LABEL_ROLE);
        self.runtime.volume_create(volume, &vol_labels, cancel).await?;
        stack.push(RollbackAction::DeleteVolume(volume.clone()));
        Ok(())
    }

    async fn prepare_registries(
        &self,
        cluster: &mut Cluster,
        opts: &ClusterCreateOpts,
        stack: &mut Vec<RollbackAction>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut referenced = Vec::new();

        // collision rule: a Use reference to the would-be creation name
        // wins, and no Create happens
        let create = opts
            .registries
            .create
            .as_ref()
            .filter(|r| !opts.registries.use_.contains(&r.name));
        if let Some(shadowed) = opts.registries.create.as_ref() {
            if create.is_none() {
                info!(
                    registry = %shadowed.name,
                    "registry is referenced via 'use'; skipping creation"
                );
            }
        }

        if let Some(registry) = create {
            let ctx = (
                cluster.name.as_str(),
                cluster.kube_api.url(),
                cluster.token.clone(),
            );
            self.registries
                .create(registry, Some((ctx.0, ctx.1.as_str(), ctx.2.as_str())), cancel)
                .await?;
            stack.push(RollbackAction::DeleteContainer(registry.name.clone()));
            referenced.push(registry.clone());
        }

        for name in &opts.registries.use_ {
            let registry = self.registries.get(name, cancel).await?;
            let joined = self
                .registries
                .connect(name, &cluster.network.name, cancel)
                .await?;
            if joined {
                stack.push(RollbackAction::DisconnectRegistry {
                    registry: name.clone(),
                    network: cluster.network.name.clone(),
                });
            }
            referenced.push(registry);
        }

        if referenced.is_empty() {
            return Ok(());
        }

        let rendered = registries_yaml(&referenced, opts.registries.config.as_deref())?;
        for node in cluster.nodes.iter_mut().filter(|n| n.role().is_k3s()) {
            node.spec.hooks.insert(0, registries_hook(rendered.clone()));
        }
        Ok(())
    }

    async fn prepull_images(&self, cluster: &Cluster, cancel: &CancellationToken) -> Result<()> {
        let images: BTreeSet<String> = cluster
            .nodes
            .iter()
            .map(|n| n.spec.image.clone())
            .collect();

        let mut tasks = JoinSet::new();
        for image in images {
            let runtime = self.runtime.clone();
            let gate = self.pull_gate.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { gate.ensure(&runtime, &image, &cancel).await });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(join_err) => {
                    first_error.get_or_insert(CoreError::Common(
                        k3c_error::CommonError::internal(join_err.to_string()),
                    ));
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Creates a batch of nodes in parallel. Every successfully created
    /// container lands on the rollback stack even when a sibling fails.
    async fn create_batch(
        &self,
        cluster: &Cluster,
        names: &[String],
        stack: &mut Vec<RollbackAction>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut tasks = JoinSet::new();
        for name in names {
            let spec = cluster
                .node(name)
                .map(|n| n.spec.clone())
                .ok_or_else(|| CoreError::Common(k3c_error::CommonError::not_found(name.clone())))?;
            let nodes = self.nodes.clone();
            let cancel = cancel.clone();
            let events = self.events.clone();
            let cluster_name = cluster.name.as_str().to_string();
            tasks.spawn(async move {
                let result = nodes.create(&spec, &cancel).await;
                if result.is_ok() {
                    events.publish(Event::NodeCreated {
                        cluster: cluster_name,
                        node: spec.name.clone(),
                        role: spec.role,
                    });
                }
                (spec.name, result)
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(_id))) => {
                    stack.push(RollbackAction::DeleteContainer(name));
                }
                Ok((name, Err(err))) => {
                    error!(node = %name, error = %err, "node create failed");
                    first_error.get_or_insert(err);
                }
                Err(join_err) => {
                    first_error.get_or_insert(CoreError::Common(
                        k3c_error::CommonError::internal(join_err.to_string()),
                    ));
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Runs pre-start hooks, starts and waits for a batch of already
    /// created nodes, all in parallel.
    async fn start_batch(
        &self,
        cluster: &mut Cluster,
        names: &[String],
        opts: &ClusterCreateOpts,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut tasks = JoinSet::new();
        for name in names {
            let spec = cluster
                .node(name)
                .map(|n| n.spec.clone())
                .ok_or_else(|| CoreError::Common(k3c_error::CommonError::not_found(name.clone())))?;
            let nodes = self.nodes.clone();
            let events = self.events.clone();
            let cancel = cancel.clone();
            let cluster_name = cluster.name.as_str().to_string();
            let policy = opts.hook_failure_policy;
            let wait = opts.wait_for_ready;
            let mirror = opts.node_wait_logs;
            tasks.spawn(async move {
                let since = Utc::now();
                let result = async {
                    nodes.run_hooks(&spec, HookStage::PreStart, policy, &cancel).await?;
                    nodes.start(&spec, &cancel).await?;
                    events.publish(Event::NodeStarted {
                        cluster: cluster_name.clone(),
                        node: spec.name.clone(),
                    });
                    if wait {
                        nodes.wait_ready(&spec, since, timeout, mirror, &cancel).await?;
                        events.publish(Event::NodeReady {
                            cluster: cluster_name.clone(),
                            node: spec.name.clone(),
                        });
                    }
                    Ok::<(), CoreError>(())
                }
                .await;
                (spec.name, result)
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => self.mark_phase(cluster, &name, NodePhase::Ready),
                Ok((name, Err(err))) => {
                    error!(node = %name, error = %err, "node start failed");
                    first_error.get_or_insert(err);
                }
                Err(join_err) => {
                    first_error.get_or_insert(CoreError::Common(
                        k3c_error::CommonError::internal(join_err.to_string()),
                    ));
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Event-driven settling probe after the last server registers: polls
    /// the API through the init server until every expected server shows
    /// `Ready`, bounded by a ceiling. Falls through with a warning on the
    /// ceiling; the cluster is usable, just not fully settled.
    async fn settle_servers(
        &self,
        cluster: &Cluster,
        init_name: &str,
        cancel: &CancellationToken,
    ) {
        let expected: Vec<&str> = cluster
            .nodes_by_role(Role::Server)
            .map(|n| n.name())
            .collect();
        let cmd = vec![
            "kubectl".to_string(),
            "get".to_string(),
            "nodes".to_string(),
            "--no-headers".to_string(),
        ];
        let started = tokio::time::Instant::now();

        loop {
            if cancel.is_cancelled() || started.elapsed() > NODE_SETTLE_CEILING {
                warn!("server settling probe hit its ceiling, continuing");
                return;
            }
            if let Ok(result) = self.runtime.exec(init_name, &cmd, cancel).await {
                if result.success() {
                    let all_ready = expected.iter().all(|name| {
                        result
                            .stdout
                            .lines()
                            .any(|l| l.contains(name) && l.contains(" Ready"))
                    });
                    if all_ready {
                        debug!("all servers registered and ready");
                        return;
                    }
                }
            }
            tokio::time::sleep(SETTLE_POLL_INTERVAL).await;
        }
    }

    /// Runs post-start hooks for every node and applies the registry
    /// hosting config map. Failures are collected; every node gets its
    /// chance to complete before the aggregate surfaces as one cluster
    /// error. Containers stay up.
    async fn run_post_start(
        &self,
        cluster: &Cluster,
        opts: &ClusterCreateOpts,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut failures: Vec<String> = Vec::new();

        for node in &cluster.nodes {
            if let Err(err) = self
                .nodes
                .run_hooks(&node.spec, HookStage::PostStart, opts.hook_failure_policy, cancel)
                .await
            {
                if err.is_cancelled() {
                    return Err(err);
                }
                failures.push(format!("{}: {err}", node.name()));
            }
        }

        let mut referenced: Vec<_> = opts
            .registries
            .create
            .clone()
            .filter(|r| !opts.registries.use_.contains(&r.name))
            .into_iter()
            .collect();
        for name in &opts.registries.use_ {
            if let Ok(registry) = self.registries.get(name, cancel).await {
                referenced.push(registry);
            }
        }
        if !referenced.is_empty() {
            if let Some(server) = cluster.init_server() {
                if let Err(err) = self
                    .registries
                    .apply_hosting_configmap(server.name(), &referenced, cancel)
                    .await
                {
                    failures.push(format!("{}: {err}", server.name()));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Hook {
                node: cluster.name.as_str().to_string(),
                description: "post-start hooks".to_string(),
                message: failures.join("; "),
            })
        }
    }

    async fn write_kubeconfig(
        &self,
        cluster: &Cluster,
        opts: &k3c_config::KubeconfigOpts,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let rendered = kubeconfig::fetch(&self.runtime, cluster, cancel).await?;
        let Some(path) = kubeconfig::default_path() else {
            warn!("no kubeconfig path could be determined, skipping update");
            return Ok(());
        };
        kubeconfig::merge_into_file(&path, &rendered, opts.switch_current_context)
    }

    /// Unwinds the rollback stack in LIFO order under a detached context.
    /// The originating error is never masked.
    async fn rollback(
        &self,
        cluster: &str,
        stack: Vec<RollbackAction>,
        original: CoreError,
    ) -> CoreError {
        self.events.publish(Event::RollbackStarted {
            cluster: cluster.to_string(),
        });
        info!(cluster, error = %original, "rolling back");

        // cancellation during rollback is ignored; cleanup runs to
        // completion on its own token with per-action bounds
        let detached = CancellationToken::new();
        let mut failures = Vec::new();
        let mut leaked = Vec::new();

        for action in stack.into_iter().rev() {
            let work = async {
                match &action {
                    RollbackAction::DeleteContainer(name) => self
                        .runtime
                        .container_delete(name, true, &detached)
                        .await
                        .map_err(CoreError::from),
                    RollbackAction::DeleteVolume(name) => self
                        .runtime
                        .volume_delete(name, &detached)
                        .await
                        .map_err(CoreError::from),
                    RollbackAction::DeleteNetwork(name) => self
                        .runtime
                        .network_delete(name, &detached)
                        .await
                        .map_err(CoreError::from),
                    RollbackAction::DisconnectRegistry { registry, network } => self
                        .runtime
                        .network_disconnect(registry, network, &detached)
                        .await
                        .map_err(CoreError::from),
                }
            };
            let result = match tokio::time::timeout(ROLLBACK_ACTION_TIMEOUT, work).await {
                Ok(result) => result,
                Err(_) => Err(CoreError::Common(k3c_error::CommonError::timeout(
                    action.describe(),
                ))),
            };
            if let Err(err) = result {
                error!(object = %action.describe(), error = %err, "rollback step failed");
                failures.push(err.to_string());
                leaked.push(action.describe());
            }
        }

        let clean = failures.is_empty();
        self.events.publish(Event::RollbackFinished {
            cluster: cluster.to_string(),
            clean,
        });

        if clean {
            CoreError::RolledBack {
                original: Box::new(original),
            }
        } else {
            CoreError::RollbackFailed {
                original: Box::new(original),
                leaked,
                failures,
            }
        }
    }

    // --- re-discovery from labels ---

    /// Rebuilds a cluster aggregate purely from labelled runtime objects.
    pub async fn get(&self, name: &str, cancel: &CancellationToken) -> Result<Cluster> {
        let containers = self
            .runtime
            .container_list(&cluster_filters(name), cancel)
            .await?;
        if containers.is_empty() {
            return Err(CoreError::Common(k3c_error::CommonError::not_found(
                format!("cluster {name}"),
            )));
        }
        self.cluster_from_containers(name, containers, cancel).await
    }

    /// Lists all clusters known to the runtime.
    pub async fn list(&self, cancel: &CancellationToken) -> Result<Vec<Cluster>> {
        let filters = vec![(labels::LABEL_APP.to_string(), labels::APP_NAME.to_string())];
        let containers = self.runtime.container_list(&filters, cancel).await?;

        let mut names = BTreeSet::new();
        for container in &containers {
            if let Ok(cluster) = labels::cluster_of(&container.name, &container.labels) {
                names.insert(cluster.to_string());
            }
        }

        let mut clusters = Vec::new();
        for name in names {
            clusters.push(self.get(&name, cancel).await?);
        }
        Ok(clusters)
    }

    async fn cluster_from_containers(
        &self,
        name: &str,
        containers: Vec<ContainerInfo>,
        cancel: &CancellationToken,
    ) -> Result<Cluster> {
        let cluster_name = ClusterName::new(name)?;

        let reference = &containers[0];
        let token = reference
            .labels
            .get(labels::LABEL_CLUSTER_TOKEN)
            .cloned()
            .ok_or_else(|| k3c_types::TypesError::MissingLabel {
                container: reference.name.clone(),
                label: labels::LABEL_CLUSTER_TOKEN.to_string(),
            })?;
        let api_url = reference
            .labels
            .get(labels::LABEL_CLUSTER_URL)
            .cloned()
            .ok_or_else(|| k3c_types::TypesError::MissingLabel {
                container: reference.name.clone(),
                label: labels::LABEL_CLUSTER_URL.to_string(),
            })?;
        let kube_api = parse_api_url(&api_url);

        // the managed network carries the cluster labels; fall back to the
        // first attachment for adopted networks
        let networks = self
            .runtime
            .network_list(&cluster_filters(name), cancel)
            .await?;
        let network = match networks.into_iter().next() {
            Some(info) => ClusterNetwork {
                name: info.name,
                external: false,
                ipam: Ipam {
                    managed: true,
                    ip_prefix: info.subnet,
                    ips_used: info
                        .containers
                        .iter()
                        .filter_map(|c| c.ip.clone())
                        .collect(),
                },
            },
            None => ClusterNetwork {
                name: containers
                    .iter()
                    .find_map(|c| c.networks.first().map(|n| n.network.clone()))
                    .unwrap_or_default(),
                external: true,
                ipam: Ipam::default(),
            },
        };

        let mut init_node = None;
        let mut nodes = Vec::new();
        for container in &containers {
            let role = labels::role_of(&container.name, &container.labels)?;
            if container
                .labels
                .get(labels::LABEL_SERVER_INIT)
                .map(String::as_str)
                == Some("true")
            {
                init_node = Some(container.name.clone());
            }

            let mut spec = NodeSpec::new(container.name.clone(), role, container.image.clone());
            spec.cmd = container.cmd.clone();
            spec.env = container.env.clone();
            spec.volumes = container.mounts.clone();
            spec.networks = container
                .networks
                .iter()
                .map(|n| n.network.clone())
                .collect();
            spec.runtime_labels = container.labels.clone();

            nodes.push(Node {
                spec,
                runtime_id: Some(container.id.clone()),
                status: NodeStatus {
                    phase: Some(if container.running {
                        NodePhase::Running
                    } else {
                        NodePhase::Stopped
                    }),
                    running: container.running,
                    state: container.state.clone(),
                    started_at: container.started_at,
                    ip: container.ip_on(&network.name).map(ToString::to_string),
                },
            });
        }
        nodes.sort_by_key(|n| (role_rank(n.role()), n.name().to_string()));

        let volumes = self
            .runtime
            .volume_list(&cluster_filters(name), cancel)
            .await?;

        Ok(Cluster {
            name: cluster_name,
            token,
            network,
            nodes,
            init_node,
            kube_api,
            image_volume: volumes.into_iter().next().map(|v| v.name),
        })
    }

    // --- further lifecycle operations ---

    /// Deletes a cluster and everything it owns. Adopted networks and
    /// `use`-referenced registries survive.
    pub async fn delete(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let cluster = self.get(name, cancel).await?;

        for node in &cluster.nodes {
            self.nodes.delete(node.name(), cancel).await?;
            self.events.publish(Event::NodeDeleted {
                cluster: name.to_string(),
                node: node.name().to_string(),
            });
        }

        for volume in self
            .runtime
            .volume_list(&cluster_filters(name), cancel)
            .await?
        {
            self.runtime.volume_delete(&volume.name, cancel).await?;
        }

        for network in self
            .runtime
            .network_list(&cluster_filters(name), cancel)
            .await?
        {
            // detach whatever is still connected (use-referenced
            // registries), then drop the network
            let info = self.runtime.network_get(&network.name, cancel).await?;
            for member in info.containers {
                let _ = self
                    .runtime
                    .network_disconnect(&member.name, &network.name, cancel)
                    .await;
            }
            self.runtime.network_delete(&network.name, cancel).await?;
        }

        self.events.publish(Event::ClusterDeleted {
            cluster: name.to_string(),
        });
        info!(cluster = name, "cluster deleted");
        Ok(())
    }

    /// Stops a cluster's containers without removing anything.
    pub async fn stop(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let cluster = self.get(name, cancel).await?;
        // agents first, then LB, servers last, so nothing keeps retrying a
        // vanished control plane
        let mut ordered = cluster.nodes.clone();
        ordered.sort_by_key(|n| match n.role() {
            Role::Agent | Role::Tools => 0,
            Role::LoadBalancer | Role::Registry => 1,
            Role::Server => 2,
        });
        for node in &ordered {
            if node.status.running {
                self.nodes.stop(node.name(), cancel).await?;
            }
        }
        info!(cluster = name, "cluster stopped");
        Ok(())
    }

    /// Starts a stopped cluster in dependency order.
    pub async fn start(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let cluster = self.get(name, cancel).await?;
        let init_name = cluster.init_server().map(|n| n.name().to_string());

        let ordered: Vec<&Node> = {
            let mut nodes: Vec<&Node> = cluster.nodes.iter().collect();
            nodes.sort_by_key(|n| {
                if Some(n.name().to_string()) == init_name {
                    0
                } else {
                    role_rank(n.role())
                }
            });
            nodes
        };

        for node in ordered {
            if node.status.running {
                continue;
            }
            let since = Utc::now();
            self.nodes.start(&node.spec, cancel).await?;
            self.nodes
                .wait_ready(&node.spec, since, DEFAULT_NODE_TIMEOUT, false, cancel)
                .await?;
        }
        info!(cluster = name, "cluster started");
        Ok(())
    }

    /// Grows a cluster by one node of the given role, then resynchronizes
    /// the LB with the new membership.
    ///
    /// The new node is modeled on an existing node of the same role (any
    /// k3s node when that role has no member yet): its inspected command,
    /// environment, mounts and networks are cloned, only identity, join
    /// URL and labels are substituted. Registry mirrors carry over by
    /// copying the template's `registries.yaml` into the new node.
    pub async fn add_node(
        &self,
        cluster_name: &str,
        role: Role,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if !matches!(role, Role::Server | Role::Agent) {
            return Err(CoreError::Common(k3c_error::CommonError::invalid_state(
                format!("cannot add a node of role {role}"),
            )));
        }
        let mut cluster = self.get(cluster_name, cancel).await?;

        let init_name = cluster
            .init_server()
            .map(|n| n.name().to_string())
            .ok_or_else(|| {
                CoreError::Common(k3c_error::CommonError::invalid_state(format!(
                    "cluster {cluster_name} has no server node"
                )))
            })?;
        let (template_spec, template_name) = {
            let template = cluster
                .nodes_by_role(role)
                .last()
                .or_else(|| cluster.nodes.iter().find(|n| n.role().is_k3s()))
                .ok_or_else(|| {
                    CoreError::Common(k3c_error::CommonError::invalid_state(format!(
                        "cluster {cluster_name} has no k3s node to model the new one on"
                    )))
                })?;
            (template.spec.clone(), template.name().to_string())
        };

        let index = cluster.nodes_by_role(role).count();
        let name = node_name(cluster_name, role, index);

        let mut spec = template_spec;
        spec.name = name.clone();
        spec.role = role;
        // the inspected command carries the role verb followed by the k3s
        // flags; only the init marker must not be inherited
        spec.args = spec
            .cmd
            .iter()
            .skip(1)
            .filter(|arg| *arg != "--cluster-init")
            .cloned()
            .collect();
        spec.cmd = vec![match role {
            Role::Server => "server".to_string(),
            _ => "agent".to_string(),
        }];
        // host port bindings cannot be claimed twice
        spec.ports.clear();
        spec.hooks.clear();
        spec.env
            .insert("K3S_TOKEN".to_string(), cluster.token.clone());
        spec.env.insert(
            "K3S_URL".to_string(),
            format!("https://{init_name}:6443"),
        );
        match role {
            Role::Server => {
                spec.env.insert(
                    "K3S_KUBECONFIG_OUTPUT".to_string(),
                    k3c_config::KUBECONFIG_OUTPUT.to_string(),
                );
            }
            _ => {
                spec.env.remove("K3S_KUBECONFIG_OUTPUT");
            }
        }
        spec.runtime_labels = labels::standard(
            cluster_name,
            role,
            &cluster.kube_api.url(),
            &cluster.token,
        );

        // the template's registries.yaml makes the new node resolve the
        // same mirrors the rest of the cluster sees
        match self
            .runtime
            .copy_from_container(&template_name, REGISTRIES_YAML_PATH, cancel)
            .await
        {
            Ok(content) => spec.hooks.push(LifecycleHook {
                stage: HookStage::PreStart,
                action: HookAction::WriteFile {
                    dest: REGISTRIES_YAML_PATH.to_string(),
                    content,
                    mode: 0o644,
                    description: "inject registries.yaml".to_string(),
                },
            }),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        let since = Utc::now();
        self.nodes.create(&spec, cancel).await?;
        self.nodes
            .run_hooks(&spec, HookStage::PreStart, HookFailurePolicy::default(), cancel)
            .await?;
        self.nodes.start(&spec, cancel).await?;
        if let Err(err) = self
            .nodes
            .wait_ready(&spec, since, DEFAULT_NODE_TIMEOUT, false, cancel)
            .await
        {
            // a half-joined node must not linger
            let _ = self.nodes.delete(&name, &CancellationToken::new()).await;
            return Err(err);
        }

        cluster.nodes.push(Node::planned(spec));
        cluster
            .nodes
            .sort_by_key(|n| (role_rank(n.role()), n.name().to_string()));
        self.resync_loadbalancer(&cluster, cancel).await?;

        info!(cluster = cluster_name, node = %name, "node added");
        Ok(name)
    }

    /// Removes one node and resynchronizes the LB.
    pub async fn delete_node(&self, node: &str, cancel: &CancellationToken) -> Result<()> {
        let info = self.runtime.container_inspect(node, cancel).await?;
        let cluster_name = labels::cluster_of(&info.name, &info.labels)?.to_string();

        self.nodes.delete(node, cancel).await?;
        self.events.publish(Event::NodeDeleted {
            cluster: cluster_name.clone(),
            node: node.to_string(),
        });

        let cluster = self.get(&cluster_name, cancel).await?;
        self.resync_loadbalancer(&cluster, cancel).await?;
        Ok(())
    }

    /// Imports a tar of images into every k3s node of a cluster through an
    /// ephemeral tools helper.
    pub async fn import_images(
        &self,
        cluster_name: &str,
        tar: &std::path::Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let cluster = self.get(cluster_name, cancel).await?;
        let tools = ToolsNode::ensure(
            self.runtime.clone(),
            self.nodes.clone(),
            &cluster,
            &self.env.tools_helper_image(),
            cancel,
        )
        .await?;
        let result = tools.import_images(&cluster, tar, cancel).await;
        let _ = tools.remove(&CancellationToken::new()).await;
        result
    }

    /// Re-synthesizes and delivers the LB config for current membership.
    /// All membership mutations funnel through here.
    async fn resync_loadbalancer(
        &self,
        cluster: &Cluster,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(lb) = cluster.loadbalancer() else {
            return Ok(());
        };

        // the extra port map is persisted on the LB container's labels
        let extra_ports: Vec<PortMapping> = lb
            .spec
            .runtime_labels
            .get(labels::LABEL_LB_PORTS)
            .map(|raw| {
                raw.split(',')
                    .filter(|s| !s.is_empty())
                    .filter_map(|s| s.parse().ok())
                    .collect()
            })
            .unwrap_or_default();

        let balancer = LoadBalancer::new(self.runtime.clone());
        if balancer.sync(cluster, &extra_ports, cancel).await? {
            self.events.publish(Event::LbConfigUpdated {
                cluster: cluster.name.as_str().to_string(),
            });
        }
        Ok(())
    }

    fn mark_phase(&self, cluster: &mut Cluster, node: &str, phase: NodePhase) {
        if let Some(node) = cluster.node_mut(node) {
            node.status.phase = Some(phase);
        }
    }

    /// Refreshes observed node state (runtime IDs, addresses) after a
    /// successful bring-up. Best effort; failures only log.
    async fn refresh_observed_state(&self, cluster: &mut Cluster, cancel: &CancellationToken) {
        let network = cluster.network.name.clone();
        for node in &mut cluster.nodes {
            match self.runtime.container_inspect(node.name(), cancel).await {
                Ok(info) => {
                    node.runtime_id = Some(info.id.clone());
                    node.status.running = info.running;
                    node.status.state = info.state.clone();
                    node.status.started_at = info.started_at;
                    node.status.ip = info.ip_on(&network).map(ToString::to_string);
                }
                Err(err) => debug!(node = node.name(), error = %err, "state refresh failed"),
            }
        }
    }
}

fn role_rank(role: Role) -> u8 {
    match role {
        Role::Server => 0,
        Role::Agent => 1,
        Role::LoadBalancer => 2,
        Role::Registry => 3,
        Role::Tools => 4,
    }
}

/// Parses `https://host:port` from the cluster URL label, tolerating
/// malformed values by falling back to defaults.
fn parse_api_url(url: &str) -> KubeApi {
    let trimmed = url.trim_start_matches("https://");
    let (host, port) = match trimmed.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(6443)),
        None => (trimmed.to_string(), 6443),
    };
    KubeApi {
        host: (host != "0.0.0.0").then_some(host),
        host_ip: "0.0.0.0".to_string(),
        host_port: port,
        container_port: 6443,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_api_url() {
        let api = parse_api_url("https://0.0.0.0:6443");
        assert_eq!(api.host, None);
        assert_eq!(api.host_port, 6443);

        let api = parse_api_url("https://k3c.example.com:6550");
        assert_eq!(api.host.as_deref(), Some("k3c.example.com"));
        assert_eq!(api.host_port, 6550);
    }

    #[test]
    fn test_rollback_action_describe() {
        assert_eq!(
            RollbackAction::DeleteContainer("k3c-x-server-0".into()).describe(),
            "container/k3c-x-server-0"
        );
        assert_eq!(
            RollbackAction::DisconnectRegistry {
                registry: "k3c-reg".into(),
                network: "k3c-x".into()
            }
            .describe(),
            "registry/k3c-reg@k3c-x"
        );
    }
}
