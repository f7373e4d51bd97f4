//! Per-node lifecycle management.
//!
//! Executes the node state machine: create, pre-start hooks, start,
//! role-specific readiness, post-start hooks, stop, delete. One manager
//! instance drives one node at a time; distinct nodes progress in parallel
//! under the orchestrator.

use std::sync::OnceLock;
use std::time::Duration;

use tokio::time::Instant;

use chrono::{DateTime, Utc};
use k3c_config::{merge_values, HookFailurePolicy};
use k3c_runtime::DynRuntime;
use k3c_types::{HookAction, HookStage, NodeSpec, Role};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::event::{Event, EventBus};

/// Poll interval while waiting for readiness.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Grace period for container stop.
pub const STOP_GRACE: Duration = Duration::from_secs(30);

/// Readiness log pattern for a role, if readiness is log-driven.
fn readiness_pattern(role: Role) -> Option<&'static Regex> {
    static SERVER: OnceLock<Regex> = OnceLock::new();
    static AGENT: OnceLock<Regex> = OnceLock::new();
    static LB: OnceLock<Regex> = OnceLock::new();
    static REGISTRY: OnceLock<Regex> = OnceLock::new();

    match role {
        Role::Server => Some(SERVER.get_or_init(|| {
            Regex::new(r"k3s is up and running").expect("static regex")
        })),
        Role::Agent => Some(AGENT.get_or_init(|| {
            Regex::new(r"Successfully registered node").expect("static regex")
        })),
        Role::LoadBalancer => Some(LB.get_or_init(|| {
            Regex::new(r"start worker process").expect("static regex")
        })),
        Role::Registry => Some(REGISTRY.get_or_init(|| {
            Regex::new(r"listening on .*:5000").expect("static regex")
        })),
        Role::Tools => None,
    }
}

/// Drives a single node through its lifecycle.
#[derive(Clone)]
pub struct NodeManager {
    runtime: DynRuntime,
    events: EventBus,
}

impl NodeManager {
    /// Creates a manager bound to a runtime and event bus.
    #[must_use]
    pub fn new(runtime: DynRuntime, events: EventBus) -> Self {
        Self { runtime, events }
    }

    /// Creates the node's container. Returns the runtime ID.
    ///
    /// On failure any partially created container is removed, so a failed
    /// create leaves no reservation behind.
    pub async fn create(&self, spec: &NodeSpec, cancel: &CancellationToken) -> Result<String> {
        match self.runtime.container_create(spec, cancel).await {
            Ok(id) => {
                debug!(node = %spec.name, role = %spec.role, "node created");
                Ok(id)
            }
            Err(err) => {
                // the create may have claimed the name before failing a
                // later step (extra network attach); release it
                let _ = self
                    .runtime
                    .container_delete(&spec.name, true, &CancellationToken::new())
                    .await;
                Err(err.into())
            }
        }
    }

    /// Runs the node's hooks for one stage, strictly in declared order.
    ///
    /// Pre-start hook failures follow `policy`; post-start failures always
    /// surface as errors (the orchestrator aggregates them per cluster).
    pub async fn run_hooks(
        &self,
        spec: &NodeSpec,
        stage: HookStage,
        policy: HookFailurePolicy,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for hook in spec.hooks_for(stage) {
            let description = hook.action.description().to_string();
            debug!(node = %spec.name, ?stage, %description, "running hook");

            let outcome = self.run_hook_action(&spec.name, &hook.action, cancel).await;
            let Err(err) = outcome else { continue };

            if err.is_cancelled() {
                return Err(err);
            }
            let lenient = stage == HookStage::PreStart
                && policy == HookFailurePolicy::WarnAndContinue;
            if lenient {
                warn!(node = %spec.name, %description, error = %err, "hook failed, continuing");
                self.events.publish(Event::HookWarning {
                    node: spec.name.clone(),
                    description,
                    message: err.to_string(),
                });
            } else {
                return Err(CoreError::Hook {
                    node: spec.name.clone(),
                    description,
                    message: err.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn run_hook_action(
        &self,
        node: &str,
        action: &HookAction,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match action {
            HookAction::WriteFile {
                dest,
                content,
                mode,
                ..
            } => {
                self.runtime
                    .copy_to_container(node, dest, content, *mode, cancel)
                    .await?;
            }
            HookAction::MergeYaml { dest, content, .. } => {
                let existing = match self.runtime.copy_from_container(node, dest, cancel).await {
                    Ok(bytes) => serde_yaml::from_slice(&bytes).unwrap_or(serde_yaml::Value::Null),
                    Err(err) if err.is_not_found() => serde_yaml::Value::Null,
                    Err(err) => return Err(err.into()),
                };
                let overlay: serde_yaml::Value = serde_yaml::from_str(content)
                    .map_err(|e| CoreError::Common(k3c_error::CommonError::config(e.to_string())))?;
                let merged = merge_values(existing, overlay);
                let rendered = serde_yaml::to_string(&merged)
                    .map_err(|e| CoreError::Common(k3c_error::CommonError::internal(e.to_string())))?;
                self.runtime
                    .copy_to_container(node, dest, rendered.as_bytes(), 0o644, cancel)
                    .await?;
            }
        }
        Ok(())
    }

    /// Starts the node's container.
    pub async fn start(&self, spec: &NodeSpec, cancel: &CancellationToken) -> Result<()> {
        self.runtime.container_start(&spec.name, cancel).await?;
        info!(node = %spec.name, "node started");
        Ok(())
    }

    /// Waits for the node's role-specific readiness signal.
    ///
    /// Bounded by `timeout`; on expiry the caller gets a
    /// [`CoreError::ReadinessTimeout`] and the orchestrator rolls back.
    pub async fn wait_ready(
        &self,
        spec: &NodeSpec,
        since: DateTime<Utc>,
        timeout: Duration,
        mirror_logs: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(pattern) = readiness_pattern(spec.role) else {
            return Ok(());
        };
        let started = Instant::now();
        let mut seen_bytes = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Common(k3c_error::CommonError::cancelled(
                    format!("waiting for node {}", spec.name),
                )));
            }
            if started.elapsed() > timeout {
                return Err(CoreError::ReadinessTimeout {
                    node: spec.name.clone(),
                    role: spec.role,
                    waited: started.elapsed(),
                });
            }

            let logs = self
                .runtime
                .read_logs(&spec.name, Some(since), cancel)
                .await?;
            if mirror_logs && logs.len() > seen_bytes {
                for line in logs[seen_bytes..].lines() {
                    debug!(node = %spec.name, "{line}");
                }
                seen_bytes = logs.len();
            }

            if pattern.is_match(&logs) {
                debug!(node = %spec.name, "readiness log pattern matched");
                return Ok(());
            }

            // servers also accept an API probe on the loopback port, which
            // can fire before the log line is flushed
            if spec.role == Role::Server && self.server_probe(&spec.name, cancel).await {
                debug!(node = %spec.name, "readiness probe succeeded");
                return Ok(());
            }

            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn server_probe(&self, node: &str, cancel: &CancellationToken) -> bool {
        let cmd = vec![
            "kubectl".to_string(),
            "get".to_string(),
            "--raw=/readyz".to_string(),
        ];
        match self.runtime.exec(node, &cmd, cancel).await {
            Ok(result) => result.success() && result.stdout.contains("ok"),
            Err(_) => false,
        }
    }

    /// Stops the node with a grace period.
    pub async fn stop(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        self.runtime.container_stop(name, STOP_GRACE, cancel).await?;
        info!(node = name, "node stopped");
        Ok(())
    }

    /// Deletes the node: graceful stop, remove, release its address.
    ///
    /// Removal from the cluster's LB configuration is the orchestrator's
    /// job, since it owns the resync.
    pub async fn delete(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let observed = self.runtime.container_inspect(name, cancel).await;

        if let Ok(info) = &observed {
            if info.running {
                if let Err(err) = self.runtime.container_stop(name, STOP_GRACE, cancel).await {
                    warn!(node = name, error = %err, "graceful stop failed, removing anyway");
                }
            }
        }

        self.runtime.container_delete(name, true, cancel).await?;

        if let Ok(info) = observed {
            if let Some(attachment) = info.networks.first() {
                if let Some(ip) = attachment.ip.as_deref().and_then(|ip| ip.parse().ok()) {
                    let _ = self
                        .runtime
                        .release_ip(&attachment.network, ip, cancel)
                        .await;
                }
            }
        }

        info!(node = name, "node deleted");
        Ok(())
    }
}
