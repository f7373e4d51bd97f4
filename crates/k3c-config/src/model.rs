//! Engine-shaped configuration: the transform output.

use std::time::Duration;

use k3c_types::{Cluster, PortMapping, Registry};
use serde::{Deserialize, Serialize};

/// How a failing pre-start hook is treated.
///
/// The default is to log a warning and continue, matching long-standing
/// behavior; strict mode elevates hook failures to fatal errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookFailurePolicy {
    #[default]
    WarnAndContinue,
    Strict,
}

/// Registry wiring resolved for the engine.
#[derive(Debug, Clone, Default)]
pub struct RegistriesOpts {
    /// Registry to create with the cluster, fully resolved.
    pub create: Option<Registry>,
    /// Container names of existing registries to reference.
    pub use_: Vec<String>,
    /// User-supplied registries.yaml merged over the generated one.
    pub config: Option<String>,
}

/// Behavior switches for a cluster create run.
#[derive(Debug, Clone)]
pub struct ClusterCreateOpts {
    /// Wait for readiness before returning.
    pub wait_for_ready: bool,
    /// Overall timeout for the run.
    pub timeout: Option<Duration>,
    pub disable_load_balancer: bool,
    pub disable_image_volume: bool,
    /// Mirror node logs while waiting for readiness.
    pub node_wait_logs: bool,
    pub hook_failure_policy: HookFailurePolicy,
    pub registries: RegistriesOpts,
    /// User-defined ports published on the LB and proxied to k3s nodes.
    pub lb_extra_ports: Vec<PortMapping>,
}

impl Default for ClusterCreateOpts {
    fn default() -> Self {
        Self {
            wait_for_ready: true,
            timeout: None,
            disable_load_balancer: false,
            disable_image_volume: false,
            node_wait_logs: false,
            hook_failure_policy: HookFailurePolicy::default(),
            registries: RegistriesOpts::default(),
            lb_extra_ports: Vec::new(),
        }
    }
}

/// Kubeconfig handling after a successful create.
#[derive(Debug, Clone)]
pub struct KubeconfigOpts {
    pub update_default: bool,
    pub switch_current_context: bool,
}

impl Default for KubeconfigOpts {
    fn default() -> Self {
        Self {
            update_default: true,
            switch_current_context: true,
        }
    }
}

/// Everything the orchestrator needs for one cluster operation.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub cluster: Cluster,
    pub create_opts: ClusterCreateOpts,
    pub kubeconfig_opts: KubeconfigOpts,
}
