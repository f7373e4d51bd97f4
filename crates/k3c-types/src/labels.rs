//! Container label schema.
//!
//! Docker labels are the only persistent source of truth: every object k3c
//! creates carries this label set, and every inverse lookup (cluster to
//! nodes, registry to referencing clusters) is a label query. Reads are
//! defensive; a partially tagged container yields an error, never a panic.

use std::collections::BTreeMap;

use crate::error::TypesError;
use crate::Role;

/// Label carried by every k3c-managed object.
pub const LABEL_APP: &str = "app";
/// Value of [`LABEL_APP`].
pub const APP_NAME: &str = "k3c";
/// Owning cluster name.
pub const LABEL_CLUSTER: &str = "k3c.cluster";
/// Node role within the cluster.
pub const LABEL_ROLE: &str = "k3c.role";
/// Kube API URL of the owning cluster.
pub const LABEL_CLUSTER_URL: &str = "k3c.cluster.url";
/// Join token of the owning cluster.
pub const LABEL_CLUSTER_TOKEN: &str = "k3c.cluster.token";
/// Registry hostname, set on registry containers only.
pub const LABEL_REGISTRY_HOST: &str = "k3c.registry.host";
/// Marks the init server in an HA topology.
pub const LABEL_SERVER_INIT: &str = "k3c.server.init";
/// Extra LB port forwards, comma-joined, set on the LB container only.
pub const LABEL_LB_PORTS: &str = "k3c.lb.ports";
/// k3c version that created the object.
pub const LABEL_VERSION: &str = "k3c.version";

/// Builds the mandatory label set for an object owned by a cluster.
#[must_use]
pub fn standard(cluster: &str, role: Role, api_url: &str, token: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_APP.to_string(), APP_NAME.to_string());
    labels.insert(LABEL_CLUSTER.to_string(), cluster.to_string());
    labels.insert(LABEL_ROLE.to_string(), role.as_str().to_string());
    labels.insert(LABEL_CLUSTER_URL.to_string(), api_url.to_string());
    labels.insert(LABEL_CLUSTER_TOKEN.to_string(), token.to_string());
    labels.insert(
        LABEL_VERSION.to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
    labels
}

/// Reads the owning cluster name from a label set.
///
/// # Errors
///
/// Returns [`TypesError::MissingLabel`] when the label is absent.
pub fn cluster_of<'a>(
    container: &str,
    labels: &'a BTreeMap<String, String>,
) -> Result<&'a str, TypesError> {
    labels
        .get(LABEL_CLUSTER)
        .map(String::as_str)
        .ok_or_else(|| TypesError::MissingLabel {
            container: container.to_string(),
            label: LABEL_CLUSTER.to_string(),
        })
}

/// Reads the node role from a label set.
///
/// # Errors
///
/// Returns an error when the label is absent or names an unknown role.
pub fn role_of(container: &str, labels: &BTreeMap<String, String>) -> Result<Role, TypesError> {
    let raw = labels
        .get(LABEL_ROLE)
        .ok_or_else(|| TypesError::MissingLabel {
            container: container.to_string(),
            label: LABEL_ROLE.to_string(),
        })?;
    raw.parse()
        .map_err(|_| TypesError::MalformedLabel {
            container: container.to_string(),
            label: LABEL_ROLE.to_string(),
            value: raw.clone(),
        })
}

/// Returns true when the label set marks a k3c-managed object.
#[must_use]
pub fn is_managed(labels: &BTreeMap<String, String>) -> bool {
    labels.get(LABEL_APP).map(String::as_str) == Some(APP_NAME)
}
