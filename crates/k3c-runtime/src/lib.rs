//! Runtime abstraction for k3c.
//!
//! A single narrow interface reifies container, network, volume, image and
//! exec operations. Labelled containers on the runtime are the only durable
//! state: the orchestrator never keeps an in-memory registry of objects
//! between operations, and every query goes through label filters here.
//!
//! One concrete adapter, [`DockerCli`], maps the interface onto the local
//! Docker daemon through its CLI. The trait is designed so further adapters
//! remain possible; only this one is provided.

pub mod args;
mod cli;
mod docker;
mod error;
mod info;
mod ipam;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k3c_types::NodeSpec;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use docker::DockerCli;
pub use error::{Result, RuntimeError};
pub use info::{
    ContainerInfo, ExecResult, NetworkAttachment, NetworkInfo, NetworkMember, RuntimeHostInfo,
    RuntimeKind, VolumeInfo,
};

/// Shared runtime trait object.
pub type DynRuntime = Arc<dyn Runtime>;

/// Label filter list, `key=value` pairs ANDed together.
pub type LabelFilters = [(String, String)];

/// The capability surface of a container runtime.
///
/// Contracts:
/// - Every object created on behalf of k3c carries the standard label set
///   and the runtime stores and returns those labels verbatim.
/// - All blocking operations accept a cancellation token and propagate
///   cancellation to the underlying daemon call.
/// - [`Runtime::allocate_ip`] is deterministic given the network's current
///   address usage; allocations for one network are serialized.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Short identifier of the adapter, for logs.
    fn id(&self) -> &'static str;

    // --- containers ---

    /// Creates a container from a node spec. Returns the runtime ID.
    async fn container_create(&self, spec: &NodeSpec, cancel: &CancellationToken)
        -> Result<String>;

    /// Starts a created container.
    async fn container_start(&self, name: &str, cancel: &CancellationToken) -> Result<()>;

    /// Stops a running container with a grace period.
    async fn container_stop(
        &self,
        name: &str,
        grace: Duration,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Removes a container.
    async fn container_delete(
        &self,
        name: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Full inspection of one container by name or ID.
    async fn container_inspect(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<ContainerInfo>;

    /// Lists containers matching all given label filters.
    async fn container_list(
        &self,
        filters: &LabelFilters,
        cancel: &CancellationToken,
    ) -> Result<Vec<ContainerInfo>>;

    /// Renames a container.
    async fn container_rename(
        &self,
        name: &str,
        new_name: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Writes `content` to `dest` inside the container with the given mode.
    /// Works on created (not yet started) containers.
    async fn copy_to_container(
        &self,
        name: &str,
        dest: &str,
        content: &[u8],
        mode: u32,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Reads a file from inside the container.
    async fn copy_from_container(
        &self,
        name: &str,
        src: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>>;

    /// Runs a command inside a running container and collects its output.
    async fn exec(
        &self,
        name: &str,
        cmd: &[String],
        cancel: &CancellationToken,
    ) -> Result<ExecResult>;

    /// Runs a command inside a running container, streaming stdout lines.
    async fn exec_streaming(
        &self,
        name: &str,
        cmd: &[String],
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<String>>;

    /// Returns the container's log output, optionally since a timestamp.
    async fn read_logs(
        &self,
        name: &str,
        since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<String>;

    // --- networks ---

    /// Creates a network unless one with this name exists. Returns the
    /// network and whether it was created by this call.
    async fn network_create_if_absent(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<(NetworkInfo, bool)>;

    /// Connects a container to a network, optionally with a fixed address.
    async fn network_connect(
        &self,
        container: &str,
        network: &str,
        ip: Option<IpAddr>,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Disconnects a container from a network.
    async fn network_disconnect(
        &self,
        container: &str,
        network: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Deletes a network.
    async fn network_delete(&self, name: &str, cancel: &CancellationToken) -> Result<()>;

    /// Inspects a network by name.
    async fn network_get(&self, name: &str, cancel: &CancellationToken) -> Result<NetworkInfo>;

    /// Lists networks matching all given label filters.
    async fn network_list(
        &self,
        filters: &LabelFilters,
        cancel: &CancellationToken,
    ) -> Result<Vec<NetworkInfo>>;

    /// Reserves the next free address on a managed network.
    async fn allocate_ip(&self, network: &str, cancel: &CancellationToken) -> Result<IpAddr>;

    /// Returns a previously allocated address to the pool.
    async fn release_ip(
        &self,
        network: &str,
        ip: IpAddr,
        cancel: &CancellationToken,
    ) -> Result<()>;

    // --- volumes ---

    /// Creates a named volume.
    async fn volume_create(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Deletes a named volume.
    async fn volume_delete(&self, name: &str, cancel: &CancellationToken) -> Result<()>;

    /// Inspects a volume by name.
    async fn volume_get(&self, name: &str, cancel: &CancellationToken) -> Result<VolumeInfo>;

    /// Lists volumes matching all given label filters.
    async fn volume_list(
        &self,
        filters: &LabelFilters,
        cancel: &CancellationToken,
    ) -> Result<Vec<VolumeInfo>>;

    // --- images ---

    /// Returns true when the image is present locally.
    async fn image_exists(&self, reference: &str, cancel: &CancellationToken) -> Result<bool>;

    /// Pulls an image from its registry.
    async fn image_pull(&self, reference: &str, cancel: &CancellationToken) -> Result<()>;

    /// Saves images to a tar archive on the host.
    async fn image_save(
        &self,
        references: &[String],
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Loads images from a tar archive on the host.
    async fn image_load(&self, tar: &Path, cancel: &CancellationToken) -> Result<()>;

    // --- host ---

    /// Facts about the daemon and its host.
    async fn host_info(&self, cancel: &CancellationToken) -> Result<RuntimeHostInfo>;

    /// Gateway address of a network, reachable from its containers.
    async fn host_gateway_ip(
        &self,
        network: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<IpAddr>>;
}
