//! Docker CLI argument builders.
//!
//! Pure functions, no I/O. Keeping the full command lines out of the
//! adapter makes them unit-testable and keeps the subprocess plumbing in
//! one place.

use std::collections::BTreeMap;

use k3c_types::NodeSpec;

/// Arguments for `docker create` from a node spec.
///
/// The spec's first network is the one the container is created on; further
/// networks are attached after creation, so their order is preserved.
#[must_use]
pub fn create_args(spec: &NodeSpec) -> Vec<String> {
    let mut args: Vec<String> = vec!["create".into(), "--name".into(), spec.name.clone()];

    if let Some(network) = spec.networks.first() {
        args.push("--network".into());
        args.push(network.clone());
    }

    for (key, value) in &spec.runtime_labels {
        args.push("--label".into());
        args.push(format!("{key}={value}"));
    }

    for (key, value) in &spec.env {
        args.push("--env".into());
        args.push(format!("{key}={value}"));
    }

    for volume in &spec.volumes {
        args.push("--volume".into());
        args.push(volume.to_string());
    }

    for port in &spec.ports {
        args.push("--publish".into());
        args.push(port.to_string());
    }

    for host in &spec.extra_hosts {
        args.push("--add-host".into());
        args.push(host.clone());
    }

    if let Some(limit) = &spec.memory_limit {
        args.push("--memory".into());
        args.push(limit.clone());
    }

    if spec.role.is_k3s() {
        // k3s needs a privileged container with its own cgroup namespace.
        args.push("--privileged".into());
        args.push("--tmpfs".into());
        args.push("/run".into());
        args.push("--tmpfs".into());
        args.push("/var/run".into());
    }

    args.push("--restart".into());
    args.push("unless-stopped".into());

    args.push(spec.image.clone());
    args.extend(spec.cmd.iter().cloned());
    args.extend(spec.args.iter().cloned());

    args
}

/// Arguments for `docker start`.
#[must_use]
pub fn start_args(name: &str) -> Vec<String> {
    vec!["start".into(), name.into()]
}

/// Arguments for `docker stop` with a grace period.
#[must_use]
pub fn stop_args(name: &str, grace_secs: u64) -> Vec<String> {
    vec![
        "stop".into(),
        "--time".into(),
        grace_secs.to_string(),
        name.into(),
    ]
}

/// Arguments for `docker rm`.
#[must_use]
pub fn rm_args(name: &str, force: bool) -> Vec<String> {
    let mut args = vec!["rm".to_string()];
    if force {
        args.push("--force".into());
    }
    args.push(name.into());
    args
}

/// Arguments for `docker rename`.
#[must_use]
pub fn rename_args(name: &str, new_name: &str) -> Vec<String> {
    vec!["rename".into(), name.into(), new_name.into()]
}

/// Arguments for `docker inspect` emitting one JSON document.
#[must_use]
pub fn inspect_args(name: &str) -> Vec<String> {
    vec!["inspect".into(), name.into()]
}

/// Arguments for `docker ps` with label filters, one JSON object per line.
#[must_use]
pub fn ps_args(filters: &[(String, String)]) -> Vec<String> {
    let mut args = vec![
        "ps".to_string(),
        "--all".to_string(),
        "--no-trunc".to_string(),
    ];
    for (key, value) in filters {
        args.push("--filter".into());
        args.push(format!("label={key}={value}"));
    }
    args.push("--format".into());
    args.push("{{.Names}}".into());
    args
}

/// Arguments for `docker cp` into a container.
#[must_use]
pub fn cp_to_args(src: &str, container: &str, dest: &str) -> Vec<String> {
    vec!["cp".into(), src.into(), format!("{container}:{dest}")]
}

/// Arguments for `docker cp` out of a container.
#[must_use]
pub fn cp_from_args(container: &str, src: &str, dest: &str) -> Vec<String> {
    vec!["cp".into(), format!("{container}:{src}"), dest.into()]
}

/// Arguments for `docker exec`.
#[must_use]
pub fn exec_args(container: &str, cmd: &[String]) -> Vec<String> {
    let mut args = vec!["exec".to_string(), container.to_string()];
    args.extend(cmd.iter().cloned());
    args
}

/// Arguments for `docker logs`, optionally since an RFC3339 timestamp.
#[must_use]
pub fn logs_args(container: &str, since: Option<&str>) -> Vec<String> {
    let mut args = vec!["logs".to_string()];
    if let Some(since) = since {
        args.push("--since".into());
        args.push(since.into());
    }
    args.push(container.into());
    args
}

/// Arguments for `docker network create`.
#[must_use]
pub fn network_create_args(name: &str, labels: &BTreeMap<String, String>) -> Vec<String> {
    let mut args = vec!["network".to_string(), "create".to_string()];
    for (key, value) in labels {
        args.push("--label".into());
        args.push(format!("{key}={value}"));
    }
    args.push(name.into());
    args
}

/// Arguments for `docker network connect`.
#[must_use]
pub fn network_connect_args(container: &str, network: &str, ip: Option<&str>) -> Vec<String> {
    let mut args = vec!["network".to_string(), "connect".to_string()];
    if let Some(ip) = ip {
        args.push("--ip".into());
        args.push(ip.into());
    }
    args.push(network.into());
    args.push(container.into());
    args
}

/// Arguments for `docker network disconnect`.
#[must_use]
pub fn network_disconnect_args(container: &str, network: &str) -> Vec<String> {
    vec![
        "network".into(),
        "disconnect".into(),
        network.into(),
        container.into(),
    ]
}

/// Arguments for `docker network rm`.
#[must_use]
pub fn network_rm_args(name: &str) -> Vec<String> {
    vec!["network".into(), "rm".into(), name.into()]
}

/// Arguments for `docker network ls` with label filters.
#[must_use]
pub fn network_ls_args(filters: &[(String, String)]) -> Vec<String> {
    let mut args = vec!["network".to_string(), "ls".to_string()];
    for (key, value) in filters {
        args.push("--filter".into());
        args.push(format!("label={key}={value}"));
    }
    args.push("--format".into());
    args.push("{{.Name}}".into());
    args
}

/// Arguments for `docker network inspect`.
#[must_use]
pub fn network_inspect_args(name: &str) -> Vec<String> {
    vec!["network".into(), "inspect".into(), name.into()]
}

/// Arguments for `docker volume create`.
#[must_use]
pub fn volume_create_args(name: &str, labels: &BTreeMap<String, String>) -> Vec<String> {
    let mut args = vec!["volume".to_string(), "create".to_string()];
    for (key, value) in labels {
        args.push("--label".into());
        args.push(format!("{key}={value}"));
    }
    args.push(name.into());
    args
}

/// Arguments for `docker volume rm`.
#[must_use]
pub fn volume_rm_args(name: &str) -> Vec<String> {
    vec!["volume".into(), "rm".into(), name.into()]
}

/// Arguments for `docker volume inspect`.
#[must_use]
pub fn volume_inspect_args(name: &str) -> Vec<String> {
    vec!["volume".into(), "inspect".into(), name.into()]
}

/// Arguments for `docker volume ls` with label filters.
#[must_use]
pub fn volume_ls_args(filters: &[(String, String)]) -> Vec<String> {
    let mut args = vec!["volume".to_string(), "ls".to_string()];
    for (key, value) in filters {
        args.push("--filter".into());
        args.push(format!("label={key}={value}"));
    }
    args.push("--format".into());
    args.push("{{.Name}}".into());
    args
}

/// Arguments for `docker image inspect`, used as an existence probe.
#[must_use]
pub fn image_inspect_args(reference: &str) -> Vec<String> {
    vec!["image".into(), "inspect".into(), reference.into()]
}

/// Arguments for `docker pull`.
#[must_use]
pub fn pull_args(reference: &str) -> Vec<String> {
    vec!["pull".into(), "--quiet".into(), reference.into()]
}

/// Arguments for `docker save`.
#[must_use]
pub fn save_args(references: &[String], dest: &str) -> Vec<String> {
    let mut args = vec!["save".to_string(), "--output".to_string(), dest.to_string()];
    args.extend(references.iter().cloned());
    args
}

/// Arguments for `docker load`.
#[must_use]
pub fn load_args(tar: &str) -> Vec<String> {
    vec!["load".into(), "--input".into(), tar.into()]
}

/// Arguments for `docker info` as JSON.
#[must_use]
pub fn info_args() -> Vec<String> {
    vec!["info".into(), "--format".into(), "{{json .}}".into()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use k3c_types::{NodeSpec, PortMapping, Role, VolumeMount};

    fn server_spec() -> NodeSpec {
        let mut spec = NodeSpec::new("k3c-dev-server-0", Role::Server, "rancher/k3s:v1.31.5-k3s1");
        spec.networks.push("k3c-dev".into());
        spec.networks.push("shared".into());
        spec.env.insert("K3S_TOKEN".into(), "secret".into());
        spec.volumes.push(VolumeMount {
            source: "k3c-dev-images".into(),
            target: "/k3c/images".into(),
            read_only: false,
        });
        spec.ports.push(PortMapping::tcp(6550, 6443));
        spec.runtime_labels.insert("app".into(), "k3c".into());
        spec.cmd.push("server".into());
        spec.args.push("--tls-san=0.0.0.0".into());
        spec
    }

    #[test]
    fn test_create_args_shape() {
        let args = create_args(&server_spec());

        assert_eq!(args[0], "create");
        assert!(args.contains(&"--name".to_string()));
        assert!(args.contains(&"k3c-dev-server-0".to_string()));
        // only the first network at create time
        let network_count = args.iter().filter(|a| *a == "--network").count();
        assert_eq!(network_count, 1);
        assert!(args.contains(&"k3c-dev".to_string()));
        assert!(!args.contains(&"shared".to_string()));
        assert!(args.contains(&"K3S_TOKEN=secret".to_string()));
        assert!(args.contains(&"k3c-dev-images:/k3c/images".to_string()));
        assert!(args.contains(&"6550:6443/tcp".to_string()));
        assert!(args.contains(&"app=k3c".to_string()));
        assert!(args.contains(&"--privileged".to_string()));
        // image comes before the command
        let image_pos = args.iter().position(|a| a == "rancher/k3s:v1.31.5-k3s1").unwrap();
        let cmd_pos = args.iter().position(|a| a == "server").unwrap();
        assert!(image_pos < cmd_pos);
        assert_eq!(args.last().unwrap(), "--tls-san=0.0.0.0");
    }

    #[test]
    fn test_create_args_non_k3s_role_unprivileged() {
        let spec = NodeSpec::new("k3c-dev-serverlb", Role::LoadBalancer, "k3c/proxy:0.4");
        let args = create_args(&spec);
        assert!(!args.contains(&"--privileged".to_string()));
    }

    #[test]
    fn test_ps_args_filters() {
        let filters = vec![
            ("app".to_string(), "k3c".to_string()),
            ("k3c.cluster".to_string(), "dev".to_string()),
        ];
        let args = ps_args(&filters);
        assert!(args.contains(&"label=app=k3c".to_string()));
        assert!(args.contains(&"label=k3c.cluster=dev".to_string()));
        assert!(args.contains(&"--all".to_string()));
    }

    #[test]
    fn test_stop_args_grace() {
        assert_eq!(
            stop_args("k3c-dev-server-0", 30),
            vec!["stop", "--time", "30", "k3c-dev-server-0"]
        );
    }

    #[test]
    fn test_cp_args() {
        assert_eq!(
            cp_to_args("/tmp/f", "c1", "/etc/rancher/k3s/registries.yaml"),
            vec!["cp", "/tmp/f", "c1:/etc/rancher/k3s/registries.yaml"]
        );
        assert_eq!(
            cp_from_args("c1", "/output/kubeconfig.yaml", "/tmp/kc"),
            vec!["cp", "c1:/output/kubeconfig.yaml", "/tmp/kc"]
        );
    }

    #[test]
    fn test_network_connect_args_with_ip() {
        let args = network_connect_args("c1", "k3c-dev", Some("172.28.0.5"));
        assert_eq!(args, vec!["network", "connect", "--ip", "172.28.0.5", "k3c-dev", "c1"]);
    }

    #[test]
    fn test_logs_args_since() {
        let args = logs_args("c1", Some("2026-01-01T00:00:00Z"));
        assert_eq!(args, vec!["logs", "--since", "2026-01-01T00:00:00Z", "c1"]);
        assert_eq!(logs_args("c1", None), vec!["logs", "c1"]);
    }

    #[test]
    fn test_save_and_load_args() {
        let refs = vec!["a:1".to_string(), "b:2".to_string()];
        assert_eq!(save_args(&refs, "/tmp/i.tar"), vec!["save", "--output", "/tmp/i.tar", "a:1", "b:2"]);
        assert_eq!(load_args("/tmp/i.tar"), vec!["load", "--input", "/tmp/i.tar"]);
    }
}
