//! End-to-end orchestration scenarios against the mock runtime.

mod common;

use std::sync::Arc;

use k3c_config::{
    transform_simple_to_cluster, PortWithFilters, SimpleConfig, TransformEnv,
};
use k3c_core::{ClusterManager, CoreError, LB_CONFIG_PATH};
use k3c_runtime::DynRuntime;
use k3c_types::{labels, Role};
use tokio_util::sync::CancellationToken;

use common::{MockBehavior, MockRuntime};

fn simple(name: &str, servers: u32, agents: u32) -> SimpleConfig {
    let mut cfg = SimpleConfig::current(name);
    cfg.servers = servers;
    cfg.agents = agents;
    cfg.token = Some("test-token".to_string());
    cfg.options.kubeconfig.update_default = false;
    cfg
}

fn setup(behavior: MockBehavior) -> (Arc<MockRuntime>, ClusterManager) {
    let mock = Arc::new(MockRuntime::with_behavior(behavior));
    let runtime: DynRuntime = mock.clone();
    (mock, ClusterManager::new(runtime))
}

async fn create(
    manager: &ClusterManager,
    cfg: SimpleConfig,
) -> Result<k3c_types::Cluster, CoreError> {
    let cluster_cfg = transform_simple_to_cluster(&cfg, &TransformEnv::default())?;
    manager.create(cluster_cfg, &CancellationToken::new()).await
}

#[tokio::test]
async fn minimal_cluster_creates_server_lb_network_volume() {
    let (mock, manager) = setup(MockBehavior::default());
    let cluster = create(&manager, simple("t1", 1, 0)).await.unwrap();

    let names = mock.container_names();
    assert!(names.contains(&"k3c-t1-server-0".to_string()));
    assert!(names.contains(&"k3c-t1-serverlb".to_string()));
    assert_eq!(names.len(), 2);

    let state = mock.state.lock().unwrap();
    assert!(state.networks.contains_key("k3c-t1"));
    assert!(state.volumes.contains_key("k3c-t1-images"));
    drop(state);

    // every container carries the mandatory label set
    for name in &names {
        let state = mock.state.lock().unwrap();
        let container = &state.containers[name];
        assert!(labels::is_managed(&container.labels), "{name} unmanaged");
        assert_eq!(
            labels::cluster_of(name, &container.labels).unwrap(),
            "t1",
            "{name} missing cluster label"
        );
        assert!(container.labels.contains_key(labels::LABEL_CLUSTER_URL));
        assert!(container.labels.contains_key(labels::LABEL_CLUSTER_TOKEN));
        labels::role_of(name, &container.labels).unwrap();
    }

    // the LB got its config before start
    assert!(mock.file("k3c-t1-serverlb", LB_CONFIG_PATH).is_some());
    assert_eq!(cluster.server_count(), 1);
    assert!(cluster.loadbalancer().is_some());
}

#[tokio::test]
async fn ha_cluster_designates_init_node_and_orders_lb_upstreams() {
    let (mock, manager) = setup(MockBehavior::default());
    let cluster = create(&manager, simple("ha", 3, 2)).await.unwrap();

    assert_eq!(cluster.init_node.as_deref(), Some("k3c-ha-server-0"));
    assert_eq!(cluster.server_count(), 3);
    assert_eq!(cluster.agent_count(), 2);

    let init = {
        let state = mock.state.lock().unwrap();
        state.containers["k3c-ha-server-0"].labels.clone()
    };
    assert_eq!(
        init.get(labels::LABEL_SERVER_INIT).map(String::as_str),
        Some("true")
    );

    let lb_config = String::from_utf8(mock.file("k3c-ha-serverlb", LB_CONFIG_PATH).unwrap()).unwrap();
    let s0 = lb_config.find("k3c-ha-server-0:6443").unwrap();
    let s1 = lb_config.find("k3c-ha-server-1:6443").unwrap();
    let s2 = lb_config.find("k3c-ha-server-2:6443").unwrap();
    assert!(s0 < s1 && s1 < s2, "upstreams must be in server index order");
}

#[tokio::test]
async fn requested_counts_match_created_containers() {
    let (mock, manager) = setup(MockBehavior::default());
    create(&manager, simple("cnt", 2, 3)).await.unwrap();

    let state = mock.state.lock().unwrap();
    let count_role = |role: &str| {
        state
            .containers
            .values()
            .filter(|c| c.labels.get(labels::LABEL_ROLE).map(String::as_str) == Some(role))
            .count()
    };
    assert_eq!(count_role("server"), 2);
    assert_eq!(count_role("agent"), 3);
    assert_eq!(count_role("loadbalancer"), 1);
}

#[tokio::test]
async fn registry_use_collision_suppresses_create() {
    let (mock, manager) = setup(MockBehavior::default());
    mock.seed_registry("k3c-reg1-registry");

    let mut cfg = simple("reg1", 1, 0);
    // the would-be creation name resolves to the very registry we use
    cfg.registries.create = Some(k3c_config::RegistryCreate {
        host_port: Some(5001),
        ..k3c_config::RegistryCreate::default()
    });
    cfg.registries.use_ = vec!["reg1-registry".to_string()];

    create(&manager, cfg).await.unwrap();

    // still exactly one registry container, the pre-existing one
    let state = mock.state.lock().unwrap();
    let registries: Vec<&str> = state
        .containers
        .values()
        .filter(|c| c.labels.get(labels::LABEL_ROLE).map(String::as_str) == Some("registry"))
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(registries, vec!["k3c-reg1-registry"]);

    // joined to the cluster network
    let registry = &state.containers["k3c-reg1-registry"];
    assert!(registry.networks.contains(&"k3c-reg1".to_string()));
    drop(state);

    // each k3s node got the endpoint injected
    let injected = mock
        .file("k3c-reg1-server-0", "/etc/rancher/k3s/registries.yaml")
        .expect("registries.yaml must be written into the node");
    let injected = String::from_utf8(injected).unwrap();
    assert!(injected.contains("k3c-reg1-registry:5000"));
}

#[tokio::test]
async fn empty_registry_create_leaves_no_registry() {
    let (mock, manager) = setup(MockBehavior::default());

    let mut cfg = simple("s4", 1, 0);
    cfg.registries.create = Some(k3c_config::RegistryCreate::default());
    create(&manager, cfg).await.unwrap();

    let state = mock.state.lock().unwrap();
    assert!(
        !state
            .containers
            .values()
            .any(|c| c.labels.get(labels::LABEL_ROLE).map(String::as_str) == Some("registry")),
        "no registry container may exist after an all-default create block"
    );
}

#[tokio::test(start_paused = true)]
async fn readiness_timeout_rolls_back_everything() {
    let (mock, manager) = setup(MockBehavior {
        never_ready: vec!["server".to_string()],
        ..MockBehavior::default()
    });

    let mut cfg = simple("s5", 1, 0);
    cfg.options.k3c.timeout = Some("1s".to_string());
    let err = create(&manager, cfg).await.unwrap_err();

    assert_eq!(err.exit_code(), 3, "timeout must map to exit code 3");
    match &err {
        CoreError::RolledBack { original } => {
            assert!(
                matches!(**original, CoreError::ReadinessTimeout { .. }),
                "original error must be the readiness failure, got {original}"
            );
        }
        other => panic!("expected RolledBack, got {other}"),
    }

    // rollback is complete: nothing labelled for the cluster remains
    let state = mock.state.lock().unwrap();
    assert!(
        state
            .containers
            .values()
            .all(|c| c.labels.get(labels::LABEL_CLUSTER).map(String::as_str) != Some("s5")),
        "containers leaked: {:?}",
        state.containers.keys().collect::<Vec<_>>()
    );
    assert!(!state.networks.contains_key("k3c-s5"), "network leaked");
    assert!(!state.volumes.contains_key("k3c-s5-images"), "volume leaked");
}

#[tokio::test]
async fn failed_sibling_create_rolls_back_successful_ones() {
    let (mock, manager) = setup(MockBehavior {
        fail_create: Some("k3c-rb-agent-1".to_string()),
        ..MockBehavior::default()
    });

    let err = create(&manager, simple("rb", 1, 2)).await.unwrap_err();
    assert!(matches!(err, CoreError::RolledBack { .. }), "got {err}");

    let state = mock.state.lock().unwrap();
    assert!(
        state
            .containers
            .values()
            .all(|c| c.labels.get(labels::LABEL_CLUSTER).map(String::as_str) != Some("rb")),
        "all created siblings must be rolled back"
    );
}

#[tokio::test]
async fn lb_resyncs_once_when_agent_added() {
    let (mock, manager) = setup(MockBehavior::default());

    let mut cfg = simple("s6", 1, 1);
    cfg.ports.push(PortWithFilters {
        port: "8080:80".to_string(),
        node_filters: vec!["loadbalancer".to_string()],
    });
    create(&manager, cfg).await.unwrap();

    let before =
        String::from_utf8(mock.file("k3c-s6-serverlb", LB_CONFIG_PATH).unwrap()).unwrap();
    assert!(before.contains("k3c-s6-agent-0:80"));
    assert!(!before.contains("k3c-s6-agent-1:80"));
    let reloads_before = mock.state.lock().unwrap().reload_count;

    let added = manager
        .add_node("s6", Role::Agent, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(added, "k3c-s6-agent-1");

    let after =
        String::from_utf8(mock.file("k3c-s6-serverlb", LB_CONFIG_PATH).unwrap()).unwrap();
    assert!(after.contains("k3c-s6-agent-1:80"), "new agent must appear");
    assert_eq!(
        mock.state.lock().unwrap().reload_count,
        reloads_before + 1,
        "exactly one reload per membership change"
    );

    // minimal diff: every new line belongs to the new agent
    let added_lines: Vec<&str> = after
        .lines()
        .filter(|l| !before.contains(l.trim()))
        .collect();
    assert!(!added_lines.is_empty());
    assert!(added_lines.iter().all(|l| l.contains("k3c-s6-agent-1")));
}

#[tokio::test]
async fn added_node_is_cloned_from_same_role_template() {
    let (mock, manager) = setup(MockBehavior::default());
    mock.seed_registry("k3c-shared-registry");

    let mut cfg = simple("grow", 1, 1);
    cfg.registries.use_ = vec!["shared-registry".to_string()];
    create(&manager, cfg).await.unwrap();

    let added = manager
        .add_node("grow", Role::Agent, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(added, "k3c-grow-agent-1");

    let container = {
        let state = mock.state.lock().unwrap();
        state.containers["k3c-grow-agent-1"].clone()
    };
    // join material points at the init server, not at the template
    assert_eq!(container.env.get("K3S_TOKEN").map(String::as_str), Some("test-token"));
    assert_eq!(
        container.env.get("K3S_URL").map(String::as_str),
        Some("https://k3c-grow-server-0:6443")
    );
    assert_eq!(container.cmd, vec!["agent"]);
    // the template's mounts ride along, image volume included
    assert!(container
        .volumes
        .iter()
        .any(|v| v.source == "k3c-grow-images"));
    assert!(container.networks.contains(&"k3c-grow".to_string()));
    assert_eq!(
        labels::cluster_of(&container.name, &container.labels).unwrap(),
        "grow"
    );

    // registry mirrors carry over from the template node
    let injected = mock
        .file("k3c-grow-agent-1", "/etc/rancher/k3s/registries.yaml")
        .expect("added node must receive registries.yaml");
    let injected = String::from_utf8(injected).unwrap();
    assert!(injected.contains("k3c-shared-registry:5000"));
}

#[tokio::test]
async fn added_server_keeps_server_env_without_init_marker() {
    let (mock, manager) = setup(MockBehavior::default());
    create(&manager, simple("grows", 2, 0)).await.unwrap();

    let added = manager
        .add_node("grows", Role::Server, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(added, "k3c-grows-server-2");

    let state = mock.state.lock().unwrap();
    let container = &state.containers["k3c-grows-server-2"];
    assert_eq!(container.cmd, vec!["server"]);
    assert!(!container.cmd.contains(&"--cluster-init".to_string()));
    assert!(container.env.contains_key("K3S_KUBECONFIG_OUTPUT"));
    assert_eq!(
        container.env.get("K3S_URL").map(String::as_str),
        Some("https://k3c-grows-server-0:6443")
    );
    assert!(!container.labels.contains_key(labels::LABEL_SERVER_INIT));
}

#[tokio::test]
async fn concurrent_pulls_deduplicate_per_image() {
    let (mock, manager) = setup(MockBehavior::default());
    create(&manager, simple("pull", 3, 2)).await.unwrap();

    let state = mock.state.lock().unwrap();
    for (image, count) in &state.pull_counts {
        assert_eq!(*count, 1, "image {image} pulled {count} times");
    }
    // k3s image and LB image
    assert_eq!(state.pull_counts.len(), 2);
}

#[tokio::test]
async fn rediscovery_from_labels_matches_created_cluster() {
    let (_mock, manager) = setup(MockBehavior::default());
    let created = create(&manager, simple("redis", 2, 1)).await.unwrap();

    let rediscovered = manager
        .get("redis", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(rediscovered.name, created.name);
    assert_eq!(rediscovered.token, created.token);
    assert_eq!(rediscovered.server_count(), 2);
    assert_eq!(rediscovered.agent_count(), 1);
    assert_eq!(rediscovered.init_node, created.init_node);
    assert_eq!(rediscovered.network.name, "k3c-redis");
    assert_eq!(rediscovered.image_volume.as_deref(), Some("k3c-redis-images"));
    assert!(rediscovered.nodes.iter().all(|n| n.status.running));
}

#[tokio::test]
async fn delete_removes_cluster_but_keeps_external_registry() {
    let (mock, manager) = setup(MockBehavior::default());
    mock.seed_registry("k3c-shared-registry");

    let mut cfg = simple("del", 1, 0);
    cfg.registries.use_ = vec!["shared-registry".to_string()];
    create(&manager, cfg).await.unwrap();

    manager.delete("del", &CancellationToken::new()).await.unwrap();

    let state = mock.state.lock().unwrap();
    assert!(
        state.containers.contains_key("k3c-shared-registry"),
        "use-referenced registry must survive cluster deletion"
    );
    assert!(state
        .containers
        .values()
        .all(|c| c.labels.get(labels::LABEL_CLUSTER).map(String::as_str) != Some("del")));
    assert!(!state.networks.contains_key("k3c-del"));
    assert!(!state.volumes.contains_key("k3c-del-images"));
}

#[tokio::test]
async fn stop_and_start_cycle() {
    let (mock, manager) = setup(MockBehavior::default());
    create(&manager, simple("cyc", 1, 1)).await.unwrap();

    manager.stop("cyc", &CancellationToken::new()).await.unwrap();
    {
        let state = mock.state.lock().unwrap();
        assert!(state
            .containers
            .values()
            .filter(|c| c.labels.get(labels::LABEL_CLUSTER).map(String::as_str) == Some("cyc"))
            .all(|c| !c.running));
    }

    manager.start("cyc", &CancellationToken::new()).await.unwrap();
    let state = mock.state.lock().unwrap();
    assert!(state
        .containers
        .values()
        .filter(|c| c.labels.get(labels::LABEL_CLUSTER).map(String::as_str) == Some("cyc"))
        .all(|c| c.running));
}

#[tokio::test]
async fn merge_yaml_hook_layers_user_keys_over_existing_file() {
    use k3c_config::HookFailurePolicy;
    use k3c_types::{HookAction, HookStage, LifecycleHook, NodeSpec};

    let (mock, _) = setup(MockBehavior::default());
    let runtime: DynRuntime = mock.clone();
    let nodes = k3c_core::NodeManager::new(runtime.clone(), k3c_core::EventBus::new());
    let cancel = CancellationToken::new();

    let mut spec = NodeSpec::new("merge-target", Role::Server, "img");
    spec.hooks.push(LifecycleHook {
        stage: HookStage::PostStart,
        action: HookAction::MergeYaml {
            dest: "/etc/rancher/k3s/registries.yaml".to_string(),
            content: "configs:\n  \"reg:5000\":\n    tls:\n      insecure_skip_verify: true\n"
                .to_string(),
            description: "merge user registry config".to_string(),
        },
    });
    runtime.container_create(&spec, &cancel).await.unwrap();
    runtime
        .copy_to_container(
            "merge-target",
            "/etc/rancher/k3s/registries.yaml",
            b"mirrors:\n  \"reg:5000\":\n    endpoint:\n      - http://reg:5000\n",
            0o644,
            &cancel,
        )
        .await
        .unwrap();

    nodes
        .run_hooks(&spec, HookStage::PostStart, HookFailurePolicy::WarnAndContinue, &cancel)
        .await
        .unwrap();

    let merged = String::from_utf8(
        mock.file("merge-target", "/etc/rancher/k3s/registries.yaml").unwrap(),
    )
    .unwrap();
    assert!(merged.contains("http://reg:5000"), "generated keys survive");
    assert!(merged.contains("insecure_skip_verify: true"), "user keys merged in");
}

#[tokio::test]
async fn existing_cluster_name_is_rejected_before_mutation() {
    let (mock, manager) = setup(MockBehavior::default());
    create(&manager, simple("dup", 1, 0)).await.unwrap();

    let containers_before = mock.container_names().len();
    let err = create(&manager, simple("dup", 1, 0)).await.unwrap_err();
    assert_eq!(err.exit_code(), 1);
    assert!(err.to_string().contains("already exists"));
    assert_eq!(mock.container_names().len(), containers_before);
}
