use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use tracing::*;

use crate::common;
use crate::env::ProcessEnv;
use crate::gitopsstack_types::GitOpsStack;
use crate::resources::*;
use crate::store::{Store, StoreError};

/// Desired existence of a workload, evaluated once from its feature flag and
/// override section before any store access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Existence {
    /// Feature flag off; a live object has to go.
    Absent,
    /// Desired with built-in defaults only.
    Present,
    /// Desired with spec override sections layered on the defaults.
    PresentWithOverrides,
}

fn present(overridden: bool) -> Existence {
    if overridden {
        Existence::PresentWithOverrides
    } else {
        Existence::Present
    }
}

pub fn repo_server_existence(stack: &GitOpsStack) -> Existence {
    let r = &stack.spec.repo;
    present(
        r.image.is_some()
            || r.version.is_some()
            || r.log_level.is_some()
            || r.exec_timeout.is_some()
            || r.env.is_some()
            || r.resources.is_some(),
    )
}

pub fn auth_proxy_existence(stack: &GitOpsStack, pcfg: &ProcessEnv) -> Existence {
    if pcfg.auth_proxy_disabled {
        return Existence::Absent;
    }
    let a = &stack.spec.auth_proxy;
    present(a.image.is_some() || a.version.is_some() || a.env.is_some() || a.resources.is_some())
}

pub fn cache_existence(stack: &GitOpsStack) -> Existence {
    if stack.spec.ha.enabled {
        return Existence::Absent;
    }
    let c = &stack.spec.cache;
    present(c.image.is_some() || c.version.is_some() || c.resources.is_some())
}

pub fn cache_ha_proxy_existence(stack: &GitOpsStack) -> Existence {
    if !stack.spec.ha.enabled {
        return Existence::Absent;
    }
    let h = &stack.spec.ha;
    present(h.image.is_some() || h.version.is_some() || h.resources.is_some())
}

pub fn server_existence(stack: &GitOpsStack) -> Existence {
    let s = &stack.spec.server;
    present(
        s.image.is_some()
            || s.version.is_some()
            || s.insecure
            || s.log_level.is_some()
            || s.log_format.is_some()
            || s.env.is_some()
            || s.resources.is_some(),
    )
}

fn pod_spec(d: &appsv1::Deployment) -> Option<&corev1::PodSpec> {
    d.spec.as_ref()?.template.spec.as_ref()
}

fn pod_spec_mut(d: &mut appsv1::Deployment) -> Option<&mut corev1::PodSpec> {
    d.spec.as_mut()?.template.spec.as_mut()
}

/// Pairs of (live, desired) containers in pod order, init containers included.
/// Pairing is positional; builders emit a fixed container layout per kind.
fn container_pairs<'a>(
    live: &'a corev1::PodSpec,
    desired: &'a corev1::PodSpec,
) -> Vec<(&'a corev1::Container, &'a corev1::Container)> {
    let mut pairs: Vec<_> = live.containers.iter().zip(desired.containers.iter()).collect();
    if let (Some(li), Some(di)) = (&live.init_containers, &desired.init_containers) {
        pairs.extend(li.iter().zip(di.iter()));
    }
    pairs
}

fn for_each_pair_mut(
    live: &mut appsv1::Deployment,
    desired: &appsv1::Deployment,
    f: fn(&mut corev1::Container, &corev1::Container),
) {
    if let (Some(live_pod), Some(desired_pod)) = (pod_spec_mut(live), pod_spec(desired)) {
        for (lc, dc) in live_pod.containers.iter_mut().zip(desired_pod.containers.iter()) {
            f(lc, dc);
        }
        if let (Some(li), Some(di)) = (live_pod.init_containers.as_mut(), desired_pod.init_containers.as_ref()) {
            for (lc, dc) in li.iter_mut().zip(di.iter()) {
                f(lc, dc);
            }
        }
    }
}

fn image_differs(live: &appsv1::Deployment, desired: &appsv1::Deployment) -> bool {
    match (pod_spec(live), pod_spec(desired)) {
        (Some(l), Some(d)) => container_pairs(l, d).iter().any(|(lc, dc)| lc.image != dc.image),
        _ => false,
    }
}

fn apply_image(live: &mut appsv1::Deployment, desired: &appsv1::Deployment) {
    for_each_pair_mut(live, desired, |lc, dc| lc.image = dc.image.clone());
}

fn command_differs(live: &appsv1::Deployment, desired: &appsv1::Deployment) -> bool {
    match (pod_spec(live), pod_spec(desired)) {
        (Some(l), Some(d)) => container_pairs(l, d)
            .iter()
            .any(|(lc, dc)| lc.command != dc.command),
        _ => false,
    }
}

fn apply_command(live: &mut appsv1::Deployment, desired: &appsv1::Deployment) {
    for_each_pair_mut(live, desired, |lc, dc| lc.command = dc.command.clone());
}

fn env_differs(live: &appsv1::Deployment, desired: &appsv1::Deployment) -> bool {
    match (pod_spec(live), pod_spec(desired)) {
        (Some(l), Some(d)) => container_pairs(l, d).iter().any(|(lc, dc)| lc.env != dc.env),
        _ => false,
    }
}

fn apply_env(live: &mut appsv1::Deployment, desired: &appsv1::Deployment) {
    for_each_pair_mut(live, desired, |lc, dc| lc.env = dc.env.clone());
}

fn volumes_differ(live: &appsv1::Deployment, desired: &appsv1::Deployment) -> bool {
    match (pod_spec(live), pod_spec(desired)) {
        (Some(l), Some(d)) => {
            l.volumes != d.volumes
                || container_pairs(l, d)
                    .iter()
                    .any(|(lc, dc)| lc.volume_mounts != dc.volume_mounts)
        }
        _ => false,
    }
}

/// Volumes and every container's mounts are replaced wholesale with the
/// kind's computed defaults, unlike the additive env policy.
fn apply_volumes(live: &mut appsv1::Deployment, desired: &appsv1::Deployment) {
    if let (Some(live_pod), Some(desired_pod)) = (pod_spec_mut(live), pod_spec(desired)) {
        live_pod.volumes = desired_pod.volumes.clone();
    }
    for_each_pair_mut(live, desired, |lc, dc| {
        lc.volume_mounts = dc.volume_mounts.clone()
    });
}

fn node_placement_differs(live: &appsv1::Deployment, desired: &appsv1::Deployment) -> bool {
    match (pod_spec(live), pod_spec(desired)) {
        (Some(l), Some(d)) => l.node_selector != d.node_selector || l.tolerations != d.tolerations,
        _ => false,
    }
}

fn apply_node_placement(live: &mut appsv1::Deployment, desired: &appsv1::Deployment) {
    if let (Some(live_pod), Some(desired_pod)) = (pod_spec_mut(live), pod_spec(desired)) {
        live_pod.node_selector = desired_pod.node_selector.clone();
        live_pod.tolerations = desired_pod.tolerations.clone();
    }
}

fn resources_differ(live: &appsv1::Deployment, desired: &appsv1::Deployment) -> bool {
    match (pod_spec(live), pod_spec(desired)) {
        (Some(l), Some(d)) => container_pairs(l, d)
            .iter()
            .any(|(lc, dc)| lc.resources != dc.resources),
        _ => false,
    }
}

fn apply_resources(live: &mut appsv1::Deployment, desired: &appsv1::Deployment) {
    for_each_pair_mut(live, desired, |lc, dc| lc.resources = dc.resources.clone());
}

pub struct FieldGroup {
    pub name: &'static str,
    pub differs: fn(&appsv1::Deployment, &appsv1::Deployment) -> bool,
    pub apply: fn(&mut appsv1::Deployment, &appsv1::Deployment),
}

/// The managed field groups of a Deployment. Convergence folds this table
/// and issues at most one update per pass regardless of how many groups
/// drifted.
pub const FIELD_GROUPS: &[FieldGroup] = &[
    FieldGroup {
        name: "image",
        differs: image_differs,
        apply: apply_image,
    },
    FieldGroup {
        name: "command",
        differs: command_differs,
        apply: apply_command,
    },
    FieldGroup {
        name: "env",
        differs: env_differs,
        apply: apply_env,
    },
    FieldGroup {
        name: "volumes",
        differs: volumes_differ,
        apply: apply_volumes,
    },
    FieldGroup {
        name: "node-placement",
        differs: node_placement_differs,
        apply: apply_node_placement,
    },
    FieldGroup {
        name: "resources",
        differs: resources_differ,
        apply: apply_resources,
    },
];

async fn converge<S: Store>(
    store: &S,
    stack: &GitOpsStack,
    existence: Existence,
    desired: appsv1::Deployment,
) -> Result<(), StoreError> {
    let name = desired.metadata.name.as_ref().unwrap();
    let ns = common::stack_namespace(stack);
    let live = store.get::<appsv1::Deployment>(Some(ns.as_str()), name).await?;

    if existence == Existence::Absent {
        if live.is_some() {
            info!("Delete deployment of disabled workload: {}", name);
            store.delete::<appsv1::Deployment>(Some(ns.as_str()), name).await?;
        }
        return Ok(());
    }

    match live {
        None => {
            info!("Create deployment: {}", name);
            store.create(&desired).await?;
        }
        Some(mut live) => {
            let mut changed = Vec::new();
            for group in FIELD_GROUPS {
                if (group.differs)(&live, &desired) {
                    (group.apply)(&mut live, &desired);
                    changed.push(group.name);
                }
            }
            if changed.is_empty() {
                debug!("Deployment unchanged: {}", name);
            } else {
                info!("Update deployment {}: {}", name, changed.join(", "));
                store.update(&live).await?;
            }
        }
    }
    Ok(())
}

pub async fn reconcile_repo_server<S: Store>(
    store: &S,
    stack: &GitOpsStack,
    pcfg: &ProcessEnv,
) -> Result<(), StoreError> {
    converge(
        store,
        stack,
        repo_server_existence(stack),
        make_repo_server_deployment(stack, pcfg),
    )
    .await
}

pub async fn reconcile_auth_proxy<S: Store>(
    store: &S,
    stack: &GitOpsStack,
    pcfg: &ProcessEnv,
) -> Result<(), StoreError> {
    converge(
        store,
        stack,
        auth_proxy_existence(stack, pcfg),
        make_auth_proxy_deployment(stack, pcfg),
    )
    .await
}

pub async fn reconcile_cache<S: Store>(
    store: &S,
    stack: &GitOpsStack,
    pcfg: &ProcessEnv,
) -> Result<(), StoreError> {
    converge(
        store,
        stack,
        cache_existence(stack),
        make_cache_deployment(stack, pcfg),
    )
    .await
}

pub async fn reconcile_cache_ha_proxy<S: Store>(
    store: &S,
    stack: &GitOpsStack,
    pcfg: &ProcessEnv,
) -> Result<(), StoreError> {
    converge(
        store,
        stack,
        cache_ha_proxy_existence(stack),
        make_cache_ha_proxy_deployment(stack, pcfg),
    )
    .await
}

pub async fn reconcile_server<S: Store>(
    store: &S,
    stack: &GitOpsStack,
    pcfg: &ProcessEnv,
) -> Result<(), StoreError> {
    converge(
        store,
        stack,
        server_existence(stack),
        make_server_deployment(stack, pcfg),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::env_var;
    use crate::testutil::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn creates_then_second_pass_writes_nothing() {
        let store = MemStore::new();
        let stack = make_test_stack();
        let pcfg = ProcessEnv::default();

        reconcile_repo_server(&store, &stack, &pcfg).await.unwrap();
        assert_eq!(store.writes().creates, 1);

        store.reset_writes();
        reconcile_repo_server(&store, &stack, &pcfg).await.unwrap();
        assert_eq!(store.writes().total(), 0);
    }

    #[tokio::test]
    async fn disabled_auth_proxy_workload_deleted_and_blocked() {
        let store = MemStore::new();
        let stack = make_test_stack();
        let enabled = ProcessEnv::default();
        reconcile_auth_proxy(&store, &stack, &enabled).await.unwrap();
        assert!(store
            .get::<appsv1::Deployment>(Some("gitops"), "test-auth-proxy")
            .await
            .unwrap()
            .is_some());

        let disabled = ProcessEnv {
            auth_proxy_disabled: true,
            ..ProcessEnv::default()
        };
        reconcile_auth_proxy(&store, &stack, &disabled).await.unwrap();
        assert!(store
            .get::<appsv1::Deployment>(Some("gitops"), "test-auth-proxy")
            .await
            .unwrap()
            .is_none());

        store.reset_writes();
        reconcile_auth_proxy(&store, &stack, &disabled).await.unwrap();
        assert_eq!(store.writes().total(), 0);

        reconcile_auth_proxy(&store, &stack, &enabled).await.unwrap();
        assert!(store
            .get::<appsv1::Deployment>(Some("gitops"), "test-auth-proxy")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn ha_toggle_swaps_cache_workloads() {
        let store = MemStore::new();
        let pcfg = ProcessEnv::default();

        let plain = make_test_stack();
        reconcile_cache(&store, &plain, &pcfg).await.unwrap();
        reconcile_cache_ha_proxy(&store, &plain, &pcfg).await.unwrap();
        assert!(store
            .get::<appsv1::Deployment>(Some("gitops"), "test-cache")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get::<appsv1::Deployment>(Some("gitops"), "test-cache-ha-proxy")
            .await
            .unwrap()
            .is_none());

        let ha = make_test_stack_with(|s| s.spec.ha.enabled = true);
        reconcile_cache(&store, &ha, &pcfg).await.unwrap();
        reconcile_cache_ha_proxy(&store, &ha, &pcfg).await.unwrap();
        assert!(store
            .get::<appsv1::Deployment>(Some("gitops"), "test-cache")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get::<appsv1::Deployment>(Some("gitops"), "test-cache-ha-proxy")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn drifted_image_and_command_fixed_in_one_update() {
        let store = MemStore::new();
        let stack = make_test_stack();
        let pcfg = ProcessEnv::default();
        reconcile_server(&store, &stack, &pcfg).await.unwrap();

        let mut live = store
            .get::<appsv1::Deployment>(Some("gitops"), "test-server")
            .await
            .unwrap()
            .unwrap();
        {
            let pod = live.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
            pod.containers[0].image = Some("tampered:latest".to_string());
            pod.containers[0].command = Some(vec!["testing".to_string()]);
        }
        store.update(&live).await.unwrap();

        store.reset_writes();
        reconcile_server(&store, &stack, &pcfg).await.unwrap();
        assert_eq!(store.writes().updates, 1);

        let fixed = store
            .get::<appsv1::Deployment>(Some("gitops"), "test-server")
            .await
            .unwrap()
            .unwrap();
        let pod = fixed.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.containers[0].image.as_deref(), Some("quay.io/anvil/gitops:v2.6.3"));
        assert_eq!(pod.containers[0].command.as_ref().unwrap()[0], "gitops-server");
    }

    #[tokio::test]
    async fn node_placement_drift_rewrites_both_fields_once() {
        let store = MemStore::new();
        let stack = make_test_stack_with(|s| {
            s.spec.node_placement = Some(crate::gitopsstack_types::NodePlacementSpec {
                node_selector: Some(BTreeMap::from([(
                    "kubernetes.io/hostname".to_string(),
                    "node-1".to_string(),
                )])),
                tolerations: None,
            });
        });
        let pcfg = ProcessEnv::default();
        reconcile_cache(&store, &stack, &pcfg).await.unwrap();

        // Identical placement: no write.
        store.reset_writes();
        reconcile_cache(&store, &stack, &pcfg).await.unwrap();
        assert_eq!(store.writes().total(), 0);

        let mut live = store
            .get::<appsv1::Deployment>(Some("gitops"), "test-cache")
            .await
            .unwrap()
            .unwrap();
        {
            let pod = live.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
            pod.node_selector = Some(BTreeMap::from([(
                "kubernetes.io/hostname".to_string(),
                "node-9".to_string(),
            )]));
            pod.tolerations = Some(vec![corev1::Toleration::default()]);
        }
        store.update(&live).await.unwrap();

        store.reset_writes();
        reconcile_cache(&store, &stack, &pcfg).await.unwrap();
        assert_eq!(store.writes().updates, 1);

        let fixed = store
            .get::<appsv1::Deployment>(Some("gitops"), "test-cache")
            .await
            .unwrap()
            .unwrap();
        let pod = fixed.spec.unwrap().template.spec.unwrap();
        assert_eq!(
            pod.node_selector.unwrap().get("kubernetes.io/hostname").unwrap(),
            "node-1"
        );
        assert!(pod.tolerations.is_none());
    }

    #[tokio::test]
    async fn drifted_volumes_replaced_wholesale() {
        let store = MemStore::new();
        let stack = make_test_stack();
        let pcfg = ProcessEnv::default();
        reconcile_repo_server(&store, &stack, &pcfg).await.unwrap();

        let mut live = store
            .get::<appsv1::Deployment>(Some("gitops"), "test-repo-server")
            .await
            .unwrap()
            .unwrap();
        {
            let pod = live.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
            pod.volumes = Some(vec![corev1::Volume {
                name: "sneaky".to_string(),
                empty_dir: Some(corev1::EmptyDirVolumeSource::default()),
                ..corev1::Volume::default()
            }]);
            pod.containers[0].volume_mounts = Some(vec![corev1::VolumeMount {
                name: "sneaky".to_string(),
                mount_path: "/sneaky".to_string(),
                ..corev1::VolumeMount::default()
            }]);
        }
        store.update(&live).await.unwrap();

        store.reset_writes();
        reconcile_repo_server(&store, &stack, &pcfg).await.unwrap();
        assert_eq!(store.writes().updates, 1);

        let fixed = store
            .get::<appsv1::Deployment>(Some("gitops"), "test-repo-server")
            .await
            .unwrap()
            .unwrap();
        let pod = fixed.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.volumes, Some(repo_server_volumes(&stack)));
        assert_eq!(
            pod.containers[0].volume_mounts,
            Some(repo_server_volume_mounts())
        );
    }

    #[tokio::test]
    async fn proxy_vars_added_to_existing_deployments() {
        let store = MemStore::new();
        let stack = make_test_stack_with(|s| {
            s.spec.auth_proxy.env = Some(vec![env_var("FOO", "BAR")]);
        });
        let plain = ProcessEnv::default();
        reconcile_auth_proxy(&store, &stack, &plain).await.unwrap();

        let proxied = ProcessEnv {
            http_proxy: Some("example.com:8888".to_string()),
            https_proxy: Some("example.com:8443".to_string()),
            no_proxy: Some(".example.com".to_string()),
            auth_proxy_disabled: false,
        };
        store.reset_writes();
        reconcile_auth_proxy(&store, &stack, &proxied).await.unwrap();
        assert_eq!(store.writes().updates, 1);

        let live = store
            .get::<appsv1::Deployment>(Some("gitops"), "test-auth-proxy")
            .await
            .unwrap()
            .unwrap();
        let pod = live.spec.unwrap().template.spec.unwrap();
        let env = pod.containers[0].env.clone().unwrap();
        assert_eq!(env.len(), 4);
        assert_eq!(env[0].name, "FOO");
        let init_env = pod.init_containers.unwrap()[0].env.clone().unwrap();
        assert_eq!(init_env.len(), 3);
    }

    #[test]
    fn existence_reflects_flags_and_overrides() {
        let plain = make_test_stack();
        assert_eq!(repo_server_existence(&plain), Existence::Present);
        assert_eq!(cache_existence(&plain), Existence::Present);
        assert_eq!(cache_ha_proxy_existence(&plain), Existence::Absent);

        let ha = make_test_stack_with(|s| s.spec.ha.enabled = true);
        assert_eq!(cache_existence(&ha), Existence::Absent);
        assert_eq!(cache_ha_proxy_existence(&ha), Existence::Present);

        let tuned = make_test_stack_with(|s| s.spec.repo.exec_timeout = Some(600));
        assert_eq!(repo_server_existence(&tuned), Existence::PresentWithOverrides);

        let disabled = ProcessEnv {
            auth_proxy_disabled: true,
            ..ProcessEnv::default()
        };
        assert_eq!(
            auth_proxy_existence(&plain, &disabled),
            Existence::Absent
        );
        assert_eq!(
            auth_proxy_existence(&plain, &ProcessEnv::default()),
            Existence::Present
        );
    }
}
