use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::api::rbac::v1 as rbacv1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube_core::Resource;
use tracing::*;

use crate::common;
use crate::env::ProcessEnv;
use crate::gitopsstack_types::GitOpsStack;
use crate::store::{Store, StoreError};

pub fn controller_policy_rules() -> Vec<rbacv1::PolicyRule> {
    vec![
        rbacv1::PolicyRule {
            api_groups: Some(vec!["".to_string()]),
            resources: Some(vec![
                "configmaps".to_string(),
                "secrets".to_string(),
                "services".to_string(),
            ]),
            verbs: vec![
                "create".to_string(),
                "get".to_string(),
                "list".to_string(),
                "watch".to_string(),
                "update".to_string(),
                "delete".to_string(),
            ],
            ..Default::default()
        },
        rbacv1::PolicyRule {
            api_groups: Some(vec!["apps".to_string()]),
            resources: Some(vec!["deployments".to_string()]),
            verbs: vec![
                "create".to_string(),
                "get".to_string(),
                "list".to_string(),
                "watch".to_string(),
                "update".to_string(),
                "delete".to_string(),
            ],
            ..Default::default()
        },
        rbacv1::PolicyRule {
            api_groups: Some(vec!["".to_string()]),
            resources: Some(vec!["events".to_string()]),
            verbs: vec!["create".to_string(), "list".to_string()],
            ..Default::default()
        },
    ]
}

pub fn server_policy_rules() -> Vec<rbacv1::PolicyRule> {
    vec![
        rbacv1::PolicyRule {
            api_groups: Some(vec!["".to_string()]),
            resources: Some(vec!["configmaps".to_string(), "secrets".to_string()]),
            verbs: vec![
                "create".to_string(),
                "get".to_string(),
                "list".to_string(),
                "watch".to_string(),
                "update".to_string(),
                "patch".to_string(),
                "delete".to_string(),
            ],
            ..Default::default()
        },
        rbacv1::PolicyRule {
            api_groups: Some(vec!["apps".to_string()]),
            resources: Some(vec!["deployments".to_string()]),
            verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
            ..Default::default()
        },
        rbacv1::PolicyRule {
            api_groups: Some(vec!["".to_string()]),
            resources: Some(vec!["events".to_string()]),
            verbs: vec!["create".to_string(), "list".to_string()],
            ..Default::default()
        },
    ]
}

pub fn auth_proxy_policy_rules() -> Vec<rbacv1::PolicyRule> {
    vec![rbacv1::PolicyRule {
        api_groups: Some(vec!["".to_string()]),
        resources: Some(vec!["secrets".to_string(), "configmaps".to_string()]),
        verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
        ..Default::default()
    }]
}

pub fn cache_ha_policy_rules() -> Vec<rbacv1::PolicyRule> {
    vec![rbacv1::PolicyRule {
        api_groups: Some(vec!["".to_string()]),
        resources: Some(vec!["endpoints".to_string()]),
        verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
        ..Default::default()
    }]
}

pub fn policy_rules_for(role_id: &str) -> Vec<rbacv1::PolicyRule> {
    match role_id {
        common::CONTROLLER_ROLE => controller_policy_rules(),
        common::SERVER_ROLE => server_policy_rules(),
        common::AUTH_PROXY_ROLE => auth_proxy_policy_rules(),
        common::CACHE_HA_ROLE => cache_ha_policy_rules(),
        _ => Vec::new(),
    }
}

pub fn cluster_policy_rules_for(role_id: &str) -> Vec<rbacv1::PolicyRule> {
    match role_id {
        common::CONTROLLER_ROLE => vec![
            rbacv1::PolicyRule {
                api_groups: Some(vec!["*".to_string()]),
                resources: Some(vec!["*".to_string()]),
                verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
                ..Default::default()
            },
            rbacv1::PolicyRule {
                api_groups: Some(vec!["".to_string()]),
                resources: Some(vec!["events".to_string()]),
                verbs: vec!["create".to_string(), "list".to_string()],
                ..Default::default()
            },
        ],
        common::SERVER_ROLE => vec![rbacv1::PolicyRule {
            api_groups: Some(vec!["*".to_string()]),
            resources: Some(vec!["*".to_string()]),
            verbs: vec![
                "get".to_string(),
                "list".to_string(),
                "watch".to_string(),
                "delete".to_string(),
                "patch".to_string(),
            ],
            ..Default::default()
        }],
        _ => Vec::new(),
    }
}

/// The namespaces this stack reconciles RBAC into: its own plus every
/// namespace labeled as managed by it.
pub async fn governed_namespaces<S: Store>(
    store: &S,
    stack: &GitOpsStack,
) -> Result<Vec<String>, StoreError> {
    let stack_ns = common::stack_namespace(stack);
    let mut namespaces = vec![stack_ns.clone()];
    let selector = format!("{}={}", common::MANAGED_BY_LABEL, stack_ns);
    for ns in store
        .list::<corev1::Namespace>(None, Some(selector.as_str()))
        .await?
    {
        let name = ns.metadata.name.as_ref().unwrap().clone();
        if name != stack_ns {
            namespaces.push(name);
        }
    }
    Ok(namespaces)
}

pub fn make_role(
    stack: &GitOpsStack,
    role_id: &str,
    namespace: &str,
    rules: &[rbacv1::PolicyRule],
) -> rbacv1::Role {
    let mut role = rbacv1::Role {
        metadata: metav1::ObjectMeta {
            name: Some(common::resource_name(stack, role_id)),
            namespace: Some(namespace.to_string()),
            labels: Some(common::app_labels(stack.metadata.name.as_ref().unwrap())),
            ..metav1::ObjectMeta::default()
        },
        rules: Some(rules.to_vec()),
        ..rbacv1::Role::default()
    };
    // Cross-namespace roles cannot be owned by the stack and are cleaned up
    // explicitly on stack deletion.
    if namespace == stack.metadata.namespace.as_deref().unwrap() {
        role.metadata.owner_references = Some(vec![stack.controller_owner_ref(&()).unwrap()]);
    }
    role
}

pub fn make_cluster_role(
    stack: &GitOpsStack,
    role_id: &str,
    rules: &[rbacv1::PolicyRule],
) -> rbacv1::ClusterRole {
    rbacv1::ClusterRole {
        metadata: metav1::ObjectMeta {
            name: Some(common::cluster_resource_name(stack, role_id)),
            labels: Some(common::app_labels(stack.metadata.name.as_ref().unwrap())),
            annotations: Some(common::owner_annotations(stack)),
            ..metav1::ObjectMeta::default()
        },
        rules: Some(rules.to_vec()),
        ..rbacv1::ClusterRole::default()
    }
}

/// Ensure the rule object for `role_id` in every governed namespace. Drifted
/// rules are rewritten in place; nothing else on the live object is touched.
pub async fn reconcile_role<S: Store>(
    store: &S,
    stack: &GitOpsStack,
    role_id: &str,
    rules: &[rbacv1::PolicyRule],
    namespaces: &[String],
    pcfg: &ProcessEnv,
) -> Result<Vec<rbacv1::Role>, StoreError> {
    let disabled = role_id == common::AUTH_PROXY_ROLE && pcfg.auth_proxy_disabled;
    let mut roles = Vec::new();
    for ns in namespaces {
        let role = make_role(stack, role_id, ns, rules);
        let role_name = role.metadata.name.as_ref().unwrap();
        let live = store.get::<rbacv1::Role>(Some(ns.as_str()), role_name).await?;
        match live {
            Some(_) if disabled => {
                info!("Delete role of disabled role id: {}/{}", ns, role_name);
                store
                    .delete::<rbacv1::Role>(Some(ns.as_str()), role_name)
                    .await?;
            }
            Some(existing) => {
                if existing.rules != role.rules {
                    info!("Update role: {}/{}", ns, role_name);
                    let updated = rbacv1::Role {
                        rules: role.rules.clone(),
                        ..existing
                    };
                    store.update(&updated).await?;
                }
            }
            None if disabled => {}
            None => {
                info!("Create role: {}/{}", ns, role_name);
                store.create(&role).await?;
            }
        }
        roles.push(role);
    }
    Ok(roles)
}

/// Ensure the cluster-scoped rule object for `role_id`. Returns `None` when
/// the cluster chain is disabled, deleting any leftover object.
pub async fn reconcile_cluster_role<S: Store>(
    store: &S,
    stack: &GitOpsStack,
    role_id: &str,
    rules: &[rbacv1::PolicyRule],
) -> Result<Option<rbacv1::ClusterRole>, StoreError> {
    let desired = make_cluster_role(stack, role_id, rules);
    let name = desired.metadata.name.as_ref().unwrap();
    let live = store.get::<rbacv1::ClusterRole>(None, name).await?;

    if !stack.spec.cluster_admin {
        if live.is_some() {
            info!("Delete cluster role: {}", name);
            store.delete::<rbacv1::ClusterRole>(None, name).await?;
        }
        return Ok(None);
    }

    match live {
        Some(existing) => {
            if existing.rules != desired.rules {
                info!("Update cluster role: {}", name);
                let updated = rbacv1::ClusterRole {
                    rules: desired.rules.clone(),
                    ..existing
                };
                store.update(&updated).await?;
            }
        }
        None => {
            info!("Create cluster role: {}", name);
            store.create(&desired).await?;
        }
    }
    Ok(Some(desired))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    #[tokio::test]
    async fn governed_namespaces_follow_managed_by_label() {
        let store = MemStore::new();
        let stack = make_test_stack();
        store.put_namespace("other", Some("gitops")).await;
        store.put_namespace("unrelated", None).await;

        let namespaces = governed_namespaces(&store, &stack).await.unwrap();
        assert_eq!(namespaces, vec!["gitops".to_string(), "other".to_string()]);
    }

    #[tokio::test]
    async fn creates_roles_in_every_governed_namespace() {
        let store = MemStore::new();
        let stack = make_test_stack();
        let namespaces = vec!["gitops".to_string(), "other".to_string()];
        let pcfg = ProcessEnv::default();

        let roles = reconcile_role(
            &store,
            &stack,
            common::SERVER_ROLE,
            &server_policy_rules(),
            &namespaces,
            &pcfg,
        )
        .await
        .unwrap();
        assert_eq!(roles.len(), 2);
        for ns in &namespaces {
            let role = store
                .get::<rbacv1::Role>(Some(ns.as_str()), "test-server")
                .await
                .unwrap()
                .expect("role created");
            assert_eq!(role.rules, Some(server_policy_rules()));
            let owned = role.metadata.owner_references.is_some();
            assert_eq!(owned, ns == "gitops");
        }
    }

    #[tokio::test]
    async fn drifted_rules_are_rewritten_in_place() {
        let store = MemStore::new();
        let stack = make_test_stack();
        let namespaces = vec!["gitops".to_string()];
        let pcfg = ProcessEnv::default();
        reconcile_role(
            &store,
            &stack,
            common::CACHE_HA_ROLE,
            &cache_ha_policy_rules(),
            &namespaces,
            &pcfg,
        )
        .await
        .unwrap();

        let mut live = store
            .get::<rbacv1::Role>(Some("gitops"), "test-cache-ha")
            .await
            .unwrap()
            .unwrap();
        live.rules = Some(Vec::new());
        store.update(&live).await.unwrap();

        store.reset_writes();
        reconcile_role(
            &store,
            &stack,
            common::CACHE_HA_ROLE,
            &cache_ha_policy_rules(),
            &namespaces,
            &pcfg,
        )
        .await
        .unwrap();
        assert_eq!(store.writes().updates, 1);
        let restored = store
            .get::<rbacv1::Role>(Some("gitops"), "test-cache-ha")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(restored.rules, Some(cache_ha_policy_rules()));
    }

    #[tokio::test]
    async fn cluster_role_gated_by_cluster_admin() {
        let store = MemStore::new();
        let stack = make_test_stack_with(|s| s.spec.cluster_admin = true);

        let built = reconcile_cluster_role(
            &store,
            &stack,
            common::SERVER_ROLE,
            &cluster_policy_rules_for(common::SERVER_ROLE),
        )
        .await
        .unwrap();
        assert!(built.is_some());
        let live = store
            .get::<rbacv1::ClusterRole>(None, "test-gitops-server")
            .await
            .unwrap()
            .expect("cluster role created");
        let annotations = live.metadata.annotations.unwrap();
        assert_eq!(annotations.get(common::NAME_ANNOTATION).unwrap(), "test");
        assert_eq!(
            annotations.get(common::NAMESPACE_ANNOTATION).unwrap(),
            "gitops"
        );

        // Dropping the flag deletes the cluster role.
        let plain = make_test_stack();
        let built = reconcile_cluster_role(
            &store,
            &plain,
            common::SERVER_ROLE,
            &cluster_policy_rules_for(common::SERVER_ROLE),
        )
        .await
        .unwrap();
        assert!(built.is_none());
        assert!(store
            .get::<rbacv1::ClusterRole>(None, "test-gitops-server")
            .await
            .unwrap()
            .is_none());
    }
}
