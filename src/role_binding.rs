use k8s_openapi::api::rbac::v1 as rbacv1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube_core::Resource;
use tracing::*;

use crate::common;
use crate::env::ProcessEnv;
use crate::gitopsstack_types::GitOpsStack;
use crate::role::{reconcile_role, reconcile_cluster_role};
use crate::service_account::reconcile_service_account;
use crate::store::{Store, StoreError};

pub fn make_role_binding(
    stack: &GitOpsStack,
    role_id: &str,
    namespace: &str,
    role_name: &str,
) -> rbacv1::RoleBinding {
    let name = common::resource_name(stack, role_id);
    let mut binding = rbacv1::RoleBinding {
        metadata: metav1::ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(common::app_labels(stack.metadata.name.as_ref().unwrap())),
            ..metav1::ObjectMeta::default()
        },
        role_ref: rbacv1::RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: role_name.to_string(),
        },
        subjects: Some(vec![rbacv1::Subject {
            kind: "ServiceAccount".to_string(),
            name: common::resource_name(stack, role_id),
            namespace: stack.meta().namespace.clone(),
            ..rbacv1::Subject::default()
        }]),
        ..rbacv1::RoleBinding::default()
    };
    if namespace == stack.metadata.namespace.as_deref().unwrap() {
        binding.metadata.owner_references = Some(vec![stack.controller_owner_ref(&()).unwrap()]);
    }
    binding
}

pub fn make_cluster_role_binding(stack: &GitOpsStack, role_id: &str) -> rbacv1::ClusterRoleBinding {
    rbacv1::ClusterRoleBinding {
        metadata: metav1::ObjectMeta {
            name: Some(common::cluster_resource_name(stack, role_id)),
            labels: Some(common::app_labels(stack.metadata.name.as_ref().unwrap())),
            annotations: Some(common::owner_annotations(stack)),
            ..metav1::ObjectMeta::default()
        },
        role_ref: rbacv1::RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: common::cluster_resource_name(stack, role_id),
        },
        subjects: Some(vec![rbacv1::Subject {
            kind: "ServiceAccount".to_string(),
            name: common::resource_name(stack, role_id),
            namespace: stack.meta().namespace.clone(),
            ..rbacv1::Subject::default()
        }]),
        ..rbacv1::ClusterRoleBinding::default()
    }
}

/// Reconcile one role's full permission chain across the governed namespaces:
/// identity first, then the rule objects, then the bindings linking them.
pub async fn reconcile_role_binding<S: Store>(
    store: &S,
    stack: &GitOpsStack,
    role_id: &str,
    rules: &[rbacv1::PolicyRule],
    namespaces: &[String],
    pcfg: &ProcessEnv,
) -> Result<(), StoreError> {
    reconcile_service_account(store, stack, role_id, pcfg).await?;
    let roles = reconcile_role(store, stack, role_id, rules, namespaces, pcfg).await?;
    let disabled = role_id == common::AUTH_PROXY_ROLE && pcfg.auth_proxy_disabled;

    for role in &roles {
        let ns = role.metadata.namespace.as_ref().unwrap();
        let desired = make_role_binding(stack, role_id, ns, role.metadata.name.as_ref().unwrap());
        let binding_name = desired.metadata.name.as_ref().unwrap();
        let live = store
            .get::<rbacv1::RoleBinding>(Some(ns.as_str()), binding_name)
            .await?;

        match live {
            None if disabled => continue,
            None => {
                info!("Create role binding: {}/{}", ns, binding_name);
                store.create(&desired).await?;
            }
            Some(_) if disabled => {
                info!("Delete role binding of disabled role id: {}/{}", ns, binding_name);
                store
                    .delete::<rbacv1::RoleBinding>(Some(ns.as_str()), binding_name)
                    .await?;
            }
            Some(existing) => {
                if existing.role_ref != desired.role_ref {
                    // The role ref is immutable on the API side. Delete the
                    // stale binding; the next pass recreates it fresh.
                    info!("Delete role binding with stale role ref: {}/{}", ns, binding_name);
                    store
                        .delete::<rbacv1::RoleBinding>(Some(ns.as_str()), binding_name)
                        .await?;
                } else if existing.subjects != desired.subjects {
                    info!("Update role binding subjects: {}/{}", ns, binding_name);
                    let updated = rbacv1::RoleBinding {
                        subjects: desired.subjects.clone(),
                        ..existing
                    };
                    store.update(&updated).await?;
                }
            }
        }
    }
    Ok(())
}

/// Reconcile the single cluster-scoped binding for `role_id`. `cluster_role`
/// is the output of the cluster rule step; `None` means the chain is disabled
/// and a live binding has to go.
pub async fn reconcile_cluster_role_binding<S: Store>(
    store: &S,
    stack: &GitOpsStack,
    role_id: &str,
    cluster_role: Option<&rbacv1::ClusterRole>,
) -> Result<(), StoreError> {
    let name = common::cluster_resource_name(stack, role_id);
    let live = store.get::<rbacv1::ClusterRoleBinding>(None, &name).await?;

    if cluster_role.is_none() {
        if live.is_some() {
            info!("Delete cluster role binding: {}", name);
            store.delete::<rbacv1::ClusterRoleBinding>(None, &name).await?;
        }
        return Ok(());
    }

    let mut desired = make_cluster_role_binding(stack, role_id);
    // Kept uniform with the namespaced chain; never true at cluster scope, so
    // these bindings are cleaned up explicitly on stack deletion.
    if desired.metadata.namespace == stack.metadata.namespace {
        desired.metadata.owner_references = Some(vec![stack.controller_owner_ref(&()).unwrap()]);
    }

    match live {
        Some(existing) => {
            if existing.role_ref != desired.role_ref || existing.subjects != desired.subjects {
                info!("Update cluster role binding: {}", name);
                let updated = rbacv1::ClusterRoleBinding {
                    role_ref: desired.role_ref.clone(),
                    subjects: desired.subjects.clone(),
                    ..existing
                };
                store.update(&updated).await?;
            }
        }
        None => {
            info!("Create cluster role binding: {}", name);
            store.create(&desired).await?;
        }
    }
    Ok(())
}

/// Full cluster-scoped chain for one role id, gated by the clusterAdmin flag.
pub async fn reconcile_cluster_permissions<S: Store>(
    store: &S,
    stack: &GitOpsStack,
    role_id: &str,
    rules: &[rbacv1::PolicyRule],
) -> Result<(), StoreError> {
    let cluster_role = reconcile_cluster_role(store, stack, role_id, rules).await?;
    reconcile_cluster_role_binding(store, stack, role_id, cluster_role.as_ref()).await
}
