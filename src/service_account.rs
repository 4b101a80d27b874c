use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube_core::Resource;
use tracing::*;

use crate::common;
use crate::env::ProcessEnv;
use crate::gitopsstack_types::GitOpsStack;
use crate::store::{Store, StoreError};

pub fn make_service_account(stack: &GitOpsStack, role_id: &str) -> corev1::ServiceAccount {
    corev1::ServiceAccount {
        metadata: metav1::ObjectMeta {
            name: Some(common::resource_name(stack, role_id)),
            namespace: stack.meta().namespace.clone(),
            labels: Some(common::app_labels(stack.metadata.name.as_ref().unwrap())),
            owner_references: Some(vec![stack.controller_owner_ref(&()).unwrap()]),
            ..metav1::ObjectMeta::default()
        },
        ..corev1::ServiceAccount::default()
    }
}

/// Ensure the identity for a permission chain role. A disabled optional role
/// loses its existing identity and is not recreated. The built identity is
/// returned either way so binding subjects can reference it.
pub async fn reconcile_service_account<S: Store>(
    store: &S,
    stack: &GitOpsStack,
    role_id: &str,
    pcfg: &ProcessEnv,
) -> Result<corev1::ServiceAccount, StoreError> {
    let sa = make_service_account(stack, role_id);
    let sa_name = sa.metadata.name.as_ref().unwrap();
    let ns = common::stack_namespace(stack);
    let disabled = role_id == common::AUTH_PROXY_ROLE && pcfg.auth_proxy_disabled;

    let live = store
        .get::<corev1::ServiceAccount>(Some(ns.as_str()), sa_name)
        .await?;
    match live {
        Some(_) if disabled => {
            info!("Delete service account of disabled role: {}", sa_name);
            store
                .delete::<corev1::ServiceAccount>(Some(ns.as_str()), sa_name)
                .await?;
        }
        Some(_) => {}
        None if disabled => {}
        None => {
            info!("Create service account: {}", sa_name);
            store.create(&sa).await?;
        }
    }
    Ok(sa)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    #[tokio::test]
    async fn creates_identity_once() {
        let store = MemStore::new();
        let stack = make_test_stack();
        let pcfg = ProcessEnv::default();

        let sa = reconcile_service_account(&store, &stack, common::SERVER_ROLE, &pcfg)
            .await
            .unwrap();
        assert_eq!(sa.metadata.name.as_deref(), Some("test-server"));
        assert_eq!(store.writes().creates, 1);

        store.reset_writes();
        reconcile_service_account(&store, &stack, common::SERVER_ROLE, &pcfg)
            .await
            .unwrap();
        assert_eq!(store.writes().total(), 0);
    }

    #[tokio::test]
    async fn disabled_role_deletes_existing_identity() {
        let store = MemStore::new();
        let stack = make_test_stack();
        let pcfg = ProcessEnv::default();
        reconcile_service_account(&store, &stack, common::AUTH_PROXY_ROLE, &pcfg)
            .await
            .unwrap();
        assert!(store
            .get::<corev1::ServiceAccount>(Some("gitops"), "test-auth-proxy")
            .await
            .unwrap()
            .is_some());

        let disabled = ProcessEnv {
            auth_proxy_disabled: true,
            ..ProcessEnv::default()
        };
        reconcile_service_account(&store, &stack, common::AUTH_PROXY_ROLE, &disabled)
            .await
            .unwrap();
        assert!(store
            .get::<corev1::ServiceAccount>(Some("gitops"), "test-auth-proxy")
            .await
            .unwrap()
            .is_none());

        // Stays gone while disabled.
        store.reset_writes();
        reconcile_service_account(&store, &stack, common::AUTH_PROXY_ROLE, &disabled)
            .await
            .unwrap();
        assert_eq!(store.writes().total(), 0);
    }
}
