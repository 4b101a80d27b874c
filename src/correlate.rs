use std::collections::BTreeMap;

use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::Resource;
use tracing::*;

use crate::common;
use crate::gitopsstack_types::GitOpsStack;
use crate::store::Store;

/// Identity of the stack a secondary object belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationKey {
    pub name: String,
    pub namespace: String,
}

/// The fields of a changed secondary object that correlation inspects,
/// detached from the concrete resource type.
#[derive(Debug, Clone, Default)]
pub struct SecondaryObject {
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub owner_references: Vec<metav1::OwnerReference>,
}

impl SecondaryObject {
    pub fn from_resource<K: Resource<DynamicType = ()>>(obj: &K) -> Self {
        let meta = obj.meta();
        SecondaryObject {
            kind: K::kind(&()).to_string(),
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone(),
            annotations: meta.annotations.clone().unwrap_or_default(),
            labels: meta.labels.clone().unwrap_or_default(),
            owner_references: meta.owner_references.clone().unwrap_or_default(),
        }
    }
}

/// Reads the owner annotation pair. Usable from a synchronous watch mapper,
/// where the store-backed strategies cannot run.
pub fn annotation_key(annotations: &BTreeMap<String, String>) -> Option<CorrelationKey> {
    let name = annotations.get(common::NAME_ANNOTATION)?;
    let namespace = annotations.get(common::NAMESPACE_ANNOTATION)?;
    if name.is_empty() || namespace.is_empty() {
        return None;
    }
    Some(CorrelationKey {
        name: name.clone(),
        namespace: namespace.clone(),
    })
}

/// Maps a changed secondary object to the stack that owns it, or to nothing.
/// Strategies are ordered; the first one whose predicate matches decides the
/// outcome, even when that outcome is "no target".
pub async fn correlate<S: Store>(store: &S, obj: &SecondaryObject) -> Option<CorrelationKey> {
    if let Some(key) = annotation_key(&obj.annotations) {
        return Some(key);
    }
    if obj.kind == "Secret" && obj.name.ends_with(common::REPO_SERVER_TLS_SUFFIX) {
        return follow_tls_secret(store, obj).await;
    }
    if obj.kind == "Namespace" {
        if let Some(managing_ns) = obj.labels.get(common::MANAGED_BY_LABEL) {
            if !managing_ns.is_empty() {
                return from_managed_namespace(store, obj, managing_ns).await;
            }
        }
    }
    None
}

/// One hop through the owning repo server service. A controller-issued TLS
/// secret is owned by that service, which in turn is owned by the stack.
async fn follow_tls_secret<S: Store>(store: &S, secret: &SecondaryObject) -> Option<CorrelationKey> {
    let namespace = secret.namespace.as_deref()?;
    if secret.owner_references.is_empty() {
        // Manually created secret. The name annotation identifies the stack,
        // scoped to the secret's own namespace.
        let name = secret.annotations.get(common::NAME_ANNOTATION)?;
        if name.is_empty() {
            return None;
        }
        return Some(CorrelationKey {
            name: name.clone(),
            namespace: namespace.to_string(),
        });
    }
    let service_ref = secret
        .owner_references
        .iter()
        .find(|r| r.kind == "Service" && r.name.ends_with(common::REPO_SERVER_SUFFIX))?;
    let service = match store
        .get::<corev1::Service>(Some(namespace), &service_ref.name)
        .await
    {
        Ok(svc) => svc?,
        Err(e) => {
            warn!(
                "Drop event for secret {}: looking up service {} failed: {}",
                secret.name, service_ref.name, e
            );
            return None;
        }
    };
    let owner = service
        .metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.kind == "GitOpsStack")?;
    Some(CorrelationKey {
        name: owner.name.clone(),
        namespace: service
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| namespace.to_string()),
    })
}

async fn from_managed_namespace<S: Store>(
    store: &S,
    obj: &SecondaryObject,
    managing_ns: &str,
) -> Option<CorrelationKey> {
    let stacks = match store.list::<GitOpsStack>(Some(managing_ns), None).await {
        Ok(stacks) => stacks,
        Err(e) => {
            warn!(
                "Drop event for namespace {}: listing stacks in {} failed: {}",
                obj.name, managing_ns, e
            );
            return None;
        }
    };
    if stacks.len() != 1 {
        debug!(
            "Namespace {} maps to {} stacks in {}; refusing to guess",
            obj.name,
            stacks.len(),
            managing_ns
        );
        return None;
    }
    Some(CorrelationKey {
        name: common::stack_name(&stacks[0]),
        namespace: common::stack_namespace(&stacks[0]),
    })
}
