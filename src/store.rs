use async_trait::async_trait;
use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::api::rbac::v1 as rbacv1;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    Client,
};
use kube_client;
use kube_core::{self, Resource};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use thiserror::Error;

use crate::gitopsstack_types::GitOpsStack;

/// Store failures, classified so callers can react per class. Conflicts and
/// unavailability surface to the pass driver and end the pass; the scheduler
/// retries the whole pass later.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {message}")]
    NotFound { message: String },
    #[error("object already exists: {message}")]
    AlreadyExists { message: String },
    #[error("write conflicted with a concurrent update: {message}")]
    Conflict { message: String },
    #[error("object rejected by the API server: {message}")]
    Invalid { message: String },
    #[error("store unavailable: {0}")]
    Unavailable(#[source] kube::Error),
}

fn classify(e: kube::Error) -> StoreError {
    if let kube_client::Error::Api(kube_core::ErrorResponse {
        reason, message, ..
    }) = &e
    {
        match reason.as_str() {
            "NotFound" => {
                return StoreError::NotFound {
                    message: message.clone(),
                }
            }
            "AlreadyExists" => {
                return StoreError::AlreadyExists {
                    message: message.clone(),
                }
            }
            "Conflict" => {
                return StoreError::Conflict {
                    message: message.clone(),
                }
            }
            "Invalid" | "BadRequest" => {
                return StoreError::Invalid {
                    message: message.clone(),
                }
            }
            _ => {}
        }
    }
    StoreError::Unavailable(e)
}

/// Typed objects the store can hold. The `api` constructor hides the
/// namespaced/cluster scope split from generic call sites.
pub trait StoreObject:
    Resource<DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

macro_rules! namespaced_store_object {
    ($kind:ty) => {
        impl StoreObject for $kind {
            fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                match namespace {
                    Some(ns) => Api::namespaced(client, ns),
                    None => Api::all(client),
                }
            }
        }
    };
}

macro_rules! cluster_store_object {
    ($kind:ty) => {
        impl StoreObject for $kind {
            fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                Api::all(client)
            }
        }
    };
}

namespaced_store_object!(GitOpsStack);
namespaced_store_object!(corev1::ServiceAccount);
namespaced_store_object!(corev1::Secret);
namespaced_store_object!(corev1::Service);
namespaced_store_object!(appsv1::Deployment);
namespaced_store_object!(rbacv1::Role);
namespaced_store_object!(rbacv1::RoleBinding);
cluster_store_object!(corev1::Namespace);
cluster_store_object!(rbacv1::ClusterRole);
cluster_store_object!(rbacv1::ClusterRoleBinding);

/// The object store as the reconcile passes see it. Namespace is `None` for
/// cluster-scoped kinds and for cross-namespace lists.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<K>, StoreError>;

    async fn list<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>, StoreError>;

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<(), StoreError>;

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<(), StoreError>;

    /// Deleting an object that is already gone is not an error.
    async fn delete<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), StoreError>;
}

pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        KubeStore { client }
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn get<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<K>, StoreError> {
        let api = K::api(self.client.clone(), namespace);
        api.get_opt(name).await.map_err(classify)
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>, StoreError> {
        let api = K::api(self.client.clone(), namespace);
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector {
            lp = lp.labels(sel);
        }
        Ok(api.list(&lp).await.map_err(classify)?.items)
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<(), StoreError> {
        let api = K::api(self.client.clone(), obj.meta().namespace.as_deref());
        api.create(&PostParams::default(), obj)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<(), StoreError> {
        let name = obj.meta().name.clone().ok_or_else(|| StoreError::Invalid {
            message: "missing .metadata.name".to_string(),
        })?;
        let api = K::api(self.client.clone(), obj.meta().namespace.as_deref());
        api.replace(&name, &PostParams::default(), obj)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn delete<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), StoreError> {
        let api = K::api(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => match classify(e) {
                StoreError::NotFound { .. } => Ok(()),
                other => Err(other),
            },
        }
    }
}
