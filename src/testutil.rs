use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube_core::Resource;

use crate::common;
use crate::gitopsstack_types::{GitOpsStack, GitOpsStackSpec};
use crate::store::{Store, StoreError, StoreObject};

pub fn make_test_stack() -> GitOpsStack {
    let mut stack = GitOpsStack::new("test", GitOpsStackSpec::default());
    stack.metadata.namespace = Some("gitops".to_string());
    stack.metadata.uid = Some("d50bb743-51aa-4231-a6e4-e3ba9a7d6b5e".to_string());
    stack
}

pub fn make_test_stack_with(f: impl FnOnce(&mut GitOpsStack)) -> GitOpsStack {
    let mut stack = make_test_stack();
    f(&mut stack);
    stack
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteCounts {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl WriteCounts {
    pub fn total(&self) -> usize {
        self.creates + self.updates + self.deletes
    }
}

type Key = (String, Option<String>, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, serde_json::Value>,
    writes: WriteCounts,
    unavailable: bool,
    rv: u64,
}

/// In-memory store double. Keyed by (kind, namespace, name), counts effective
/// writes, and can simulate a store outage.
pub struct MemStore {
    inner: Mutex<Inner>,
}

fn key_of<K: StoreObject>(namespace: Option<&str>, name: &str) -> Key {
    (
        K::kind(&()).to_string(),
        namespace.map(str::to_string),
        name.to_string(),
    )
}

fn unavailable() -> StoreError {
    StoreError::Unavailable(kube::Error::Api(kube_core::ErrorResponse {
        status: "Failure".to_string(),
        message: "injected outage".to_string(),
        reason: "ServiceUnavailable".to_string(),
        code: 503,
    }))
}

fn matches_selector(obj: &serde_json::Value, selector: Option<&str>) -> bool {
    match selector {
        None => true,
        Some(sel) => match sel.split_once('=') {
            Some((k, v)) => {
                obj.pointer("/metadata/labels")
                    .and_then(|labels| labels.get(k))
                    .and_then(|value| value.as_str())
                    == Some(v)
            }
            None => false,
        },
    }
}

impl MemStore {
    pub fn new() -> Self {
        MemStore {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn writes(&self) -> WriteCounts {
        self.inner.lock().unwrap().writes
    }

    pub fn reset_writes(&self) {
        self.inner.lock().unwrap().writes = WriteCounts::default();
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unwrap().unavailable = unavailable;
    }

    /// Seeds a namespace without touching the write counters.
    pub async fn put_namespace(&self, name: &str, managed_by: Option<&str>) {
        let labels = managed_by.map(|managing_ns| {
            BTreeMap::from([(common::MANAGED_BY_LABEL.to_string(), managing_ns.to_string())])
        });
        let mut ns = corev1::Namespace {
            metadata: metav1::ObjectMeta {
                name: Some(name.to_string()),
                labels,
                ..metav1::ObjectMeta::default()
            },
            ..corev1::Namespace::default()
        };
        let mut inner = self.inner.lock().unwrap();
        inner.rv += 1;
        ns.metadata.resource_version = Some(inner.rv.to_string());
        inner.objects.insert(
            key_of::<corev1::Namespace>(None, name),
            serde_json::to_value(&ns).unwrap(),
        );
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<K>, StoreError> {
        let inner = self.inner.lock().unwrap();
        if inner.unavailable {
            return Err(unavailable());
        }
        Ok(inner
            .objects
            .get(&key_of::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap()))
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>, StoreError> {
        let inner = self.inner.lock().unwrap();
        if inner.unavailable {
            return Err(unavailable());
        }
        let kind = K::kind(&()).to_string();
        Ok(inner
            .objects
            .iter()
            .filter(|((k, ns, _), _)| {
                *k == kind && namespace.map_or(true, |want| ns.as_deref() == Some(want))
            })
            .filter(|(_, v)| matches_selector(v, label_selector))
            .map(|(_, v)| serde_json::from_value(v.clone()).unwrap())
            .collect())
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unavailable {
            return Err(unavailable());
        }
        let name = obj.meta().name.clone().unwrap_or_default();
        let key = key_of::<K>(obj.meta().namespace.as_deref(), &name);
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists { message: name });
        }
        let mut obj = obj.clone();
        inner.rv += 1;
        obj.meta_mut().resource_version = Some(inner.rv.to_string());
        inner.objects.insert(key, serde_json::to_value(&obj).unwrap());
        inner.writes.creates += 1;
        Ok(())
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unavailable {
            return Err(unavailable());
        }
        let name = obj.meta().name.clone().unwrap_or_default();
        let key = key_of::<K>(obj.meta().namespace.as_deref(), &name);
        if !inner.objects.contains_key(&key) {
            return Err(StoreError::NotFound { message: name });
        }
        let mut obj = obj.clone();
        inner.rv += 1;
        obj.meta_mut().resource_version = Some(inner.rv.to_string());
        inner.objects.insert(key, serde_json::to_value(&obj).unwrap());
        inner.writes.updates += 1;
        Ok(())
    }

    async fn delete<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unavailable {
            return Err(unavailable());
        }
        if inner.objects.remove(&key_of::<K>(namespace, name)).is_some() {
            inner.writes.deletes += 1;
        }
        Ok(())
    }
}
