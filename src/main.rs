#![allow(clippy::unnecessary_lazy_evaluations)]

pub mod common;
pub mod correlate;
pub mod deployment;
pub mod env;
pub mod gitopsstack_types;
pub mod resources;
pub mod role;
pub mod role_binding;
pub mod service_account;
pub mod store;
#[cfg(test)]
mod testutil;

use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::api::rbac::v1 as rbacv1;
use kube::{
    api::{Api, ListParams},
    runtime::controller::{Action, Controller},
    runtime::reflector::ObjectRef,
    runtime::watcher,
    Client, CustomResourceExt,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Duration;
use tracing::*;

use crate::correlate::SecondaryObject;
use crate::env::ProcessEnv;
use crate::gitopsstack_types::*;
use crate::store::{KubeStore, Store, StoreError, StoreObject};

#[derive(Debug, Error)]
enum Error {
    #[error("Failed to get CR: {0}")]
    CRGetFailed(#[source] StoreError),
    #[error("Failed to update CR finalizers: {0}")]
    FinalizerUpdateFailed(#[source] StoreError),
    #[error("Failed to list governed namespaces: {0}")]
    GovernedNamespacesFailed(#[source] StoreError),
    #[error("Failed to reconcile permissions of role {0}: {1}")]
    ReconcilePermissionsFailed(&'static str, #[source] StoreError),
    #[error("Failed to reconcile cluster permissions of role {0}: {1}")]
    ReconcileClusterPermissionsFailed(&'static str, #[source] StoreError),
    #[error("Failed to reconcile Deployment of {0}: {1}")]
    ReconcileDeploymentFailed(&'static str, #[source] StoreError),
    #[error("Failed to finalize stack: {0}")]
    FinalizeFailed(#[source] StoreError),
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
}

async fn ensure_finalizer<S: Store>(store: &S, stack: &GitOpsStack) -> Result<(), Error> {
    let mut finalizers = stack.metadata.finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|f| f == common::FINALIZER) {
        return Ok(());
    }
    info!("Add finalizer to stack: {}", common::stack_name(stack));
    finalizers.push(common::FINALIZER.to_string());
    let mut updated = stack.clone();
    updated.metadata.finalizers = Some(finalizers);
    store
        .update(&updated)
        .await
        .map_err(Error::FinalizerUpdateFailed)
}

/// Tear down everything owner references cannot reach: the cluster-scoped
/// chains and the RBAC placed in governed namespaces other than the stack's
/// own. Objects in the stack namespace ride on their owner references.
async fn finalize<S: Store>(store: &S, stack: &GitOpsStack) -> Result<(), Error> {
    let finalizers = stack.metadata.finalizers.clone().unwrap_or_default();
    if !finalizers.iter().any(|f| f == common::FINALIZER) {
        return Ok(());
    }
    info!("Finalize stack: {}", common::stack_name(stack));

    for role_id in common::CLUSTER_ROLE_IDS {
        let name = common::cluster_resource_name(stack, role_id);
        store
            .delete::<rbacv1::ClusterRoleBinding>(None, &name)
            .await
            .map_err(Error::FinalizeFailed)?;
        store
            .delete::<rbacv1::ClusterRole>(None, &name)
            .await
            .map_err(Error::FinalizeFailed)?;
    }

    let stack_ns = common::stack_namespace(stack);
    let namespaces = role::governed_namespaces(store, stack)
        .await
        .map_err(Error::FinalizeFailed)?;
    for ns in namespaces.iter().filter(|ns| **ns != stack_ns) {
        for role_id in common::ROLE_IDS {
            let name = common::resource_name(stack, role_id);
            store
                .delete::<rbacv1::RoleBinding>(Some(ns.as_str()), &name)
                .await
                .map_err(Error::FinalizeFailed)?;
            store
                .delete::<rbacv1::Role>(Some(ns.as_str()), &name)
                .await
                .map_err(Error::FinalizeFailed)?;
        }
    }

    let mut updated = stack.clone();
    let remaining: Vec<String> = finalizers
        .into_iter()
        .filter(|f| f != common::FINALIZER)
        .collect();
    updated.metadata.finalizers = if remaining.is_empty() {
        None
    } else {
        Some(remaining)
    };
    store
        .update(&updated)
        .await
        .map_err(Error::FinalizerUpdateFailed)
}

/// One full reconciliation pass: permission chains for every role id across
/// the governed namespaces, the cluster-scoped chains, then the workloads.
async fn run_pass<S: Store>(
    store: &S,
    stack: &GitOpsStack,
    pcfg: &ProcessEnv,
) -> Result<(), Error> {
    if stack.metadata.deletion_timestamp.is_some() {
        return finalize(store, stack).await;
    }
    ensure_finalizer(store, stack).await?;

    let namespaces = role::governed_namespaces(store, stack)
        .await
        .map_err(Error::GovernedNamespacesFailed)?;
    for role_id in common::ROLE_IDS {
        role_binding::reconcile_role_binding(
            store,
            stack,
            role_id,
            &role::policy_rules_for(role_id),
            &namespaces,
            pcfg,
        )
        .await
        .map_err(|e| Error::ReconcilePermissionsFailed(role_id, e))?;
    }
    for role_id in common::CLUSTER_ROLE_IDS {
        role_binding::reconcile_cluster_permissions(
            store,
            stack,
            role_id,
            &role::cluster_policy_rules_for(role_id),
        )
        .await
        .map_err(|e| Error::ReconcileClusterPermissionsFailed(role_id, e))?;
    }

    deployment::reconcile_repo_server(store, stack, pcfg)
        .await
        .map_err(|e| Error::ReconcileDeploymentFailed("repo-server", e))?;
    deployment::reconcile_auth_proxy(store, stack, pcfg)
        .await
        .map_err(|e| Error::ReconcileDeploymentFailed("auth-proxy", e))?;
    deployment::reconcile_cache(store, stack, pcfg)
        .await
        .map_err(|e| Error::ReconcileDeploymentFailed("cache", e))?;
    deployment::reconcile_cache_ha_proxy(store, stack, pcfg)
        .await
        .map_err(|e| Error::ReconcileDeploymentFailed("cache-ha-proxy", e))?;
    deployment::reconcile_server(store, stack, pcfg)
        .await
        .map_err(|e| Error::ReconcileDeploymentFailed("server", e))?;
    Ok(())
}

/// Controller triggers this whenever our main object or our children changed
async fn reconcile(stack_from_cache: Arc<GitOpsStack>, ctx: Arc<Data>) -> Result<Action, Error> {
    let store = &ctx.store;

    let stack_name = stack_from_cache
        .metadata
        .name
        .as_ref()
        .ok_or_else(|| Error::MissingObjectKey(".metadata.name"))?;
    let stack_ns = stack_from_cache
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| Error::MissingObjectKey(".metadata.namespace"))?;

    // Get the GitOpsStack custom resource before taking any reconciliation
    // actions; the cached copy may be stale.
    let stack = match store.get::<GitOpsStack>(Some(stack_ns), stack_name).await {
        Ok(Some(stack)) => stack,
        Ok(None) => {
            info!("{} not found, end reconcile", stack_name);
            return Ok(Action::await_change());
        }
        Err(e) => return Err(Error::CRGetFailed(e)),
    };

    let pcfg = ProcessEnv::capture();
    run_pass(store, &stack, &pcfg).await?;

    Ok(Action::requeue(Duration::from_secs(60)))
}

/// The controller triggers this on reconcile errors
fn error_policy(_object: Arc<GitOpsStack>, error: &Error, _ctx: Arc<Data>) -> Action {
    warn!("Reconcile failed due to error: {}", error);
    Action::requeue(Duration::from_secs(10))
}

// Data we want access to in error/reconcile calls
struct Data {
    store: KubeStore,
}

/// Maps a cluster-scoped object to the stack named by its owner annotations.
fn cluster_scoped_mapper(
    annotations: Option<&BTreeMap<String, String>>,
) -> Option<ObjectRef<GitOpsStack>> {
    annotations
        .and_then(correlate::annotation_key)
        .map(|key| ObjectRef::new(&key.name).within(&key.namespace))
}

async fn handle_secondary_event<S: Store>(store: &S, obj: &SecondaryObject) {
    let key = match correlate::correlate(store, obj).await {
        Some(key) => key,
        None => return,
    };
    debug!(
        "{} {} correlates to stack {}/{}",
        obj.kind, obj.name, key.namespace, key.name
    );
    let stack = match store
        .get::<GitOpsStack>(Some(key.namespace.as_str()), &key.name)
        .await
    {
        Ok(Some(stack)) => stack,
        Ok(None) => return,
        Err(e) => {
            warn!("Failed to get stack {}/{}: {}", key.namespace, key.name, e);
            return;
        }
    };
    let pcfg = ProcessEnv::capture();
    if let Err(e) = run_pass(store, &stack, &pcfg).await {
        warn!(
            "Pass triggered by {} {} failed: {}",
            obj.kind, obj.name, e
        );
    }
}

/// Watches a secondary kind the controller relation machinery cannot map on
/// its own and runs a pass for whichever stack each event correlates to.
async fn watch_secondary<K: StoreObject>(client: Client, store: Arc<KubeStore>) {
    let api = K::api(client, None);
    let mut stream = watcher(api, ListParams::default()).boxed();
    while let Some(event) = stream.next().await {
        let objects = match event {
            Ok(watcher::Event::Applied(obj)) => vec![obj],
            Ok(watcher::Event::Deleted(obj)) => vec![obj],
            Ok(watcher::Event::Restarted(objects)) => objects,
            Err(e) => {
                warn!("Secondary watch failed: {}", e);
                continue;
            }
        };
        for obj in objects {
            handle_secondary_event(store.as_ref(), &SecondaryObject::from_resource(&obj)).await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let cmd = args[1].clone();
    if cmd == String::from("export") {
        info!("exporting custom resource definition");
        println!("{}", serde_yaml::to_string(&GitOpsStack::crd())?);
    } else if cmd == String::from("run") {
        info!("running gitops-controller");
        let client = Client::try_default().await?;
        let stacks = Api::<GitOpsStack>::all(client.clone());

        let watch_store = Arc::new(KubeStore::new(client.clone()));
        tokio::spawn(watch_secondary::<corev1::Secret>(
            client.clone(),
            watch_store.clone(),
        ));
        tokio::spawn(watch_secondary::<corev1::Namespace>(
            client.clone(),
            watch_store,
        ));

        Controller::new(stacks, ListParams::default())
            .owns(
                Api::<appsv1::Deployment>::all(client.clone()),
                ListParams::default(),
            )
            .owns(
                Api::<corev1::ServiceAccount>::all(client.clone()),
                ListParams::default(),
            )
            .owns(
                Api::<rbacv1::Role>::all(client.clone()),
                ListParams::default(),
            )
            .owns(
                Api::<rbacv1::RoleBinding>::all(client.clone()),
                ListParams::default(),
            )
            .watches(
                Api::<rbacv1::ClusterRole>::all(client.clone()),
                ListParams::default(),
                |cr| cluster_scoped_mapper(cr.metadata.annotations.as_ref()),
            )
            .watches(
                Api::<rbacv1::ClusterRoleBinding>::all(client.clone()),
                ListParams::default(),
                |crb| cluster_scoped_mapper(crb.metadata.annotations.as_ref()),
            )
            .shutdown_on_signal()
            .run(
                reconcile,
                error_policy,
                Arc::new(Data {
                    store: KubeStore::new(client),
                }),
            )
            .for_each(|res| async move {
                match res {
                    Ok(o) => info!("reconciled {:?}", o),
                    Err(e) => warn!("reconcile failed: {}", e),
                }
            })
            .await;
        info!("controller terminated");
    } else {
        warn!("wrong command; please use \"export\" or \"run\"");
    }
    Ok(())
}
