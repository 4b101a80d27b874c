use crate::gitopsstack_types::GitOpsStack;
use std::collections::BTreeMap;

// Label and annotation keys shared across all managed resources.
pub const APP_LABEL: &str = "app";
pub const MANAGED_BY_LABEL: &str = "gitops.anvil.dev/managed-by";
pub const NAME_ANNOTATION: &str = "gitops.anvil.dev/name";
pub const NAMESPACE_ANNOTATION: &str = "gitops.anvil.dev/namespace";
pub const FINALIZER: &str = "gitopsstack.anvil.dev/finalizer";

// Role identifiers for the permission chain.
pub const CONTROLLER_ROLE: &str = "controller";
pub const SERVER_ROLE: &str = "server";
pub const AUTH_PROXY_ROLE: &str = "auth-proxy";
pub const CACHE_HA_ROLE: &str = "cache-ha";

// Every role identifier, in the order the permission chains are reconciled.
pub const ROLE_IDS: [&str; 4] = [CONTROLLER_ROLE, AUTH_PROXY_ROLE, CACHE_HA_ROLE, SERVER_ROLE];

// Roles that also get a cluster-scoped chain when clusterAdmin is set.
pub const CLUSTER_ROLE_IDS: [&str; 2] = [CONTROLLER_ROLE, SERVER_ROLE];

pub const EXEC_TIMEOUT_ENV: &str = "GITOPS_EXEC_TIMEOUT";

pub const REPO_SERVER_SUFFIX: &str = "-repo-server";
pub const REPO_SERVER_TLS_SUFFIX: &str = "-repo-server-tls";

// Shared configuration sources mounted into the repo server.
pub const SSH_KNOWN_HOSTS_CONFIGMAP: &str = "gitops-ssh-known-hosts-cm";
pub const TLS_CERTS_CONFIGMAP: &str = "gitops-tls-certs-cm";
pub const GPG_KEYS_CONFIGMAP: &str = "gitops-gpg-keys-cm";

pub const DEFAULT_IMAGE: &str = "quay.io/anvil/gitops";
pub const DEFAULT_VERSION: &str = "v2.6.3";
pub const DEFAULT_AUTH_PROXY_IMAGE: &str = "ghcr.io/anvil/auth-proxy";
pub const DEFAULT_AUTH_PROXY_VERSION: &str = "v2.35.3";
pub const DEFAULT_CACHE_IMAGE: &str = "redis";
pub const DEFAULT_CACHE_VERSION: &str = "7.0.8-alpine";
pub const DEFAULT_CACHE_HA_PROXY_IMAGE: &str = "haproxy";
pub const DEFAULT_CACHE_HA_PROXY_VERSION: &str = "2.6.9-alpine";

pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_LOG_FORMAT: &str = "text";

pub fn stack_name(stack: &GitOpsStack) -> String {
    stack.metadata.name.as_ref().unwrap().clone()
}

pub fn stack_namespace(stack: &GitOpsStack) -> String {
    stack.metadata.namespace.as_ref().unwrap().clone()
}

/// Name of a namespaced resource generated for `id`, e.g. `<name>-server`.
pub fn resource_name(stack: &GitOpsStack, id: &str) -> String {
    stack.metadata.name.as_ref().unwrap().clone() + "-" + id
}

/// Name of a cluster-scoped resource generated for `id`. The stack namespace
/// is folded in so two stacks with the same name never collide.
pub fn cluster_resource_name(stack: &GitOpsStack, id: &str) -> String {
    format!(
        "{}-{}-{}",
        stack.metadata.name.as_ref().unwrap(),
        stack.metadata.namespace.as_ref().unwrap(),
        id
    )
}

pub fn repo_server_name(stack: &GitOpsStack) -> String {
    stack.metadata.name.as_ref().unwrap().clone() + REPO_SERVER_SUFFIX
}

pub fn repo_server_tls_secret_name(stack: &GitOpsStack) -> String {
    stack.metadata.name.as_ref().unwrap().clone() + REPO_SERVER_TLS_SUFFIX
}

pub fn auth_proxy_name(stack: &GitOpsStack) -> String {
    resource_name(stack, "auth-proxy")
}

pub fn cache_name(stack: &GitOpsStack) -> String {
    resource_name(stack, "cache")
}

pub fn cache_ha_proxy_name(stack: &GitOpsStack) -> String {
    resource_name(stack, "cache-ha-proxy")
}

pub fn server_name(stack: &GitOpsStack) -> String {
    resource_name(stack, "server")
}

pub fn repo_server_addr(stack: &GitOpsStack) -> String {
    format!(
        "{}.{}.svc.cluster.local:8081",
        repo_server_name(stack),
        stack.metadata.namespace.as_ref().unwrap()
    )
}

pub fn auth_proxy_addr(stack: &GitOpsStack) -> String {
    format!(
        "http://{}.{}.svc.cluster.local:5556",
        auth_proxy_name(stack),
        stack.metadata.namespace.as_ref().unwrap()
    )
}

/// Address the API and repo servers use to reach the cache. Points at the
/// balancer when HA is enabled, at the plain cache server otherwise.
pub fn cache_addr(stack: &GitOpsStack) -> String {
    let svc = if stack.spec.ha.enabled {
        cache_ha_proxy_name(stack)
    } else {
        cache_name(stack)
    };
    format!(
        "{}.{}.svc.cluster.local:6379",
        svc,
        stack.metadata.namespace.as_ref().unwrap()
    )
}

pub fn app_labels(value: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), value.to_string())])
}

/// Annotations stamped on cluster-scoped resources so events on them can be
/// traced back to the owning stack.
pub fn owner_annotations(stack: &GitOpsStack) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            NAME_ANNOTATION.to_string(),
            stack.metadata.name.as_ref().unwrap().clone(),
        ),
        (
            NAMESPACE_ANNOTATION.to_string(),
            stack.metadata.namespace.as_ref().unwrap().clone(),
        ),
    ])
}
