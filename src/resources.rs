use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube_core::Resource;

use crate::common;
use crate::env::{env_merge, env_var, ProcessEnv};
use crate::gitopsstack_types::GitOpsStack;

/// Image for product components: component override, stack-level override,
/// then the built-in default. Tag resolves the same way.
fn product_image(
    stack: &GitOpsStack,
    image: &Option<String>,
    version: &Option<String>,
) -> String {
    let img = image
        .clone()
        .or_else(|| stack.spec.image.clone())
        .unwrap_or_else(|| common::DEFAULT_IMAGE.to_string());
    let tag = version
        .clone()
        .or_else(|| stack.spec.version.clone())
        .unwrap_or_else(|| common::DEFAULT_VERSION.to_string());
    img + ":" + &tag
}

fn auth_proxy_image(stack: &GitOpsStack) -> String {
    let img = stack
        .spec
        .auth_proxy
        .image
        .clone()
        .unwrap_or_else(|| common::DEFAULT_AUTH_PROXY_IMAGE.to_string());
    let tag = stack
        .spec
        .auth_proxy
        .version
        .clone()
        .unwrap_or_else(|| common::DEFAULT_AUTH_PROXY_VERSION.to_string());
    img + ":" + &tag
}

fn cache_image(stack: &GitOpsStack) -> String {
    let img = stack
        .spec
        .cache
        .image
        .clone()
        .unwrap_or_else(|| common::DEFAULT_CACHE_IMAGE.to_string());
    let tag = stack
        .spec
        .cache
        .version
        .clone()
        .unwrap_or_else(|| common::DEFAULT_CACHE_VERSION.to_string());
    img + ":" + &tag
}

fn cache_ha_proxy_image(stack: &GitOpsStack) -> String {
    let img = stack
        .spec
        .ha
        .image
        .clone()
        .unwrap_or_else(|| common::DEFAULT_CACHE_HA_PROXY_IMAGE.to_string());
    let tag = stack
        .spec
        .ha
        .version
        .clone()
        .unwrap_or_else(|| common::DEFAULT_CACHE_HA_PROXY_VERSION.to_string());
    img + ":" + &tag
}

fn env_opt(env: Vec<corev1::EnvVar>) -> Option<Vec<corev1::EnvVar>> {
    if env.is_empty() {
        None
    } else {
        Some(env)
    }
}

/// Repo server environment: spec-declared entries, then the exec timeout
/// entry which replaces even an explicit same-named entry, then the proxy
/// entries which never replace anything.
fn repo_server_env(stack: &GitOpsStack, pcfg: &ProcessEnv) -> Vec<corev1::EnvVar> {
    let mut env = stack.spec.repo.env.clone().unwrap_or_default();
    if let Some(timeout) = stack.spec.repo.exec_timeout {
        env = env_merge(
            &env,
            &[env_var(common::EXEC_TIMEOUT_ENV, &timeout.to_string())],
            true,
        );
    }
    env_merge(&env, &pcfg.proxy_env_vars(), false)
}

fn server_env(stack: &GitOpsStack, pcfg: &ProcessEnv) -> Vec<corev1::EnvVar> {
    let env = stack.spec.server.env.clone().unwrap_or_default();
    env_merge(&env, &pcfg.proxy_env_vars(), false)
}

fn auth_proxy_env(stack: &GitOpsStack, pcfg: &ProcessEnv) -> Vec<corev1::EnvVar> {
    let env = stack.spec.auth_proxy.env.clone().unwrap_or_default();
    env_merge(&env, &pcfg.proxy_env_vars(), false)
}

fn make_deployment(stack: &GitOpsStack, name: String, pod_spec: corev1::PodSpec) -> appsv1::Deployment {
    appsv1::Deployment {
        metadata: metav1::ObjectMeta {
            name: Some(name.clone()),
            namespace: stack.meta().namespace.clone(),
            labels: Some(common::app_labels(&name)),
            owner_references: Some(vec![stack.controller_owner_ref(&()).unwrap()]),
            ..metav1::ObjectMeta::default()
        },
        spec: Some(appsv1::DeploymentSpec {
            selector: metav1::LabelSelector {
                match_labels: Some(common::app_labels(&name)),
                ..metav1::LabelSelector::default()
            },
            template: corev1::PodTemplateSpec {
                metadata: Some(metav1::ObjectMeta {
                    labels: Some(common::app_labels(&name)),
                    ..metav1::ObjectMeta::default()
                }),
                spec: Some(pod_spec),
            },
            ..appsv1::DeploymentSpec::default()
        }),
        ..appsv1::Deployment::default()
    }
}

fn apply_node_placement(pod_spec: &mut corev1::PodSpec, stack: &GitOpsStack) {
    if let Some(np) = &stack.spec.node_placement {
        pod_spec.node_selector = np.node_selector.clone();
        pod_spec.tolerations = np.tolerations.clone();
    }
}

pub fn repo_server_volumes(stack: &GitOpsStack) -> Vec<corev1::Volume> {
    vec![
        corev1::Volume {
            name: "ssh-known-hosts".to_string(),
            config_map: Some(corev1::ConfigMapVolumeSource {
                name: Some(common::SSH_KNOWN_HOSTS_CONFIGMAP.to_string()),
                ..corev1::ConfigMapVolumeSource::default()
            }),
            ..corev1::Volume::default()
        },
        corev1::Volume {
            name: "tls-certs".to_string(),
            config_map: Some(corev1::ConfigMapVolumeSource {
                name: Some(common::TLS_CERTS_CONFIGMAP.to_string()),
                ..corev1::ConfigMapVolumeSource::default()
            }),
            ..corev1::Volume::default()
        },
        corev1::Volume {
            name: "gpg-keys".to_string(),
            config_map: Some(corev1::ConfigMapVolumeSource {
                name: Some(common::GPG_KEYS_CONFIGMAP.to_string()),
                ..corev1::ConfigMapVolumeSource::default()
            }),
            ..corev1::Volume::default()
        },
        corev1::Volume {
            name: "gpg-keyring".to_string(),
            empty_dir: Some(corev1::EmptyDirVolumeSource::default()),
            ..corev1::Volume::default()
        },
        corev1::Volume {
            name: "repo-server-tls".to_string(),
            secret: Some(corev1::SecretVolumeSource {
                secret_name: Some(common::repo_server_tls_secret_name(stack)),
                optional: Some(true),
                ..corev1::SecretVolumeSource::default()
            }),
            ..corev1::Volume::default()
        },
    ]
}

pub fn repo_server_volume_mounts() -> Vec<corev1::VolumeMount> {
    vec![
        corev1::VolumeMount {
            name: "ssh-known-hosts".to_string(),
            mount_path: "/app/config/ssh".to_string(),
            ..corev1::VolumeMount::default()
        },
        corev1::VolumeMount {
            name: "tls-certs".to_string(),
            mount_path: "/app/config/tls".to_string(),
            ..corev1::VolumeMount::default()
        },
        corev1::VolumeMount {
            name: "gpg-keys".to_string(),
            mount_path: "/app/config/gpg/source".to_string(),
            ..corev1::VolumeMount::default()
        },
        corev1::VolumeMount {
            name: "gpg-keyring".to_string(),
            mount_path: "/app/config/gpg/keys".to_string(),
            ..corev1::VolumeMount::default()
        },
        corev1::VolumeMount {
            name: "repo-server-tls".to_string(),
            mount_path: "/app/config/reposerver/tls".to_string(),
            ..corev1::VolumeMount::default()
        },
    ]
}

pub fn server_volumes(stack: &GitOpsStack) -> Vec<corev1::Volume> {
    vec![
        corev1::Volume {
            name: "ssh-known-hosts".to_string(),
            config_map: Some(corev1::ConfigMapVolumeSource {
                name: Some(common::SSH_KNOWN_HOSTS_CONFIGMAP.to_string()),
                ..corev1::ConfigMapVolumeSource::default()
            }),
            ..corev1::Volume::default()
        },
        corev1::Volume {
            name: "tls-certs".to_string(),
            config_map: Some(corev1::ConfigMapVolumeSource {
                name: Some(common::TLS_CERTS_CONFIGMAP.to_string()),
                ..corev1::ConfigMapVolumeSource::default()
            }),
            ..corev1::Volume::default()
        },
        corev1::Volume {
            name: "repo-server-tls".to_string(),
            secret: Some(corev1::SecretVolumeSource {
                secret_name: Some(common::repo_server_tls_secret_name(stack)),
                optional: Some(true),
                ..corev1::SecretVolumeSource::default()
            }),
            ..corev1::Volume::default()
        },
    ]
}

pub fn server_volume_mounts() -> Vec<corev1::VolumeMount> {
    vec![
        corev1::VolumeMount {
            name: "ssh-known-hosts".to_string(),
            mount_path: "/app/config/ssh".to_string(),
            ..corev1::VolumeMount::default()
        },
        corev1::VolumeMount {
            name: "tls-certs".to_string(),
            mount_path: "/app/config/tls".to_string(),
            ..corev1::VolumeMount::default()
        },
        corev1::VolumeMount {
            name: "repo-server-tls".to_string(),
            mount_path: "/app/config/server/tls".to_string(),
            ..corev1::VolumeMount::default()
        },
    ]
}

pub fn make_repo_server_deployment(stack: &GitOpsStack, pcfg: &ProcessEnv) -> appsv1::Deployment {
    let mut pod_spec = corev1::PodSpec {
        containers: vec![corev1::Container {
            name: "repo-server".to_string(),
            image: Some(product_image(
                stack,
                &stack.spec.repo.image,
                &stack.spec.repo.version,
            )),
            image_pull_policy: Some("Always".to_string()),
            command: Some(vec![
                "uid_entrypoint.sh".to_string(),
                "gitops-repo-server".to_string(),
                "--cache".to_string(),
                common::cache_addr(stack),
                "--loglevel".to_string(),
                stack
                    .spec
                    .repo
                    .log_level
                    .clone()
                    .unwrap_or_else(|| common::DEFAULT_LOG_LEVEL.to_string()),
            ]),
            ports: Some(vec![
                corev1::ContainerPort {
                    name: Some("server".to_string()),
                    container_port: 8081,
                    ..corev1::ContainerPort::default()
                },
                corev1::ContainerPort {
                    name: Some("metrics".to_string()),
                    container_port: 8084,
                    ..corev1::ContainerPort::default()
                },
            ]),
            liveness_probe: Some(corev1::Probe {
                tcp_socket: Some(corev1::TCPSocketAction {
                    port: IntOrString::Int(8081),
                    ..corev1::TCPSocketAction::default()
                }),
                initial_delay_seconds: Some(5),
                period_seconds: Some(10),
                ..corev1::Probe::default()
            }),
            readiness_probe: Some(corev1::Probe {
                tcp_socket: Some(corev1::TCPSocketAction {
                    port: IntOrString::Int(8081),
                    ..corev1::TCPSocketAction::default()
                }),
                initial_delay_seconds: Some(5),
                period_seconds: Some(10),
                ..corev1::Probe::default()
            }),
            env: env_opt(repo_server_env(stack, pcfg)),
            resources: stack.spec.repo.resources.clone(),
            volume_mounts: Some(repo_server_volume_mounts()),
            ..corev1::Container::default()
        }],
        volumes: Some(repo_server_volumes(stack)),
        ..corev1::PodSpec::default()
    };
    apply_node_placement(&mut pod_spec, stack);
    make_deployment(stack, common::repo_server_name(stack), pod_spec)
}

pub fn make_auth_proxy_deployment(stack: &GitOpsStack, pcfg: &ProcessEnv) -> appsv1::Deployment {
    let mut pod_spec = corev1::PodSpec {
        volumes: Some(vec![corev1::Volume {
            name: "static-files".to_string(),
            empty_dir: Some(corev1::EmptyDirVolumeSource::default()),
            ..corev1::Volume::default()
        }]),
        init_containers: Some(vec![corev1::Container {
            name: "copyutil".to_string(),
            image: Some(product_image(stack, &None, &None)),
            image_pull_policy: Some("Always".to_string()),
            command: Some(vec![
                "cp".to_string(),
                "-n".to_string(),
                "/usr/local/bin/gitops".to_string(),
                "/shared/gitops-auth-proxy".to_string(),
            ]),
            env: env_opt(pcfg.proxy_env_vars()),
            resources: stack.spec.auth_proxy.resources.clone(),
            volume_mounts: Some(vec![corev1::VolumeMount {
                name: "static-files".to_string(),
                mount_path: "/shared".to_string(),
                ..corev1::VolumeMount::default()
            }]),
            ..corev1::Container::default()
        }]),
        containers: vec![corev1::Container {
            name: "auth-proxy".to_string(),
            image: Some(auth_proxy_image(stack)),
            image_pull_policy: Some("Always".to_string()),
            command: Some(vec![
                "/shared/gitops-auth-proxy".to_string(),
                "serve".to_string(),
            ]),
            ports: Some(vec![
                corev1::ContainerPort {
                    name: Some("http".to_string()),
                    container_port: 5556,
                    ..corev1::ContainerPort::default()
                },
                corev1::ContainerPort {
                    name: Some("grpc".to_string()),
                    container_port: 5557,
                    ..corev1::ContainerPort::default()
                },
            ]),
            env: env_opt(auth_proxy_env(stack, pcfg)),
            resources: stack.spec.auth_proxy.resources.clone(),
            volume_mounts: Some(vec![corev1::VolumeMount {
                name: "static-files".to_string(),
                mount_path: "/shared".to_string(),
                ..corev1::VolumeMount::default()
            }]),
            ..corev1::Container::default()
        }],
        service_account_name: Some(common::resource_name(stack, common::AUTH_PROXY_ROLE)),
        ..corev1::PodSpec::default()
    };
    apply_node_placement(&mut pod_spec, stack);
    make_deployment(stack, common::auth_proxy_name(stack), pod_spec)
}

pub fn make_cache_deployment(stack: &GitOpsStack, pcfg: &ProcessEnv) -> appsv1::Deployment {
    let mut pod_spec = corev1::PodSpec {
        containers: vec![corev1::Container {
            name: "cache".to_string(),
            image: Some(cache_image(stack)),
            image_pull_policy: Some("Always".to_string()),
            command: Some(vec![
                "redis-server".to_string(),
                "--save".to_string(),
                "".to_string(),
                "--appendonly".to_string(),
                "no".to_string(),
            ]),
            ports: Some(vec![corev1::ContainerPort {
                name: Some("cache".to_string()),
                container_port: 6379,
                ..corev1::ContainerPort::default()
            }]),
            env: env_opt(pcfg.proxy_env_vars()),
            resources: stack.spec.cache.resources.clone(),
            ..corev1::Container::default()
        }],
        ..corev1::PodSpec::default()
    };
    apply_node_placement(&mut pod_spec, stack);
    make_deployment(stack, common::cache_name(stack), pod_spec)
}

pub fn make_cache_ha_proxy_deployment(stack: &GitOpsStack, pcfg: &ProcessEnv) -> appsv1::Deployment {
    let mut pod_spec = corev1::PodSpec {
        volumes: Some(vec![
            corev1::Volume {
                name: "config".to_string(),
                config_map: Some(corev1::ConfigMapVolumeSource {
                    name: Some(common::resource_name(stack, "cache-ha-cm")),
                    ..corev1::ConfigMapVolumeSource::default()
                }),
                ..corev1::Volume::default()
            },
            corev1::Volume {
                name: "shared-socket".to_string(),
                empty_dir: Some(corev1::EmptyDirVolumeSource::default()),
                ..corev1::Volume::default()
            },
            corev1::Volume {
                name: "data".to_string(),
                empty_dir: Some(corev1::EmptyDirVolumeSource::default()),
                ..corev1::Volume::default()
            },
        ]),
        init_containers: Some(vec![corev1::Container {
            name: "config-init".to_string(),
            image: Some(cache_ha_proxy_image(stack)),
            image_pull_policy: Some("Always".to_string()),
            command: Some(vec!["sh".to_string(), "/readonly/haproxy_init.sh".to_string()]),
            env: env_opt(pcfg.proxy_env_vars()),
            resources: stack.spec.ha.resources.clone(),
            volume_mounts: Some(vec![
                corev1::VolumeMount {
                    name: "config".to_string(),
                    mount_path: "/readonly".to_string(),
                    read_only: Some(true),
                    ..corev1::VolumeMount::default()
                },
                corev1::VolumeMount {
                    name: "data".to_string(),
                    mount_path: "/data".to_string(),
                    ..corev1::VolumeMount::default()
                },
            ]),
            ..corev1::Container::default()
        }]),
        containers: vec![corev1::Container {
            name: "haproxy".to_string(),
            image: Some(cache_ha_proxy_image(stack)),
            image_pull_policy: Some("Always".to_string()),
            ports: Some(vec![corev1::ContainerPort {
                name: Some("cache".to_string()),
                container_port: 6379,
                ..corev1::ContainerPort::default()
            }]),
            readiness_probe: Some(corev1::Probe {
                http_get: Some(corev1::HTTPGetAction {
                    path: Some("/healthz".to_string()),
                    port: IntOrString::Int(8888),
                    ..corev1::HTTPGetAction::default()
                }),
                initial_delay_seconds: Some(5),
                period_seconds: Some(3),
                ..corev1::Probe::default()
            }),
            env: env_opt(pcfg.proxy_env_vars()),
            resources: stack.spec.ha.resources.clone(),
            volume_mounts: Some(vec![
                corev1::VolumeMount {
                    name: "data".to_string(),
                    mount_path: "/usr/local/etc/haproxy".to_string(),
                    ..corev1::VolumeMount::default()
                },
                corev1::VolumeMount {
                    name: "shared-socket".to_string(),
                    mount_path: "/run/haproxy".to_string(),
                    ..corev1::VolumeMount::default()
                },
            ]),
            ..corev1::Container::default()
        }],
        service_account_name: Some(common::resource_name(stack, common::CACHE_HA_ROLE)),
        ..corev1::PodSpec::default()
    };
    apply_node_placement(&mut pod_spec, stack);
    make_deployment(stack, common::cache_ha_proxy_name(stack), pod_spec)
}

pub fn make_server_deployment(stack: &GitOpsStack, pcfg: &ProcessEnv) -> appsv1::Deployment {
    let mut command = vec!["gitops-server".to_string()];
    if stack.spec.server.insecure {
        command.push("--insecure".to_string());
    }
    command.push("--staticassets".to_string());
    command.push("/shared/app".to_string());
    command.push("--auth-server".to_string());
    command.push(common::auth_proxy_addr(stack));
    command.push("--repo-server".to_string());
    command.push(common::repo_server_addr(stack));
    command.push("--cache".to_string());
    command.push(common::cache_addr(stack));
    command.push("--loglevel".to_string());
    command.push(
        stack
            .spec
            .server
            .log_level
            .clone()
            .unwrap_or_else(|| common::DEFAULT_LOG_LEVEL.to_string()),
    );
    command.push("--logformat".to_string());
    command.push(
        stack
            .spec
            .server
            .log_format
            .clone()
            .unwrap_or_else(|| common::DEFAULT_LOG_FORMAT.to_string()),
    );

    let mut pod_spec = corev1::PodSpec {
        containers: vec![corev1::Container {
            name: "server".to_string(),
            image: Some(product_image(
                stack,
                &stack.spec.server.image,
                &stack.spec.server.version,
            )),
            image_pull_policy: Some("Always".to_string()),
            command: Some(command),
            ports: Some(vec![
                corev1::ContainerPort {
                    container_port: 8080,
                    ..corev1::ContainerPort::default()
                },
                corev1::ContainerPort {
                    container_port: 8083,
                    ..corev1::ContainerPort::default()
                },
            ]),
            liveness_probe: Some(corev1::Probe {
                http_get: Some(corev1::HTTPGetAction {
                    path: Some("/healthz".to_string()),
                    port: IntOrString::Int(8080),
                    ..corev1::HTTPGetAction::default()
                }),
                initial_delay_seconds: Some(3),
                period_seconds: Some(30),
                ..corev1::Probe::default()
            }),
            readiness_probe: Some(corev1::Probe {
                http_get: Some(corev1::HTTPGetAction {
                    path: Some("/healthz".to_string()),
                    port: IntOrString::Int(8080),
                    ..corev1::HTTPGetAction::default()
                }),
                initial_delay_seconds: Some(3),
                period_seconds: Some(30),
                ..corev1::Probe::default()
            }),
            env: env_opt(server_env(stack, pcfg)),
            resources: stack.spec.server.resources.clone(),
            volume_mounts: Some(server_volume_mounts()),
            ..corev1::Container::default()
        }],
        volumes: Some(server_volumes(stack)),
        service_account_name: Some(common::resource_name(stack, common::SERVER_ROLE)),
        ..corev1::PodSpec::default()
    };
    apply_node_placement(&mut pod_spec, stack);
    make_deployment(stack, common::server_name(stack), pod_spec)
}
