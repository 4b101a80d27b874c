use k8s_openapi::api::core::v1 as corev1;
use std::env;

pub const HTTP_PROXY_ENV: &str = "HTTP_PROXY";
pub const HTTPS_PROXY_ENV: &str = "HTTPS_PROXY";
pub const NO_PROXY_ENV: &str = "no_proxy";
pub const DISABLE_AUTH_PROXY_ENV: &str = "DISABLE_AUTH_PROXY";

/// Process-level configuration captured once per reconcile pass and threaded
/// into every step that needs it. Nothing below the pass driver reads the
/// process environment directly.
#[derive(Debug, Clone, Default)]
pub struct ProcessEnv {
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
    pub auth_proxy_disabled: bool,
}

impl ProcessEnv {
    pub fn capture() -> Self {
        ProcessEnv {
            http_proxy: non_empty(env::var(HTTP_PROXY_ENV).ok()),
            https_proxy: non_empty(env::var(HTTPS_PROXY_ENV).ok()),
            no_proxy: non_empty(env::var(NO_PROXY_ENV).ok()),
            auth_proxy_disabled: env::var(DISABLE_AUTH_PROXY_ENV)
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    /// The proxy variables to propagate into managed containers. Only the
    /// ones actually set appear, under their fixed names.
    pub fn proxy_env_vars(&self) -> Vec<corev1::EnvVar> {
        let mut vars = Vec::new();
        if let Some(v) = &self.http_proxy {
            vars.push(env_var(HTTP_PROXY_ENV, v));
        }
        if let Some(v) = &self.https_proxy {
            vars.push(env_var(HTTPS_PROXY_ENV, v));
        }
        if let Some(v) = &self.no_proxy {
            vars.push(env_var(NO_PROXY_ENV, v));
        }
        vars
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.is_empty())
}

pub fn env_var(name: &str, value: &str) -> corev1::EnvVar {
    corev1::EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..corev1::EnvVar::default()
    }
}

/// Merge `merge` into `existing`. Existing entries keep their order; names
/// not seen before are appended in the order given. On a name collision the
/// existing entry wins unless `override_existing` is set, in which case the
/// merged value replaces it in place.
pub fn env_merge(
    existing: &[corev1::EnvVar],
    merge: &[corev1::EnvVar],
    override_existing: bool,
) -> Vec<corev1::EnvVar> {
    let mut merged: Vec<corev1::EnvVar> = existing.to_vec();
    for var in merge {
        match merged.iter_mut().find(|e| e.name == var.name) {
            Some(slot) => {
                if override_existing {
                    *slot = var.clone();
                }
            }
            None => merged.push(var.clone()),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_appends_new_entries_in_order() {
        let existing = vec![env_var("FOO", "BAR"), env_var("BAR", "FOO")];
        let merge = vec![
            env_var(HTTP_PROXY_ENV, "example.com:8888"),
            env_var(HTTPS_PROXY_ENV, "example.com:8443"),
            env_var(NO_PROXY_ENV, ".example.com"),
        ];
        let merged = env_merge(&existing, &merge, false);
        assert_eq!(merged.len(), 5);
        assert_eq!(merged[0].name, "FOO");
        assert_eq!(merged[1].name, "BAR");
        assert_eq!(merged[2].name, HTTP_PROXY_ENV);
        assert_eq!(merged[3].name, HTTPS_PROXY_ENV);
        assert_eq!(merged[4].name, NO_PROXY_ENV);
    }

    #[test]
    fn merge_into_empty() {
        let merge = vec![env_var(HTTP_PROXY_ENV, "example.com:8888")];
        let merged = env_merge(&[], &merge, false);
        assert_eq!(merged, merge);
    }

    #[test]
    fn merge_keeps_existing_value_without_override() {
        let existing = vec![env_var("FOO", "BAR")];
        let merge = vec![env_var("FOO", "QUX")];
        let merged = env_merge(&existing, &merge, false);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].value.as_deref(), Some("BAR"));
    }

    #[test]
    fn merge_with_override_replaces_in_place() {
        let existing = vec![env_var(crate::common::EXEC_TIMEOUT_ENV, "20"), env_var("FOO", "BAR")];
        let merge = vec![env_var(crate::common::EXEC_TIMEOUT_ENV, "600")];
        let merged = env_merge(&existing, &merge, true);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].name, crate::common::EXEC_TIMEOUT_ENV);
        assert_eq!(merged[0].value.as_deref(), Some("600"));
    }

    #[test]
    fn proxy_env_vars_skips_unset() {
        let pcfg = ProcessEnv {
            http_proxy: Some("example.com:8888".to_string()),
            ..ProcessEnv::default()
        };
        let vars = pcfg.proxy_env_vars();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].name, HTTP_PROXY_ENV);
    }

    #[test]
    fn proxy_env_vars_all_set() {
        let pcfg = ProcessEnv {
            http_proxy: Some("example.com:8888".to_string()),
            https_proxy: Some("example.com:8443".to_string()),
            no_proxy: Some(".example.com".to_string()),
            auth_proxy_disabled: false,
        };
        assert_eq!(pcfg.proxy_env_vars().len(), 3);
    }
}
