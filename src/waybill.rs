use chrono::{DateTime, Utc};
use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::error::CoreError;

/// Reference to a Secret in some namespace, used for the three kinds of
/// delegated credentials a Waybill can carry: the delegate SA token, an
/// optional Strongbox keyring, and an optional Git SSH identity.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema, Hash)]
pub struct SecretReference {
    pub namespace: String,
    pub name: String,
}

/// The namespace's declarative binding to a repo path and apply policy.
///
/// All options are enumerated here with the same defaults the admission
/// webhook applies server-side, per spec.md §6: a Waybill read back from
/// the apiserver with a field omitted gets the same value `serde` would
/// give it here, so the core never has to special-case "not yet
/// defaulted" specs.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "kube-applier.io",
    version = "v1",
    kind = "Waybill",
    namespaced,
    status = "WaybillStatus",
    shortname = "wb"
)]
#[serde(rename_all = "camelCase")]
pub struct WaybillSpec {
    #[serde(default = "default_true")]
    pub auto_apply: bool,

    #[serde(default)]
    pub dry_run: bool,

    #[serde(default = "default_true")]
    pub prune: bool,

    #[serde(default)]
    pub prune_cluster_resources: bool,

    #[serde(default)]
    pub prune_blacklist: Vec<String>,

    /// Relative path under the repo root. Empty means "use the namespace
    /// name", per spec.md §4.4 step 2 and the boundary behavior in §8.
    #[serde(default)]
    #[schemars(regex(pattern = r"^(/?[A-Za-z0-9._-]+(/[A-Za-z0-9._-]+)*/?)?$"))]
    pub repository_path: String,

    #[serde(default = "default_run_interval")]
    pub run_interval: u64,

    #[serde(default)]
    pub server_side_apply: bool,

    #[serde(default)]
    pub strongbox_keyring_secret_ref: Option<SecretReference>,

    #[serde(default)]
    pub git_ssh_secret_ref: Option<SecretReference>,

    pub delegate_service_account_secret_ref: SecretReference,
}

fn default_true() -> bool {
    true
}

fn default_run_interval() -> u64 {
    3600
}

/// Same pattern the CRD's admission webhook validates against (spec.md
/// §6); the core re-checks it defensively before using the path in a
/// subprocess invocation, since not every cluster is guaranteed to have
/// the webhook installed (spec.md §8's `runInterval=0` boundary case makes
/// the same "the core can't fully trust admission" point).
static REPOSITORY_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(/?[A-Za-z0-9._-]+(/[A-Za-z0-9._-]+)*/?)?$").expect("valid regex"));

impl WaybillSpec {
    /// `repositoryPath` empty is treated as the namespace name, per
    /// spec.md §4.4/§8.
    pub fn effective_repository_path<'a>(&'a self, namespace: &'a str) -> &'a str {
        if self.repository_path.is_empty() {
            namespace
        } else {
            &self.repository_path
        }
    }

    /// `runInterval=0` is rejected at admission; if the core somehow sees
    /// it anyway (e.g. a CRD without the webhook installed), spec.md §8
    /// says to treat it as the default of 3600.
    pub fn effective_run_interval(&self) -> std::time::Duration {
        let secs = if self.run_interval == 0 {
            default_run_interval()
        } else {
            self.run_interval
        };
        std::time::Duration::from_secs(secs)
    }

    /// Defensive re-check of the admission-time `repositoryPath` regex and
    /// the non-empty `delegateServiceAccountSecretRef`, per spec.md §6. A
    /// failure here is a `ConfigError`: never retried without the spec
    /// itself changing (spec.md §7).
    pub fn validate(&self) -> Result<(), CoreError> {
        if !REPOSITORY_PATH_RE.is_match(&self.repository_path) {
            return Err(CoreError::Config(format!(
                "repositoryPath {:?} does not match the safe-path pattern",
                self.repository_path
            )));
        }
        if self.delegate_service_account_secret_ref.name.is_empty() {
            return Err(CoreError::Config(
                "delegateServiceAccountSecretRef.name must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WaybillStatus {
    pub last_run: Option<LastRun>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Scheduled,
    Forced,
    Polling,
    FailedRetry,
}

impl std::fmt::Display for RunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunType::Scheduled => "scheduled",
            RunType::Forced => "forced",
            RunType::Polling => "polling",
            RunType::FailedRetry => "failed-retry",
        };
        write!(f, "{s}")
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastRun {
    pub command: String,
    pub commit: String,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub success: bool,
    #[serde(rename = "type")]
    pub run_type: RunType,
    pub output: String,
    /// Non-empty iff `success == false`, per spec.md §3.
    #[serde(default)]
    pub error_message: String,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn empty_repository_path_defaults_to_namespace() {
        let spec = WaybillSpec {
            auto_apply: true,
            dry_run: false,
            prune: true,
            prune_cluster_resources: false,
            prune_blacklist: vec![],
            repository_path: String::new(),
            run_interval: 3600,
            server_side_apply: false,
            strongbox_keyring_secret_ref: None,
            git_ssh_secret_ref: None,
            delegate_service_account_secret_ref: SecretReference {
                namespace: "demo".into(),
                name: "delegate-token".into(),
            },
        };
        assert_eq!(spec.effective_repository_path("demo"), "demo");
    }

    #[test]
    fn nonempty_repository_path_is_used_verbatim() {
        let spec = WaybillSpec {
            auto_apply: true,
            dry_run: false,
            prune: true,
            prune_cluster_resources: false,
            prune_blacklist: vec![],
            repository_path: "manifests/demo".into(),
            run_interval: 3600,
            server_side_apply: false,
            strongbox_keyring_secret_ref: None,
            git_ssh_secret_ref: None,
            delegate_service_account_secret_ref: SecretReference {
                namespace: "demo".into(),
                name: "delegate-token".into(),
            },
        };
        assert_eq!(spec.effective_repository_path("demo"), "manifests/demo");
    }

    #[test]
    fn zero_run_interval_falls_back_to_default() {
        let spec = WaybillSpec {
            auto_apply: true,
            dry_run: false,
            prune: true,
            prune_cluster_resources: false,
            prune_blacklist: vec![],
            repository_path: String::new(),
            run_interval: 0,
            server_side_apply: false,
            strongbox_keyring_secret_ref: None,
            git_ssh_secret_ref: None,
            delegate_service_account_secret_ref: SecretReference {
                namespace: "demo".into(),
                name: "delegate-token".into(),
            },
        };
        assert_eq!(
            spec.effective_run_interval(),
            std::time::Duration::from_secs(3600)
        );
    }

    fn base_spec() -> WaybillSpec {
        WaybillSpec {
            auto_apply: true,
            dry_run: false,
            prune: true,
            prune_cluster_resources: false,
            prune_blacklist: vec![],
            repository_path: String::new(),
            run_interval: 3600,
            server_side_apply: false,
            strongbox_keyring_secret_ref: None,
            git_ssh_secret_ref: None,
            delegate_service_account_secret_ref: SecretReference {
                namespace: "demo".into(),
                name: "delegate-token".into(),
            },
        }
    }

    #[test]
    fn validate_rejects_unsafe_repository_path() {
        let mut spec = base_spec();
        spec.repository_path = "../../etc/passwd".into();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_delegate_secret_name() {
        let mut spec = base_spec();
        spec.delegate_service_account_secret_ref.name = String::new();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn validate_accepts_default_spec() {
        assert!(base_spec().validate().is_ok());
    }
}
