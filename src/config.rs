use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context as _};
use schemars::JsonSchema;
use serde::Deserialize;

/// Top level daemon configuration, loaded from a TOML file at startup.
/// Mirrors the teacher's `Config`/`deny_unknown_fields` style: every field
/// either has an explicit default or is required, and an unrecognized key
/// is a hard parse error rather than a silently ignored typo.
#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub git: GitConfig,
    pub kube: KubeConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub apply: ApplyConfig,
}

#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct GitConfig {
    pub remote: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_revision")]
    pub revision: String,
    pub mirror_path: PathBuf,
    #[serde(default = "default_sync_interval_s")]
    pub sync_interval_s: u64,
    #[serde(default)]
    pub depth: Option<u32>,
    #[serde(default)]
    pub git_binary: Option<PathBuf>,
}

impl GitConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_s)
    }

    /// Validates the invariants spec.md §4.1 lists as reasons `StartSync`
    /// should fail outright: path not absolute, remote empty, depth
    /// negative. `depth` is unsigned here so "negative" can't arise from
    /// parsing, but zero is just as meaningless, so we reject it too.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.mirror_path.is_absolute() {
            bail!("git.mirror_path must be absolute, got {:?}", self.mirror_path);
        }
        if self.remote.trim().is_empty() {
            bail!("git.remote must not be empty");
        }
        if matches!(self.depth, Some(0)) {
            bail!("git.depth must not be zero");
        }
        Ok(())
    }
}

fn default_branch() -> String {
    "master".to_owned()
}

fn default_revision() -> String {
    "HEAD".to_owned()
}

fn default_sync_interval_s() -> u64 {
    30
}

#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct KubeConfig {
    /// Path to a kubeconfig file to use for the management connection
    /// (listing Waybills, reading secrets, writing status/events). The
    /// per-run `kubectl apply` invocation never uses this identity: it
    /// always uses the namespace's delegate service account, per spec.md
    /// §4.4/§9.
    #[serde(default)]
    pub kubeconfig_path: Option<PathBuf>,
    #[serde(default = "default_field_manager")]
    pub field_manager: String,
    /// Apiserver URL baked into each per-run delegate kubeconfig (spec.md
    /// §4.4 step 3). Required because the delegate token alone isn't
    /// enough for `kubectl` to know where to send it.
    pub api_server: String,
    /// PEM-encoded cluster CA, baked into each delegate kubeconfig
    /// alongside the token. `None` means skip TLS verification of the
    /// apiserver, which should only ever be used in test fixtures.
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
}

fn default_field_manager() -> String {
    "kube-applier".to_owned()
}

impl KubeConfig {
    /// Renders a minimal per-run kubeconfig YAML embedding the delegate's
    /// token, per spec.md §4.4 step 3. This is written into the run's
    /// scratch directory and referenced via `--kubeconfig` so `kubectl`
    /// never sees the management identity.
    pub fn render_delegate_kubeconfig(&self, namespace: &str, token: &str, ca_pem: Option<&[u8]>) -> String {
        use base64::Engine as _;
        let cluster = if let Some(ca) = ca_pem {
            format!(
                "certificate-authority-data: {}\n    server: {}",
                base64::engine::general_purpose::STANDARD.encode(ca),
                self.api_server
            )
        } else {
            format!("insecure-skip-tls-verify: true\n    server: {}", self.api_server)
        };
        format!(
            "apiVersion: v1\n\
             kind: Config\n\
             clusters:\n\
             - name: delegate\n  \
               cluster:\n    {cluster}\n\
             contexts:\n\
             - name: delegate\n  \
               context:\n    cluster: delegate\n    namespace: {namespace}\n    user: delegate\n\
             current-context: delegate\n\
             users:\n\
             - name: delegate\n  \
               user:\n    token: {token}\n"
        )
    }
}

#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct SchedulerConfig {
    pub waybill_poll_interval_s: u64,
    pub git_poll_interval_s: u64,
    pub run_queue_capacity: usize,
    /// Cooldown before a `FailedRetry` request is enqueued after a failed
    /// run. `None` means the spec.md §4.6 default behavior: no retry
    /// beyond the next Scheduled tick.
    pub failed_retry_cooldown_s: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            waybill_poll_interval_s: 5,
            git_poll_interval_s: 30,
            run_queue_capacity: 256,
            failed_retry_cooldown_s: None,
        }
    }
}

impl SchedulerConfig {
    pub fn waybill_poll_interval(&self) -> Duration {
        Duration::from_secs(self.waybill_poll_interval_s)
    }

    pub fn git_poll_interval(&self) -> Duration {
        Duration::from_secs(self.git_poll_interval_s)
    }

    pub fn failed_retry_cooldown(&self) -> Option<Duration> {
        self.failed_retry_cooldown_s.map(Duration::from_secs)
    }
}

#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct RunnerConfig {
    pub pool_size: usize,
    pub status_update_retries: u32,
    /// Daemon-wide override: when set, every run behaves as if
    /// `spec.dryRun` were true, regardless of the individual Waybill's
    /// setting, per spec.md §4.4 step 5's "or global dry-run".
    pub global_dry_run: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            status_update_retries: 3,
            global_dry_run: false,
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pool_size == 0 {
            bail!("runner.pool_size must be at least 1");
        }
        Ok(())
    }
}

#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct ApplyConfig {
    pub kubectl_binary: PathBuf,
    pub kustomize_binary: PathBuf,
    pub strongbox_binary: PathBuf,
    pub subprocess_timeout_s: u64,
    /// Terms that, if present in filtered `kubectl`/`kustomize` error
    /// output, cause the whole message to be replaced by a fixed
    /// redaction sentence rather than surfaced to operators.
    pub sensitive_terms: Vec<String>,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            kubectl_binary: "kubectl".into(),
            kustomize_binary: "kustomize".into(),
            strongbox_binary: "strongbox".into(),
            subprocess_timeout_s: 120,
            sensitive_terms: vec!["Secret".to_owned(), "base64".to_owned()],
        }
    }
}

impl ApplyConfig {
    pub fn subprocess_timeout(&self) -> Duration {
        Duration::from_secs(self.subprocess_timeout_s)
    }
}

impl Config {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(s).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.git.validate().context("validating [git]")?;
        self.runner.validate().context("validating [runner]")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;

    use super::*;

    #[googletest::test]
    fn minimal_config_parses_with_defaults() {
        let toml = r#"
            [git]
            remote = "git@example.com:foo/bar.git"
            mirror_path = "/var/lib/kube-applier/mirror"

            [kube]
            api_server = "https://kube.example.com:6443"
        "#;
        let config = Config::parse(toml).expect("minimal config should parse");
        expect_that!(config.git.branch, eq("master"));
        expect_that!(config.git.revision, eq("HEAD"));
        expect_that!(config.scheduler.waybill_poll_interval_s, eq(5));
        expect_that!(config.runner.pool_size, eq(4));
    }

    #[googletest::test]
    fn unknown_field_is_rejected() {
        let toml = r#"
            [git]
            remote = "git@example.com:foo/bar.git"
            mirror_path = "/var/lib/kube-applier/mirror"
            bogus = true

            [kube]
            api_server = "https://kube.example.com:6443"
        "#;
        assert_that!(Config::parse(toml), err(anything()));
    }

    #[googletest::test]
    fn relative_mirror_path_is_rejected() {
        let toml = r#"
            [git]
            remote = "git@example.com:foo/bar.git"
            mirror_path = "relative/path"

            [kube]
            api_server = "https://kube.example.com:6443"
        "#;
        assert_that!(Config::parse(toml), err(anything()));
    }

    #[googletest::test]
    fn empty_remote_is_rejected() {
        let toml = r#"
            [git]
            remote = ""
            mirror_path = "/var/lib/kube-applier/mirror"

            [kube]
            api_server = "https://kube.example.com:6443"
        "#;
        assert_that!(Config::parse(toml), err(anything()));
    }

    #[googletest::test]
    fn zero_pool_size_is_rejected() {
        let toml = r#"
            [git]
            remote = "git@example.com:foo/bar.git"
            mirror_path = "/var/lib/kube-applier/mirror"

            [kube]
            api_server = "https://kube.example.com:6443"

            [runner]
            pool_size = 0
        "#;
        assert_that!(Config::parse(toml), err(anything()));
    }
}
