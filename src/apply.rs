use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize as _;
use tokio::process::Command;

use crate::error::CoreError;
use crate::process::display_command;

/// The fixed sentence substituted for any error output that matches one of
/// the configured sensitive terms, per spec.md §4.3/§7: operators never see
/// the raw detail, only that something sensitive was redacted.
pub const REDACTION_SENTENCE: &str =
    "Output redacted: error message may have contained sensitive data.";

const KUSTOMIZATION_FILENAMES: &[&str] = &["kustomization.yaml", "kustomization.yml", "Kustomization"];
const CORE_SECRET_GVK: &str = "core/v1/Secret";

/// `dryRunStrategy` from the spec's Flag object: empty means "really
/// apply", the other two select `kubectl apply --dry-run=<value>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DryRunStrategy {
    Empty,
    None,
    Server,
}

impl DryRunStrategy {
    pub fn for_waybill(dry_run: bool, global_dry_run: bool) -> Self {
        if dry_run || global_dry_run {
            DryRunStrategy::Server
        } else {
            DryRunStrategy::Empty
        }
    }

    fn kubectl_arg(self) -> Option<&'static str> {
        match self {
            DryRunStrategy::Empty => None,
            DryRunStrategy::None => Some("--dry-run=none"),
            DryRunStrategy::Server => Some("--dry-run=server"),
        }
    }
}

/// The Flag object from spec.md §4.3, ENUMERATED.
#[derive(Debug, Clone)]
pub struct ApplyFlags {
    pub namespace: String,
    pub dry_run: DryRunStrategy,
    /// Ordered `group/version/kind` whitelist. Empty means pruning is off.
    pub prune_whitelist: Vec<String>,
    pub server_side: bool,
    /// The delegate token. Not passed to `kubectl` directly -- it's already
    /// baked into `kubeconfig_path` by the Runner (spec.md §4.4 step 3) --
    /// kept here so the composed `LastRun.command` string and test fixtures
    /// can refer to which identity ran the command.
    pub token: String,
    pub kubeconfig_path: PathBuf,
}

/// Combined result of one apply invocation (direct or Kustomize), per
/// spec.md §4.3: composed output plus the first error encountered, if any.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub command: String,
    pub output: String,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub timed_out: bool,
}

impl ApplyOutcome {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

/// Invokes `kubectl apply` (direct or Kustomize-piped) against a prepared
/// workspace, per spec.md §4.3.
pub struct ApplyExecutor {
    kubectl_binary: PathBuf,
    kustomize_binary: PathBuf,
    sensitive_terms: Vec<String>,
    subprocess_timeout: Duration,
}

impl ApplyExecutor {
    pub fn new(
        kubectl_binary: PathBuf,
        kustomize_binary: PathBuf,
        sensitive_terms: Vec<String>,
        subprocess_timeout: Duration,
    ) -> Self {
        Self {
            kubectl_binary,
            kustomize_binary,
            sensitive_terms,
            subprocess_timeout,
        }
    }

    /// Replaces `text` with the fixed redaction sentence if it contains any
    /// of the configured sensitive terms, per spec.md §4.3/§7.
    fn filter(&self, text: &str) -> String {
        if self.sensitive_terms.iter().any(|term| text.contains(term.as_str())) {
            REDACTION_SENTENCE.to_owned()
        } else {
            text.to_owned()
        }
    }

    async fn is_kustomize_dir(workspace: &Path) -> bool {
        for name in KUSTOMIZATION_FILENAMES {
            if tokio::fs::try_exists(workspace.join(name)).await.unwrap_or(false) {
                return true;
            }
        }
        false
    }

    pub async fn apply(&self, workspace: &Path, flags: &ApplyFlags) -> ApplyOutcome {
        if Self::is_kustomize_dir(workspace).await {
            self.apply_kustomize(workspace, flags).await
        } else {
            self.apply_direct(workspace, flags).await
        }
    }

    fn base_kubectl_command(&self, flags: &ApplyFlags) -> Command {
        let mut cmd = Command::new(&self.kubectl_binary);
        cmd.arg("--kubeconfig").arg(&flags.kubeconfig_path);
        cmd.arg("-n").arg(&flags.namespace);
        cmd.arg("apply");
        cmd
    }

    fn apply_args(&self, whitelist: &[String], flags: &ApplyFlags) -> Vec<String> {
        let mut args = Vec::new();
        if !whitelist.is_empty() {
            args.push("--prune".to_owned());
            args.push(format!("--prune-whitelist={}", whitelist.join(",")));
        }
        if flags.server_side {
            args.push("--server-side".to_owned());
        }
        if let Some(arg) = flags.dry_run.kubectl_arg() {
            args.push(arg.to_owned());
        }
        args
    }

    /// The no-Kustomize path: `kubectl apply -f <workspace> -R`.
    async fn apply_direct(&self, workspace: &Path, flags: &ApplyFlags) -> ApplyOutcome {
        let mut cmd = self.base_kubectl_command(flags);
        cmd.arg("-f").arg(workspace).arg("-R");
        for arg in self.apply_args(&flags.prune_whitelist, flags) {
            cmd.arg(arg);
        }
        let command_str = display_command(
            self.kubectl_binary.as_os_str(),
            &cmd.as_std().get_args().collect::<Vec<_>>(),
        );

        match crate::process::run_with_deadline(&mut cmd, self.subprocess_timeout).await {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                let combined = format!("{stdout}{stderr}");
                if output.status.success() {
                    ApplyOutcome {
                        command: command_str,
                        output: combined,
                        exit_code: output.status.code(),
                        error: None,
                        timed_out: false,
                    }
                } else {
                    ApplyOutcome {
                        command: command_str,
                        output: self.filter(&combined),
                        exit_code: output.status.code(),
                        error: Some(self.filter(&stderr)),
                        timed_out: false,
                    }
                }
            }
            Err(CoreError::Timeout(d)) => ApplyOutcome {
                command: command_str,
                output: String::new(),
                exit_code: None,
                error: Some(format!("kubectl apply timed out after {d:?}")),
                timed_out: true,
            },
            Err(e) => ApplyOutcome {
                command: command_str,
                output: String::new(),
                exit_code: e.exit_code(),
                error: Some(e.to_string()),
                timed_out: false,
            },
        }
    }

    /// The Kustomize path, per spec.md §4.3 steps 1-5: build, split by
    /// `kind == Secret`, apply each stream separately with its own
    /// whitelist, and never surface raw Secret-apply stderr.
    async fn apply_kustomize(&self, workspace: &Path, flags: &ApplyFlags) -> ApplyOutcome {
        let mut build_cmd = Command::new(&self.kustomize_binary);
        build_cmd.arg("build").arg(workspace);
        let build_command_str = display_command(
            self.kustomize_binary.as_os_str(),
            &build_cmd.as_std().get_args().collect::<Vec<_>>(),
        );

        let built = match crate::process::run_with_deadline(&mut build_cmd, self.subprocess_timeout).await {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout).into_owned(),
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                return ApplyOutcome {
                    command: build_command_str,
                    output: self.filter(&stderr),
                    exit_code: output.status.code(),
                    error: Some(self.filter(&stderr)),
                    timed_out: false,
                };
            }
            Err(CoreError::Timeout(d)) => {
                return ApplyOutcome {
                    command: build_command_str,
                    output: String::new(),
                    exit_code: None,
                    error: Some(format!("kustomize build timed out after {d:?}")),
                    timed_out: true,
                };
            }
            Err(e) => {
                return ApplyOutcome {
                    command: build_command_str,
                    output: String::new(),
                    exit_code: e.exit_code(),
                    error: Some(e.to_string()),
                    timed_out: false,
                };
            }
        };

        let (secrets_doc, rest_doc) = match split_secrets(&built) {
            Ok(pair) => pair,
            Err(e) => {
                return ApplyOutcome {
                    command: build_command_str,
                    output: String::new(),
                    exit_code: None,
                    error: Some(e.to_string()),
                    timed_out: false,
                };
            }
        };

        let mut composed_output = String::new();
        let mut composed_command = build_command_str;
        let mut first_error = None;
        let mut timed_out = false;
        let mut exit_code = None;

        if !rest_doc.trim().is_empty() {
            let rest_whitelist: Vec<String> = flags
                .prune_whitelist
                .iter()
                .filter(|g| g.as_str() != CORE_SECRET_GVK)
                .cloned()
                .collect();
            let outcome = self
                .apply_stdin(&rest_doc, workspace, &rest_whitelist, flags, true, false)
                .await;
            composed_command.push('\n');
            composed_command.push_str(&outcome.command);
            composed_output.push_str(&outcome.output);
            if !outcome.success() {
                first_error.get_or_insert_with(|| outcome.error.clone().unwrap_or_default());
                exit_code = outcome.exit_code;
                timed_out |= outcome.timed_out;
            }
        }

        if !secrets_doc.trim().is_empty() {
            let secret_whitelist: Vec<String> = if flags.prune_whitelist.iter().any(|g| g == CORE_SECRET_GVK) {
                vec![CORE_SECRET_GVK.to_owned()]
            } else {
                Vec::new()
            };
            let outcome = self
                .apply_stdin(&secrets_doc, workspace, &secret_whitelist, flags, false, true)
                .await;
            composed_command.push('\n');
            composed_command.push_str(&outcome.command);
            if outcome.success() {
                composed_output.push_str(&outcome.output);
            } else {
                // Never surface the raw Secret-apply output, per spec.md §4.3 step 4.
                composed_output.push_str(REDACTION_SENTENCE);
                composed_output.push('\n');
                if first_error.is_none() {
                    first_error = Some(REDACTION_SENTENCE.to_owned());
                    exit_code = outcome.exit_code;
                    timed_out |= outcome.timed_out;
                }
            }
        }

        if rest_doc.trim().is_empty() && secrets_doc.trim().is_empty() {
            return ApplyOutcome {
                command: composed_command,
                output: String::new(),
                exit_code: None,
                error: Some("no resources extracted".to_owned()),
                timed_out: false,
            };
        }

        ApplyOutcome {
            command: composed_command,
            output: composed_output,
            exit_code,
            error: first_error,
            timed_out,
        }
    }

    /// `kubectl apply -f - [-R]` reading `yaml` from stdin, used for both
    /// streams in the Kustomize path. `recursive` adds `-R`, set for the
    /// non-Secret stream per spec.md §4.3 step 3; the Secret stream (step 4)
    /// omits it. `redact_stderr_on_error` is set only for the Secret stream:
    /// its stderr must never be surfaced verbatim.
    async fn apply_stdin(
        &self,
        yaml: &str,
        _workspace: &Path,
        whitelist: &[String],
        flags: &ApplyFlags,
        recursive: bool,
        redact_stderr_on_error: bool,
    ) -> ApplyOutcome {
        use std::process::Stdio;
        use tokio::io::AsyncWriteExt as _;

        let mut cmd = self.base_kubectl_command(flags);
        cmd.arg("-f").arg("-");
        if recursive {
            cmd.arg("-R");
        }
        for arg in self.apply_args(whitelist, flags) {
            cmd.arg(arg);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let command_str = display_command(
            self.kubectl_binary.as_os_str(),
            &cmd.as_std().get_args().collect::<Vec<_>>(),
        );

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return ApplyOutcome {
                    command: command_str,
                    output: String::new(),
                    exit_code: None,
                    error: Some(format!("failed to spawn kubectl apply: {e}")),
                    timed_out: false,
                }
            }
        };

        let mut stdin = child.stdin.take().expect("stdin was piped");
        let yaml_owned = yaml.to_owned();
        let write_task = tokio::spawn(async move {
            let _ = stdin.write_all(yaml_owned.as_bytes()).await;
        });

        let result = tokio::time::timeout(self.subprocess_timeout, child.wait_with_output()).await;
        let _ = write_task.await;

        match result {
            Err(_elapsed) => ApplyOutcome {
                command: command_str,
                output: String::new(),
                exit_code: None,
                error: Some(format!("kubectl apply timed out after {:?}", self.subprocess_timeout)),
                timed_out: true,
            },
            Ok(Err(e)) => ApplyOutcome {
                command: command_str,
                output: String::new(),
                exit_code: None,
                error: Some(format!("waiting for kubectl apply: {e}")),
                timed_out: false,
            },
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                if output.status.success() {
                    ApplyOutcome {
                        command: command_str,
                        output: format!("{stdout}{stderr}"),
                        exit_code: output.status.code(),
                        error: None,
                        timed_out: false,
                    }
                } else {
                    let reported = if redact_stderr_on_error {
                        stderr.clone()
                    } else {
                        self.filter(&stderr)
                    };
                    ApplyOutcome {
                        command: command_str,
                        output: self.filter(&stdout),
                        exit_code: output.status.code(),
                        error: Some(reported),
                        timed_out: false,
                    }
                }
            }
        }
    }
}

/// Splits a multi-document YAML stream by `kind == Secret`, per spec.md
/// §4.3 step 2, returning `(secrets, rest)` each re-joined with `---\n`.
fn split_secrets(stream: &str) -> anyhow::Result<(String, String)> {
    #[derive(serde::Deserialize)]
    struct KindOnly {
        kind: Option<String>,
    }

    let mut secrets = Vec::new();
    let mut rest = Vec::new();

    for document in serde_yaml::Deserializer::from_str(stream) {
        let value = serde_yaml::Value::deserialize(document).context("parsing kustomize build output as YAML")?;
        if matches!(&value, serde_yaml::Value::Null) {
            continue;
        }
        let kind_only: KindOnly = serde_yaml::from_value(value.clone()).unwrap_or(KindOnly { kind: None });
        let rendered = serde_yaml::to_string(&value).context("re-serializing split document")?;
        if kind_only.kind.as_deref() == Some("Secret") {
            secrets.push(rendered);
        } else {
            rest.push(rendered);
        }
    }

    Ok((secrets.join("---\n"), rest.join("---\n")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_secrets_partitions_by_kind() {
        let stream = indoc::indoc! {"
            apiVersion: v1
            kind: ConfigMap
            metadata:
              name: cm-a
            ---
            apiVersion: v1
            kind: Secret
            metadata:
              name: sec-a
        "};
        let (secrets, rest) = split_secrets(stream).unwrap();
        assert!(secrets.contains("sec-a"));
        assert!(!secrets.contains("cm-a"));
        assert!(rest.contains("cm-a"));
        assert!(!rest.contains("sec-a"));
    }

    #[test]
    fn split_secrets_handles_empty_stream() {
        let (secrets, rest) = split_secrets("").unwrap();
        assert!(secrets.is_empty());
        assert!(rest.is_empty());
    }

    #[test_case::test_case(true, false, DryRunStrategy::Server; "waybill dry run")]
    #[test_case::test_case(false, true, DryRunStrategy::Server; "global dry run")]
    #[test_case::test_case(true, true, DryRunStrategy::Server; "both set")]
    #[test_case::test_case(false, false, DryRunStrategy::Empty; "neither set")]
    fn dry_run_strategy_mapping(waybill_dry_run: bool, global_dry_run: bool, expected: DryRunStrategy) {
        assert_eq!(DryRunStrategy::for_waybill(waybill_dry_run, global_dry_run), expected);
    }

    #[test]
    fn apply_args_includes_prune_whitelist_and_server_side() {
        let executor = ApplyExecutor::new(
            "kubectl".into(),
            "kustomize".into(),
            vec!["Secret".to_owned()],
            Duration::from_secs(30),
        );
        let flags = ApplyFlags {
            namespace: "demo".to_owned(),
            dry_run: DryRunStrategy::Server,
            prune_whitelist: vec!["core/v1/ConfigMap".to_owned()],
            server_side: true,
            token: "tok".to_owned(),
            kubeconfig_path: "/tmp/kubeconfig".into(),
        };
        let args = executor.apply_args(&flags.prune_whitelist, &flags);
        assert!(args.contains(&"--prune".to_owned()));
        assert!(args.iter().any(|a| a == "--prune-whitelist=core/v1/ConfigMap"));
        assert!(args.contains(&"--server-side".to_owned()));
        assert!(args.contains(&"--dry-run=server".to_owned()));
    }

    #[test]
    fn filter_redacts_sensitive_terms() {
        let executor = ApplyExecutor::new(
            "kubectl".into(),
            "kustomize".into(),
            vec!["Secret".to_owned(), "base64".to_owned()],
            Duration::from_secs(30),
        );
        assert_eq!(executor.filter("error decoding base64 data"), REDACTION_SENTENCE);
        assert_eq!(executor.filter("plain configmap error"), "plain configmap error");
    }
}
