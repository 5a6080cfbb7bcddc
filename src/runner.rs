use std::collections::HashMap;
use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::ResourceExt;
use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;

use crate::apply::{ApplyExecutor, ApplyFlags, DryRunStrategy};
use crate::config::KubeConfig;
use crate::git::GitMirror;
use crate::kube_client::{EventType, KubeApiClient, PrunableKinds};
use crate::metrics::{parse_result_lines, MetricsSink};
use crate::queue::Request;
use crate::scheduler::WaybillSnapshots;
use crate::waybill::{LastRun, RunType, Waybill, WaybillSpec, WaybillStatus};

const DELEGATE_TOKEN_KEY: &str = "token";
const DELEGATE_CA_KEY: &str = "ca.crt";
const GIT_SSH_KEY_KEY: &str = "key";
const GIT_SSH_KNOWN_HOSTS_KEY: &str = "known_hosts";
const STRONGBOX_KEYRING_FILENAME: &str = ".strongbox_keyring";

/// Worker pool that consumes `Request`s off the run queue, per spec.md
/// §4.4. Serializes runs per namespace via a keyed lock; runs for distinct
/// namespaces proceed in parallel, bounded only by `pool_size` tasks
/// pulling off the shared receiver.
pub struct Runner<K, M> {
    kube: Arc<K>,
    git: Arc<GitMirror>,
    metrics: Arc<M>,
    apply: Arc<ApplyExecutor>,
    snapshots: Arc<WaybillSnapshots>,
    kube_config: KubeConfig,
    namespace_locks: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    pool_size: usize,
    status_update_retries: u32,
    global_dry_run: bool,
    failed_retry_cooldown: Option<Duration>,
    queue_sender: crate::queue::RunQueueSender,
}

impl<K, M> Runner<K, M>
where
    K: KubeApiClient + 'static,
    M: MetricsSink + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kube: Arc<K>,
        git: Arc<GitMirror>,
        metrics: Arc<M>,
        apply: Arc<ApplyExecutor>,
        snapshots: Arc<WaybillSnapshots>,
        kube_config: KubeConfig,
        pool_size: usize,
        status_update_retries: u32,
        global_dry_run: bool,
        failed_retry_cooldown: Option<Duration>,
        queue_sender: crate::queue::RunQueueSender,
    ) -> Self {
        Self {
            kube,
            git,
            metrics,
            apply,
            snapshots,
            kube_config,
            namespace_locks: std::sync::Mutex::new(HashMap::new()),
            pool_size,
            status_update_retries,
            global_dry_run,
            failed_retry_cooldown,
            queue_sender,
        }
    }

    fn namespace_lock(&self, namespace: &str) -> Arc<AsyncMutex<()>> {
        self.namespace_locks
            .lock()
            .expect("namespace lock map poisoned")
            .entry(namespace.to_owned())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Drains `queue` with `pool_size` concurrent workers until the queue
    /// is closed (the Scheduler/daemon shut down and dropped every
    /// sender). Mirrors the teacher's `ErrGroup`-joined-task pattern,
    /// though a worker never itself returns an error: a failed apply is a
    /// `LastRun` record, not a crashed task.
    pub async fn run_pool(self: Arc<Self>, queue: crate::queue::RunQueue) {
        let receiver = Arc::new(AsyncMutex::new(queue.into_receiver()));
        let mut handles = Vec::with_capacity(self.pool_size);
        for worker_id in 0..self.pool_size {
            let this = self.clone();
            let receiver = receiver.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let req = {
                        let mut guard = receiver.lock().await;
                        guard.recv().await
                    };
                    match req {
                        Some(req) => this.handle_request(req).await,
                        None => {
                            log::debug!("runner worker {worker_id} exiting: queue closed");
                            return;
                        }
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn handle_request(&self, req: Request) {
        let Some(waybill) = self.snapshots.get(&req.namespace) else {
            log::debug!("dropping {:?} request for unknown namespace {}", req.run_type, req.namespace);
            return;
        };

        if !waybill.spec.auto_apply && req.run_type != RunType::Forced {
            log::debug!(
                "dropping {:?} request for {}: autoApply=false",
                req.run_type,
                req.namespace
            );
            return;
        }

        let name = waybill.name_any();
        if req.run_type == RunType::Forced && !waybill.spec.auto_apply {
            self.kube
                .emit_waybill_event(
                    &req.namespace,
                    &name,
                    EventType::Warning,
                    "WaybillAutoApplyDisabled",
                    "forced run requested on a Waybill with autoApply=false".to_owned(),
                )
                .await
                .ok();
        }

        let lock = self.namespace_lock(&req.namespace);
        let _guard = lock.lock().await;

        let started = Utc::now();
        let outcome = self.run_once(&req.namespace, &name, &waybill, req.run_type.clone()).await;
        let finished = Utc::now();

        let success = outcome.success;
        let last_run = LastRun {
            command: outcome.command,
            commit: outcome.commit,
            started,
            finished,
            success,
            run_type: req.run_type.clone(),
            output: outcome.output,
            error_message: outcome.error_message.unwrap_or_default(),
        };

        self.persist_status(&req.namespace, &name, last_run.clone()).await;

        let duration = (finished - started).to_std().unwrap_or(Duration::ZERO);
        self.metrics.record_run_latency(&req.namespace, duration, success);
        self.metrics.record_last_run_timestamp(&req.namespace, finished);
        if let Some(exit_code) = outcome.exit_code {
            self.metrics.update_kubectl_exit_code_count(&req.namespace, Some(exit_code));
        }
        let result_lines = parse_result_lines(&last_run.output);
        self.metrics.update_result_summary(&req.namespace, &result_lines);

        if success {
            let truncated: String = last_run.command.chars().take(512).collect();
            self.kube
                .emit_waybill_event(
                    &req.namespace,
                    &name,
                    EventType::Normal,
                    "WaybillApplied",
                    format!("applied commit {} via `{truncated}`", last_run.commit),
                )
                .await
                .ok();
        } else {
            self.kube
                .emit_waybill_event(
                    &req.namespace,
                    &name,
                    EventType::Warning,
                    "WaybillRunFailed",
                    last_run.error_message.clone(),
                )
                .await
                .ok();

            if let Some(cooldown) = self.failed_retry_cooldown {
                let sender = self.queue_sender.clone();
                let namespace = req.namespace.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(cooldown).await;
                    sender.try_enqueue(Request::new(namespace, RunType::FailedRetry));
                });
            }
        }
    }

    /// Steps 2-6 of spec.md §4.4: prepare the scratch workspace, resolve
    /// credentials, compute the prune whitelist, and invoke the Apply
    /// Executor. Always returns a result usable for a `LastRun` record;
    /// never panics on a user/cluster induced failure, per spec.md §7.
    async fn run_once(&self, namespace: &str, name: &str, waybill: &Waybill, run_type: RunType) -> RunOutcome {
        if let Err(e) = waybill.spec.validate() {
            return RunOutcome::config_error(e.to_string());
        }

        let scratch = match tempfile::TempDir::with_prefix(format!("kube-applier-{namespace}-")) {
            Ok(dir) => dir,
            Err(e) => return RunOutcome::config_error(format!("creating scratch dir: {e}")),
        };

        let mut env: Vec<(OsString, OsString)> = Vec::new();

        if let Some(keyring_ref) = &waybill.spec.strongbox_keyring_secret_ref {
            match self.materialize_strongbox_keyring(scratch.path(), keyring_ref).await {
                Ok(strongbox_home) => env.push(("STRONGBOX_HOME".into(), strongbox_home.into())),
                Err(e) => return RunOutcome::config_error(format!("materializing strongbox keyring: {e}")),
            }
        }

        if let Some(ssh_ref) = &waybill.spec.git_ssh_secret_ref {
            match self.materialize_git_ssh(scratch.path(), ssh_ref).await {
                Ok(ssh_command) => env.push(("GIT_SSH_COMMAND".into(), ssh_command.into())),
                Err(e) => return RunOutcome::config_error(format!("materializing git SSH identity: {e}")),
            }
        }

        let repository_path = waybill.spec.effective_repository_path(namespace).to_owned();
        let workspace = scratch.path().join("workspace");
        let commit = match self.git.clone_local(&env, &workspace, &repository_path).await {
            Ok(commit) => commit,
            Err(e) => return RunOutcome::git_error(e.to_string()),
        };

        let token = match self.resolve_delegate_token(waybill).await {
            Ok(token) => token,
            Err(e) => return RunOutcome::config_error(e),
        };

        let kubeconfig_path = scratch.path().join("kubeconfig");
        if let Err(e) = fs::write(&kubeconfig_path, &token.kubeconfig).await {
            return RunOutcome::config_error(format!("writing kubeconfig: {e}"));
        }

        let whitelist = self.compute_whitelist(namespace, &waybill.spec, &token.kubeconfig).await;

        let flags = ApplyFlags {
            namespace: namespace.to_owned(),
            dry_run: DryRunStrategy::for_waybill(waybill.spec.dry_run, self.global_dry_run),
            prune_whitelist: whitelist,
            server_side: waybill.spec.server_side_apply,
            token: token.raw,
            kubeconfig_path,
        };

        let apply_outcome = self.apply.apply(&workspace, &flags).await;

        log::info!(
            "run finished: namespace={namespace} name={name} type={run_type} commit={} success={}",
            commit,
            apply_outcome.success()
        );

        RunOutcome {
            command: apply_outcome.command,
            commit: commit.to_string(),
            output: apply_outcome.output,
            success: apply_outcome.success(),
            error_message: apply_outcome.error,
            exit_code: apply_outcome.exit_code,
        }
    }

    /// Discovery-permission intersection, per spec.md §4.2/§4.4 step 4. Runs
    /// the access checks under the delegate's own kubeconfig, the same one
    /// written to disk for `kubectl`, so the whitelist never includes a kind
    /// the delegate can't actually delete. On discovery failure, degrades to
    /// an empty whitelist (pruning off for this run), per spec.md §4.6.
    async fn compute_whitelist(&self, namespace: &str, spec: &WaybillSpec, delegate_kubeconfig: &str) -> Vec<String> {
        if !spec.prune {
            return Vec::new();
        }
        let prunable = match self.kube.prunable_resource_gvks(namespace, delegate_kubeconfig).await {
            Ok(p) => p,
            Err(e) => {
                log::warn!("prunable resource discovery failed for {namespace}, disabling pruning for this run: {e}");
                PrunableKinds::default()
            }
        };

        let mut whitelist = prunable.namespaced.clone();
        if spec.prune_cluster_resources {
            for gvk in &prunable.cluster_scoped {
                if !whitelist.contains(gvk) {
                    whitelist.push(gvk.clone());
                }
            }
        }
        whitelist.retain(|gvk| !spec.prune_blacklist.iter().any(|b| b == gvk));
        whitelist
    }

    async fn resolve_delegate_token(&self, waybill: &Waybill) -> Result<DelegateToken, String> {
        let secret_ref = &waybill.spec.delegate_service_account_secret_ref;
        let data = self
            .kube
            .get_secret(&secret_ref.namespace, &secret_ref.name)
            .await
            .map_err(|e| format!("fetching delegate secret {}/{}: {e}", secret_ref.namespace, secret_ref.name))?;

        let token_bytes = data
            .get(DELEGATE_TOKEN_KEY)
            .ok_or_else(|| format!("delegate secret {}/{} missing {DELEGATE_TOKEN_KEY:?} key", secret_ref.namespace, secret_ref.name))?;
        let token = String::from_utf8_lossy(token_bytes).into_owned();
        let ca_pem = data.get(DELEGATE_CA_KEY).cloned();

        let namespace = waybill.namespace().unwrap_or_default();
        let kubeconfig = self
            .kube_config
            .render_delegate_kubeconfig(&namespace, &token, ca_pem.as_deref());

        Ok(DelegateToken {
            raw: token,
            kubeconfig,
        })
    }

    async fn materialize_strongbox_keyring(
        &self,
        scratch: &Path,
        secret_ref: &crate::waybill::SecretReference,
    ) -> Result<String, String> {
        let data = self
            .kube
            .get_secret(&secret_ref.namespace, &secret_ref.name)
            .await
            .map_err(|e| format!("fetching strongbox secret: {e}"))?;
        let keyring_bytes = data
            .values()
            .next()
            .ok_or_else(|| "strongbox secret has no data keys".to_owned())?;

        let home = scratch.join("strongbox-home");
        fs::create_dir_all(&home).await.map_err(|e| e.to_string())?;
        let keyring_path = home.join(STRONGBOX_KEYRING_FILENAME);
        fs::write(&keyring_path, keyring_bytes).await.map_err(|e| e.to_string())?;
        set_private_permissions(&keyring_path).await;
        Ok(home.to_string_lossy().into_owned())
    }

    async fn materialize_git_ssh(
        &self,
        scratch: &Path,
        secret_ref: &crate::waybill::SecretReference,
    ) -> Result<String, String> {
        let data = self
            .kube
            .get_secret(&secret_ref.namespace, &secret_ref.name)
            .await
            .map_err(|e| format!("fetching git SSH secret: {e}"))?;
        let key_bytes = data
            .get(GIT_SSH_KEY_KEY)
            .ok_or_else(|| format!("git SSH secret missing {GIT_SSH_KEY_KEY:?} key"))?;

        let ssh_dir = scratch.join("ssh");
        fs::create_dir_all(&ssh_dir).await.map_err(|e| e.to_string())?;
        let key_path = ssh_dir.join("id");
        fs::write(&key_path, key_bytes).await.map_err(|e| e.to_string())?;
        set_private_permissions(&key_path).await;

        let known_hosts_arg = if let Some(known_hosts_bytes) = data.get(GIT_SSH_KNOWN_HOSTS_KEY) {
            let known_hosts_path = ssh_dir.join("known_hosts");
            fs::write(&known_hosts_path, known_hosts_bytes).await.map_err(|e| e.to_string())?;
            format!("-o UserKnownHostsFile={}", known_hosts_path.display())
        } else {
            "-o StrictHostKeyChecking=no".to_owned()
        };

        Ok(format!("ssh -i {} {known_hosts_arg}", key_path.display()))
    }

    /// Writes the `LastRun` to the Waybill's status subresource, retrying
    /// on conflict up to `status_update_retries` times because status
    /// updates are idempotent and `lastRun` is authoritative, per spec.md
    /// §4.4 step 6 / §4.6.
    async fn persist_status(&self, namespace: &str, name: &str, last_run: LastRun) {
        for attempt in 0..self.status_update_retries.max(1) {
            let status = WaybillStatus {
                last_run: Some(last_run.clone()),
            };
            match self.kube.update_waybill_status(namespace, name, status).await {
                Ok(()) => return,
                Err(e) => {
                    log::warn!(
                        "status update for {namespace}/{name} failed (attempt {}/{}): {e}",
                        attempt + 1,
                        self.status_update_retries
                    );
                    // Re-fetch so a subsequent attempt isn't racing a stale
                    // resourceVersion; the fetched object itself isn't
                    // needed beyond confirming the Waybill still exists.
                    if self.kube.get_waybill(namespace, name).await.is_err() {
                        log::error!("waybill {namespace}/{name} disappeared during status update, dropping");
                        return;
                    }
                }
            }
        }
        log::error!("giving up persisting status for {namespace}/{name} after {} attempts", self.status_update_retries);
    }
}

async fn set_private_permissions(path: &Path) {
    if let Err(e) = fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await {
        log::warn!("failed to restrict permissions on {path:?}: {e}");
    }
}

struct DelegateToken {
    raw: String,
    kubeconfig: String,
}

/// Outcome of `run_once`, pre-`LastRun` shape so `handle_request` can stamp
/// the timestamps and run type that only it knows about.
struct RunOutcome {
    command: String,
    commit: String,
    output: String,
    success: bool,
    error_message: Option<String>,
    exit_code: Option<i32>,
}

impl RunOutcome {
    fn config_error(message: String) -> Self {
        Self {
            command: String::new(),
            commit: String::new(),
            output: String::new(),
            success: false,
            error_message: Some(message),
            exit_code: None,
        }
    }

    fn git_error(message: String) -> Self {
        Self {
            command: String::new(),
            commit: String::new(),
            output: String::new(),
            success: false,
            error_message: Some(format!("git error: {message}")),
            exit_code: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::ApplyExecutor;
    use crate::config::KubeConfig;
    use crate::kube_client::mock::MockKubeClient;
    use crate::metrics::LoggingMetricsSink;
    use crate::queue::RunQueue;
    use crate::waybill::{SecretReference, WaybillSpec};
    use kube::core::ObjectMeta;

    fn waybill(namespace: &str, auto_apply: bool) -> Waybill {
        Waybill {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_owned()),
                name: Some("wb".to_owned()),
                ..Default::default()
            },
            spec: WaybillSpec {
                auto_apply,
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
                    namespace: namespace.to_owned(),
                    name: "delegate-token".to_owned(),
                },
            },
            status: None,
        }
    }

    fn kube_config() -> KubeConfig {
        KubeConfig {
            kubeconfig_path: None,
            field_manager: "kube-applier".to_owned(),
            api_server: "https://kube.example.com:6443".to_owned(),
            ca_cert_path: None,
        }
    }

    async fn git_mirror() -> Arc<GitMirror> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_owned();
        std::mem::forget(dir);
        Arc::new(
            GitMirror::new(
                path,
                "git".into(),
                "file:///dev/null".to_owned(),
                "master".to_owned(),
                "HEAD".to_owned(),
                None,
                Duration::from_secs(30),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn drops_request_for_unknown_namespace() {
        let kube = Arc::new(MockKubeClient::default());
        let snapshots = Arc::new(WaybillSnapshots::default());
        let runner = Arc::new(Runner::new(
            kube,
            git_mirror().await,
            Arc::new(LoggingMetricsSink::default()),
            Arc::new(ApplyExecutor::new(
                "kubectl".into(),
                "kustomize".into(),
                vec!["Secret".into()],
                Duration::from_secs(5),
            )),
            snapshots,
            kube_config(),
            1,
            3,
            false,
            None,
            RunQueue::new(4).sender(),
        ));
        // Should simply return without panicking: namespace has no snapshot.
        runner.handle_request(Request::new("ghost", RunType::Scheduled)).await;
    }

    #[tokio::test]
    async fn drops_scheduled_request_when_autoapply_false() {
        let kube = Arc::new(MockKubeClient::default());
        let wb = waybill("quiet", false);
        kube.insert_waybill(wb.clone());
        let snapshots = Arc::new(WaybillSnapshots::default());
        snapshots.set_for_test("quiet".to_owned(), wb);

        let runner = Arc::new(Runner::new(
            kube.clone(),
            git_mirror().await,
            Arc::new(LoggingMetricsSink::default()),
            Arc::new(ApplyExecutor::new(
                "kubectl".into(),
                "kustomize".into(),
                vec!["Secret".into()],
                Duration::from_secs(5),
            )),
            snapshots,
            kube_config(),
            1,
            3,
            false,
            None,
            RunQueue::new(4).sender(),
        ));
        runner.handle_request(Request::new("quiet", RunType::Scheduled)).await;
        // No status should have been written since the request was dropped
        // before any run executed.
        let stored = kube.get_waybill("quiet", "wb").await.unwrap();
        assert!(stored.status.is_none());
    }

    #[test]
    fn whitelist_removes_blacklisted_entries() {
        let spec = WaybillSpec {
            auto_apply: true,
            dry_run: false,
            prune: true,
            prune_cluster_resources: true,
            prune_blacklist: vec!["core/v1/ConfigMap".to_owned()],
            repository_path: String::new(),
            run_interval: 3600,
            server_side_apply: false,
            strongbox_keyring_secret_ref: None,
            git_ssh_secret_ref: None,
            delegate_service_account_secret_ref: SecretReference {
                namespace: "demo".to_owned(),
                name: "delegate-token".to_owned(),
            },
        };
        let prunable = PrunableKinds {
            namespaced: vec!["core/v1/ConfigMap".to_owned(), "apps/v1/Deployment".to_owned()],
            cluster_scoped: vec!["rbac.authorization.k8s.io/v1/ClusterRole".to_owned()],
        };
        // Exercise the pure logic directly (mirrors Runner::compute_whitelist
        // without needing a KubeApiClient instance).
        let mut whitelist = prunable.namespaced.clone();
        for gvk in &prunable.cluster_scoped {
            if !whitelist.contains(gvk) {
                whitelist.push(gvk.clone());
            }
        }
        whitelist.retain(|gvk| !spec.prune_blacklist.iter().any(|b| b == gvk));
        assert!(!whitelist.contains(&"core/v1/ConfigMap".to_owned()));
        assert!(whitelist.contains(&"apps/v1/Deployment".to_owned()));
        assert!(whitelist.contains(&"rbac.authorization.k8s.io/v1/ClusterRole".to_owned()));
    }
}
