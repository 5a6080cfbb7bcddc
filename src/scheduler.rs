use std::collections::HashMap;
use std::sync::Arc;

use kube::ResourceExt;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::git::GitMirror;
use crate::kube_client::KubeApiClient;
use crate::metrics::MetricsSink;
use crate::queue::RunQueueSender;
use crate::waybill::{RunType, Waybill};

/// Shared read view of the Scheduler's `namespace -> Waybill` map, handed to
/// the Runner so step 1 of spec.md §4.4 ("look up the latest Waybill
/// snapshot") doesn't have to go back to the apiserver on every request.
/// The Scheduler is the sole writer; reads never block a write for longer
/// than a `HashMap` clone.
#[derive(Default)]
pub struct WaybillSnapshots {
    inner: parking_lot::RwLock<HashMap<String, Waybill>>,
}

impl WaybillSnapshots {
    pub fn get(&self, namespace: &str) -> Option<Waybill> {
        self.inner.read().get(namespace).cloned()
    }

    fn set(&self, namespace: String, waybill: Waybill) {
        self.inner.write().insert(namespace, waybill);
    }

    /// Test-only seam so other modules' unit tests (e.g. the Runner's) can
    /// populate a snapshot without going through a full refresh cycle.
    #[cfg(test)]
    pub fn set_for_test(&self, namespace: String, waybill: Waybill) {
        self.set(namespace, waybill);
    }

    fn remove(&self, namespace: &str) {
        self.inner.write().remove(namespace);
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }
}

struct SchedulerState {
    timers: HashMap<String, CancellationToken>,
    git_last_queued_hash: Option<String>,
}

/// Owns Waybill discovery, per-Waybill timer loops, Git polling, and
/// request enqueueing, per spec.md §4.5.
pub struct Scheduler<K, M> {
    kube: Arc<K>,
    git: Arc<GitMirror>,
    metrics: Arc<M>,
    queue: RunQueueSender,
    snapshots: Arc<WaybillSnapshots>,
    waybill_poll_interval: std::time::Duration,
    git_poll_interval: std::time::Duration,
    state: parking_lot::Mutex<SchedulerState>,
    stop: CancellationToken,
}

impl<K, M> Scheduler<K, M>
where
    K: KubeApiClient + 'static,
    M: MetricsSink + 'static,
{
    pub fn new(
        kube: Arc<K>,
        git: Arc<GitMirror>,
        metrics: Arc<M>,
        queue: RunQueueSender,
        waybill_poll_interval: std::time::Duration,
        git_poll_interval: std::time::Duration,
    ) -> Self {
        Self {
            kube,
            git,
            metrics,
            queue,
            snapshots: Arc::new(WaybillSnapshots::default()),
            waybill_poll_interval,
            git_poll_interval,
            state: parking_lot::Mutex::new(SchedulerState {
                timers: HashMap::new(),
                git_last_queued_hash: None,
            }),
            stop: CancellationToken::new(),
        }
    }

    pub fn snapshots(&self) -> Arc<WaybillSnapshots> {
        self.snapshots.clone()
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Runs all three cooperating loops until the stop token fires. Mirrors
    /// the teacher's `ErrGroup` join-all-cancel-on-first-error pattern.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let mut group = crate::util::ErrGroup::new(self.stop.clone());

        let this = self.clone();
        group.spawn(async move { this.waybill_refresh_loop().await });

        let this = self.clone();
        group.spawn(async move { this.git_polling_loop().await });

        group.wait().await
    }

    async fn waybill_refresh_loop(self: Arc<Self>) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.waybill_poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_waybills().await {
                        log::warn!("waybill refresh failed: {e:#}");
                    }
                }
            }
        }
    }

    /// Runs a single Waybill discovery pass without starting the timer
    /// loops. Used by the `--once` CLI path, which wants `snapshots()`
    /// populated but never enters `run`'s infinite loops.
    pub async fn refresh_once(self: &Arc<Self>) -> anyhow::Result<()> {
        self.refresh_waybills().await
    }

    async fn refresh_waybills(self: &Arc<Self>) -> anyhow::Result<()> {
        let listed = self.kube.list_waybills().await?;
        let seen_namespaces: Vec<String> = listed
            .iter()
            .filter_map(|wb| wb.namespace())
            .collect();

        for waybill in &listed {
            let Some(ns) = waybill.namespace() else { continue };
            let existing = self.snapshots.get(&ns);
            // Deep-equal on the *full* object, per spec.md §4.5 -- not just
            // `spec`. The Runner patches `status.lastRun` on the apiserver
            // after every run, and `git_poll_tick` reads `lastRun` straight
            // out of this snapshot; comparing only `spec` would leave the
            // snapshot's `status` permanently stale and starve the Git
            // polling trigger of a commit to compare against.
            let changed = match &existing {
                None => true,
                Some(prev) => prev != waybill,
            };
            if changed {
                self.install_timer(ns.clone(), waybill.clone());
            }
        }

        let stale: Vec<String> = {
            let state = self.state.lock();
            state
                .timers
                .keys()
                .filter(|ns| !seen_namespaces.contains(ns))
                .cloned()
                .collect()
        };
        for ns in stale {
            self.cancel_timer(&ns);
            self.snapshots.remove(&ns);
        }

        self.metrics.reconcile_from_waybill_list(&listed);
        Ok(())
    }

    /// Cancels any existing timer for `namespace`, stores the new snapshot,
    /// and spawns a fresh per-Waybill timer loop, per spec.md §4.5.
    fn install_timer(self: &Arc<Self>, namespace: String, waybill: Waybill) {
        self.cancel_timer(&namespace);
        self.snapshots.set(namespace.clone(), waybill.clone());

        let child_stop = self.stop.child_token();
        self.state.lock().timers.insert(namespace.clone(), child_stop.clone());

        let this = self.clone();
        tokio::spawn(async move {
            this.per_waybill_timer_loop(namespace, waybill, child_stop).await;
        });
    }

    fn cancel_timer(&self, namespace: &str) {
        if let Some(token) = self.state.lock().timers.remove(namespace) {
            token.cancel();
        }
    }

    async fn per_waybill_timer_loop(self: Arc<Self>, namespace: String, waybill: Waybill, stop: CancellationToken) {
        let interval = waybill.spec.effective_run_interval();

        let initial_wait = match waybill.status.as_ref().and_then(|s| s.last_run.as_ref()) {
            None => None,
            Some(last_run) => {
                let due = last_run.started + chrono::Duration::from_std(interval).unwrap_or_default();
                let now = chrono::Utc::now();
                if due <= now {
                    None
                } else {
                    (due - now).to_std().ok()
                }
            }
        };

        if let Some(wait) = initial_wait {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = sleep(wait) => {}
            }
        }

        self.enqueue_if_auto_apply(&namespace, RunType::Scheduled);

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately; we already enqueued above
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => {
                    self.enqueue_if_auto_apply(&namespace, RunType::Scheduled);
                }
            }
        }
    }

    /// `spec.autoApply=false` still gets a timer loop (so it reinstalls
    /// correctly when toggled back on) but never enqueues Scheduled or
    /// Polling requests, per spec.md §4.5/§8.
    fn enqueue_if_auto_apply(&self, namespace: &str, run_type: RunType) {
        let Some(snapshot) = self.snapshots.get(namespace) else { return };
        if !snapshot.spec.auto_apply {
            return;
        }
        self.queue.try_enqueue(crate::queue::Request::new(namespace, run_type));
    }

    /// Forced runs ignore `autoApply` entirely, per spec.md §4.5/§8
    /// scenario 6. Exposed for the external force-run HTTP handler.
    pub fn enqueue_forced(&self, namespace: &str) {
        self.queue
            .try_enqueue(crate::queue::Request::new(namespace, RunType::Forced));
    }

    async fn git_polling_loop(self: Arc<Self>) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.git_poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if let Err(e) = self.git_poll_tick().await {
                        log::warn!("git polling tick failed: {e:#}");
                    }
                }
            }
        }
    }

    async fn git_poll_tick(self: &Arc<Self>) -> anyhow::Result<()> {
        let hash = self.git.hash_for_path(".").await?;

        let already_queued = {
            let state = self.state.lock();
            state.git_last_queued_hash.as_deref() == Some(hash.as_str())
        };
        if already_queued {
            return Ok(());
        }

        for namespace in self.snapshots.namespaces() {
            let Some(waybill) = self.snapshots.get(&namespace) else { continue };
            let Some(last_run) = waybill.status.as_ref().and_then(|s| s.last_run.as_ref()) else {
                continue;
            };
            if last_run.commit == hash.as_str() {
                continue;
            }
            let path = waybill.spec.effective_repository_path(&namespace).to_owned();
            match self.git.has_changes_for_path(&path, &last_run.commit).await {
                Ok(true) => self
                    .queue
                    .try_enqueue(crate::queue::Request::new(namespace.as_str(), RunType::Polling)),
                Ok(false) => {}
                Err(e) => log::warn!("has_changes_for_path({path:?}) failed: {e}"),
            }
        }

        self.state.lock().git_last_queued_hash = Some(hash.as_str().to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_client::mock::MockKubeClient;
    use crate::metrics::LoggingMetricsSink;
    use crate::queue::RunQueue;
    use crate::waybill::{SecretReference, WaybillSpec};
    use kube::core::ObjectMeta;

    fn waybill(namespace: &str, name: &str, auto_apply: bool) -> Waybill {
        Waybill {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_owned()),
                name: Some(name.to_owned()),
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

    // The GitMirror only holds a path, not a live handle to the TempDir, so
    // it's fine for the directory to be deleted once the test ends; these
    // tests never actually sync against it.
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
                std::time::Duration::from_secs(30),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn autoapply_false_never_enqueues_scheduled() {
        let kube = Arc::new(MockKubeClient::default());
        kube.insert_waybill(waybill("quiet", "wb", false));
        let git = git_mirror().await;
        let metrics = Arc::new(LoggingMetricsSink::default());
        let queue = RunQueue::new(8);
        let sender = queue.sender();

        let scheduler = Arc::new(Scheduler::new(
            kube,
            git,
            metrics,
            sender,
            std::time::Duration::from_millis(10),
            std::time::Duration::from_secs(3600),
        ));
        scheduler.refresh_waybills().await.unwrap();
        scheduler.enqueue_if_auto_apply("quiet", RunType::Scheduled);

        // enqueue_if_auto_apply is synchronous and should not have sent anything.
        assert!(scheduler.snapshots().get("quiet").is_some());
    }

    #[tokio::test]
    async fn forced_run_enqueues_regardless_of_autoapply() {
        let kube = Arc::new(MockKubeClient::default());
        kube.insert_waybill(waybill("quiet", "wb", false));
        let git = git_mirror().await;
        let metrics = Arc::new(LoggingMetricsSink::default());
        let mut queue = RunQueue::new(8);
        let sender = queue.sender();

        let scheduler = Arc::new(Scheduler::new(
            kube,
            git,
            metrics,
            sender,
            std::time::Duration::from_millis(10),
            std::time::Duration::from_secs(3600),
        ));
        scheduler.enqueue_forced("quiet");
        let req = queue.recv().await.unwrap();
        assert_eq!(req.namespace, "quiet");
        assert_eq!(req.run_type, RunType::Forced);
    }
}
