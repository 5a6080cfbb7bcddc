use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use kube::config::{KubeConfigOptions, Kubeconfig};

use kube_applier_core::apply::ApplyExecutor;
use kube_applier_core::config::Config;
use kube_applier_core::git::GitMirror;
use kube_applier_core::kube_client::RealKubeClient;
use kube_applier_core::metrics::LoggingMetricsSink;
use kube_applier_core::queue::RunQueue;
use kube_applier_core::runner::Runner;
use kube_applier_core::scheduler::Scheduler;
use kube_applier_core::status::{self, StatusServerState};
use kube_applier_core::util::ErrGroup;
use kube_applier_core::waybill::RunType;

/// Reconciles a fleet of namespaces against Git-declared manifests via
/// per-namespace `kubectl apply`. See spec.md for the full design.
#[derive(Parser, Debug)]
#[command(name = "kube-applier", version)]
struct Cli {
    /// Path to the daemon's TOML config file.
    #[arg(long, global = true, default_value = "kube-applier.toml")]
    config: PathBuf,

    /// Overrides `kube.kubeconfig_path` from the config file.
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Starts the daemon: Git mirror, Scheduler, Runner pool, and the
    /// status/force-run HTTP listener.
    Run {
        /// Runs every currently-due Waybill once and exits, instead of
        /// starting the timer loops. Useful for CI smoke-testing the
        /// binary against a throwaway cluster.
        #[arg(long)]
        once: bool,
        /// Address the status/force-run HTTP listener binds to.
        #[arg(long, default_value = "0.0.0.0:8080")]
        listen: String,
    },
    /// Parses and schema-checks a config file without starting anything.
    ValidateConfig,
}

fn init_logging() -> Result<()> {
    flexi_logger::Logger::try_with_env_or_str("info")
        .context("configuring flexi_logger")?
        .start()
        .context("starting flexi_logger")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    let config_str = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading config file {:?}", cli.config))?;
    let mut config = Config::parse(&config_str).context("loading config")?;
    if let Some(kubeconfig) = &cli.kubeconfig {
        config.kube.kubeconfig_path = Some(kubeconfig.clone());
    }

    match cli.command {
        Command::ValidateConfig => {
            log::info!("config at {:?} is valid", cli.config);
            Ok(())
        }
        Command::Run { once, listen } => run(config, once, listen).await,
    }
}

async fn build_kube_client(config: &Config) -> Result<kube::Client> {
    match &config.kube.kubeconfig_path {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig {path:?}"))?;
            let kube_config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("building kube::Config from kubeconfig")?;
            kube::Client::try_from(kube_config).context("constructing kube client")
        }
        None => kube::Client::try_default()
            .await
            .context("constructing in-cluster/default kube client"),
    }
}

async fn run(config: Config, once: bool, listen: String) -> Result<()> {
    let kube_client = build_kube_client(&config).await?;
    let kube = Arc::new(RealKubeClient::new(kube_client));
    let metrics = Arc::new(LoggingMetricsSink::default());

    let git = Arc::new(GitMirror::new(
        config.git.mirror_path.clone(),
        config.git.git_binary.clone().unwrap_or_else(|| "git".into()),
        config.git.remote.clone(),
        config.git.branch.clone(),
        config.git.revision.clone(),
        config.git.depth,
        config.git.sync_interval(),
    )?);

    let apply = Arc::new(ApplyExecutor::new(
        config.apply.kubectl_binary.clone(),
        config.apply.kustomize_binary.clone(),
        config.apply.sensitive_terms.clone(),
        config.apply.subprocess_timeout(),
    ));

    let queue = RunQueue::new(config.scheduler.run_queue_capacity);
    let queue_sender = queue.sender();

    let scheduler = Arc::new(Scheduler::new(
        kube.clone(),
        git.clone(),
        metrics.clone(),
        queue_sender.clone(),
        config.scheduler.waybill_poll_interval(),
        config.scheduler.git_poll_interval(),
    ));

    let runner = Arc::new(Runner::new(
        kube.clone(),
        git.clone(),
        metrics.clone(),
        apply,
        scheduler.snapshots(),
        config.kube.clone(),
        config.runner.pool_size,
        config.runner.status_update_retries,
        config.runner.global_dry_run,
        config.scheduler.failed_retry_cooldown(),
        queue_sender.clone(),
    ));

    if once {
        log::info!("--once requested: syncing Git, refreshing Waybills, and forcing a single run of each");
        git.ensure_cloned().await.context("initial git clone")?;
        scheduler.refresh_once().await.context("waybill refresh")?;
        for namespace in scheduler.snapshots().namespaces() {
            queue_sender.try_enqueue(kube_applier_core::queue::Request::new(namespace, RunType::Forced));
        }
        drop(queue_sender);

        // run_pool only returns once every RunQueueSender is dropped; the
        // Runner itself holds one (for FailedRetry re-enqueues), so bound
        // this with a generous deadline instead of waiting on that forever.
        let deadline = config.apply.subprocess_timeout() * (config.runner.pool_size as u32).max(1)
            + std::time::Duration::from_secs(30);
        if tokio::time::timeout(deadline, runner.run_pool(queue)).await.is_err() {
            log::warn!("--once: timed out waiting for all runs to finish");
        }
        return Ok(());
    }

    let stop = scheduler.stop_token();
    let mut group = ErrGroup::new(stop.clone());

    let git_for_sync = git.clone();
    let metrics_for_sync = metrics.clone();
    group.spawn(async move {
        git_for_sync
            .start_sync(move |ok, duration| metrics_for_sync.record_git_sync(ok, duration))
            .await
    });

    let scheduler_for_run = scheduler.clone();
    group.spawn(async move { scheduler_for_run.run().await });

    group.spawn(async move {
        runner.run_pool(queue).await;
        Ok(())
    });

    let router = status::router(StatusServerState {
        kube: kube.clone(),
        queue: queue_sender,
    });
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding status listener on {listen}"))?;
    log::info!("status/force-run listener on {listen}");
    let stop_for_server = stop.clone();
    group.spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { stop_for_server.cancelled().await })
            .await
            .context("status server failed")
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("received shutdown signal");
            stop.cancel();
        }
        _ = stop.cancelled() => {}
    }

    git.stop_sync();
    group.wait().await
}
