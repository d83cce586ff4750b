pub mod clients;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod notifications;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use clients::elastic::{ElasticClient, LogStore};
use clients::generator::ChatPlanGenerator;
use clients::kube::{ControlPlane, KubeClient};
use config::AppConfig;
use engine::background::{self, RuntimeStats};
use engine::cache::SolutionCache;
use engine::cleanup::{CleanupService, CleanupSettings};
use engine::detector::Detector;
use engine::executor::{Executor, ExecutorSettings};
use engine::pipeline::{Pipeline, PipelineSettings};
use engine::port_forward::{self, PortForward};
use engine::verifier::Verifier;
use error::AppError;
use notifications::SlackNotifier;

/// Command-line switches that change how the service runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Run a single detection cycle (and a single cleanup pass) and return.
    pub once: bool,
    pub cleanup: bool,
    pub port_forward: bool,
}

/// Run the service until `cancel` fires, or for one cycle with `once`.
///
/// Errors returned from here are initialization failures; once the loops are
/// running, per-cycle failures are logged and retried.
pub async fn run(config: AppConfig, opts: RunOptions, cancel: CancellationToken) -> Result<(), AppError> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), once = opts.once, "Starting logheal");

    let forward = if opts.port_forward {
        Some(PortForward::start(&config.kubernetes.namespace, config.elasticsearch.port).await?)
    } else {
        None
    };

    let result = run_service(&config, opts, cancel).await;

    if let Some(forward) = forward {
        forward.stop(port_forward::SHUTDOWN_GRACE).await;
    }
    tracing::info!("logheal stopped");
    result
}

async fn run_service(config: &AppConfig, opts: RunOptions, cancel: CancellationToken) -> Result<(), AppError> {
    let pool = db::init_db(&config.database)?;

    let store = ElasticClient::connect(&config.elasticsearch).await?;
    let probe = store
        .reachability_client(&config.elasticsearch)?
        .map(|client| Arc::new(client) as Arc<dyn LogStore>);
    let control_plane: Arc<dyn ControlPlane> = Arc::new(KubeClient::new(&config.kubernetes)?);
    let generator = Arc::new(ChatPlanGenerator::new(&config.generator, &config.kubernetes.namespace)?);
    let notifier = Arc::new(SlackNotifier::new(&config.slack)?);
    let stats = Arc::new(RuntimeStats::new());
    let namespace = config.kubernetes.namespace.as_str();

    let verifier = Verifier::new(pool.clone(), control_plane.clone(), probe, namespace);
    let executor = Executor::new(
        pool.clone(),
        control_plane,
        verifier,
        ExecutorSettings::from_config(&config.resolver, namespace),
    );
    let cache = SolutionCache::new(pool.clone(), generator, config.resolver.reuse_threshold);
    let max_lookback = std::time::Duration::from_secs(config.log_management.max_search_hours * 3600);
    let detector = Detector::load(
        &pool,
        Arc::new(store.clone()) as Arc<dyn LogStore>,
        &config.elasticsearch.index_pattern,
        max_lookback,
    )?;
    let pipeline = Arc::new(Pipeline::new(
        pool.clone(),
        detector,
        cache,
        executor,
        notifier,
        stats.clone(),
        PipelineSettings::from_config(config),
    ));

    let cleanup = if opts.cleanup {
        // Own client for the cleanup task, pointed at whichever target answered.
        let cleanup_store = store.sibling(&config.elasticsearch)?;
        Some(CleanupService::new(
            pool.clone(),
            Some(Arc::new(cleanup_store)),
            CleanupSettings::from_config(&config.log_management, &config.database.path),
        ))
    } else {
        None
    };
    let interval = config.monitoring.check_interval();

    if opts.once {
        let report = pipeline.run_cycle(interval, &cancel).await?;
        tracing::info!(?report, "Single cycle complete");
        if let Some(cleanup) = cleanup {
            cleanup.run_pass(chrono::Utc::now()).await;
        }
        stats.log_report();
        return Ok(());
    }

    let cleanup_task = cleanup.map(|service| {
        background::spawn_cleanup_loop(
            service,
            std::time::Duration::from_secs(config.log_management.cleanup_interval_hours * 3600),
            background::CLEANUP_CHECK_EVERY,
            cancel.clone(),
        )
    });

    background::detection_loop(
        pipeline,
        stats,
        interval,
        std::time::Duration::from_secs(config.monitoring.stats_interval_secs),
        cancel.clone(),
    )
    .await;

    // The detection loop only returns once cancelled.
    if let Some(handle) = cleanup_task {
        background::join_with_timeout(handle, background::CLEANUP_JOIN_TIMEOUT, "cleanup").await;
    }
    Ok(())
}
