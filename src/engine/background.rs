use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::cleanup::CleanupService;
use crate::engine::pipeline::Pipeline;

/// Granularity of the detection loop's idle wait.
pub const IDLE_TICK: Duration = Duration::from_secs(1);
/// How often the cleanup loop checks whether its interval has elapsed.
pub const CLEANUP_CHECK_EVERY: Duration = Duration::from_secs(60);
/// Bounded wait for the cleanup task on shutdown.
pub const CLEANUP_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Pipeline counters, shared between the detection loop and the reporter.
pub struct RuntimeStats {
    detected: AtomicU64,
    analyzed: AtomicU64,
    resolved: AtomicU64,
    failed: AtomicU64,
    started_at: Instant,
}

impl Default for RuntimeStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeStats {
    pub fn new() -> Self {
        Self {
            detected: AtomicU64::new(0),
            analyzed: AtomicU64::new(0),
            resolved: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn record_detected(&self, n: usize) {
        self.detected.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_analyzed(&self) {
        self.analyzed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolved(&self) {
        self.resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            detected: self.detected.load(Ordering::Relaxed),
            analyzed: self.analyzed.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    pub fn log_report(&self) {
        let s = self.snapshot();
        tracing::info!(
            detected = s.detected,
            analyzed = s.analyzed,
            resolved = s.resolved,
            failed = s.failed,
            uptime_secs = s.uptime_secs,
            success_rate = %format!("{:.1}%", s.success_rate()),
            "Runtime statistics"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub detected: u64,
    pub analyzed: u64,
    pub resolved: u64,
    pub failed: u64,
    pub uptime_secs: u64,
}

impl StatsSnapshot {
    /// Share of finished resolutions that succeeded, 0 when none finished.
    pub fn success_rate(&self) -> f64 {
        let finished = self.resolved + self.failed;
        if finished == 0 {
            0.0
        } else {
            self.resolved as f64 / finished as f64 * 100.0
        }
    }
}

// ---------------------------------------------------------------------------
// Detection loop
// ---------------------------------------------------------------------------

/// Run detection cycles every `interval` until `cancel` fires. Each cycle
/// looks back over one interval.
pub async fn detection_loop(
    pipeline: Arc<Pipeline>,
    stats: Arc<RuntimeStats>,
    interval: Duration,
    stats_interval: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(interval_secs = interval.as_secs(), "Detection loop starting");
    let mut last_report = Instant::now();

    while !cancel.is_cancelled() {
        match pipeline.run_cycle(interval, &cancel).await {
            Ok(report) => tracing::debug!(?report, "Detection cycle complete"),
            Err(e) if e.is_retryable_next_cycle() => {
                tracing::warn!("Detection cycle skipped, retrying next cycle: {}", e)
            }
            Err(e) => tracing::error!("Detection cycle failed: {}", e),
        }

        if last_report.elapsed() >= stats_interval {
            stats.log_report();
            last_report = Instant::now();
        }

        if !idle(interval, &cancel).await {
            break;
        }
    }

    tracing::info!("Detection loop stopped");
    stats.log_report();
}

/// Sleep for `total` in one-second ticks. Returns `false` if cancelled first.
pub async fn idle(total: Duration, cancel: &CancellationToken) -> bool {
    let deadline = tokio::time::Instant::now() + total;
    let mut ticker = tokio::time::interval(IDLE_TICK);
    ticker.tick().await;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        if tokio::time::Instant::now() >= deadline {
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = ticker.tick() => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Cleanup loop
// ---------------------------------------------------------------------------

/// Start the cleanup task. The first pass runs immediately; later passes run
/// once `interval` has elapsed since the previous one, checked every
/// `check_every`.
pub fn spawn_cleanup_loop(
    service: CleanupService,
    interval: Duration,
    check_every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(
            interval_hours = interval.as_secs() / 3600,
            "Cleanup scheduler starting"
        );
        let mut last_pass: Option<Instant> = None;
        let mut ticker = tokio::time::interval(check_every);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let due = last_pass.map_or(true, |t| t.elapsed() >= interval);
            if due {
                service.run_pass(chrono::Utc::now()).await;
                last_pass = Some(Instant::now());
            }
        }

        tracing::info!("Cleanup scheduler stopped");
    })
}

/// Wait for a background task, giving up after `timeout`.
pub async fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, name: &str) {
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(())) => tracing::debug!(task = name, "Background task joined"),
        Ok(Err(e)) => tracing::error!(task = name, "Background task panicked: {}", e),
        Err(_) => tracing::warn!(task = name, timeout_secs = timeout.as_secs(), "Background task did not stop in time"),
    }
}
