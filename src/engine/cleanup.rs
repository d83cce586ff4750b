//! Retention cleanup: log-store indices, then the audit trail, plans and
//! events, child before parent. A failed step is reported and the pass moves on.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc};

use crate::clients::elastic::LogStore;
use crate::config::LogManagementConfig;
use crate::db::repos::{error_events as event_repo, execution_records as record_repo, plans as plan_repo};
use crate::db::DbPool;

/// How far past the retention window the exact index enumeration reaches.
const INDEX_SCAN_DAYS: i64 = 29;

#[derive(Debug, Clone)]
pub struct CleanupSettings {
    pub retention_days: u32,
    pub event_retention_days: u32,
    pub indices_enabled: bool,
    pub index_prefix: String,
    pub database_enabled: bool,
    pub resource_check: Option<ResourceCheck>,
}

#[derive(Debug, Clone)]
pub struct ResourceCheck {
    /// Directory whose filesystem usage is reported.
    pub disk_path: PathBuf,
    pub warn_percent: f64,
}

impl CleanupSettings {
    pub fn from_config(config: &LogManagementConfig, db_path: &std::path::Path) -> Self {
        let disk_path = db_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            retention_days: config.retention_days,
            event_retention_days: config
                .database_cleanup
                .error_events_retention_days
                .unwrap_or(config.retention_days),
            indices_enabled: config.elasticsearch_cleanup.enabled,
            index_prefix: config.elasticsearch_cleanup.index_prefix.clone(),
            database_enabled: config.database_cleanup.enabled,
            resource_check: config.resource_check.enabled.then(|| ResourceCheck {
                disk_path,
                warn_percent: config.resource_check.warn_percent,
            }),
        }
    }
}

/// Per-entity outcome of one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    pub indices_deleted: usize,
    pub wildcard_pattern: Option<String>,
    pub execution_records_deleted: usize,
    pub plans_deleted: usize,
    pub error_events_deleted: usize,
    pub errors: Vec<String>,
}

pub struct CleanupService {
    pool: DbPool,
    store: Option<Arc<dyn LogStore>>,
    settings: CleanupSettings,
}

impl CleanupService {
    pub fn new(pool: DbPool, store: Option<Arc<dyn LogStore>>, settings: CleanupSettings) -> Self {
        Self { pool, store, settings }
    }

    pub async fn run_pass(&self, now: DateTime<Utc>) -> CleanupReport {
        tracing::info!(retention_days = self.settings.retention_days, "Cleanup pass started");
        let mut report = CleanupReport::default();

        if self.settings.indices_enabled {
            if let Some(store) = &self.store {
                self.cleanup_indices(store.as_ref(), now, &mut report).await;
            }
        }

        if self.settings.database_enabled {
            self.cleanup_database(now, &mut report);
        }

        if let Some(check) = &self.settings.resource_check {
            report_resources(check);
        }

        tracing::info!(
            indices = report.indices_deleted,
            execution_records = report.execution_records_deleted,
            plans = report.plans_deleted,
            error_events = report.error_events_deleted,
            errors = report.errors.len(),
            "Cleanup pass finished"
        );
        report
    }

    async fn cleanup_indices(&self, store: &dyn LogStore, now: DateTime<Utc>, report: &mut CleanupReport) {
        let retention = i64::from(self.settings.retention_days);
        let prefix = &self.settings.index_prefix;

        for name in expired_index_names(prefix, retention, now) {
            match store.index_exists(&name).await {
                Ok(false) => {}
                Ok(true) => match store.delete_index(&name).await {
                    Ok(()) => {
                        tracing::info!(index = %name, "Deleted expired index");
                        report.indices_deleted += 1;
                    }
                    Err(e) => {
                        tracing::warn!(index = %name, "Index delete failed: {}", e);
                        report.errors.push(format!("delete {name}: {e}"));
                    }
                },
                Err(e) => {
                    tracing::warn!(index = %name, "Index lookup failed: {}", e);
                    report.errors.push(format!("lookup {name}: {e}"));
                }
            }
        }

        if let Some(pattern) = expired_month_pattern(prefix, retention, now) {
            match store.delete_indices_matching(&pattern).await {
                Ok(()) => {
                    tracing::info!(pattern = %pattern, "Wildcard index cleanup done");
                    report.wildcard_pattern = Some(pattern);
                }
                Err(e) => {
                    tracing::warn!(pattern = %pattern, "Wildcard index cleanup failed: {}", e);
                    report.errors.push(format!("delete {pattern}: {e}"));
                }
            }
        }
    }

    fn cleanup_database(&self, now: DateTime<Utc>, report: &mut CleanupReport) {
        let cutoff = (now - ChronoDuration::days(i64::from(self.settings.retention_days))).to_rfc3339();
        let event_cutoff =
            (now - ChronoDuration::days(i64::from(self.settings.event_retention_days))).to_rfc3339();

        match record_repo::delete_older_than(&self.pool, &cutoff) {
            Ok(n) => report.execution_records_deleted = n,
            Err(e) => {
                tracing::error!("Execution record cleanup failed: {}", e);
                report.errors.push(format!("execution_records: {e}"));
            }
        }

        match plan_repo::delete_unreferenced_older_than(&self.pool, &cutoff) {
            Ok(n) => report.plans_deleted = n,
            Err(e) => {
                tracing::error!("Plan cleanup failed: {}", e);
                report.errors.push(format!("remediation_plans: {e}"));
            }
        }

        match event_repo::delete_older_than(&self.pool, &event_cutoff) {
            Ok(n) => report.error_events_deleted = n,
            Err(e) => {
                tracing::error!("Error event cleanup failed: {}", e);
                report.errors.push(format!("error_events: {e}"));
            }
        }
    }
}

/// Daily index names from `retention + 1` to `retention + 29` days back.
pub fn expired_index_names(prefix: &str, retention_days: i64, now: DateTime<Utc>) -> Vec<String> {
    (retention_days + 1..=retention_days + INDEX_SCAN_DAYS)
        .map(|days_back| {
            let date = now - ChronoDuration::days(days_back);
            format!("{prefix}-{}", date.format("%Y.%m.%d"))
        })
        .collect()
}

/// Wildcard over the whole month before the cutoff's month. Every index in it
/// is past retention.
pub fn expired_month_pattern(prefix: &str, retention_days: i64, now: DateTime<Utc>) -> Option<String> {
    let cutoff = (now - ChronoDuration::days(retention_days)).date_naive();
    let previous_month = cutoff.with_day(1)?.pred_opt()?;
    Some(format!("{prefix}-{}*", previous_month.format("%Y.%m")))
}

// ---------------------------------------------------------------------------
// System resources
// ---------------------------------------------------------------------------

fn report_resources(check: &ResourceCheck) {
    if let Some(pct) = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|text| memory_used_percent(&text))
    {
        log_usage("memory", pct, check.warn_percent);
    }
    if let Some(pct) = disk_used_percent(&check.disk_path) {
        log_usage("disk", pct, check.warn_percent);
    }
}

fn log_usage(resource: &str, pct: f64, warn_percent: f64) {
    if pct > warn_percent {
        tracing::warn!(resource, used_percent = %format!("{pct:.1}"), "High resource usage");
    } else {
        tracing::info!(resource, used_percent = %format!("{pct:.1}"), "Resource usage");
    }
}

/// Used memory percentage from `/proc/meminfo` contents.
fn memory_used_percent(meminfo: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    (total > 0.0).then(|| (total - available) / total * 100.0)
}

#[cfg(unix)]
fn disk_used_percent(path: &std::path::Path) -> Option<f64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and stat is a valid out-pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 || stat.f_blocks == 0 {
        return None;
    }
    let total = stat.f_blocks as f64;
    let free = stat.f_bfree as f64;
    Some((total - free) / total * 100.0)
}

#[cfg(not(unix))]
fn disk_used_percent(_path: &std::path::Path) -> Option<f64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::db::init_test_db;
    use crate::db::models::CreateExecutionRecordInput;
    use crate::engine::testing::FakeLogStore;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 15, 12, 0, 0).unwrap()
    }

    fn settings(retention_days: u32) -> CleanupSettings {
        CleanupSettings {
            retention_days,
            event_retention_days: retention_days,
            indices_enabled: true,
            index_prefix: "logstash".into(),
            database_enabled: true,
            resource_check: None,
        }
    }

    /// Insert an event, a plan and a record, all dated `days_ago`.
    fn seed_chain(pool: &DbPool, tag: &str, days_ago: i64) {
        let event = event_repo::insert_if_absent(pool, &event_repo::sample_input("memory", tag))
            .unwrap()
            .unwrap();
        let plan = plan_repo::create(pool, &plan_repo::sample_input(&event.signature)).unwrap();
        let record = record_repo::append(
            pool,
            &CreateExecutionRecordInput {
                error_event_id: Some(event.id.clone()),
                plan_id: Some(plan.id.clone()),
                status: "success".into(),
                output: "[]".into(),
                failure_reason: None,
                elapsed_ms: 12,
            },
        )
        .unwrap();

        let ts = (now() - ChronoDuration::days(days_ago)).to_rfc3339();
        let conn = pool.get().unwrap();
        conn.execute("UPDATE error_events SET created_at = ?1 WHERE id = ?2", rusqlite::params![ts, event.id])
            .unwrap();
        conn.execute("UPDATE remediation_plans SET created_at = ?1 WHERE id = ?2", rusqlite::params![ts, plan.id])
            .unwrap();
        conn.execute("UPDATE execution_records SET created_at = ?1 WHERE id = ?2", rusqlite::params![ts, record.id])
            .unwrap();
    }

    #[tokio::test]
    async fn test_database_retention_deletes_only_old_rows() {
        let pool = init_test_db().unwrap();
        seed_chain(&pool, "OOMKilled old", 10);
        seed_chain(&pool, "OOMKilled recent", 3);

        let service = CleanupService::new(pool.clone(), None, settings(7));
        let report = service.run_pass(now()).await;

        assert_eq!(report.execution_records_deleted, 1);
        assert_eq!(report.plans_deleted, 1);
        assert_eq!(report.error_events_deleted, 1);
        assert!(report.errors.is_empty());
        assert_eq!(record_repo::count(&pool).unwrap(), 1);
        assert_eq!(plan_repo::count(&pool).unwrap(), 1);
        assert_eq!(event_repo::count(&pool).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_index_cleanup_exact_then_wildcard() {
        let pool = init_test_db().unwrap();
        let store = Arc::new(FakeLogStore::with_indices(&[
            "logstash-2024.05.12".to_string(), // 3 days
            "logstash-2024.05.05".to_string(), // 10 days
            "logstash-2024.04.20".to_string(), // 25 days
            "logstash-2024.04.01".to_string(), // beyond the exact scan
            "other-2024.04.01".to_string(),
        ]));
        let service = CleanupService::new(pool, Some(store.clone()), settings(7));

        let report = service.run_pass(now()).await;
        assert_eq!(report.indices_deleted, 2);
        assert_eq!(report.wildcard_pattern.as_deref(), Some("logstash-2024.04*"));
        assert_eq!(
            store.remaining_indices(),
            vec!["logstash-2024.05.12".to_string(), "other-2024.04.01".to_string()]
        );
    }

    #[test]
    fn test_expired_index_names_window() {
        let names = expired_index_names("logstash", 7, now());
        assert_eq!(names.len(), 29);
        assert_eq!(names.first().unwrap(), "logstash-2024.05.07");
        assert_eq!(names.last().unwrap(), "logstash-2024.04.09");
    }

    #[test]
    fn test_month_pattern_never_covers_retained_days() {
        // Cutoff 2024-03-03 lies in March, so only February is matched.
        let t = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        assert_eq!(expired_month_pattern("logstash", 7, t).as_deref(), Some("logstash-2024.02*"));
        // Year boundary.
        let t = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        assert_eq!(expired_month_pattern("logstash", 1, t).as_deref(), Some("logstash-2023.12*"));
    }

    #[test]
    fn test_memory_used_percent() {
        let text = "MemTotal:       1000 kB\nMemFree:         100 kB\nMemAvailable:    250 kB\n";
        let pct = memory_used_percent(text).unwrap();
        assert!((pct - 75.0).abs() < f64::EPSILON);
        assert!(memory_used_percent("MemTotal: 0 kB\n").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_disk_usage_of_temp_dir() {
        let pct = disk_used_percent(&std::env::temp_dir()).unwrap();
        assert!((0.0..=100.0).contains(&pct));
    }
}
