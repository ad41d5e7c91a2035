//! Monitor cycle runner.
//!
//! Drives the main loop: every cycle reloads the configuration, prunes the
//! store, fetches every enabled point concurrently, then walks the results
//! in configured point order to append readings, evaluate alerts and
//! deliver notifications. The health reporter is called exactly once at the
//! end of every cycle, whatever happened before.
//!
//! Nothing inside a cycle stops the loop. A point failure is recorded in the
//! [`CycleReport`]; a broken configuration aborts only that cycle and the
//! next one is scheduled with the last good interval.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::alerts::notifier::{Notification, Notifier};
use crate::alerts::report::{build_status_report, report_due, sent_recently};
use crate::alerts::AlertEvaluator;
use crate::config::ConfigSnapshot;
use crate::error::FailureKind;
use crate::forecast::{normalize_entries, ForecastSource, SourceError, SourceResult};
use crate::health::HealthReporter;
use crate::metrics::AppMetrics;
use crate::store::NowcastStore;
use crate::types::{ForecastEntry, Point, Reading};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_COOLDOWN_MINUTES: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleStatus {
    Completed,
    /// `monitoring.enabled` is false; nothing was collected.
    Disabled,
    /// The configuration could not be loaded; nothing was collected.
    ConfigFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointFailure {
    pub point: String,
    pub kind: FailureKind,
    pub message: String,
}

/// What happened to one point in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum PointOutcome {
    Collected { readings: usize },
    Failed { kind: FailureKind, message: String },
    /// Shutdown was requested before the fetch finished.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: CycleStatus,
    pub points_total: usize,
    pub points_ok: usize,
    pub outcomes: Vec<(String, PointOutcome)>,
    pub failures: Vec<PointFailure>,
    pub readings_stored: usize,
    pub notifications_sent: usize,
    pub notification_errors: usize,
    pub pruned: u64,
    pub interrupted: bool,
}

impl CycleReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            status: CycleStatus::Completed,
            points_total: 0,
            points_ok: 0,
            outcomes: Vec::new(),
            failures: Vec::new(),
            readings_stored: 0,
            notifications_sent: 0,
            notification_errors: 0,
            pruned: 0,
            interrupted: false,
        }
    }

    /// False iff any point failed or the configuration could not be loaded.
    pub fn ok(&self) -> bool {
        !matches!(self.status, CycleStatus::ConfigFailed(_)) && self.failures.is_empty()
    }

    pub fn outcome(&self, point: &str) -> Option<&PointOutcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == point)
            .map(|(_, outcome)| outcome)
    }

    pub fn summary_line(&self) -> String {
        match &self.status {
            CycleStatus::ConfigFailed(message) => format!("Cycle aborted: {}", message),
            CycleStatus::Disabled => "Monitoring disabled, collection skipped".to_string(),
            CycleStatus::Completed => {
                let mut line = format!(
                    "Cycle {}: {}/{} points ok, {} readings stored, {} notifications sent",
                    if self.ok() { "OK" } else { "FAILED" },
                    self.points_ok,
                    self.points_total,
                    self.readings_stored,
                    self.notifications_sent,
                );
                if self.notification_errors > 0 {
                    line.push_str(&format!(", {} notification errors", self.notification_errors));
                }
                if self.interrupted {
                    line.push_str(" (interrupted)");
                }
                line
            }
        }
    }

    fn record(&mut self, point: &str, outcome: PointOutcome) {
        match &outcome {
            PointOutcome::Collected { readings } => {
                self.points_ok += 1;
                self.readings_stored += readings;
            }
            PointOutcome::Failed { kind, message } => {
                tracing::warn!("[{}] {}: {}", point, kind, message);
                self.failures.push(PointFailure {
                    point: point.to_string(),
                    kind: *kind,
                    message: message.clone(),
                });
            }
            PointOutcome::Cancelled => self.interrupted = true,
        }
        self.outcomes.push((point.to_string(), outcome));
    }
}

type FetchHandle = JoinHandle<Option<SourceResult<Vec<ForecastEntry>>>>;

/// Owns the alert state and every collaborator a cycle needs.
pub struct Monitor {
    config_path: PathBuf,
    source: Arc<dyn ForecastSource>,
    notifier: Arc<dyn Notifier>,
    store: Arc<NowcastStore>,
    health: Arc<HealthReporter>,
    metrics: Arc<AppMetrics>,
    evaluator: AlertEvaluator,
    last_interval: Duration,
}

impl Monitor {
    pub fn new(
        config_path: impl Into<PathBuf>,
        source: Arc<dyn ForecastSource>,
        notifier: Arc<dyn Notifier>,
        store: Arc<NowcastStore>,
        health: Arc<HealthReporter>,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        Self {
            config_path: config_path.into(),
            source,
            notifier,
            store,
            health,
            metrics,
            evaluator: AlertEvaluator::new(chrono::Duration::minutes(DEFAULT_COOLDOWN_MINUTES)),
            last_interval: DEFAULT_INTERVAL,
        }
    }

    pub fn evaluator(&self) -> &AlertEvaluator {
        &self.evaluator
    }

    /// Interval from the last configuration that loaded successfully.
    pub fn last_interval(&self) -> Duration {
        self.last_interval
    }

    /// Run cycles until `token` is cancelled. The first cycle starts
    /// immediately; each following one starts `interval` after the previous
    /// start, or right away if the previous cycle overran.
    pub async fn run(mut self, token: CancellationToken) {
        tracing::info!(
            "Monitor started (config: {}, source: {}, notifier: {})",
            self.config_path.display(),
            self.source.source_name(),
            self.notifier.transport_name()
        );

        loop {
            let started = Instant::now();
            self.run_once(&token).await;

            if token.is_cancelled() {
                break;
            }

            let next = started
                .checked_add(self.last_interval)
                .or_else(|| started.checked_add(DEFAULT_INTERVAL))
                .unwrap_or(started);
            tracing::debug!("Next cycle in {:?}", next.saturating_duration_since(Instant::now()));

            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep_until(next) => {}
            }
        }

        tracing::info!("Monitor stopped cleanly");
    }

    pub async fn run_once(&mut self, token: &CancellationToken) -> CycleReport {
        self.run_once_at(Utc::now(), token).await
    }

    /// Run one cycle using `now` as the reference time.
    pub async fn run_once_at(&mut self, now: DateTime<Utc>, token: &CancellationToken) -> CycleReport {
        let clock = Instant::now();
        let mut report = CycleReport::new(now);

        match ConfigSnapshot::load(&self.config_path).await {
            Err(err) => {
                tracing::error!("Configuration error, skipping cycle: {}", err);
                report.status = CycleStatus::ConfigFailed(err.to_string());
            }
            Ok(snapshot) => {
                self.last_interval = snapshot.interval();
                if snapshot.monitoring.enabled {
                    self.collect(&snapshot, now, token, &mut report).await;
                } else {
                    tracing::info!("Monitoring disabled in configuration");
                    report.status = CycleStatus::Disabled;
                }
            }
        }

        report.finished_at = now
            + chrono::Duration::from_std(clock.elapsed())
                .unwrap_or_else(|_| chrono::Duration::zero());

        self.health.report(&report).await;
        self.metrics.observe_cycle(&report);
        tracing::info!("{}", report.summary_line());

        report
    }

    async fn collect(
        &mut self,
        snapshot: &ConfigSnapshot,
        now: DateTime<Utc>,
        token: &CancellationToken,
        report: &mut CycleReport,
    ) {
        self.evaluator.set_cooldown(snapshot.cooldown());
        let configured: HashSet<&str> = snapshot.points.iter().map(|p| p.name.as_str()).collect();
        self.evaluator.retain_points(&configured);

        self.prune(snapshot, now, report).await;

        let points: Vec<Point> = snapshot.enabled_points().cloned().collect();
        report.points_total = points.len();

        let handles = self.spawn_fetches(&points, snapshot, now, token);

        for (point, handle) in points.iter().zip(handles) {
            let outcome = match handle.await {
                Err(err) if err.is_panic() => PointOutcome::Failed {
                    kind: FailureKind::Internal,
                    message: "fetch task panicked".to_string(),
                },
                Err(err) => PointOutcome::Failed {
                    kind: FailureKind::Internal,
                    message: format!("fetch task failed: {}", err),
                },
                Ok(None) => PointOutcome::Cancelled,
                Ok(Some(Err(err))) => source_failure(err),
                Ok(Some(Ok(entries))) => match normalize_entries(entries, &snapshot.leads) {
                    Err(err) => source_failure(err),
                    Ok(entries) => self.process_point(point, &entries, snapshot, now, report).await,
                },
            };
            report.record(&point.name, outcome);
        }

        if snapshot.notification.enabled && !token.is_cancelled() {
            self.maybe_send_status_report(snapshot, now, report).await;
        }
    }

    async fn prune(&self, snapshot: &ConfigSnapshot, now: DateTime<Utc>, report: &mut CycleReport) {
        let retention = snapshot.retention();

        // Out-of-range cutoffs mean nothing is old enough to delete.
        match now.checked_sub_signed(retention) {
            Some(cutoff) => match self.store.prune(cutoff).await {
                Ok(removed) => {
                    report.pruned = removed;
                    if removed > 0 {
                        tracing::info!("Pruned {} readings older than {} days", removed, snapshot.storage.retention_days);
                    }
                }
                Err(err) => tracing::warn!("Prune failed: {}", err),
            },
            None => tracing::warn!("Retention of {} days reaches before the calendar, prune skipped", snapshot.storage.retention_days),
        }

        let history_cutoff = retention
            .checked_mul(2)
            .and_then(|window| now.checked_sub_signed(window));
        if let Some(cutoff) = history_cutoff {
            if let Err(err) = self.store.prune_notifications(cutoff).await {
                tracing::warn!("Notification history prune failed: {}", err);
            }
        }
    }

    /// One task per point, bounded by `max_concurrent_fetches`. Handles are
    /// returned in point order.
    fn spawn_fetches(
        &self,
        points: &[Point],
        snapshot: &ConfigSnapshot,
        now: DateTime<Utc>,
        token: &CancellationToken,
    ) -> Vec<FetchHandle> {
        let semaphore = Arc::new(Semaphore::new(snapshot.monitoring.max_concurrent_fetches.max(1)));
        let timeout = snapshot.fetch_timeout();

        points
            .iter()
            .map(|point| {
                let source = Arc::clone(&self.source);
                let semaphore = Arc::clone(&semaphore);
                let token = token.clone();
                let point = point.clone();
                let leads = snapshot.leads.clone();

                tokio::spawn(async move {
                    let fetch = async {
                        let _permit = semaphore
                            .acquire_owned()
                            .await
                            .map_err(|_| SourceError::unavailable("fetch pool closed"))?;
                        match tokio::time::timeout(timeout, source.fetch(&point, now, &leads)).await {
                            Ok(result) => result,
                            Err(_) => Err(SourceError::unavailable(format!(
                                "no response within {}s",
                                timeout.as_secs()
                            ))),
                        }
                    };

                    tokio::select! {
                        _ = token.cancelled() => None,
                        result = fetch => Some(result),
                    }
                })
            })
            .collect()
    }

    /// Append the point's readings in lead order, then evaluate alerts.
    async fn process_point(
        &mut self,
        point: &Point,
        entries: &[ForecastEntry],
        snapshot: &ConfigSnapshot,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> PointOutcome {
        let mut readings = Vec::with_capacity(entries.len());
        for entry in entries {
            let reading = Reading::from_entry(point, entry, now);
            if let Err(err) = self.store.append(&reading).await {
                return PointOutcome::Failed {
                    kind: FailureKind::StoreWriteError,
                    message: err.to_string(),
                };
            }
            readings.push(reading);
        }

        if let Some(first) = readings.first() {
            tracing::debug!(
                "[{}] stored {} readings, nearest {:.1} mm/h at +{} min",
                point.name,
                readings.len(),
                first.mmph,
                first.lead_minutes
            );
        }

        if snapshot.notification.enabled {
            let tiers = point.effective_tiers(&snapshot.tiers);
            if let Some(alert) = self.evaluator.evaluate(point, tiers, &readings, now) {
                tracing::info!(
                    "[{}] {} alert: {:.1} mm/h at +{} min",
                    point.name,
                    alert.tier.name,
                    alert.mmph,
                    alert.lead_minutes
                );
                let notification = Notification::threshold(&alert, &snapshot.notification);
                self.deliver(&notification, snapshot, report).await;
            }
        }

        PointOutcome::Collected {
            readings: readings.len(),
        }
    }

    async fn maybe_send_status_report(
        &self,
        snapshot: &ConfigSnapshot,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        let Some(due) = report_due(now, &snapshot.notification, snapshot.interval()) else {
            return;
        };

        match sent_recently(&self.store, now).await {
            Ok(true) => {
                tracing::debug!("Status report for {} already sent", due.format("%H:%M"));
                return;
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!("Cannot check status report history: {}", err);
                return;
            }
        }

        match build_status_report(&self.store, snapshot, now).await {
            Ok(status) => {
                let notification = Notification::status_report(&status, &snapshot.notification);
                self.deliver(&notification, snapshot, report).await;
            }
            Err(err) => tracing::warn!("Cannot build status report: {}", err),
        }
    }

    /// Send and, on success, append to the notification history. Delivery
    /// failures are counted but never fail the point.
    async fn deliver(&self, notification: &Notification, snapshot: &ConfigSnapshot, report: &mut CycleReport) {
        match self.notifier.notify(notification, &snapshot.notification).await {
            Ok(()) => {
                report.notifications_sent += 1;
                if let Err(err) = self.store.record_notification(&notification.to_record()).await {
                    tracing::warn!("Failed to record notification history: {}", err);
                }
            }
            Err(err) => {
                report.notification_errors += 1;
                tracing::error!(
                    "[{}] notification '{}' failed: {}",
                    notification.point_name,
                    notification.subject,
                    err
                );
            }
        }
    }
}

fn source_failure(err: SourceError) -> PointOutcome {
    PointOutcome::Failed {
        kind: err.kind(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::notifier::{MemoryNotifier, NotificationKind};
    use crate::db::create_pool;
    use crate::forecast::mock::MockForecastSource;
    use chrono::TimeZone;

    const CONFIG: &str = r#"{
        "locations": [
            {"name": "A", "lat": 35.1, "lon": 138.9},
            {"name": "B", "lat": 35.2, "lon": 139.0}
        ],
        "thresholds": {"strong": 10, "heavy": 30},
        "leads": [0, 15, 30],
        "monitoring": {"interval_minutes": 5},
        "notification": {"cooldown_minutes": 60, "admin_report_times": []}
    }"#;

    struct Harness {
        _dir: tempfile::TempDir,
        monitor: Monitor,
        source: Arc<MockForecastSource>,
        notifier: Arc<MemoryNotifier>,
        store: Arc<NowcastStore>,
    }

    async fn harness(config: &str, source: MockForecastSource) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, config).unwrap();

        let source = Arc::new(source);
        let notifier = Arc::new(MemoryNotifier::new());
        let store = Arc::new(NowcastStore::new(create_pool("sqlite::memory:").await.unwrap()));
        let monitor = Monitor::new(
            &config_path,
            source.clone(),
            notifier.clone(),
            store.clone(),
            Arc::new(HealthReporter::new(dir.path().join("logs"))),
            Arc::new(AppMetrics::new().unwrap()),
        );

        Harness {
            _dir: dir,
            monitor,
            source,
            notifier,
            store,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).unwrap()
    }

    #[test]
    fn report_ok_semantics() {
        let mut report = CycleReport::new(t0());
        report.points_total = 2;
        assert!(report.ok());

        report.record("A", PointOutcome::Collected { readings: 3 });
        assert!(report.ok());
        assert_eq!(report.readings_stored, 3);

        report.record(
            "B",
            PointOutcome::Failed {
                kind: FailureKind::SourceFormatError,
                message: "bad".into(),
            },
        );
        assert!(!report.ok());
        assert!(report.summary_line().starts_with("Cycle FAILED: 1/2 points ok"));

        let mut aborted = CycleReport::new(t0());
        aborted.status = CycleStatus::ConfigFailed("broken".into());
        assert!(!aborted.ok());
        assert_eq!(aborted.summary_line(), "Cycle aborted: broken");
    }

    #[tokio::test]
    async fn cycle_stores_one_row_per_lead() {
        let mut h = harness(CONFIG, MockForecastSource::new().with_intensity("A", 1.0)).await;
        let report = h.monitor.run_once_at(t0(), &CancellationToken::new()).await;

        assert!(report.ok());
        assert_eq!(report.points_ok, 2);
        assert_eq!(report.readings_stored, 6);
        assert_eq!(h.store.count_readings().await.unwrap(), 6);
        assert_eq!(h.source.calls(), 2);
    }

    #[tokio::test]
    async fn failed_point_does_not_stop_others() {
        let source = MockForecastSource::new().with_unavailable("A", "connection refused");
        let mut h = harness(CONFIG, source).await;
        let report = h.monitor.run_once_at(t0(), &CancellationToken::new()).await;

        assert!(!report.ok());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, FailureKind::SourceUnavailable);
        assert!(h.store.query_latest("A", 0, 10).await.unwrap().is_empty());
        assert_eq!(h.store.query_latest("B", 0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn heavy_reading_notifies_once_per_cooldown() {
        let mut h = harness(CONFIG, MockForecastSource::new().with_intensity("A", 35.0)).await;
        let token = CancellationToken::new();

        let first = h.monitor.run_once_at(t0(), &token).await;
        let second = h
            .monitor
            .run_once_at(t0() + chrono::Duration::minutes(5), &token)
            .await;

        assert_eq!(first.notifications_sent, 1);
        assert_eq!(second.notifications_sent, 0);
        let sent = h.notifier.sent_of_kind(NotificationKind::ThresholdAlert);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].tier.as_deref(), Some("heavy"));
    }

    #[tokio::test]
    async fn notifier_failure_keeps_alert_state() {
        let mut h = harness(CONFIG, MockForecastSource::new().with_intensity("A", 35.0)).await;
        h.notifier.set_failing(true);

        let report = h.monitor.run_once_at(t0(), &CancellationToken::new()).await;

        assert!(report.ok());
        assert_eq!(report.notification_errors, 1);
        assert_eq!(
            h.monitor.evaluator().state("A", "heavy").status,
            crate::alerts::AlertStatus::Alerting
        );
    }

    #[tokio::test]
    async fn cancelled_token_skips_fetches() {
        let source = MockForecastSource::new().with_delay("A", Duration::from_secs(5), 1.0);
        let mut h = harness(CONFIG, source).await;
        let token = CancellationToken::new();
        token.cancel();

        let report = h.monitor.run_once_at(t0(), &token).await;

        assert!(report.interrupted);
        assert_eq!(report.outcome("A"), Some(&PointOutcome::Cancelled));
    }
}
