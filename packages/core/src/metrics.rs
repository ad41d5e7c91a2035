//! Prometheus metrics registry for the nowcast monitor.
//!
//! [`AppMetrics`] owns all registered metrics and the [`Registry`] they
//! belong to. Construct it once at startup, wrap in `Arc`, and pass it to
//! the monitor and the HTTP server.
//!
//! Exposed at `GET /metrics` in Prometheus text exposition format
//! (`text/plain; version=0.0.4`) when the HTTP server is enabled.

use prometheus::{Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry};

use crate::scheduler::CycleReport;

pub struct AppMetrics {
    /// Cycles run, including config failures and disabled cycles.
    pub cycles_total: Counter,
    /// Cycles whose heartbeat was not ok.
    pub cycle_failures_total: Counter,
    /// Failed points, labelled by failure kind.
    pub point_failures_total: CounterVec,
    pub readings_stored_total: Counter,
    pub readings_pruned_total: Counter,
    pub notifications_sent_total: Counter,
    pub notification_errors_total: Counter,
    /// 1 when the last cycle was ok, 0 otherwise.
    pub last_cycle_ok: Gauge,
    pub cycle_duration: Histogram,
    pub registry: Registry,
}

impl AppMetrics {
    /// Create and register all metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let cycles_total = Counter::with_opts(Opts::new(
            "nowcast_monitor_cycles_total",
            "Monitor cycles run",
        ))?;

        let cycle_failures_total = Counter::with_opts(Opts::new(
            "nowcast_monitor_cycle_failures_total",
            "Cycles that reported ok = false",
        ))?;

        let point_failures_total = CounterVec::new(
            Opts::new(
                "nowcast_monitor_point_failures_total",
                "Per-point failures by kind",
            ),
            &["kind"],
        )?;

        let readings_stored_total = Counter::with_opts(Opts::new(
            "nowcast_monitor_readings_stored_total",
            "Readings appended to the store",
        ))?;

        let readings_pruned_total = Counter::with_opts(Opts::new(
            "nowcast_monitor_readings_pruned_total",
            "Readings removed by retention pruning",
        ))?;

        let notifications_sent_total = Counter::with_opts(Opts::new(
            "nowcast_monitor_notifications_sent_total",
            "Notifications delivered",
        ))?;

        let notification_errors_total = Counter::with_opts(Opts::new(
            "nowcast_monitor_notification_errors_total",
            "Notifications the transport failed to deliver",
        ))?;

        let last_cycle_ok = Gauge::with_opts(Opts::new(
            "nowcast_monitor_last_cycle_ok",
            "1 if the last cycle completed without failures",
        ))?;

        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new(
                "nowcast_monitor_cycle_duration_seconds",
                "Wall time of one monitor cycle in seconds",
            )
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0]),
        )?;

        registry.register(Box::new(cycles_total.clone()))?;
        registry.register(Box::new(cycle_failures_total.clone()))?;
        registry.register(Box::new(point_failures_total.clone()))?;
        registry.register(Box::new(readings_stored_total.clone()))?;
        registry.register(Box::new(readings_pruned_total.clone()))?;
        registry.register(Box::new(notifications_sent_total.clone()))?;
        registry.register(Box::new(notification_errors_total.clone()))?;
        registry.register(Box::new(last_cycle_ok.clone()))?;
        registry.register(Box::new(cycle_duration.clone()))?;

        Ok(Self {
            cycles_total,
            cycle_failures_total,
            point_failures_total,
            readings_stored_total,
            readings_pruned_total,
            notifications_sent_total,
            notification_errors_total,
            last_cycle_ok,
            cycle_duration,
            registry,
        })
    }

    /// Fold one cycle's outcome into the counters.
    pub fn observe_cycle(&self, report: &CycleReport) {
        self.cycles_total.inc();
        if report.ok() {
            self.last_cycle_ok.set(1.0);
        } else {
            self.cycle_failures_total.inc();
            self.last_cycle_ok.set(0.0);
        }
        for failure in &report.failures {
            self.point_failures_total
                .with_label_values(&[failure.kind.as_str()])
                .inc();
        }
        self.readings_stored_total.inc_by(report.readings_stored as f64);
        self.readings_pruned_total.inc_by(report.pruned as f64);
        self.notifications_sent_total
            .inc_by(report.notifications_sent as f64);
        self.notification_errors_total
            .inc_by(report.notification_errors as f64);

        let elapsed = (report.finished_at - report.started_at)
            .to_std()
            .unwrap_or_default();
        self.cycle_duration.observe(elapsed.as_secs_f64());
    }

    /// Render all metrics as Prometheus text format (for the `/metrics` endpoint).
    pub fn render(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&metric_families, &mut buf)?;
        Ok(String::from_utf8(buf).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::scheduler::PointFailure;
    use chrono::Utc;

    #[test]
    fn all_metrics_register_without_error() {
        let metrics = AppMetrics::new();
        assert!(metrics.is_ok(), "AppMetrics::new() failed: {:?}", metrics.err());
    }

    #[test]
    fn observe_successful_cycle() {
        let metrics = AppMetrics::new().unwrap();
        let mut report = CycleReport::new(Utc::now());
        report.points_total = 1;
        report.points_ok = 1;
        report.readings_stored = 5;
        report.notifications_sent = 1;
        report.finished_at = report.started_at + chrono::Duration::milliseconds(1500);

        metrics.observe_cycle(&report);

        assert!((metrics.cycles_total.get() - 1.0).abs() < f64::EPSILON);
        assert!((metrics.readings_stored_total.get() - 5.0).abs() < f64::EPSILON);
        assert!((metrics.last_cycle_ok.get() - 1.0).abs() < f64::EPSILON);
        assert_eq!(metrics.cycle_duration.get_sample_count(), 1);
        assert!(metrics.cycle_failures_total.get().abs() < f64::EPSILON);
    }

    #[test]
    fn point_failures_are_labelled_by_kind() {
        let metrics = AppMetrics::new().unwrap();
        let mut report = CycleReport::new(Utc::now());
        report.points_total = 2;
        report.failures = vec![
            PointFailure {
                point: "A".into(),
                kind: FailureKind::SourceUnavailable,
                message: "timeout".into(),
            },
            PointFailure {
                point: "B".into(),
                kind: FailureKind::Internal,
                message: "panic".into(),
            },
        ];

        metrics.observe_cycle(&report);

        let unavailable = metrics
            .point_failures_total
            .with_label_values(&["SourceUnavailable"])
            .get();
        assert!((unavailable - 1.0).abs() < f64::EPSILON);
        assert!(metrics.last_cycle_ok.get().abs() < f64::EPSILON);
        assert!((metrics.cycle_failures_total.get() - 1.0).abs() < f64::EPSILON);

        let output = metrics.render().unwrap();
        assert!(output.contains("nowcast_monitor_point_failures_total{kind=\"Internal\"} 1"));
    }
}
