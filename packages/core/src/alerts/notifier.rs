//! Notification rendering and delivery.
//!
//! The cycle runner builds a [`Notification`] (subject and body already
//! rendered) and hands it to a [`Notifier`]. Which transport is used is
//! decided per call from the current [`NotificationSettings`], so a change to
//! `notification.transport` takes effect on the next cycle.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;

use crate::alerts::report::StatusReport;
use crate::alerts::webhook;
use crate::alerts::ThresholdAlert;
use crate::config::{NotificationSettings, Transport};
use crate::store::{NotificationRecord, NOTIFICATION_STATUS_REPORT, NOTIFICATION_THRESHOLD_ALERT};

/// Point name recorded for notifications that are not tied to a point.
pub const ADMIN_POINT: &str = "ADMIN";

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("delivery failed: {message}")]
    Delivery { message: String },

    #[error("receiver rejected notification with HTTP {status}")]
    Rejected { status: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NotificationKind {
    #[serde(rename = "threshold_alert")]
    ThresholdAlert,
    #[serde(rename = "admin_heartbeat")]
    StatusReport,
    #[serde(rename = "test")]
    Test,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ThresholdAlert => NOTIFICATION_THRESHOLD_ALERT,
            NotificationKind::StatusReport => NOTIFICATION_STATUS_REPORT,
            NotificationKind::Test => "test",
        }
    }
}

/// A rendered notification, ready for any transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub point_name: String,
    pub tier: Option<String>,
    pub mmph: Option<f64>,
    pub valid_time: Option<DateTime<Utc>>,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Convert a UTC instant to the configured local offset. Offsets outside the
/// representable range fall back to UTC.
pub fn to_local(time: DateTime<Utc>, utc_offset_hours: i32) -> DateTime<FixedOffset> {
    let offset = FixedOffset::east_opt(utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix());
    time.with_timezone(&offset)
}

impl Notification {
    /// Render a threshold alert. Point recipients win; otherwise the admin
    /// recipients receive it.
    pub fn threshold(alert: &ThresholdAlert, settings: &NotificationSettings) -> Self {
        let offset = settings.utc_offset_hours;
        let valid_local = to_local(alert.valid_time, offset);

        let subject = format!(
            "[Rain alert] {}: {} {:.1} mm/h at {}",
            alert.point_name,
            alert.tier.name,
            alert.mmph,
            valid_local.format("%H:%M"),
        );

        let mut body = String::new();
        body.push_str(&format!("Point: {}\n", alert.point_name));
        body.push_str(&format!(
            "Coordinates: {:.4}, {:.4}\n",
            alert.latitude, alert.longitude
        ));
        body.push_str(&format!(
            "Tier: {} (>= {:.1} mm/h)\n",
            alert.tier.name, alert.tier.threshold_mmph
        ));
        body.push_str(&format!("Intensity: {:.1} mm/h\n", alert.mmph));
        body.push_str(&format!(
            "Valid time: {} (UTC{:+})\n",
            valid_local.format("%Y-%m-%d %H:%M"),
            offset
        ));
        body.push_str(&format!("Lead: {} min\n", alert.lead_minutes));

        if !alert.forecast.is_empty() {
            body.push_str("\nForecast:\n");
            for (lead, mmph) in &alert.forecast {
                let marker = alert
                    .tiers
                    .iter()
                    .find(|t| t.qualifies(*mmph))
                    .map(|t| format!("  [{}]", t.name))
                    .unwrap_or_default();
                body.push_str(&format!("  +{:>3} min  {:>6.1} mm/h{}\n", lead, mmph, marker));
            }
        }

        body.push_str(&format!(
            "\nIssued: {}\n",
            to_local(alert.triggered_at, offset).format("%Y-%m-%d %H:%M:%S")
        ));

        let recipients = if alert.recipients.is_empty() {
            settings.admin_recipients.clone()
        } else {
            alert.recipients.clone()
        };

        Self {
            kind: NotificationKind::ThresholdAlert,
            point_name: alert.point_name.clone(),
            tier: Some(alert.tier.name.clone()),
            mmph: Some(alert.mmph),
            valid_time: Some(alert.valid_time),
            recipients,
            subject,
            body,
            created_at: alert.triggered_at,
        }
    }

    pub fn status_report(report: &StatusReport, settings: &NotificationSettings) -> Self {
        let offset = settings.utc_offset_hours;
        let local = to_local(report.generated_at, offset);

        let subject = format!("[Nowcast monitor] Status report {}", local.format("%Y-%m-%d %H:%M"));

        let mut body = String::new();
        body.push_str(&format!(
            "Generated: {} (UTC{:+})\n",
            local.format("%Y-%m-%d %H:%M:%S"),
            offset
        ));
        body.push_str(&format!(
            "Interval: {} min, retention: {} days\n",
            report.interval_minutes, report.retention_days
        ));
        body.push_str(&format!("Stored readings: {}\n", report.readings_total));
        body.push_str(&format!("Alerts sent (24h): {}\n", report.alerts_last_24h));
        body.push_str("\nLast hour:\n");
        for point in &report.points {
            let peak = point
                .max_mmph
                .map(|v| format!("{:.1} mm/h", v))
                .unwrap_or_else(|| "-".to_string());
            let state = if point.enabled { "" } else { " (disabled)" };
            body.push_str(&format!(
                "  {}{}: {} rows, max {}\n",
                point.name, state, point.rows, peak
            ));
        }

        Self {
            kind: NotificationKind::StatusReport,
            point_name: ADMIN_POINT.to_string(),
            tier: None,
            mmph: None,
            valid_time: None,
            recipients: settings.admin_recipients.clone(),
            subject,
            body,
            created_at: report.generated_at,
        }
    }

    /// Connectivity check sent by `--test-notify`.
    pub fn test(settings: &NotificationSettings, now: DateTime<Utc>) -> Self {
        let local = to_local(now, settings.utc_offset_hours);
        Self {
            kind: NotificationKind::Test,
            point_name: ADMIN_POINT.to_string(),
            tier: None,
            mmph: None,
            valid_time: None,
            recipients: settings.admin_recipients.clone(),
            subject: "[Nowcast monitor] Test notification".to_string(),
            body: format!(
                "Test notification sent at {}.\n",
                local.format("%Y-%m-%d %H:%M:%S")
            ),
            created_at: now,
        }
    }

    /// Audit row for `notification_history`.
    pub fn to_record(&self) -> NotificationRecord {
        NotificationRecord {
            point_name: self.point_name.clone(),
            notification_type: self.kind.as_str().to_string(),
            recipients: self.recipients.clone(),
            subject: self.subject.clone(),
            body: self.body.clone(),
            mmph: self.mmph,
            threshold_type: self.tier.clone(),
            sent_at: self.created_at,
        }
    }
}

/// Opaque delivery capability.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        notification: &Notification,
        settings: &NotificationSettings,
    ) -> Result<(), NotifierError>;

    fn transport_name(&self) -> &str;
}

/// Writes notifications to the tracing log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        notification: &Notification,
        _settings: &NotificationSettings,
    ) -> Result<(), NotifierError> {
        tracing::info!(
            "Notification to [{}]: {}",
            notification.recipients.join(", "),
            notification.subject
        );
        tracing::debug!("{}", notification.body);
        Ok(())
    }

    fn transport_name(&self) -> &str {
        "log"
    }
}

/// Dispatches on `notification.transport` for every call.
pub struct TransportNotifier {
    http: Client,
}

impl TransportNotifier {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Notifier for TransportNotifier {
    async fn notify(
        &self,
        notification: &Notification,
        settings: &NotificationSettings,
    ) -> Result<(), NotifierError> {
        match &settings.transport {
            Transport::Log => LogNotifier.notify(notification, settings).await,
            Transport::Webhook {
                url,
                timeout_seconds,
            } => {
                webhook::deliver(
                    &self.http,
                    url,
                    std::time::Duration::from_secs(*timeout_seconds),
                    notification,
                )
                .await
            }
        }
    }

    fn transport_name(&self) -> &str {
        "transport"
    }
}

/// Records notifications in memory. Used by tests and `--once` dry runs.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: Mutex<bool>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent delivery fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut flag) = self.failing.lock() {
            *flag = failing;
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_of_kind(&self, kind: NotificationKind) -> Vec<Notification> {
        self.sent().into_iter().filter(|n| n.kind == kind).collect()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(
        &self,
        notification: &Notification,
        _settings: &NotificationSettings,
    ) -> Result<(), NotifierError> {
        if self.failing.lock().map(|f| *f).unwrap_or(false) {
            return Err(NotifierError::Delivery {
                message: "memory notifier set to fail".to_string(),
            });
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification.clone());
        }
        Ok(())
    }

    fn transport_name(&self) -> &str {
        "memory"
    }
}
