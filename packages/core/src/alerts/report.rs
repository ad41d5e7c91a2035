//! Periodic status report for the admin recipients.

use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};

use crate::alerts::notifier::to_local;
use crate::config::{ConfigSnapshot, NotificationSettings};
use crate::error::StoreError;
use crate::store::{NowcastStore, NOTIFICATION_STATUS_REPORT, NOTIFICATION_THRESHOLD_ALERT};

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq)]
pub struct PointSummary {
    pub name: String,
    pub enabled: bool,
    pub rows: i64,
    pub max_mmph: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub points: Vec<PointSummary>,
    pub alerts_last_24h: i64,
    pub readings_total: i64,
    pub interval_minutes: u64,
    pub retention_days: u32,
}

/// The report time that falls due at `now`, if any.
///
/// A time `t` is due when the local clock is in `[t, t + interval)`, so each
/// configured time is hit by exactly one cycle of a regular schedule.
pub fn report_due(
    now: DateTime<Utc>,
    settings: &NotificationSettings,
    interval: Duration,
) -> Option<NaiveTime> {
    let local = to_local(now, settings.utc_offset_hours).time();
    let window = interval.as_secs() as i64;

    settings.admin_report_times.iter().copied().find(|time| {
        let elapsed = (local - *time).num_seconds().rem_euclid(SECONDS_PER_DAY);
        elapsed < window
    })
}

/// Whether a status report already went out in the last hour.
pub async fn sent_recently(store: &NowcastStore, now: DateTime<Utc>) -> Result<bool, StoreError> {
    let count = store
        .count_notifications_since(NOTIFICATION_STATUS_REPORT, now - chrono::Duration::hours(1))
        .await?;
    Ok(count > 0)
}

pub async fn build_status_report(
    store: &NowcastStore,
    snapshot: &ConfigSnapshot,
    now: DateTime<Utc>,
) -> Result<StatusReport, StoreError> {
    let stats = store
        .collection_stats_since(now - chrono::Duration::hours(1))
        .await?;
    let alerts_last_24h = store
        .count_notifications_since(NOTIFICATION_THRESHOLD_ALERT, now - chrono::Duration::hours(24))
        .await?;
    let readings_total = store.count_readings().await?;

    let points = snapshot
        .points
        .iter()
        .map(|point| {
            let stat = stats.get(&point.name);
            PointSummary {
                name: point.name.clone(),
                enabled: point.enabled,
                rows: stat.map_or(0, |s| s.rows),
                max_mmph: stat.and_then(|s| s.max_mmph),
            }
        })
        .collect();

    Ok(StatusReport {
        generated_at: now,
        points,
        alerts_last_24h,
        readings_total,
        interval_minutes: snapshot.monitoring.interval_minutes,
        retention_days: snapshot.storage.retention_days,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::notifier::Notification;
    use crate::db::create_pool;
    use crate::store::NotificationRecord;
    use crate::types::Reading;
    use chrono::TimeZone;

    const FIVE_MIN: Duration = Duration::from_secs(300);

    fn settings() -> NotificationSettings {
        NotificationSettings::default()
    }

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, m, 0).unwrap()
    }

    #[test]
    fn due_inside_window_after_local_time() {
        // 00:00 UTC is 09:00 at UTC+9.
        assert!(report_due(utc(0, 0), &settings(), FIVE_MIN).is_some());
        assert!(report_due(utc(0, 4), &settings(), FIVE_MIN).is_some());
        assert!(report_due(utc(0, 5), &settings(), FIVE_MIN).is_none());
        assert!(report_due(utc(23, 59), &settings(), FIVE_MIN).is_none());
        // 17:00 local.
        assert!(report_due(utc(8, 2), &settings(), FIVE_MIN).is_some());
    }

    #[test]
    fn window_wraps_past_midnight() {
        let mut s = settings();
        s.utc_offset_hours = 0;
        s.admin_report_times = vec![NaiveTime::from_hms_opt(23, 58, 0).unwrap()];
        let next_day = Utc.with_ymd_and_hms(2024, 6, 2, 0, 1, 0).unwrap();
        assert!(report_due(next_day, &s, FIVE_MIN).is_some());
    }

    #[test]
    fn no_times_never_due() {
        let mut s = settings();
        s.admin_report_times.clear();
        assert!(report_due(utc(0, 0), &s, FIVE_MIN).is_none());
    }

    #[tokio::test]
    async fn builds_report_from_store() {
        let store = NowcastStore::new(create_pool("sqlite::memory:").await.unwrap());
        let snapshot = ConfigSnapshot::from_json_str(
            r#"{"locations": [{"name": "A", "lat": 35, "lon": 139},
                              {"name": "B", "lat": 35, "lon": 139}]}"#,
        )
        .unwrap();
        let now = utc(0, 0);

        for mmph in [3.0, 12.5] {
            let reading = Reading {
                id: None,
                point_name: "A".into(),
                latitude: 35.0,
                longitude: 139.0,
                base_time: now,
                valid_time: now,
                lead_minutes: 0,
                mmph,
                created_at: now - chrono::Duration::minutes(10),
            };
            store.append(&reading).await.unwrap();
        }

        let report = build_status_report(&store, &snapshot, now).await.unwrap();
        assert_eq!(report.points.len(), 2);
        assert_eq!(report.points[0].rows, 2);
        assert_eq!(report.points[0].max_mmph, Some(12.5));
        assert_eq!(report.points[1].rows, 0);
        assert_eq!(report.readings_total, 2);

        let n = Notification::status_report(&report, &settings());
        assert!(n.body.contains("A: 2 rows, max 12.5 mm/h"));
        assert!(n.body.contains("B: 0 rows, max -"));
    }

    #[tokio::test]
    async fn sent_recently_checks_history() {
        let store = NowcastStore::new(create_pool("sqlite::memory:").await.unwrap());
        let now = utc(0, 0);
        assert!(!sent_recently(&store, now).await.unwrap());

        store
            .record_notification(&NotificationRecord {
                point_name: "ADMIN".into(),
                notification_type: NOTIFICATION_STATUS_REPORT.into(),
                recipients: vec![],
                subject: "s".into(),
                body: "b".into(),
                mmph: None,
                threshold_type: None,
                sent_at: now - chrono::Duration::minutes(30),
            })
            .await
            .unwrap();

        assert!(sent_recently(&store, now).await.unwrap());
        assert!(!sent_recently(&store, now + chrono::Duration::minutes(31)).await.unwrap());
    }
}
