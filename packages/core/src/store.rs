//! Append-only nowcast store.
//!
//! All SQLite read/write logic lives here. The cycle runner calls
//! [`NowcastStore::append`] once per reading (each row commits on its own,
//! so an abandoned cycle leaves only whole rows behind) and
//! [`NowcastStore::prune`] once per cycle to bound growth. Rows are never
//! updated.
//!
//! The read paths (`query_latest`, `query_range`) mirror what the external
//! viewer runs against the same schema.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::StoreError;
use crate::types::{
    format_basetime, format_sql_datetime, parse_basetime, parse_sql_datetime, Reading,
};

pub const NOTIFICATION_THRESHOLD_ALERT: &str = "threshold_alert";
pub const NOTIFICATION_STATUS_REPORT: &str = "admin_heartbeat";

/// One delivered notification, kept as an audit trail for the viewer.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRecord {
    pub point_name: String,
    pub notification_type: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub mmph: Option<f64>,
    pub threshold_type: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// Rows collected for one point over a window.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionStats {
    pub rows: i64,
    pub max_mmph: Option<f64>,
}

/// Repository for the `nowcast` and `notification_history` tables.
pub struct NowcastStore {
    pool: SqlitePool,
}

impl NowcastStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert one reading. Duplicate (point, validtime, lead) rows are
    /// accepted; the new row simply gets a higher id.
    pub async fn append(&self, reading: &Reading) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO nowcast
             (point_name, lat, lon, basetime, validtime, lead_min, mmph, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&reading.point_name)
        .bind(reading.latitude)
        .bind(reading.longitude)
        .bind(format_basetime(reading.base_time))
        .bind(format_sql_datetime(reading.valid_time))
        .bind(i64::from(reading.lead_minutes))
        .bind(reading.mmph)
        .bind(format_sql_datetime(reading.created_at))
        .execute(&self.pool)
        .await
        .map_err(StoreError::Write)?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent readings for a point and lead, newest valid time first.
    pub async fn query_latest(
        &self,
        point_name: &str,
        lead_minutes: u32,
        limit: i64,
    ) -> Result<Vec<Reading>, StoreError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT id, point_name, lat, lon, basetime, validtime, lead_min, mmph, created_at
             FROM nowcast
             WHERE point_name = ? AND lead_min = ?
             ORDER BY validtime DESC, id DESC
             LIMIT ?",
        )
        .bind(point_name)
        .bind(i64::from(lead_minutes))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        Ok(rows.iter().filter_map(reading_from_row).collect())
    }

    /// All readings for a point with `from <= validtime <= to`, ordered by
    /// valid time, then lead, then insertion.
    pub async fn query_range(
        &self,
        point_name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, point_name, lat, lon, basetime, validtime, lead_min, mmph, created_at
             FROM nowcast
             WHERE point_name = ? AND validtime >= ? AND validtime <= ?
             ORDER BY validtime ASC, lead_min ASC, id ASC",
        )
        .bind(point_name)
        .bind(format_sql_datetime(from))
        .bind(format_sql_datetime(to))
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        Ok(rows.iter().filter_map(reading_from_row).collect())
    }

    /// Delete readings created before `older_than`. Returns rows deleted.
    pub async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM nowcast WHERE datetime(created_at) < datetime(?)")
            .bind(format_sql_datetime(older_than))
            .execute(&self.pool)
            .await
            .map_err(StoreError::Write)?;

        Ok(result.rows_affected())
    }

    pub async fn count_readings(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM nowcast")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        Ok(row.try_get("cnt").unwrap_or(0))
    }

    /// Per point row count and peak intensity for rows created since `since`.
    pub async fn collection_stats_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<HashMap<String, CollectionStats>, StoreError> {
        let rows = sqlx::query(
            "SELECT point_name, COUNT(*) AS cnt, MAX(mmph) AS max_mmph
             FROM nowcast
             WHERE datetime(created_at) > datetime(?)
             GROUP BY point_name",
        )
        .bind(format_sql_datetime(since))
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        let stats = rows
            .into_iter()
            .filter_map(|row| {
                let name: String = row.try_get("point_name").ok()?;
                let rows: i64 = row.try_get("cnt").ok()?;
                let max_mmph: Option<f64> = row.try_get("max_mmph").ok()?;
                Some((name, CollectionStats { rows, max_mmph }))
            })
            .collect();

        Ok(stats)
    }

    // ---- Notification history ----

    pub async fn record_notification(&self, record: &NotificationRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO notification_history
             (point_name, notification_type, recipients, subject, body, mmph, threshold_type, sent_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.point_name)
        .bind(&record.notification_type)
        .bind(record.recipients.join(", "))
        .bind(&record.subject)
        .bind(&record.body)
        .bind(record.mmph)
        .bind(&record.threshold_type)
        .bind(format_sql_datetime(record.sent_at))
        .execute(&self.pool)
        .await
        .map_err(StoreError::Write)?;

        Ok(())
    }

    pub async fn count_notifications_since(
        &self,
        notification_type: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM notification_history
             WHERE notification_type = ? AND datetime(sent_at) > datetime(?)",
        )
        .bind(notification_type)
        .bind(format_sql_datetime(since))
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        Ok(row.try_get("cnt").unwrap_or(0))
    }

    pub async fn prune_notifications(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM notification_history WHERE datetime(sent_at) < datetime(?)")
                .bind(format_sql_datetime(older_than))
                .execute(&self.pool)
                .await
                .map_err(StoreError::Write)?;

        Ok(result.rows_affected())
    }
}

fn reading_from_row(row: &SqliteRow) -> Option<Reading> {
    let id: i64 = row.try_get("id").ok()?;
    let point_name: String = row.try_get("point_name").ok()?;
    let latitude: f64 = row.try_get("lat").ok()?;
    let longitude: f64 = row.try_get("lon").ok()?;
    let basetime: String = row.try_get("basetime").ok()?;
    let validtime: String = row.try_get("validtime").ok()?;
    let lead_min: i64 = row.try_get("lead_min").ok()?;
    let mmph: f64 = row.try_get("mmph").ok()?;
    let created_at: String = row.try_get("created_at").ok()?;

    Some(Reading {
        id: Some(id),
        point_name,
        latitude,
        longitude,
        base_time: parse_basetime(&basetime)?,
        valid_time: parse_sql_datetime(&validtime)?,
        lead_minutes: u32::try_from(lead_min).ok()?,
        mmph,
        created_at: parse_sql_datetime(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    use crate::db::create_pool;

    async fn make_store() -> NowcastStore {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        NowcastStore::new(pool)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
    }

    fn make_reading(point: &str, lead: u32, mmph: f64, created_at: DateTime<Utc>) -> Reading {
        Reading {
            id: None,
            point_name: point.to_string(),
            latitude: 35.12,
            longitude: 138.91,
            base_time: t0(),
            valid_time: t0() + Duration::minutes(i64::from(lead)),
            lead_minutes: lead,
            mmph,
            created_at,
        }
    }

    #[tokio::test]
    async fn append_and_query_latest_roundtrip() {
        let store = make_store().await;
        let reading = make_reading("A", 0, 12.5, t0());

        let id = store.append(&reading).await.unwrap();
        let latest = store.query_latest("A", 0, 10).await.unwrap();

        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id, Some(id));
        assert_eq!(latest[0].mmph, 12.5);
        assert_eq!(latest[0].valid_time, reading.valid_time);
        assert_eq!(latest[0].base_time, reading.base_time);
    }

    #[tokio::test]
    async fn duplicate_slots_are_tolerated_and_ordered_by_id() {
        let store = make_store().await;
        let first = make_reading("A", 15, 1.0, t0());
        let second = make_reading("A", 15, 2.0, t0());

        let id1 = store.append(&first).await.unwrap();
        let id2 = store.append(&second).await.unwrap();
        assert!(id2 > id1);

        let latest = store.query_latest("A", 15, 10).await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].mmph, 2.0);
        assert_eq!(latest[1].mmph, 1.0);
    }

    #[tokio::test]
    async fn query_latest_respects_limit_and_lead() {
        let store = make_store().await;
        for lead in [0, 15, 30] {
            store.append(&make_reading("A", lead, f64::from(lead), t0())).await.unwrap();
        }
        let mut later = make_reading("A", 0, 99.0, t0());
        later.valid_time = t0() + Duration::minutes(5);
        store.append(&later).await.unwrap();

        let latest = store.query_latest("A", 0, 1).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].mmph, 99.0);
    }

    #[tokio::test]
    async fn non_positive_limit_returns_nothing() {
        let store = make_store().await;
        store.append(&make_reading("A", 0, 1.0, t0())).await.unwrap();

        assert!(store.query_latest("A", 0, 0).await.unwrap().is_empty());
        assert!(store.query_latest("A", 0, -3).await.unwrap().is_empty());
        assert_eq!(store.query_latest("A", 0, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn timestamps_are_written_as_utc_text() {
        let store = make_store().await;
        store.append(&make_reading("A", 15, 1.0, t0())).await.unwrap();

        let (basetime, validtime, created_at): (String, String, String) =
            sqlx::query_as("SELECT basetime, validtime, created_at FROM nowcast")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(basetime, "20240601100000");
        assert_eq!(validtime, "2024-06-01 10:15:00");
        assert_eq!(created_at, "2024-06-01 10:00:00");
    }

    #[tokio::test]
    async fn query_range_filters_by_point_and_valid_time() {
        let store = make_store().await;
        for lead in [0, 15, 30, 45, 60] {
            store.append(&make_reading("A", lead, 1.0, t0())).await.unwrap();
        }
        store.append(&make_reading("B", 15, 1.0, t0())).await.unwrap();

        let rows = store
            .query_range("A", t0() + Duration::minutes(15), t0() + Duration::minutes(45))
            .await
            .unwrap();

        let leads: Vec<u32> = rows.iter().map(|r| r.lead_minutes).collect();
        assert_eq!(leads, vec![15, 30, 45]);
        assert!(rows.iter().all(|r| r.point_name == "A"));
    }

    #[tokio::test]
    async fn prune_removes_only_rows_created_before_cutoff() {
        let store = make_store().await;
        store.append(&make_reading("A", 0, 1.0, t0() - Duration::days(5))).await.unwrap();
        store.append(&make_reading("A", 15, 2.0, t0() - Duration::hours(1))).await.unwrap();
        store.append(&make_reading("A", 30, 3.0, t0())).await.unwrap();

        let before = store.query_range("A", t0(), t0() + Duration::hours(1)).await.unwrap();
        let deleted = store.prune(t0() - Duration::days(3)).await.unwrap();
        let after = store.query_range("A", t0(), t0() + Duration::hours(1)).await.unwrap();

        assert_eq!(deleted, 1);
        assert_eq!(store.count_readings().await.unwrap(), 2);
        // Survivors are untouched and keep their order.
        assert_eq!(after[..], before[1..]);
    }

    #[tokio::test]
    async fn prune_returns_zero_when_nothing_is_old() {
        let store = make_store().await;
        store.append(&make_reading("A", 0, 1.0, t0())).await.unwrap();
        assert_eq!(store.prune(t0() - Duration::days(3)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rows_written_with_column_default_are_readable() {
        let store = make_store().await;
        sqlx::query(
            "INSERT INTO nowcast (point_name, lat, lon, basetime, validtime, lead_min, mmph)
             VALUES ('A', 1.0, 2.0, '20240601100000', '2024-06-01 10:00:00', 0, 4.0)",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let latest = store.query_latest("A", 0, 1).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].mmph, 4.0);
    }

    #[tokio::test]
    async fn collection_stats_group_by_point() {
        let store = make_store().await;
        store.append(&make_reading("A", 0, 5.0, t0())).await.unwrap();
        store.append(&make_reading("A", 15, 12.0, t0())).await.unwrap();
        store.append(&make_reading("B", 0, 0.0, t0())).await.unwrap();
        store.append(&make_reading("C", 0, 9.0, t0() - Duration::hours(3))).await.unwrap();

        let stats = store.collection_stats_since(t0() - Duration::hours(1)).await.unwrap();

        assert_eq!(stats.len(), 2);
        assert_eq!(stats["A"], CollectionStats { rows: 2, max_mmph: Some(12.0) });
        assert_eq!(stats["B"].rows, 1);
        assert!(!stats.contains_key("C"));
    }

    #[tokio::test]
    async fn notification_history_counts_and_prunes() {
        let store = make_store().await;
        let record = NotificationRecord {
            point_name: "A".into(),
            notification_type: NOTIFICATION_THRESHOLD_ALERT.into(),
            recipients: vec!["a@example.com".into(), "b@example.com".into()],
            subject: "heavy rain".into(),
            body: "body".into(),
            mmph: Some(35.0),
            threshold_type: Some("heavy".into()),
            sent_at: t0(),
        };
        store.record_notification(&record).await.unwrap();
        store
            .record_notification(&NotificationRecord {
                sent_at: t0() - Duration::days(10),
                ..record.clone()
            })
            .await
            .unwrap();

        let recent = store
            .count_notifications_since(NOTIFICATION_THRESHOLD_ALERT, t0() - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(recent, 1);
        assert_eq!(
            store
                .count_notifications_since(NOTIFICATION_STATUS_REPORT, t0() - Duration::days(30))
                .await
                .unwrap(),
            0
        );

        let pruned = store.prune_notifications(t0() - Duration::days(6)).await.unwrap();
        assert_eq!(pruned, 1);

        let recipients: String = sqlx::query("SELECT recipients FROM notification_history")
            .fetch_one(store.pool())
            .await
            .unwrap()
            .get("recipients");
        assert_eq!(recipients, "a@example.com, b@example.com");
    }
}
