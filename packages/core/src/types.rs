//! Core data types shared by the collection loop, the store and the
//! alert evaluator.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Format of the `basetime` column (forecast issuance time, UTC).
pub const BASETIME_FORMAT: &str = "%Y%m%d%H%M%S";

/// Format of the `validtime` / `created_at` columns (UTC). Matches SQLite's
/// `datetime('now')`, so rows written by the monitor and the column default
/// compare correctly as plain strings.
pub const SQL_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A monitored location. Immutable for the duration of a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub enabled: bool,
    /// Per-point tier override; `None` falls back to the global tiers.
    pub tiers: Option<Vec<Tier>>,
    /// Transport-specific addressees for this point's alerts.
    pub recipients: Vec<String>,
}

impl Point {
    pub fn new(name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            name: name.into(),
            latitude,
            longitude,
            enabled: true,
            tiers: None,
            recipients: Vec::new(),
        }
    }

    /// Tiers that apply to this point, most severe first.
    pub fn effective_tiers<'a>(&'a self, global: &'a [Tier]) -> &'a [Tier] {
        self.tiers.as_deref().unwrap_or(global)
    }
}

/// A named alert severity threshold in mm/h.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    pub name: String,
    pub threshold_mmph: f64,
}

impl Tier {
    pub fn new(name: impl Into<String>, threshold_mmph: f64) -> Self {
        Self {
            name: name.into(),
            threshold_mmph,
        }
    }

    pub fn qualifies(&self, mmph: f64) -> bool {
        mmph >= self.threshold_mmph
    }
}

/// Sort tiers so the most severe (highest threshold) comes first.
pub fn sort_by_severity(tiers: &mut [Tier]) {
    tiers.sort_by(|a, b| b.threshold_mmph.total_cmp(&a.threshold_mmph));
}

/// One forecast value returned by a [`crate::forecast::ForecastSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastEntry {
    pub lead_minutes: u32,
    pub base_time: DateTime<Utc>,
    pub valid_time: DateTime<Utc>,
    pub mmph: f64,
}

/// A persisted forecast row. Never mutated once written.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub id: Option<i64>,
    pub point_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub base_time: DateTime<Utc>,
    pub valid_time: DateTime<Utc>,
    pub lead_minutes: u32,
    pub mmph: f64,
    pub created_at: DateTime<Utc>,
}

impl Reading {
    /// Build a reading for `point`, denormalising its coordinates.
    pub fn from_entry(point: &Point, entry: &ForecastEntry, created_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            point_name: point.name.clone(),
            latitude: point.latitude,
            longitude: point.longitude,
            base_time: entry.base_time,
            valid_time: entry.valid_time,
            lead_minutes: entry.lead_minutes,
            mmph: entry.mmph,
            created_at,
        }
    }
}

pub fn format_basetime(time: DateTime<Utc>) -> String {
    time.format(BASETIME_FORMAT).to_string()
}

pub fn format_sql_datetime(time: DateTime<Utc>) -> String {
    time.format(SQL_DATETIME_FORMAT).to_string()
}

pub fn parse_basetime(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, BASETIME_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Parse a `validtime` / `created_at` value. Accepts the `T` separator too,
/// since rows written by other tools may use ISO 8601.
pub fn parse_sql_datetime(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, SQL_DATETIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_by_severity_puts_highest_threshold_first() {
        let mut tiers = vec![Tier::new("strong", 10.0), Tier::new("heavy", 30.0)];
        sort_by_severity(&mut tiers);
        assert_eq!(tiers[0].name, "heavy");
        assert_eq!(tiers[1].name, "strong");
    }

    #[test]
    fn tier_qualifies_at_exact_threshold() {
        let tier = Tier::new("heavy", 30.0);
        assert!(tier.qualifies(30.0));
        assert!(!tier.qualifies(29.9));
    }

    #[test]
    fn effective_tiers_prefers_point_override() {
        let global = vec![Tier::new("heavy", 30.0)];
        let mut point = Point::new("A", 35.0, 139.0);
        assert_eq!(point.effective_tiers(&global)[0].threshold_mmph, 30.0);

        point.tiers = Some(vec![Tier::new("heavy", 20.0)]);
        assert_eq!(point.effective_tiers(&global)[0].threshold_mmph, 20.0);
    }

    #[test]
    fn timestamps_survive_column_formats() {
        let time = Utc.with_ymd_and_hms(2024, 6, 1, 10, 15, 0).unwrap();
        assert_eq!(format_basetime(time), "20240601101500");
        assert_eq!(format_sql_datetime(time), "2024-06-01 10:15:00");
        assert_eq!(parse_basetime("20240601101500"), Some(time));
        assert_eq!(parse_sql_datetime("2024-06-01 10:15:00"), Some(time));
        assert_eq!(parse_sql_datetime("2024-06-01T10:15:00"), Some(time));
        assert_eq!(parse_sql_datetime("garbage"), None);
    }
}
