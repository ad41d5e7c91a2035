//! Open-Meteo nowcast adapter.
//!
//! Reads the `minutely_15` precipitation series and maps it onto the
//! configured lead horizons: for each lead the slot whose time is nearest to
//! `reference + lead` is chosen. Values are 15-minute accumulations and are
//! scaled to an hourly rate.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::forecast::{ForecastSource, SourceError, SourceResult};
use crate::types::{ForecastEntry, Point};

pub const DEFAULT_BASE_URL: &str = "https://api.open-meteo.com";

const SLOT_MINUTES: u32 = 15;
const SLOTS_PER_HOUR: f64 = 4.0;

#[derive(Clone)]
pub struct OpenMeteoSource {
    base_url: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    minutely_15: Option<Minutely15>,
}

#[derive(Debug, Deserialize)]
struct Minutely15 {
    time: Vec<String>,
    precipitation: Vec<Option<f64>>,
}

impl OpenMeteoSource {
    pub fn new(base_url: impl Into<String>, http: Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch_series(&self, point: &Point, max_lead: u32) -> SourceResult<Vec<(DateTime<Utc>, Option<f64>)>> {
        let url = format!("{}/v1/forecast", self.base_url);
        let forecast_slots = max_lead / SLOT_MINUTES + 2;

        let response = self
            .http
            .get(&url)
            .query(&[
                ("latitude", point.latitude.to_string()),
                ("longitude", point.longitude.to_string()),
                ("minutely_15", "precipitation".to_string()),
                ("past_minutely_15", "1".to_string()),
                ("forecast_minutely_15", forecast_slots.to_string()),
                ("timezone", "GMT".to_string()),
            ])
            .send()
            .await
            .map_err(|e| SourceError::unavailable(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(SourceError::unavailable(format!(
                "provider returned HTTP {}",
                response.status()
            )));
        }

        let body: ForecastResponse = response
            .json()
            .await
            .map_err(|e| SourceError::format(format!("failed to parse response: {}", e)))?;

        let series = body
            .minutely_15
            .ok_or_else(|| SourceError::format("response has no minutely_15 block"))?;

        if series.time.len() != series.precipitation.len() {
            return Err(SourceError::format(format!(
                "time/precipitation length mismatch ({} vs {})",
                series.time.len(),
                series.precipitation.len()
            )));
        }

        series
            .time
            .iter()
            .zip(series.precipitation)
            .map(|(raw, value)| {
                let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M")
                    .map_err(|_| SourceError::format(format!("invalid slot time '{}'", raw)))?;
                Ok((Utc.from_utc_datetime(&naive), value))
            })
            .collect()
    }
}

/// Pick the entry for each lead from a time-ordered slot series.
fn select_leads(
    slots: &[(DateTime<Utc>, Option<f64>)],
    reference_time: DateTime<Utc>,
    leads: &[u32],
) -> SourceResult<Vec<ForecastEntry>> {
    let first = slots
        .first()
        .ok_or_else(|| SourceError::format("empty precipitation series"))?;

    // The provider has no issuance time; use the latest slot not after the
    // reference time.
    let base_time = slots
        .iter()
        .map(|(time, _)| *time)
        .filter(|time| *time <= reference_time)
        .max()
        .unwrap_or(first.0);

    let mut entries = Vec::with_capacity(leads.len());
    for &lead in leads {
        let target = reference_time + Duration::minutes(i64::from(lead));
        let nearest = slots
            .iter()
            .min_by_key(|(time, _)| (*time - target).num_seconds().abs());

        match nearest {
            Some((valid_time, Some(value))) => entries.push(ForecastEntry {
                lead_minutes: lead,
                base_time,
                valid_time: *valid_time,
                mmph: value * SLOTS_PER_HOUR,
            }),
            Some((valid_time, None)) => {
                tracing::warn!("No precipitation value for slot {} (lead {})", valid_time, lead);
            }
            None => {}
        }
    }

    if entries.is_empty() {
        return Err(SourceError::format("no usable precipitation values"));
    }
    Ok(entries)
}

#[async_trait]
impl ForecastSource for OpenMeteoSource {
    async fn fetch(
        &self,
        point: &Point,
        reference_time: DateTime<Utc>,
        leads: &[u32],
    ) -> SourceResult<Vec<ForecastEntry>> {
        let max_lead = leads.iter().copied().max().unwrap_or(0);
        let slots = self.fetch_series(point, max_lead).await?;
        select_leads(&slots, reference_time, leads)
    }

    fn source_name(&self) -> &str {
        "Open-Meteo"
    }
}
