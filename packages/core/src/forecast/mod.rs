//! Forecast source interface.
//!
//! The monitor treats the upstream provider as an opaque capability: given a
//! point, a reference time and the configured lead horizons it returns one
//! [`ForecastEntry`] per horizon, or fails for that point only.

pub mod mock;
pub mod open_meteo;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error::FailureKind;
use crate::types::{ForecastEntry, Point};

/// Errors from forecast sources. Both kinds are recoverable: the point is
/// skipped for this cycle and fetched again on the next one.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source unavailable: {message}")]
    Unavailable { message: String },

    #[error("unexpected payload: {message}")]
    Format { message: String },
}

impl SourceError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            SourceError::Unavailable { .. } => FailureKind::SourceUnavailable,
            SourceError::Format { .. } => FailureKind::SourceFormatError,
        }
    }
}

pub type SourceResult<T> = Result<T, SourceError>;

/// Trait for nowcast providers.
#[async_trait]
pub trait ForecastSource: Send + Sync {
    /// Fetch one entry per lead in `leads` for `point`, relative to
    /// `reference_time`.
    async fn fetch(
        &self,
        point: &Point,
        reference_time: DateTime<Utc>,
        leads: &[u32],
    ) -> SourceResult<Vec<ForecastEntry>>;

    /// Name of this provider for logging.
    fn source_name(&self) -> &str;
}

/// Bring a source response in line with the configured horizons.
///
/// Entries for unconfigured leads are dropped, duplicate leads keep the first
/// entry and the result is sorted by ascending lead. Non-finite or negative
/// intensities reject the whole response.
pub fn normalize_entries(
    entries: Vec<ForecastEntry>,
    leads: &[u32],
) -> SourceResult<Vec<ForecastEntry>> {
    let configured: HashSet<u32> = leads.iter().copied().collect();
    let mut seen = HashSet::new();
    let mut normalized = Vec::with_capacity(leads.len());

    for entry in entries {
        if !entry.mmph.is_finite() || entry.mmph < 0.0 {
            return Err(SourceError::format(format!(
                "invalid intensity {} at lead {}",
                entry.mmph, entry.lead_minutes
            )));
        }
        if !configured.contains(&entry.lead_minutes) {
            tracing::debug!("Dropping unconfigured lead {} from source", entry.lead_minutes);
            continue;
        }
        if seen.insert(entry.lead_minutes) {
            normalized.push(entry);
        }
    }

    if normalized.is_empty() {
        return Err(SourceError::format("no entries for any configured lead"));
    }

    normalized.sort_by_key(|e| e.lead_minutes);
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(lead: u32, mmph: f64) -> ForecastEntry {
        let base = Utc::now();
        ForecastEntry {
            lead_minutes: lead,
            base_time: base,
            valid_time: base + Duration::minutes(i64::from(lead)),
            mmph,
        }
    }

    #[test]
    fn normalize_sorts_by_lead() {
        let out = normalize_entries(vec![entry(30, 1.0), entry(0, 2.0), entry(15, 3.0)], &[0, 15, 30])
            .unwrap();
        let leads: Vec<u32> = out.iter().map(|e| e.lead_minutes).collect();
        assert_eq!(leads, vec![0, 15, 30]);
    }

    #[test]
    fn normalize_drops_unconfigured_and_duplicate_leads() {
        let out = normalize_entries(
            vec![entry(0, 1.0), entry(0, 9.0), entry(5, 4.0), entry(15, 2.0)],
            &[0, 15],
        )
        .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].mmph, 1.0);
    }

    #[test]
    fn normalize_rejects_negative_intensity() {
        let err = normalize_entries(vec![entry(0, -1.0)], &[0]).unwrap_err();
        assert_eq!(err.kind(), FailureKind::SourceFormatError);
    }

    #[test]
    fn normalize_rejects_empty_result() {
        let err = normalize_entries(vec![entry(90, 1.0)], &[0, 15]).unwrap_err();
        assert!(matches!(err, SourceError::Format { .. }));
    }

    #[test]
    fn source_error_kinds_map_to_failure_taxonomy() {
        assert_eq!(SourceError::unavailable("x").kind(), FailureKind::SourceUnavailable);
        assert_eq!(SourceError::format("x").kind(), FailureKind::SourceFormatError);
    }
}
