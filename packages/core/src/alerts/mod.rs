//! Threshold alert evaluation.
//!
//! [`AlertEvaluator`] keeps one small state machine per (point, tier):
//! `Quiet` or `Alerting`. Only the nearest available lead of a point drives
//! transitions; tiers are walked from most severe down and at most one
//! notification is produced per point per evaluation.
//!
//! State lives in process memory only. A restart resets every pair to
//! `Quiet`, so a still-qualifying reading re-notifies right after restart.

pub mod notifier;
pub mod report;
pub mod webhook;

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::types::{sort_by_severity, Point, Reading, Tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertStatus {
    Quiet,
    Alerting,
}

/// Dedup state for one (point, tier) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertState {
    pub status: AlertStatus,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub last_notified_mmph: Option<f64>,
}

impl Default for AlertState {
    fn default() -> Self {
        Self {
            status: AlertStatus::Quiet,
            last_notified_at: None,
            last_notified_mmph: None,
        }
    }
}

/// A threshold crossing that should be delivered to the notifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdAlert {
    pub point_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub tier: Tier,
    /// All tiers for the point, most severe first (for rendering).
    pub tiers: Vec<Tier>,
    pub mmph: f64,
    pub lead_minutes: u32,
    pub valid_time: DateTime<Utc>,
    pub recipients: Vec<String>,
    /// Every lead collected this cycle, ascending.
    pub forecast: Vec<(u32, f64)>,
    pub triggered_at: DateTime<Utc>,
}

type StateKey = (String, String);

/// In-memory alert state machine for all (point, tier) pairs.
#[derive(Debug)]
pub struct AlertEvaluator {
    cooldown: Duration,
    states: HashMap<StateKey, AlertState>,
}

impl AlertEvaluator {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            states: HashMap::new(),
        }
    }

    /// Cooldown is hot-reloaded with the configuration each cycle.
    pub fn set_cooldown(&mut self, cooldown: Duration) {
        self.cooldown = cooldown;
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Current state for a pair; unseen pairs are `Quiet`.
    pub fn state(&self, point_name: &str, tier_name: &str) -> AlertState {
        self.states
            .get(&(point_name.to_string(), tier_name.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Drop state for points that are no longer configured.
    pub fn retain_points(&mut self, point_names: &HashSet<&str>) {
        self.states
            .retain(|(point, _), _| point_names.contains(point.as_str()));
    }

    /// Evaluate this cycle's readings for `point`.
    ///
    /// Returns the alert to deliver, if any. The state transition is
    /// committed before returning, so a failed delivery still counts
    /// against the cooldown.
    pub fn evaluate(
        &mut self,
        point: &Point,
        tiers: &[Tier],
        readings: &[Reading],
        now: DateTime<Utc>,
    ) -> Option<ThresholdAlert> {
        let driving = readings.iter().min_by_key(|r| r.lead_minutes)?;

        let mut ordered = tiers.to_vec();
        sort_by_severity(&mut ordered);

        let mut alert = None;
        let mut covered = false;

        for tier in &ordered {
            let key = (point.name.clone(), tier.name.clone());
            let state = self.states.entry(key).or_default();

            if !tier.qualifies(driving.mmph) {
                if state.status == AlertStatus::Alerting {
                    tracing::info!(
                        "[{}] {} cleared ({:.1} mm/h < {:.1})",
                        point.name,
                        tier.name,
                        driving.mmph,
                        tier.threshold_mmph
                    );
                }
                state.status = AlertStatus::Quiet;
                continue;
            }

            if covered {
                // A more severe tier already handled this reading.
                state.status = AlertStatus::Alerting;
                continue;
            }
            covered = true;

            if state.status == AlertStatus::Alerting {
                continue;
            }

            let cooled_down = state
                .last_notified_at
                .map_or(true, |last| now - last >= self.cooldown);
            if !cooled_down {
                tracing::info!(
                    "[{}] {} suppressed by cooldown ({} min)",
                    point.name,
                    tier.name,
                    self.cooldown.num_minutes()
                );
                continue;
            }

            state.status = AlertStatus::Alerting;
            state.last_notified_at = Some(now);
            state.last_notified_mmph = Some(driving.mmph);

            let mut forecast: Vec<(u32, f64)> =
                readings.iter().map(|r| (r.lead_minutes, r.mmph)).collect();
            forecast.sort_by_key(|(lead, _)| *lead);

            alert = Some(ThresholdAlert {
                point_name: point.name.clone(),
                latitude: point.latitude,
                longitude: point.longitude,
                tier: tier.clone(),
                tiers: ordered.clone(),
                mmph: driving.mmph,
                lead_minutes: driving.lead_minutes,
                valid_time: driving.valid_time,
                recipients: point.recipients.clone(),
                forecast,
                triggered_at: now,
            });
        }

        alert
    }
}
