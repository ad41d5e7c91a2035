//! Scriptable in-process forecast source used by tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::forecast::{ForecastSource, SourceError, SourceResult};
use crate::types::{ForecastEntry, Point};

#[derive(Debug, Clone)]
enum Script {
    /// Same intensity for every requested lead.
    Intensity(f64),
    /// Intensity per lead; leads not listed are omitted from the response.
    PerLead(Vec<(u32, f64)>),
    Unavailable(String),
    Malformed(String),
    Delay(Duration, f64),
    Panic,
}

/// Mock source keyed by point name. Points without a script return an
/// intensity of 0.0 for every lead.
#[derive(Debug, Default)]
pub struct MockForecastSource {
    scripts: Mutex<HashMap<String, Script>>,
    calls: AtomicUsize,
}

impl MockForecastSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_intensity(self, point: &str, mmph: f64) -> Self {
        self.set(point, Script::Intensity(mmph));
        self
    }

    pub fn with_lead_intensities(self, point: &str, values: Vec<(u32, f64)>) -> Self {
        self.set(point, Script::PerLead(values));
        self
    }

    pub fn with_unavailable(self, point: &str, message: &str) -> Self {
        self.set(point, Script::Unavailable(message.to_string()));
        self
    }

    pub fn with_malformed(self, point: &str, message: &str) -> Self {
        self.set(point, Script::Malformed(message.to_string()));
        self
    }

    pub fn with_delay(self, point: &str, delay: Duration, mmph: f64) -> Self {
        self.set(point, Script::Delay(delay, mmph));
        self
    }

    pub fn with_panic(self, point: &str) -> Self {
        self.set(point, Script::Panic);
        self
    }

    /// Change a point's intensity between cycles.
    pub fn set_intensity(&self, point: &str, mmph: f64) {
        self.set(point, Script::Intensity(mmph));
    }

    pub fn set_unavailable(&self, point: &str, message: &str) {
        self.set(point, Script::Unavailable(message.to_string()));
    }

    /// Total number of `fetch` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn set(&self, point: &str, script: Script) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(point.to_string(), script);
        }
    }

    fn script_for(&self, point: &str) -> Script {
        self.scripts
            .lock()
            .ok()
            .and_then(|scripts| scripts.get(point).cloned())
            .unwrap_or(Script::Intensity(0.0))
    }
}

fn entries(reference: DateTime<Utc>, values: impl IntoIterator<Item = (u32, f64)>) -> Vec<ForecastEntry> {
    values
        .into_iter()
        .map(|(lead, mmph)| ForecastEntry {
            lead_minutes: lead,
            base_time: reference,
            valid_time: reference + chrono::Duration::minutes(i64::from(lead)),
            mmph,
        })
        .collect()
}

#[async_trait]
impl ForecastSource for MockForecastSource {
    async fn fetch(
        &self,
        point: &Point,
        reference_time: DateTime<Utc>,
        leads: &[u32],
    ) -> SourceResult<Vec<ForecastEntry>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        match self.script_for(&point.name) {
            Script::Intensity(mmph) => Ok(entries(reference_time, leads.iter().map(|&l| (l, mmph)))),
            Script::PerLead(values) => Ok(entries(reference_time, values)),
            Script::Unavailable(message) => Err(SourceError::unavailable(message)),
            Script::Malformed(message) => Err(SourceError::format(message)),
            Script::Delay(delay, mmph) => {
                tokio::time::sleep(delay).await;
                Ok(entries(reference_time, leads.iter().map(|&l| (l, mmph))))
            }
            Script::Panic => panic!("mock source panicked for {}", point.name),
        }
    }

    fn source_name(&self) -> &str {
        "Mock"
    }
}
