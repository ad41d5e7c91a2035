//! Process settings and the per-cycle monitor configuration.
//!
//! [`Settings`] come from the environment (and CLI overrides) and are read
//! once at startup. [`ConfigSnapshot`] is the JSON configuration file that
//! the external viewer edits; it is parsed fresh at the start of every
//! cycle and treated as immutable for that cycle.

use std::collections::{BTreeMap, HashSet};
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Deserializer};

use crate::cli::Cli;
use crate::error::ConfigError;
use crate::forecast::open_meteo::DEFAULT_BASE_URL;
use crate::types::{sort_by_severity, Point, Tier};

pub const DEFAULT_CONFIG_PATH: &str = "config.json";
pub const DEFAULT_LOG_DIR: &str = "logs";

const MAX_INTERVAL_MINUTES: u64 = 24 * 60;
const MAX_FETCH_TIMEOUT_SECONDS: u64 = 60 * 60;
const MAX_RETENTION_DAYS: u32 = 3650;
const MAX_COOLDOWN_MINUTES: u64 = 7 * 24 * 60;

// ---- Process settings -------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Settings {
    pub config_path: PathBuf,
    pub log_dir: PathBuf,
    pub http_addr: Option<SocketAddr>,
    pub forecast_base_url: String,
}

impl Settings {
    pub fn from_env() -> Result<Self, String> {
        let config_path = env::var("NOWCAST_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let log_dir = env::var("NOWCAST_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_DIR));

        let http_addr = match env::var("HTTP_ADDR") {
            Ok(raw) => Some(
                raw.parse::<SocketAddr>()
                    .map_err(|_| format!("Invalid HTTP_ADDR: {}", raw))?,
            ),
            Err(_) => None,
        };

        let forecast_base_url =
            env::var("FORECAST_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        Ok(Self {
            config_path,
            log_dir,
            http_addr,
            forecast_base_url,
        })
    }

    /// Apply CLI arguments on top of the environment.
    pub fn with_overrides(mut self, cli: &Cli) -> Self {
        if let Some(path) = &cli.config {
            self.config_path = path.clone();
        }
        if let Some(dir) = &cli.log_dir {
            self.log_dir = dir.clone();
        }
        if let Some(addr) = cli.http_addr {
            self.http_addr = Some(addr);
        }
        if let Some(url) = &cli.forecast_url {
            self.forecast_base_url = url.clone();
        }
        self
    }
}

// ---- Monitor configuration file ---------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub fetch_timeout_seconds: u64,
    pub max_concurrent_fetches: usize,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 5,
            fetch_timeout_seconds: 20,
            max_concurrent_fetches: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub sqlite_path: PathBuf,
    pub retention_days: u32,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("data/nowcast.sqlite"),
            retention_days: 3,
        }
    }
}

/// How notifications leave the process.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transport {
    /// Write notifications to the tracing log only.
    #[default]
    Log,
    /// POST a JSON payload to `url`.
    Webhook {
        url: String,
        #[serde(default = "default_webhook_timeout")]
        timeout_seconds: u64,
    },
}

fn default_webhook_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub enabled: bool,
    pub cooldown_minutes: u64,
    #[serde(alias = "admin_email", deserialize_with = "deserialize_recipients")]
    pub admin_recipients: Vec<String>,
    #[serde(alias = "admin_notification_times", deserialize_with = "deserialize_report_times")]
    pub admin_report_times: Vec<NaiveTime>,
    /// Offset used to interpret `admin_report_times` and to render local
    /// times in notification bodies.
    pub utc_offset_hours: i32,
    pub transport: Transport,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_minutes: 30,
            admin_recipients: Vec::new(),
            admin_report_times: NaiveTime::from_hms_opt(9, 0, 0)
                .into_iter()
                .chain(NaiveTime::from_hms_opt(17, 0, 0))
                .collect(),
            utc_offset_hours: 9,
            transport: Transport::Log,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawLocation {
    name: String,
    #[serde(alias = "latitude")]
    lat: f64,
    #[serde(alias = "longitude")]
    lon: f64,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    thresholds: BTreeMap<String, f64>,
    #[serde(default, alias = "email_to", deserialize_with = "deserialize_recipients")]
    recipients: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawConfig {
    locations: Vec<RawLocation>,
    monitoring: MonitoringSettings,
    thresholds: BTreeMap<String, f64>,
    leads: Vec<u32>,
    storage: StorageSettings,
    notification: NotificationSettings,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            locations: Vec::new(),
            monitoring: MonitoringSettings::default(),
            thresholds: BTreeMap::from([
                ("heavy_rain".to_string(), 30.0),
                ("torrential_rain".to_string(), 50.0),
            ]),
            leads: vec![0, 15, 30, 45, 60],
            storage: StorageSettings::default(),
            notification: NotificationSettings::default(),
        }
    }
}

/// Immutable view of the configuration for one cycle.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub points: Vec<Point>,
    /// Global tiers, most severe first.
    pub tiers: Vec<Tier>,
    /// Lead horizons in minutes, ascending and unique.
    pub leads: Vec<u32>,
    pub monitoring: MonitoringSettings,
    pub storage: StorageSettings,
    pub notification: NotificationSettings,
}

impl ConfigSnapshot {
    /// Read and validate the configuration file at `path`.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(raw)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        if !(1..=MAX_INTERVAL_MINUTES).contains(&raw.monitoring.interval_minutes) {
            return Err(ConfigError::invalid(format!(
                "monitoring.interval_minutes must be between 1 and {}",
                MAX_INTERVAL_MINUTES
            )));
        }
        if !(1..=MAX_FETCH_TIMEOUT_SECONDS).contains(&raw.monitoring.fetch_timeout_seconds) {
            return Err(ConfigError::invalid(format!(
                "monitoring.fetch_timeout_seconds must be between 1 and {}",
                MAX_FETCH_TIMEOUT_SECONDS
            )));
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&raw.storage.retention_days) {
            return Err(ConfigError::invalid(format!(
                "storage.retention_days must be between 1 and {}",
                MAX_RETENTION_DAYS
            )));
        }
        if raw.notification.cooldown_minutes > MAX_COOLDOWN_MINUTES {
            return Err(ConfigError::invalid(format!(
                "notification.cooldown_minutes must be at most {}",
                MAX_COOLDOWN_MINUTES
            )));
        }

        let mut leads = raw.leads;
        leads.sort_unstable();
        leads.dedup();
        if leads.is_empty() {
            return Err(ConfigError::invalid("leads must list at least one horizon"));
        }

        let tiers = build_tiers(&raw.thresholds, "thresholds")?;
        if tiers.is_empty() {
            return Err(ConfigError::invalid("thresholds must define at least one tier"));
        }

        let mut seen = HashSet::new();
        let mut points = Vec::with_capacity(raw.locations.len());
        for location in raw.locations {
            let name = location.name.trim().to_string();
            if name.is_empty() {
                return Err(ConfigError::invalid("location name must not be empty"));
            }
            if !seen.insert(name.clone()) {
                return Err(ConfigError::invalid(format!("duplicate location name '{}'", name)));
            }
            if !(-90.0..=90.0).contains(&location.lat) || !(-180.0..=180.0).contains(&location.lon)
            {
                return Err(ConfigError::invalid(format!(
                    "location '{}' has out-of-range coordinates ({}, {})",
                    name, location.lat, location.lon
                )));
            }

            let point_tiers = if location.thresholds.is_empty() {
                None
            } else {
                Some(build_tiers(
                    &location.thresholds,
                    &format!("locations['{}'].thresholds", name),
                )?)
            };

            points.push(Point {
                name,
                latitude: location.lat,
                longitude: location.lon,
                enabled: location.enabled,
                tiers: point_tiers,
                recipients: location.recipients,
            });
        }

        if !(-14..=14).contains(&raw.notification.utc_offset_hours) {
            return Err(ConfigError::invalid(
                "notification.utc_offset_hours must be between -14 and 14",
            ));
        }
        if let Transport::Webhook { url, .. } = &raw.notification.transport {
            if url.trim().is_empty() {
                return Err(ConfigError::invalid("notification.transport.url must not be empty"));
            }
        }

        Ok(Self {
            points,
            tiers,
            leads,
            monitoring: raw.monitoring,
            storage: raw.storage,
            notification: raw.notification,
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.monitoring.interval_minutes.saturating_mul(60))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.monitoring.fetch_timeout_seconds)
    }

    /// Saturates instead of wrapping; `from_raw` already bounds the value.
    pub fn cooldown(&self) -> chrono::Duration {
        i64::try_from(self.notification.cooldown_minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::try_days(i64::from(self.storage.retention_days))
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn enabled_points(&self) -> impl Iterator<Item = &Point> {
        self.points.iter().filter(|p| p.enabled)
    }
}

fn build_tiers(thresholds: &BTreeMap<String, f64>, field: &str) -> Result<Vec<Tier>, ConfigError> {
    let mut tiers = Vec::with_capacity(thresholds.len());
    for (name, value) in thresholds {
        if !value.is_finite() || *value <= 0.0 {
            return Err(ConfigError::invalid(format!(
                "{}.{} must be a positive number, got {}",
                field, name, value
            )));
        }
        tiers.push(Tier::new(name.clone(), *value));
    }
    sort_by_severity(&mut tiers);
    Ok(tiers)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RecipientList {
    Joined(String),
    List(Vec<String>),
}

/// Accepts either a list or a comma / semicolon separated string.
fn deserialize_recipients<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = match RecipientList::deserialize(deserializer)? {
        RecipientList::Joined(joined) => joined
            .split([',', ';'])
            .map(str::to_string)
            .collect::<Vec<_>>(),
        RecipientList::List(list) => list,
    };
    Ok(raw
        .into_iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect())
}

fn deserialize_report_times<'de, D>(deserializer: D) -> Result<Vec<NaiveTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<String>::deserialize(deserializer)?;
    raw.iter()
        .map(|s| {
            NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|_| {
                serde::de::Error::custom(format!("invalid report time '{}', expected HH:MM", s))
            })
        })
        .collect()
}
