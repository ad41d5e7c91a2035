//! Health self-reporting.
//!
//! After every cycle the [`HealthReporter`] overwrites
//! `<log_dir>/monitor_heartbeat.json` and appends to `<log_dir>/monitor.log`.
//! The viewer polls both files. Nothing in here returns an error: I/O
//! problems are logged and the cycle carries on.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::scheduler::{CycleReport, CycleStatus};

pub const HEARTBEAT_FILE: &str = "monitor_heartbeat.json";
pub const LOG_FILE: &str = "monitor.log";

const LOCAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Liveness snapshot written after every cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Heartbeat {
    pub last_run: String,
    pub ok: bool,
    /// Set only when `ok` is false.
    pub error: Option<String>,
    /// Informational status, e.g. why nothing was collected.
    pub note: Option<String>,
    pub last_success: Option<String>,
    pub points_ok: usize,
    pub points_failed: usize,
    pub readings_stored: usize,
    pub notifications_sent: usize,
    /// Point name to "Kind: message".
    pub failures: BTreeMap<String, String>,
}

pub struct HealthReporter {
    log_dir: PathBuf,
    latest: RwLock<Option<Heartbeat>>,
}

impl HealthReporter {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            latest: RwLock::new(None),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn heartbeat_path(&self) -> PathBuf {
        self.log_dir.join(HEARTBEAT_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(LOG_FILE)
    }

    /// Most recent heartbeat, `None` until the first cycle has finished.
    pub async fn latest(&self) -> Option<Heartbeat> {
        self.latest.read().await.clone()
    }

    /// Record the outcome of one cycle.
    pub async fn report(&self, cycle: &CycleReport) -> Heartbeat {
        let now = Local::now().format(LOCAL_FORMAT).to_string();
        let ok = cycle.ok();

        let error = match &cycle.status {
            CycleStatus::ConfigFailed(message) => Some(message.clone()),
            CycleStatus::Disabled => None,
            CycleStatus::Completed if !cycle.failures.is_empty() => Some(format!(
                "{} of {} points failed",
                cycle.failures.len(),
                cycle.points_total
            )),
            CycleStatus::Completed => None,
        };

        let note = match cycle.status {
            CycleStatus::Disabled => Some("monitoring disabled".to_string()),
            _ => None,
        };

        let failures = cycle
            .failures
            .iter()
            .map(|f| (f.point.clone(), format!("{}: {}", f.kind, f.message)))
            .collect();

        let mut latest = self.latest.write().await;
        let previous_success = latest.as_ref().and_then(|hb| hb.last_success.clone());
        let last_success = if ok && cycle.status == CycleStatus::Completed {
            Some(now.clone())
        } else {
            previous_success
        };

        let heartbeat = Heartbeat {
            last_run: now,
            ok,
            error,
            note,
            last_success,
            points_ok: cycle.points_ok,
            points_failed: cycle.failures.len(),
            readings_stored: cycle.readings_stored,
            notifications_sent: cycle.notifications_sent,
            failures,
        };

        self.write_heartbeat(&heartbeat).await;

        let mut lines = vec![cycle.summary_line()];
        lines.extend(
            cycle
                .failures
                .iter()
                .map(|f| format!("  {} failed ({}): {}", f.point, f.kind, f.message)),
        );
        for line in &lines {
            self.append_log(line).await;
        }

        *latest = Some(heartbeat.clone());
        heartbeat
    }

    /// Append one `[YYYY-MM-DD HH:MM:SS] message` line to the operational log.
    pub async fn append_log(&self, message: &str) {
        if let Err(err) = self.try_append_log(message).await {
            tracing::error!("Failed to append to {}: {}", self.log_path().display(), err);
        }
    }

    async fn try_append_log(&self, message: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.log_dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .await?;
        let line = format!("[{}] {}\n", Local::now().format(LOCAL_FORMAT), message);
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    async fn write_heartbeat(&self, heartbeat: &Heartbeat) {
        if let Err(err) = self.try_write_heartbeat(heartbeat).await {
            tracing::error!(
                "Failed to write heartbeat {}: {}",
                self.heartbeat_path().display(),
                err
            );
        }
    }

    async fn try_write_heartbeat(&self, heartbeat: &Heartbeat) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.log_dir).await?;
        let body = serde_json::to_vec_pretty(heartbeat)?;
        let tmp = self.log_dir.join(format!("{}.tmp", HEARTBEAT_FILE));
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, self.heartbeat_path()).await
    }
}
