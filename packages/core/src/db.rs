//! SQLite connection setup and schema.
//!
//! The monitor writes through a single-connection pool so every insert and
//! prune is serialised. File databases run in WAL mode, which lets the
//! viewer's own connection read committed rows while the monitor appends.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Schema shared with the external viewer. Column names, types and the
/// index must stay exactly as they are.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS nowcast(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        point_name TEXT,
        lat REAL, lon REAL,
        basetime TEXT,
        validtime TEXT,
        lead_min INTEGER,
        mmph REAL,
        created_at TEXT DEFAULT (datetime('now'))
    )",
    "CREATE INDEX IF NOT EXISTS idx_nowcast_point_time ON nowcast(point_name, validtime, lead_min)",
    "CREATE TABLE IF NOT EXISTS notification_history(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        point_name TEXT,
        notification_type TEXT,
        recipients TEXT,
        subject TEXT,
        body TEXT,
        mmph REAL,
        threshold_type TEXT,
        sent_at TEXT DEFAULT (datetime('now'))
    )",
    "CREATE INDEX IF NOT EXISTS idx_notification_point ON notification_history(point_name, sent_at)",
];

/// Open a pool for `database_url` and apply the schema.
///
/// `sqlite::memory:` is supported for tests; the single connection is kept
/// alive for the pool's lifetime so the database is not dropped.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?;
    connect(options, database_url.contains(":memory:")).await
}

/// Open (creating if needed) the database file at `path`.
pub async fn open_file(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    connect(SqliteConnectOptions::new().filename(path), false).await
}

async fn connect(options: SqliteConnectOptions, in_memory: bool) -> Result<SqlitePool, sqlx::Error> {
    let mut options = options.create_if_missing(true).busy_timeout(BUSY_TIMEOUT);
    if !in_memory {
        options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
    }

    let mut pool_options = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(60));
    if in_memory {
        pool_options = pool_options.idle_timeout(None).max_lifetime(None);
    }

    let pool = pool_options.connect_with(options).await?;
    init_schema(&pool).await?;

    tracing::debug!("SQLite store ready (in_memory: {})", in_memory);
    Ok(pool)
}

/// Create tables and indexes if they do not exist yet.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
