pub mod queries;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Open the single-file store. WAL journaling plus a short busy timeout keep
/// the concurrent workers from tripping over SQLITE_BUSY.
pub async fn connect(db_path: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
}

/// One-shot schema migration: `CREATE TABLE IF NOT EXISTS`, additive only.
pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scans (
            scan_id TEXT PRIMARY KEY,
            probe_name TEXT NOT NULL,
            target TEXT NOT NULL,
            scan_type TEXT NOT NULL,
            ports TEXT,
            engine_target_id TEXT,
            engine_task_id TEXT,
            engine_report_id TEXT,
            gvm_status TEXT NOT NULL DEFAULT 'New',
            gvm_progress INTEGER NOT NULL DEFAULT 0,
            report_xml TEXT,
            summary TEXT,
            error TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            external_target_id TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_scans_created_at ON scans(created_at)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_scans_active ON scans(probe_name) WHERE completed_at IS NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS targets (
            external_id TEXT PRIMARY KEY,
            host TEXT NOT NULL,
            ports TEXT NOT NULL DEFAULT '[]',
            scan_type TEXT NOT NULL DEFAULT 'full',
            criticality TEXT NOT NULL DEFAULT 'medium',
            criticality_weight INTEGER NOT NULL DEFAULT 2,
            scan_frequency_hours INTEGER NOT NULL DEFAULT 24,
            enabled INTEGER NOT NULL DEFAULT 1,
            tags TEXT NOT NULL DEFAULT '{}',
            last_scan_at TEXT,
            next_scan_at TEXT,
            last_scan_id TEXT,
            synced_at TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_targets_due ON targets(enabled, next_scan_at)")
        .execute(pool)
        .await?;

    Ok(())
}

/// In-memory store for tests. Single connection so every query sees the
/// same database.
#[cfg(test)]
pub(crate) async fn connect_memory() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    migrate(&pool).await.expect("migration");
    pool
}
