use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::scan::{Scan, ScanSummary, ScanType};
use crate::models::target::{Criticality, Target};

fn decode_err(msg: impl std::fmt::Display) -> sqlx::Error {
    sqlx::Error::Decode(msg.to_string().into())
}

fn json_err(e: serde_json::Error) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(e))
}

fn parse_uuid(s: &str) -> Result<Uuid, sqlx::Error> {
    Uuid::parse_str(s).map_err(|e| decode_err(format!("invalid uuid {s:?}: {e}")))
}

// ============================================
// Scan rows
// ============================================

pub(crate) fn scan_from_row(row: &SqliteRow) -> Result<Scan, sqlx::Error> {
    let scan_id = parse_uuid(&row.get::<String, _>("scan_id"))?;

    let scan_type_raw: String = row.get("scan_type");
    let scan_type = ScanType::parse(&scan_type_raw)
        .ok_or_else(|| decode_err(format!("unknown scan_type {scan_type_raw:?}")))?;

    let ports = row
        .get::<Option<String>, _>("ports")
        .map(|raw| serde_json::from_str::<Vec<u16>>(&raw).map_err(json_err))
        .transpose()?;

    let summary = row
        .get::<Option<String>, _>("summary")
        .map(|raw| serde_json::from_str::<ScanSummary>(&raw).map_err(json_err))
        .transpose()?;

    Ok(Scan {
        scan_id,
        probe_name: row.get("probe_name"),
        target: row.get("target"),
        scan_type,
        ports,
        engine_target_id: row.get("engine_target_id"),
        engine_task_id: row.get("engine_task_id"),
        engine_report_id: row.get("engine_report_id"),
        gvm_status: row.get("gvm_status"),
        gvm_progress: row.get("gvm_progress"),
        report_xml: row.get("report_xml"),
        summary,
        error: row.get("error"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        external_target_id: row.get("external_target_id"),
    })
}

pub async fn insert_scan(pool: &SqlitePool, scan: &Scan) -> Result<(), sqlx::Error> {
    let ports = scan
        .ports
        .as_ref()
        .map(|p| serde_json::to_string(p).map_err(json_err))
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO scans (
            scan_id, probe_name, target, scan_type, ports,
            gvm_status, gvm_progress, created_at, external_target_id
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(scan.scan_id.to_string())
    .bind(&scan.probe_name)
    .bind(&scan.target)
    .bind(scan.scan_type.as_str())
    .bind(ports)
    .bind(&scan.gvm_status)
    .bind(scan.gvm_progress)
    .bind(scan.created_at)
    .bind(&scan.external_target_id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_scan(pool: &SqlitePool, scan_id: Uuid) -> Result<Option<Scan>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM scans WHERE scan_id = ?1")
        .bind(scan_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(scan_from_row).transpose()
}

pub async fn list_scans(pool: &SqlitePool) -> Result<Vec<Scan>, sqlx::Error> {
    let rows = sqlx::query("SELECT * FROM scans ORDER BY created_at DESC")
        .fetch_all(pool)
        .await?;

    rows.iter().map(scan_from_row).collect()
}

/// Scans that have not reached a terminal state, for restart recovery.
pub async fn incomplete_scans(pool: &SqlitePool) -> Result<Vec<Scan>, sqlx::Error> {
    let rows = sqlx::query("SELECT * FROM scans WHERE completed_at IS NULL ORDER BY created_at")
        .fetch_all(pool)
        .await?;

    rows.iter().map(scan_from_row).collect()
}

/// Live scans per probe (`completed_at IS NULL`), the selector's input.
pub async fn active_scan_counts(pool: &SqlitePool) -> Result<HashMap<String, i64>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT probe_name, COUNT(*) AS active FROM scans WHERE completed_at IS NULL GROUP BY probe_name",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| (row.get("probe_name"), row.get("active")))
        .collect())
}

pub async fn set_engine_target(
    pool: &SqlitePool,
    scan_id: Uuid,
    engine_target_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE scans SET engine_target_id = ?2 WHERE scan_id = ?1")
        .bind(scan_id.to_string())
        .bind(engine_target_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_engine_task(
    pool: &SqlitePool,
    scan_id: Uuid,
    engine_task_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE scans SET engine_task_id = ?2 WHERE scan_id = ?1")
        .bind(scan_id.to_string())
        .bind(engine_task_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_started(
    pool: &SqlitePool,
    scan_id: Uuid,
    engine_report_id: &str,
    started_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE scans SET engine_report_id = ?2, started_at = ?3 WHERE scan_id = ?1")
        .bind(scan_id.to_string())
        .bind(engine_report_id)
        .bind(started_at)
        .execute(pool)
        .await?;
    Ok(())
}

/// Persist the last observed (non-terminal) engine status and progress.
pub async fn update_observed_status(
    pool: &SqlitePool,
    scan_id: Uuid,
    status: &str,
    progress: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE scans SET gvm_status = ?2, gvm_progress = ?3 WHERE scan_id = ?1 AND completed_at IS NULL",
    )
    .bind(scan_id.to_string())
    .bind(status)
    .bind(progress)
    .execute(pool)
    .await?;
    Ok(())
}

/// Terminal non-success transition (`Stopped`, `Interrupted`). Status and
/// `completed_at` move together so the terminal invariant holds at every
/// point in time. Returns false when another writer finalized first.
pub async fn finalize_status(
    pool: &SqlitePool,
    scan_id: Uuid,
    status: &str,
    progress: i32,
    completed_at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE scans SET gvm_status = ?2, gvm_progress = ?3, completed_at = ?4
        WHERE scan_id = ?1 AND completed_at IS NULL
        "#,
    )
    .bind(scan_id.to_string())
    .bind(status)
    .bind(progress)
    .bind(completed_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Adapter-side failure: record the error and finalize.
pub async fn finalize_error(
    pool: &SqlitePool,
    scan_id: Uuid,
    error: &str,
    completed_at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE scans SET error = ?2, completed_at = ?3 WHERE scan_id = ?1 AND completed_at IS NULL",
    )
    .bind(scan_id.to_string())
    .bind(error)
    .bind(completed_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// The at-most-once `Done` transition: report blob, summary, status and
/// `completed_at` land in one conditional update. A racing writer (possible
/// only after restart recovery) sees zero rows affected and backs off.
pub async fn write_report(
    pool: &SqlitePool,
    scan_id: Uuid,
    report_xml: &str,
    summary: &ScanSummary,
    completed_at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let summary_json = serde_json::to_string(summary).map_err(json_err)?;

    let result = sqlx::query(
        r#"
        UPDATE scans
        SET gvm_status = 'Done', gvm_progress = 100,
            report_xml = ?2, summary = ?3, completed_at = ?4
        WHERE scan_id = ?1 AND report_xml IS NULL AND completed_at IS NULL
        "#,
    )
    .bind(scan_id.to_string())
    .bind(report_xml)
    .bind(summary_json)
    .bind(completed_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

// ============================================
// Target rows
// ============================================

pub(crate) fn target_from_row(row: &SqliteRow) -> Result<Target, sqlx::Error> {
    let scan_type_raw: String = row.get("scan_type");
    let scan_type = ScanType::parse(&scan_type_raw)
        .ok_or_else(|| decode_err(format!("unknown scan_type {scan_type_raw:?}")))?;

    let criticality_raw: String = row.get("criticality");
    let criticality = Criticality::parse(&criticality_raw)
        .ok_or_else(|| decode_err(format!("unknown criticality {criticality_raw:?}")))?;

    let ports: Vec<u16> =
        serde_json::from_str(&row.get::<String, _>("ports")).map_err(json_err)?;
    let tags: serde_json::Value =
        serde_json::from_str(&row.get::<String, _>("tags")).map_err(json_err)?;

    let last_scan_id = row
        .get::<Option<String>, _>("last_scan_id")
        .map(|s| parse_uuid(&s))
        .transpose()?;

    Ok(Target {
        external_id: row.get("external_id"),
        host: row.get("host"),
        ports,
        scan_type,
        criticality,
        criticality_weight: row.get("criticality_weight"),
        scan_frequency_hours: row.get("scan_frequency_hours"),
        enabled: row.get::<i64, _>("enabled") != 0,
        tags,
        last_scan_at: row.get("last_scan_at"),
        next_scan_at: row.get("next_scan_at"),
        last_scan_id,
        synced_at: row.get("synced_at"),
        created_at: row.get("created_at"),
    })
}

pub async fn get_target(
    pool: &SqlitePool,
    external_id: &str,
) -> Result<Option<Target>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM targets WHERE external_id = ?1")
        .bind(external_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(target_from_row).transpose()
}

pub async fn list_targets(pool: &SqlitePool) -> Result<Vec<Target>, sqlx::Error> {
    let rows = sqlx::query("SELECT * FROM targets ORDER BY external_id")
        .fetch_all(pool)
        .await?;

    rows.iter().map(target_from_row).collect()
}

/// Eligible rows for one scheduler tick, highest criticality first, oldest
/// due time breaking ties.
pub async fn due_targets(
    pool: &SqlitePool,
    now: DateTime<Utc>,
) -> Result<Vec<Target>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM targets
        WHERE enabled = 1 AND next_scan_at IS NOT NULL AND next_scan_at <= ?1
        ORDER BY criticality_weight DESC, next_scan_at ASC
        "#,
    )
    .bind(now)
    .fetch_all(pool)
    .await?;

    rows.iter().map(target_from_row).collect()
}

/// Post-dispatch bookkeeping; only the Scheduler touches these columns.
pub async fn mark_target_dispatched(
    pool: &SqlitePool,
    external_id: &str,
    scan_id: Uuid,
    now: DateTime<Utc>,
    next_scan_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE targets SET last_scan_at = ?2, last_scan_id = ?3, next_scan_at = ?4
        WHERE external_id = ?1
        "#,
    )
    .bind(external_id)
    .bind(now)
    .bind(scan_id.to_string())
    .bind(next_scan_at)
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_memory;

    fn sample_scan(probe: &str) -> Scan {
        Scan {
            scan_id: Uuid::new_v4(),
            probe_name: probe.to_string(),
            target: "192.168.15.20".to_string(),
            scan_type: ScanType::Full,
            ports: None,
            engine_target_id: None,
            engine_task_id: None,
            engine_report_id: None,
            gvm_status: "New".to_string(),
            gvm_progress: 0,
            report_xml: None,
            summary: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            external_target_id: None,
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_round_trip() {
        let pool = connect_memory().await;
        let mut scan = sample_scan("gvm-1");
        scan.scan_type = ScanType::Directed;
        scan.ports = Some(vec![22, 80, 443]);

        insert_scan(&pool, &scan).await.unwrap();
        let fetched = get_scan(&pool, scan.scan_id).await.unwrap().unwrap();

        assert_eq!(fetched.target, "192.168.15.20");
        assert_eq!(fetched.scan_type, ScanType::Directed);
        assert_eq!(fetched.ports, Some(vec![22, 80, 443]));
        assert_eq!(fetched.gvm_status, "New");
        assert!(fetched.completed_at.is_none());
    }

    #[tokio::test]
    async fn active_counts_exclude_completed() {
        let pool = connect_memory().await;
        let a = sample_scan("gvm-1");
        let b = sample_scan("gvm-1");
        let c = sample_scan("gvm-2");
        for scan in [&a, &b, &c] {
            insert_scan(&pool, scan).await.unwrap();
        }

        finalize_status(&pool, b.scan_id, "Stopped", 40, Utc::now())
            .await
            .unwrap();

        let counts = active_scan_counts(&pool).await.unwrap();
        assert_eq!(counts.get("gvm-1"), Some(&1));
        assert_eq!(counts.get("gvm-2"), Some(&1));
    }

    #[tokio::test]
    async fn report_write_is_at_most_once() {
        let pool = connect_memory().await;
        let scan = sample_scan("gvm-1");
        insert_scan(&pool, &scan).await.unwrap();

        let summary = ScanSummary {
            hosts_scanned: 1,
            vulns_high: 2,
            ..Default::default()
        };

        let first = write_report(&pool, scan.scan_id, "<report/>", &summary, Utc::now())
            .await
            .unwrap();
        let second = write_report(&pool, scan.scan_id, "<other/>", &summary, Utc::now())
            .await
            .unwrap();

        assert!(first);
        assert!(!second);

        let fetched = get_scan(&pool, scan.scan_id).await.unwrap().unwrap();
        assert_eq!(fetched.report_xml.as_deref(), Some("<report/>"));
        assert_eq!(fetched.gvm_status, "Done");
        assert_eq!(fetched.summary, Some(summary));
        assert!(fetched.completed_at.is_some());
    }

    #[tokio::test]
    async fn finalize_is_idempotent() {
        let pool = connect_memory().await;
        let scan = sample_scan("gvm-1");
        insert_scan(&pool, &scan).await.unwrap();

        assert!(
            finalize_error(&pool, scan.scan_id, "timeout", Utc::now())
                .await
                .unwrap()
        );
        assert!(
            !finalize_status(&pool, scan.scan_id, "Stopped", 10, Utc::now())
                .await
                .unwrap()
        );

        let fetched = get_scan(&pool, scan.scan_id).await.unwrap().unwrap();
        assert_eq!(fetched.error.as_deref(), Some("timeout"));
        assert_eq!(fetched.gvm_status, "New");
    }
}
