//! Inventory synchronizer.
//!
//! Periodically pulls the upstream target list and reconciles it into the
//! local table. The coupling is weak on purpose: any fetch or parse error
//! leaves the store untouched and the system keeps scanning whatever is
//! already persisted. Rows are never deleted, only disabled.

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use sqlx::SqlitePool;
use thiserror::Error;

use crate::config::SourceConfig;
use crate::metrics::Metrics;
use crate::models::scan::ScanType;
use crate::models::target::Criticality;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("source returned status {0}")]
    Status(reqwest::StatusCode),
}

/// One target as the upstream source sends it.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncedTarget {
    pub external_id: String,
    pub host: String,
    #[serde(default)]
    pub ports: Vec<u16>,
    pub scan_type: ScanType,
    pub criticality: Criticality,
    pub scan_frequency_hours: i64,
    pub enabled: bool,
    #[serde(default = "empty_tags")]
    pub tags: serde_json::Value,
}

fn empty_tags() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Debug, Deserialize)]
struct SourceResponse {
    targets: Vec<serde_json::Value>,
}

/// Decode received objects one by one; an invalid entry is skipped, not the
/// whole batch.
pub fn parse_targets(values: Vec<serde_json::Value>) -> Vec<SyncedTarget> {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<SyncedTarget>(value) {
            Ok(target) => {
                if target.external_id.is_empty()
                    || target.host.is_empty()
                    || target.scan_frequency_hours <= 0
                {
                    tracing::warn!(
                        "Skipping invalid target {:?} from source",
                        target.external_id
                    );
                    return None;
                }
                Some(target)
            }
            Err(e) => {
                tracing::warn!("Skipping undecodable target from source: {}", e);
                None
            }
        })
        .collect()
}

pub async fn fetch(
    client: &reqwest::Client,
    source: &SourceConfig,
) -> Result<Vec<SyncedTarget>, SyncError> {
    let mut request = client.get(&source.url);
    if let Some(token) = &source.auth_token {
        request = request.bearer_auth(token);
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(SyncError::Status(response.status()));
    }

    let body: SourceResponse = response.json().await?;
    Ok(parse_targets(body.targets))
}

/// Apply one received batch within a single transaction: upsert everything
/// received (forcing `enabled = 0` for received-disabled entries) and
/// soft-delete every local row absent from the batch. New rows get
/// `next_scan_at = now` so they are scanned immediately.
pub async fn reconcile(pool: &SqlitePool, targets: &[SyncedTarget]) -> Result<(), sqlx::Error> {
    let sync_time = Utc::now();
    let mut tx = pool.begin().await?;

    for target in targets {
        let ports = serde_json::to_string(&target.ports)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let tags = target.tags.to_string();

        sqlx::query(
            r#"
            INSERT INTO targets (
                external_id, host, ports, scan_type, criticality,
                criticality_weight, scan_frequency_hours, enabled, tags,
                synced_at, next_scan_at, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?10)
            ON CONFLICT(external_id) DO UPDATE SET
                host = excluded.host,
                ports = excluded.ports,
                scan_type = excluded.scan_type,
                criticality = excluded.criticality,
                criticality_weight = excluded.criticality_weight,
                scan_frequency_hours = excluded.scan_frequency_hours,
                enabled = excluded.enabled,
                tags = excluded.tags,
                synced_at = excluded.synced_at
            "#,
        )
        .bind(&target.external_id)
        .bind(&target.host)
        .bind(ports)
        .bind(target.scan_type.as_str())
        .bind(target.criticality.as_str())
        .bind(target.criticality.weight())
        .bind(target.scan_frequency_hours)
        .bind(target.enabled as i64)
        .bind(tags)
        .bind(sync_time)
        .execute(&mut *tx)
        .await?;
    }

    // Set-difference soft delete: everything this pass did not touch keeps
    // an older (or null) synced_at.
    sqlx::query("UPDATE targets SET enabled = 0 WHERE synced_at IS NULL OR synced_at < ?1")
        .bind(sync_time)
        .execute(&mut *tx)
        .await?;

    tx.commit().await
}

pub async fn run(pool: SqlitePool, source: SourceConfig, metrics: std::sync::Arc<Metrics>) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(source.timeout))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("Failed to build sync HTTP client: {}", e);
            return;
        }
    };

    let mut interval = tokio::time::interval(Duration::from_secs(source.sync_interval.max(1)));
    tracing::info!(
        "Target sync running every {}s against {}",
        source.sync_interval,
        source.url
    );

    loop {
        interval.tick().await;

        let targets = match fetch(&client, &source).await {
            Ok(targets) => targets,
            Err(e) => {
                tracing::warn!("Target sync skipped: {}", e);
                metrics.sync_failures.inc();
                continue;
            }
        };

        match reconcile(&pool, &targets).await {
            Ok(()) => {
                metrics.sync_runs.inc();
                tracing::info!("Synchronized {} target(s)", targets.len());
            }
            Err(e) => {
                tracing::error!("Target reconciliation failed: {}", e);
                metrics.sync_failures.inc();
            }
        }
    }
}
