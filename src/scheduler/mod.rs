//! Due-target scheduler.
//!
//! Every tick selects the enabled targets whose `next_scan_at` has passed,
//! highest criticality first, and pushes them through the Scan Manager.
//! Bookkeeping (`last_scan_at`, `last_scan_id`, `next_scan_at`) advances
//! only on successful submission, so a failed dispatch is retried on the
//! next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::queries;
use crate::manager::{ScanManager, ScanRequest};
use crate::metrics::Metrics;
use crate::models::scan::ScanType;

pub async fn run(
    pool: SqlitePool,
    manager: Arc<ScanManager>,
    metrics: Arc<Metrics>,
    interval_secs: u64,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    tracing::info!("Scheduler running every {}s", interval_secs);

    loop {
        interval.tick().await;
        match tick(&pool, &manager, &metrics).await {
            Ok(dispatched) if !dispatched.is_empty() => {
                tracing::info!("Scheduler dispatched {} scan(s)", dispatched.len());
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("Scheduler tick failed: {}", e);
            }
        }
    }
}

/// One tick. Returns the dispatched `(external_id, scan_id)` pairs in
/// dispatch order.
pub async fn tick(
    pool: &SqlitePool,
    manager: &Arc<ScanManager>,
    metrics: &Metrics,
) -> Result<Vec<(String, Uuid)>, sqlx::Error> {
    let due = queries::due_targets(pool, Utc::now()).await?;
    let mut dispatched = Vec::new();

    for target in due {
        let ports = match target.scan_type {
            ScanType::Directed => Some(target.ports.clone()),
            ScanType::Full => None,
        };

        let request = ScanRequest {
            target: target.host.clone(),
            scan_type: target.scan_type,
            ports,
            probe_name: None,
            external_target_id: Some(target.external_id.clone()),
        };

        match manager.submit(request).await {
            Ok((scan_id, probe_name)) => {
                let now = Utc::now();
                let next_scan_at = now + chrono::Duration::hours(target.scan_frequency_hours);
                if let Err(e) = queries::mark_target_dispatched(
                    pool,
                    &target.external_id,
                    scan_id,
                    now,
                    next_scan_at,
                )
                .await
                {
                    tracing::error!(
                        "Failed to record dispatch of target {}: {}",
                        target.external_id,
                        e
                    );
                }
                metrics.scheduler_dispatches.inc();
                tracing::info!(
                    "Dispatched target {} ({}) to probe {} as scan {}",
                    target.external_id,
                    target.host,
                    probe_name,
                    scan_id
                );
                dispatched.push((target.external_id, scan_id));
            }
            Err(e) => {
                // next_scan_at stays put; the row is retried next tick.
                tracing::warn!(
                    "Could not dispatch target {}: {}",
                    target.external_id,
                    e
                );
            }
        }
    }

    Ok(dispatched)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::ScanConfig;
    use crate::db::connect_memory;
    use crate::gmp::{EngineError, ScanEngine, TaskStatus};
    use crate::models::target::Criticality;
    use crate::sync::{SyncedTarget, reconcile};

    /// Engine that accepts everything and never progresses; the scheduler
    /// tests only care about dispatch, not completion.
    struct IdleEngine;

    #[async_trait::async_trait]
    impl ScanEngine for IdleEngine {
        async fn ping(&self) -> Result<(), EngineError> {
            Ok(())
        }

        async fn create_target(
            &self,
            name: &str,
            _host: &str,
            _ports: Option<&[u16]>,
        ) -> Result<String, EngineError> {
            Ok(format!("tgt-{name}"))
        }

        async fn create_task(&self, name: &str, _target_id: &str) -> Result<String, EngineError> {
            Ok(format!("task-{name}"))
        }

        async fn start_task(&self, _task_id: &str) -> Result<String, EngineError> {
            Ok("rep-1".to_string())
        }

        async fn get_task(&self, _task_id: &str) -> Result<TaskStatus, EngineError> {
            Ok(TaskStatus {
                status: "Requested".to_string(),
                progress: 0,
            })
        }

        async fn get_report(&self, _report_id: &str) -> Result<String, EngineError> {
            Ok("<report/>".to_string())
        }

        async fn stop_task(&self, _task_id: &str) -> Result<(), EngineError> {
            Ok(())
        }

        async fn delete_task(&self, _task_id: &str) -> Result<(), EngineError> {
            Ok(())
        }

        async fn delete_target(&self, _target_id: &str) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn manager(pool: &SqlitePool, probes: &[&str]) -> Arc<ScanManager> {
        let engines: HashMap<String, Arc<dyn ScanEngine>> = probes
            .iter()
            .map(|name| (name.to_string(), Arc::new(IdleEngine) as Arc<dyn ScanEngine>))
            .collect();
        Arc::new(ScanManager::new(
            pool.clone(),
            engines,
            ScanConfig {
                poll_interval: 1,
                ..ScanConfig::default()
            },
            None,
            Arc::new(Metrics::new().unwrap()),
        ))
    }

    fn target(external_id: &str, criticality: Criticality) -> SyncedTarget {
        SyncedTarget {
            external_id: external_id.to_string(),
            host: format!("10.1.0.{}", external_id.len()),
            ports: vec![],
            scan_type: ScanType::Full,
            criticality,
            scan_frequency_hours: 24,
            enabled: true,
            tags: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn critical_targets_dispatch_first() {
        let pool = connect_memory().await;
        reconcile(
            &pool,
            &[
                target("asset-low", Criticality::Low),
                target("asset-critical", Criticality::Critical),
            ],
        )
        .await
        .unwrap();

        let manager = manager(&pool, &["gvm-1"]);
        let metrics = Metrics::new().unwrap();
        let dispatched = tick(&pool, &manager, &metrics).await.unwrap();

        let order: Vec<&str> = dispatched.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, vec!["asset-critical", "asset-low"]);
    }

    #[tokio::test]
    async fn dispatch_advances_schedule_and_links_scan() {
        let pool = connect_memory().await;
        reconcile(&pool, &[target("asset-001", Criticality::High)])
            .await
            .unwrap();

        let manager = manager(&pool, &["gvm-1"]);
        let metrics = Metrics::new().unwrap();
        let dispatched = tick(&pool, &manager, &metrics).await.unwrap();
        assert_eq!(dispatched.len(), 1);
        let (external_id, scan_id) = &dispatched[0];

        let row = queries::get_target(&pool, external_id).await.unwrap().unwrap();
        assert_eq!(row.last_scan_id, Some(*scan_id));
        assert!(row.last_scan_at.is_some());
        assert!(row.next_scan_at.unwrap() > Utc::now());

        let scan = queries::get_scan(&pool, *scan_id).await.unwrap().unwrap();
        assert_eq!(scan.external_target_id.as_deref(), Some("asset-001"));

        // Nothing left to do this tick.
        let again = tick(&pool, &manager, &metrics).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn failed_submission_leaves_target_due() {
        let pool = connect_memory().await;
        reconcile(&pool, &[target("asset-001", Criticality::High)])
            .await
            .unwrap();

        // No probes configured: every submission fails.
        let manager = manager(&pool, &[]);
        let metrics = Metrics::new().unwrap();
        let dispatched = tick(&pool, &manager, &metrics).await.unwrap();
        assert!(dispatched.is_empty());

        let row = queries::get_target(&pool, "asset-001").await.unwrap().unwrap();
        assert!(row.last_scan_id.is_none());
        let due = queries::due_targets(&pool, Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1, "undispatched target must stay due");
    }

    #[tokio::test]
    async fn disabled_targets_are_never_emitted() {
        let pool = connect_memory().await;
        let mut disabled = target("asset-001", Criticality::Critical);
        disabled.enabled = false;
        reconcile(&pool, &[disabled]).await.unwrap();

        let manager = manager(&pool, &["gvm-1"]);
        let metrics = Metrics::new().unwrap();
        let dispatched = tick(&pool, &manager, &metrics).await.unwrap();
        assert!(dispatched.is_empty());
    }
}
