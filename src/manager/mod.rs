pub mod selector;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::ScanConfig;
use crate::db::queries;
use crate::gmp::ScanEngine;
use crate::metrics::Metrics;
use crate::models::scan::{Scan, ScanType, is_terminal_status};
use crate::report;
use selector::ProbeSelector;

// ============================================
// Constants
// ============================================

/// Callback delivery attempts before giving up
const CALLBACK_RETRY_ATTEMPTS: u32 = 3;

/// Fixed backoff between callback attempts
const CALLBACK_RETRY_DELAY_SECS: u64 = 5;

// ============================================
// Submission types
// ============================================

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{0}")]
    Invalid(String),

    #[error("unknown probe {0:?}")]
    ProbeNotFound(String),

    #[error("no probes configured")]
    NoProbes,

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub target: String,
    pub scan_type: ScanType,
    pub ports: Option<Vec<u16>>,
    pub probe_name: Option<String>,
    pub external_target_id: Option<String>,
}

// ============================================
// Manager
// ============================================

/// Per-scan orchestrator. Submission picks a probe and persists the row;
/// one spawned worker then owns that row exclusively until it reaches a
/// terminal state. The store, not this struct, is the authoritative state:
/// restart recovery re-adopts every row without a `completed_at`.
pub struct ScanManager {
    pool: SqlitePool,
    engines: HashMap<String, Arc<dyn ScanEngine>>,
    probe_names: Vec<String>,
    scan_cfg: ScanConfig,
    callback_url: Option<String>,
    http: reqwest::Client,
    metrics: Arc<Metrics>,
    selector: Mutex<ProbeSelector>,
}

impl ScanManager {
    pub fn new(
        pool: SqlitePool,
        engines: HashMap<String, Arc<dyn ScanEngine>>,
        scan_cfg: ScanConfig,
        callback_url: Option<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let mut probe_names: Vec<String> = engines.keys().cloned().collect();
        probe_names.sort();

        let selector = Mutex::new(ProbeSelector::new(scan_cfg.max_consecutive_same_probe));

        Self {
            pool,
            engines,
            probe_names,
            scan_cfg,
            callback_url,
            http: reqwest::Client::new(),
            metrics,
            selector,
        }
    }

    /// Validate, select a probe, persist the row and spawn the worker.
    pub async fn submit(
        self: &Arc<Self>,
        request: ScanRequest,
    ) -> Result<(Uuid, String), SubmitError> {
        validate(&request)?;

        let probe_name = match &request.probe_name {
            Some(name) => {
                if !self.engines.contains_key(name) {
                    return Err(SubmitError::ProbeNotFound(name.clone()));
                }
                let mut selector = self.selector.lock().await;
                selector.record(name);
                name.clone()
            }
            None => {
                let counts = queries::active_scan_counts(&self.pool).await?;
                let mut selector = self.selector.lock().await;
                let picked = selector
                    .select(&self.probe_names, &counts)
                    .ok_or(SubmitError::NoProbes)?;
                selector.record(&picked);
                picked
            }
        };

        let scan = Scan {
            scan_id: Uuid::new_v4(),
            probe_name: probe_name.clone(),
            target: request.target.trim().to_string(),
            scan_type: request.scan_type,
            ports: request.ports,
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
            external_target_id: request.external_target_id,
        };

        queries::insert_scan(&self.pool, &scan).await?;

        self.metrics
            .scans_submitted
            .with_label_values(&[probe_name.as_str()])
            .inc();
        self.metrics
            .active_scans
            .with_label_values(&[probe_name.as_str()])
            .inc();

        tracing::info!(
            "Scan {} submitted for {} on probe {}",
            scan.scan_id,
            scan.target,
            probe_name
        );

        let scan_id = scan.scan_id;
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_worker(scan).await;
        });

        Ok((scan_id, probe_name))
    }

    /// Re-adopt every scan without a terminal state. The worker resumes at
    /// the first stage whose engine id is missing; engine resources are
    /// named `scan-<scan_id>`, so recovery is reconciliation, not replay.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, sqlx::Error> {
        let counts = queries::active_scan_counts(&self.pool).await?;
        for (probe, count) in &counts {
            self.metrics
                .active_scans
                .with_label_values(&[probe.as_str()])
                .set(*count);
        }

        let scans = queries::incomplete_scans(&self.pool).await?;
        let adopted = scans.len();

        for scan in scans {
            tracing::info!(
                "Re-adopting scan {} on probe {} (status {})",
                scan.scan_id,
                scan.probe_name,
                scan.gvm_status
            );
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                manager.run_worker(scan).await;
            });
        }

        Ok(adopted)
    }

    // ============================================
    // Worker
    // ============================================

    async fn run_worker(self: Arc<Self>, scan: Scan) {
        let scan_id = scan.scan_id;
        let probe_name = scan.probe_name.clone();

        let Some(engine) = self.engines.get(&probe_name).cloned() else {
            self.fail_scan(scan_id, &probe_name, "probe is no longer configured")
                .await;
            return;
        };

        let resource_name = format!("scan-{scan_id}");

        // Stage 1: engine target. Skipped when recovery already has the id.
        let engine_target_id = match scan.engine_target_id.clone() {
            Some(id) => id,
            None => {
                match engine
                    .create_target(&resource_name, &scan.target, scan.ports.as_deref())
                    .await
                {
                    Ok(id) => {
                        if let Err(e) =
                            queries::set_engine_target(&self.pool, scan_id, &id).await
                        {
                            tracing::error!(
                                "Failed to persist engine target for scan {}: {}",
                                scan_id,
                                e
                            );
                        }
                        id
                    }
                    Err(e) => {
                        self.fail_scan(scan_id, &probe_name, &format!("create_target failed: {e}"))
                            .await;
                        return;
                    }
                }
            }
        };

        // Stage 2: engine task.
        let engine_task_id = match scan.engine_task_id.clone() {
            Some(id) => id,
            None => match engine.create_task(&resource_name, &engine_target_id).await {
                Ok(id) => {
                    if let Err(e) = queries::set_engine_task(&self.pool, scan_id, &id).await {
                        tracing::error!(
                            "Failed to persist engine task for scan {}: {}",
                            scan_id,
                            e
                        );
                    }
                    id
                }
                Err(e) => {
                    self.fail_scan(scan_id, &probe_name, &format!("create_task failed: {e}"))
                        .await;
                    return;
                }
            },
        };

        // Stage 3: start. The stored report id marks this stage done.
        let engine_report_id = match scan.engine_report_id.clone() {
            Some(id) => id,
            None => match engine.start_task(&engine_task_id).await {
                Ok(id) => {
                    if let Err(e) =
                        queries::set_started(&self.pool, scan_id, &id, Utc::now()).await
                    {
                        tracing::error!(
                            "Failed to persist start of scan {}: {}",
                            scan_id,
                            e
                        );
                    }
                    id
                }
                Err(e) => {
                    self.fail_scan(scan_id, &probe_name, &format!("start_task failed: {e}"))
                        .await;
                    return;
                }
            },
        };

        // The wall-clock cap counts from the original start, surviving
        // restarts.
        let started_at = scan.started_at.unwrap_or_else(Utc::now);
        let deadline = started_at + chrono::Duration::seconds(self.scan_cfg.max_duration as i64);

        self.poll_until_terminal(
            engine,
            scan_id,
            &probe_name,
            &engine_target_id,
            &engine_task_id,
            &engine_report_id,
            deadline,
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn poll_until_terminal(
        &self,
        engine: Arc<dyn ScanEngine>,
        scan_id: Uuid,
        probe_name: &str,
        engine_target_id: &str,
        engine_task_id: &str,
        engine_report_id: &str,
        deadline: chrono::DateTime<Utc>,
    ) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.scan_cfg.poll_interval.max(1)));
        let mut consecutive_failures: u32 = 0;

        loop {
            interval.tick().await;

            if Utc::now() >= deadline {
                tracing::warn!("Scan {} exceeded max duration, stopping task", scan_id);
                if let Err(e) = engine.stop_task(engine_task_id).await {
                    tracing::warn!("Best-effort stop of scan {} failed: {}", scan_id, e);
                }
                self.fail_scan(scan_id, probe_name, "timeout").await;
                return;
            }

            let task = match engine.get_task(engine_task_id).await {
                Ok(task) => {
                    consecutive_failures = 0;
                    task
                }
                Err(e) => {
                    consecutive_failures += 1;
                    tracing::warn!(
                        "Failed to poll scan {} (attempt {}): {}",
                        scan_id,
                        consecutive_failures,
                        e
                    );
                    if consecutive_failures >= self.scan_cfg.poll_failure_budget {
                        self.fail_scan(
                            scan_id,
                            probe_name,
                            &format!("engine polling failed: {e}"),
                        )
                        .await;
                        return;
                    }
                    continue;
                }
            };

            if task.status == "Done" {
                self.complete_done(
                    engine.as_ref(),
                    scan_id,
                    probe_name,
                    engine_target_id,
                    engine_task_id,
                    engine_report_id,
                )
                .await;
                return;
            }

            if is_terminal_status(&task.status) {
                match queries::finalize_status(
                    &self.pool,
                    scan_id,
                    &task.status,
                    task.progress,
                    Utc::now(),
                )
                .await
                {
                    Ok(true) => {
                        tracing::info!("Scan {} finished as {}", scan_id, task.status);
                        self.observe_completed(scan_id, probe_name, &task.status.to_lowercase())
                            .await;
                        self.deliver_callback(scan_id).await;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!("Failed to finalize scan {}: {}", scan_id, e);
                    }
                }
                return;
            }

            if let Err(e) =
                queries::update_observed_status(&self.pool, scan_id, &task.status, task.progress)
                    .await
            {
                tracing::warn!("Failed to persist status of scan {}: {}", scan_id, e);
            }
        }
    }

    /// Terminal success: download the report once, derive the summary and
    /// finalize in a single conditional update. A racing writer (possible
    /// only after restart recovery) sees zero rows affected and backs off.
    async fn complete_done(
        &self,
        engine: &dyn ScanEngine,
        scan_id: Uuid,
        probe_name: &str,
        engine_target_id: &str,
        engine_task_id: &str,
        engine_report_id: &str,
    ) {
        let report_xml = match engine.get_report(engine_report_id).await {
            Ok(xml) => xml,
            Err(e) => {
                self.fail_scan(scan_id, probe_name, &format!("report download failed: {e}"))
                    .await;
                return;
            }
        };

        let summary = report::summarize(&report_xml);

        match queries::write_report(&self.pool, scan_id, &report_xml, &summary, Utc::now()).await {
            Ok(true) => {
                tracing::info!(
                    "Scan {} done: {} hosts, {} high / {} medium / {} low",
                    scan_id,
                    summary.hosts_scanned,
                    summary.vulns_high,
                    summary.vulns_medium,
                    summary.vulns_low
                );
                self.observe_completed(scan_id, probe_name, "done").await;

                if self.scan_cfg.cleanup_after_report {
                    if let Err(e) = engine.delete_task(engine_task_id).await {
                        tracing::debug!("Cleanup of task for scan {} failed: {}", scan_id, e);
                    }
                    if let Err(e) = engine.delete_target(engine_target_id).await {
                        tracing::debug!("Cleanup of target for scan {} failed: {}", scan_id, e);
                    }
                }

                self.deliver_callback(scan_id).await;
            }
            Ok(false) => {
                tracing::debug!("Report for scan {} already recorded", scan_id);
            }
            Err(e) => {
                tracing::error!("Failed to store report for scan {}: {}", scan_id, e);
            }
        }
    }

    /// Adapter-side failure: record the error, finalize, account for it.
    async fn fail_scan(&self, scan_id: Uuid, probe_name: &str, message: &str) {
        match queries::finalize_error(&self.pool, scan_id, message, Utc::now()).await {
            Ok(true) => {
                tracing::error!("Scan {} failed: {}", scan_id, message);
                self.observe_completed(scan_id, probe_name, "error").await;
                self.deliver_callback(scan_id).await;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!("Failed to mark scan {} as failed: {}", scan_id, e);
            }
        }
    }

    async fn observe_completed(&self, scan_id: Uuid, probe_name: &str, result: &str) {
        self.metrics
            .scans_completed
            .with_label_values(&[probe_name, result])
            .inc();
        self.metrics
            .active_scans
            .with_label_values(&[probe_name])
            .dec();

        if let Ok(Some(scan)) = queries::get_scan(&self.pool, scan_id).await {
            if let Some(completed_at) = scan.completed_at {
                let started = scan.started_at.unwrap_or(scan.created_at);
                let seconds = (completed_at - started).num_milliseconds() as f64 / 1000.0;
                self.metrics
                    .scan_duration_seconds
                    .with_label_values(&[probe_name])
                    .observe(seconds.max(0.0));
            }
        }
    }

    /// Best-effort completion callback for scheduler-originated scans.
    async fn deliver_callback(&self, scan_id: Uuid) {
        let Some(url) = self.callback_url.clone() else {
            return;
        };
        let scan = match queries::get_scan(&self.pool, scan_id).await {
            Ok(Some(scan)) => scan,
            _ => return,
        };
        let Some(external_target_id) = scan.external_target_id.clone() else {
            return;
        };
        let Some(completed_at) = scan.completed_at else {
            return;
        };

        let started = scan.started_at.unwrap_or(scan.created_at);
        let body = serde_json::json!({
            "external_target_id": external_target_id,
            "scan_id": scan.scan_id,
            "probe_name": scan.probe_name,
            "host": scan.target,
            "gvm_status": scan.gvm_status,
            "completed_at": completed_at,
            "summary": scan.summary,
            "duration_seconds": (completed_at - started).num_seconds().max(0),
        });

        for attempt in 1..=CALLBACK_RETRY_ATTEMPTS {
            match self.http.post(&url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!("Callback for scan {} delivered", scan_id);
                    return;
                }
                Ok(response) => {
                    tracing::warn!(
                        "Callback for scan {} got {} (attempt {})",
                        scan_id,
                        response.status(),
                        attempt
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "Callback for scan {} failed (attempt {}): {}",
                        scan_id,
                        attempt,
                        e
                    );
                }
            }
            if attempt < CALLBACK_RETRY_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(CALLBACK_RETRY_DELAY_SECS)).await;
            }
        }

        tracing::error!(
            "Callback for scan {} not delivered after {} attempts",
            scan_id,
            CALLBACK_RETRY_ATTEMPTS
        );
    }
}

fn validate(request: &ScanRequest) -> Result<(), SubmitError> {
    if request.target.trim().is_empty() {
        return Err(SubmitError::Invalid("target must not be empty".to_string()));
    }

    match request.scan_type {
        ScanType::Directed => {
            let ports = request
                .ports
                .as_ref()
                .filter(|ports| !ports.is_empty())
                .ok_or_else(|| {
                    SubmitError::Invalid(
                        "directed scans require a non-empty ports list".to_string(),
                    )
                })?;
            if ports.iter().any(|port| *port == 0) {
                return Err(SubmitError::Invalid(
                    "ports must be between 1 and 65535".to_string(),
                ));
            }
        }
        ScanType::Full => {
            if request.ports.as_ref().is_some_and(|ports| !ports.is_empty()) {
                return Err(SubmitError::Invalid(
                    "ports are only accepted for directed scans".to_string(),
                ));
            }
        }
    }

    Ok(())
}
