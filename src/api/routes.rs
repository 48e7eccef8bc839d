use axum::{
    Router,
    routing::{get, post},
};

use super::AppState;
use super::{health, metrics, probes, scans, targets};

/// API surface
///
/// - POST /scans - submit an ad-hoc scan
/// - GET  /scans - list scans, newest first
/// - GET  /scans/{scan_id} - scan status object
/// - GET  /scans/{scan_id}/report - report blob + summary (409 until Done)
/// - GET  /probes - per-probe utilization
/// - GET  /targets - synchronized target table
/// - GET  /targets/{external_id} - one target
/// - GET  /health - live engine pings (the only endpoint touching engines)
/// - GET  /metrics - Prometheus text
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/scans", post(scans::submit_scan).get(scans::list_scans))
        .route("/scans/{scan_id}", get(scans::get_scan))
        .route("/scans/{scan_id}/report", get(scans::get_scan_report))
        .route("/probes", get(probes::list_probes))
        .route("/targets", get(targets::list_targets))
        .route("/targets/{external_id}", get(targets::get_target))
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics::metrics))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use chrono::Utc;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::*;
    use crate::config::{ProbeConfig, ScanConfig};
    use crate::db::{connect_memory, queries};
    use crate::gmp::{EngineError, ScanEngine, TaskStatus};
    use crate::manager::ScanManager;
    use crate::metrics::Metrics;
    use crate::models::scan::{Scan, ScanSummary, ScanType};

    struct RouteEngine {
        ping_ok: bool,
    }

    #[async_trait::async_trait]
    impl ScanEngine for RouteEngine {
        async fn ping(&self) -> Result<(), EngineError> {
            if self.ping_ok {
                Ok(())
            } else {
                Err(EngineError::Unavailable("connection refused".to_string()))
            }
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

    async fn make_state(ping_ok: bool) -> AppState {
        let pool = connect_memory().await;
        let engines: HashMap<String, Arc<dyn ScanEngine>> = HashMap::from([(
            "gvm-1".to_string(),
            Arc::new(RouteEngine { ping_ok }) as Arc<dyn ScanEngine>,
        )]);
        let metrics = Arc::new(Metrics::new().unwrap());
        let manager = Arc::new(ScanManager::new(
            pool.clone(),
            engines.clone(),
            ScanConfig {
                poll_interval: 1,
                ..ScanConfig::default()
            },
            None,
            metrics.clone(),
        ));

        AppState {
            pool,
            manager,
            engines,
            probes: vec![ProbeConfig {
                name: "gvm-1".to_string(),
                host: "10.0.0.10".to_string(),
                port: 9390,
                username: "admin".to_string(),
                password: "secret".to_string(),
            }],
            metrics,
        }
    }

    fn app(state: AppState) -> Router {
        router().with_state(state)
    }

    async fn call(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.oneshot(request).await.expect("request failed");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body collect failed")
            .to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request build")
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .expect("request build")
    }

    #[tokio::test]
    async fn submit_then_fetch_round_trips() {
        let state = make_state(true).await;

        let (status, body) = call(
            app(state.clone()),
            post_json(
                "/scans",
                serde_json::json!({
                    "target": "10.0.0.5",
                    "scan_type": "directed",
                    "ports": [22, 80, 443]
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["probe_name"], "gvm-1");
        let scan_id = body["scan_id"].as_str().expect("scan_id").to_string();

        let (status, body) = call(app(state), get_req(&format!("/scans/{scan_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["target"], "10.0.0.5");
        assert_eq!(body["scan_type"], "directed");
        assert_eq!(body["ports"], serde_json::json!([22, 80, 443]));
        assert_eq!(body["probe_name"], "gvm-1");
    }

    #[tokio::test]
    async fn directed_without_ports_is_unprocessable() {
        let state = make_state(true).await;
        let (status, body) = call(
            app(state),
            post_json(
                "/scans",
                serde_json::json!({"target": "10.0.0.5", "scan_type": "directed"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "INVALID_SCAN_REQUEST");
    }

    #[tokio::test]
    async fn unknown_probe_is_unprocessable() {
        let state = make_state(true).await;
        let (status, _) = call(
            app(state),
            post_json(
                "/scans",
                serde_json::json!({"target": "10.0.0.5", "probe_name": "gvm-9"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn missing_scan_is_not_found() {
        let state = make_state(true).await;
        let (status, _) = call(
            app(state),
            get_req(&format!("/scans/{}", Uuid::new_v4())),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn report_is_conflict_until_done() {
        let state = make_state(true).await;

        let scan = Scan {
            scan_id: Uuid::new_v4(),
            probe_name: "gvm-1".to_string(),
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
        };
        queries::insert_scan(&state.pool, &scan).await.unwrap();

        let uri = format!("/scans/{}/report", scan.scan_id);
        let (status, body) = call(app(state.clone()), get_req(&uri)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "REPORT_NOT_READY");

        let summary = ScanSummary {
            hosts_scanned: 1,
            vulns_high: 1,
            ..Default::default()
        };
        queries::write_report(&state.pool, scan.scan_id, "<report/>", &summary, Utc::now())
            .await
            .unwrap();

        let (status, body) = call(app(state), get_req(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["report_xml"], "<report/>");
        assert_eq!(body["summary"]["vulns_high"], 1);
        assert_eq!(body["gvm_status"], "Done");
    }

    #[tokio::test]
    async fn probes_report_active_counts() {
        let state = make_state(true).await;

        call(
            app(state.clone()),
            post_json("/scans", serde_json::json!({"target": "10.0.0.5"})),
        )
        .await;

        let (status, body) = call(app(state), get_req("/probes")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["probes"][0]["name"], "gvm-1");
        assert_eq!(body["probes"][0]["active_scans"], 1);
        assert_eq!(body["probes"][0]["port"], 9390);
    }

    #[tokio::test]
    async fn health_reflects_engine_pings() {
        let healthy = make_state(true).await;
        let (status, body) = call(app(healthy), get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["probes"]["gvm-1"], "connected");

        let degraded = make_state(false).await;
        let (status, body) = call(app(degraded), get_req("/health")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["detail"]["status"], "degraded");
    }

    #[tokio::test]
    async fn targets_endpoints() {
        let state = make_state(true).await;

        let (status, body) = call(app(state.clone()), get_req("/targets")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 0);

        let (status, _) = call(app(state), get_req("/targets/asset-404")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_exposition_is_text() {
        let state = make_state(true).await;
        state.metrics.scans_submitted.with_label_values(&["gvm-1"]).inc();

        let router = app(state);
        let response = router.oneshot(get_req("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("gvm_fleet_scans_submitted_total"));
    }
}
