use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use sqlx::SqlitePool;

use crate::config::ProbeConfig;
use crate::gmp::ScanEngine;
use crate::manager::ScanManager;
use crate::metrics::Metrics;

pub mod health;
pub mod metrics;
pub mod probes;
pub mod routes;
pub mod scans;
pub mod targets;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub manager: Arc<ScanManager>,
    pub engines: HashMap<String, Arc<dyn ScanEngine>>,
    pub probes: Vec<ProbeConfig>,
    pub metrics: Arc<Metrics>,
}

#[derive(Serialize, Clone)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}
