use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Registry, TextEncoder,
    histogram_opts, opts, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_vec_with_registry,
};

const NAMESPACE: &str = "gvm_fleet";

macro_rules! namespaced {
    ($name:expr) => {
        format!("{}_{}", NAMESPACE, $name)
    };
}

/// Process-wide metrics, updated at state transitions and scraped by
/// `/metrics`.
pub struct Metrics {
    registry: Registry,

    pub scans_submitted: IntCounterVec,
    pub scans_completed: IntCounterVec,
    pub active_scans: IntGaugeVec,
    pub scan_duration_seconds: HistogramVec,

    pub sync_runs: IntCounter,
    pub sync_failures: IntCounter,
    pub scheduler_dispatches: IntCounter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let scans_submitted = register_int_counter_vec_with_registry!(
            opts!(
                namespaced!("scans_submitted_total"),
                "Scans accepted for dispatch"
            ),
            &["probe"],
            registry
        )?;

        let scans_completed = register_int_counter_vec_with_registry!(
            opts!(
                namespaced!("scans_completed_total"),
                "Scans that reached a terminal state"
            ),
            &["probe", "result"],
            registry
        )?;

        let active_scans = register_int_gauge_vec_with_registry!(
            opts!(namespaced!("active_scans"), "Live scans per probe"),
            &["probe"],
            registry
        )?;

        let scan_duration_seconds = register_histogram_vec_with_registry!(
            histogram_opts!(
                namespaced!("scan_duration_seconds"),
                "Wall-clock duration of terminal scans",
                vec![30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 14400.0]
            ),
            &["probe"],
            registry
        )?;

        let sync_runs = register_int_counter_with_registry!(
            opts!(
                namespaced!("sync_runs_total"),
                "Successful inventory sync iterations"
            ),
            registry
        )?;

        let sync_failures = register_int_counter_with_registry!(
            opts!(
                namespaced!("sync_failures_total"),
                "Inventory sync iterations that were abandoned"
            ),
            registry
        )?;

        let scheduler_dispatches = register_int_counter_with_registry!(
            opts!(
                namespaced!("scheduler_dispatches_total"),
                "Scans emitted by the due-target scheduler"
            ),
            registry
        )?;

        Ok(Self {
            registry,
            scans_submitted,
            scans_completed,
            active_scans,
            scan_duration_seconds,
            sync_runs,
            sync_failures,
            scheduler_dispatches,
        })
    }

    /// Prometheus text exposition of everything registered.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
