use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Engine status strings are passed through unchanged from GMP; these three
/// mean the task will make no further progress.
pub const TERMINAL_STATUSES: [&str; 3] = ["Done", "Stopped", "Interrupted"];

pub fn is_terminal_status(status: &str) -> bool {
    TERMINAL_STATUSES.contains(&status)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    Full,
    Directed,
}

impl ScanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanType::Full => "full",
            ScanType::Directed => "directed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(ScanType::Full),
            "directed" => Some(ScanType::Directed),
            _ => None,
        }
    }
}

/// Fixed summary derived from a completed report.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanSummary {
    pub hosts_scanned: i64,
    pub vulns_high: i64,
    pub vulns_medium: i64,
    pub vulns_low: i64,
    pub vulns_log: i64,
}

/// One assessment run owned by the control plane. A row is written only by
/// its owning worker until `completed_at` is set, then it is read-only
/// (except `summary`).
#[derive(Debug, Clone, Serialize)]
pub struct Scan {
    pub scan_id: Uuid,
    pub probe_name: String,
    pub target: String,
    pub scan_type: ScanType,
    pub ports: Option<Vec<u16>>,
    pub engine_target_id: Option<String>,
    pub engine_task_id: Option<String>,
    pub engine_report_id: Option<String>,
    pub gvm_status: String,
    pub gvm_progress: i32,
    /// Opaque report blob; served by the report endpoint, not the scan object.
    #[serde(skip_serializing)]
    pub report_xml: Option<String>,
    pub summary: Option<ScanSummary>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub external_target_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_match_engine_strings() {
        assert!(is_terminal_status("Done"));
        assert!(is_terminal_status("Stopped"));
        assert!(is_terminal_status("Interrupted"));
        assert!(!is_terminal_status("Running"));
        assert!(!is_terminal_status("Stop Requested"));
        assert!(!is_terminal_status("Queued"));
    }

    #[test]
    fn scan_type_round_trip() {
        assert_eq!(ScanType::parse("full"), Some(ScanType::Full));
        assert_eq!(ScanType::parse("directed"), Some(ScanType::Directed));
        assert_eq!(ScanType::parse("quick"), None);
        assert_eq!(ScanType::Directed.as_str(), "directed");
    }
}
