use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::scan::ScanType;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    Critical,
    High,
    Medium,
    Low,
}

impl Criticality {
    /// Scheduling priority, highest first.
    pub fn weight(&self) -> i32 {
        match self {
            Criticality::Critical => 4,
            Criticality::High => 3,
            Criticality::Medium => 2,
            Criticality::Low => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Criticality::Critical => "critical",
            Criticality::High => "high",
            Criticality::Medium => "medium",
            Criticality::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Criticality::Critical),
            "high" => Some(Criticality::High),
            "medium" => Some(Criticality::Medium),
            "low" => Some(Criticality::Low),
            _ => None,
        }
    }
}

/// A row in the local target table, synchronized from the upstream asset
/// inventory. Identity/config columns are written only by Target Sync;
/// schedule columns only by the Scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct Target {
    pub external_id: String,
    pub host: String,
    pub ports: Vec<u16>,
    pub scan_type: ScanType,
    pub criticality: Criticality,
    pub criticality_weight: i32,
    pub scan_frequency_hours: i64,
    pub enabled: bool,
    pub tags: serde_json::Value,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub next_scan_at: Option<DateTime<Utc>>,
    pub last_scan_id: Option<Uuid>,
    pub synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn criticality_weights_are_ordered() {
        assert_eq!(Criticality::Critical.weight(), 4);
        assert_eq!(Criticality::High.weight(), 3);
        assert_eq!(Criticality::Medium.weight(), 2);
        assert_eq!(Criticality::Low.weight(), 1);
    }

    #[test]
    fn criticality_parses_labels() {
        assert_eq!(Criticality::parse("critical"), Some(Criticality::Critical));
        assert_eq!(Criticality::parse("urgent"), None);
    }
}
