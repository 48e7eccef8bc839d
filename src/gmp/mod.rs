//! Engine client boundary.
//!
//! The control plane talks to every probe through the [`ScanEngine`] trait;
//! [`client::GmpClient`] is the production implementation speaking GMP over
//! TLS. The trait is the seam an alternative transport (or a scripted test
//! engine) plugs into.

pub mod client;

use async_trait::async_trait;
use thiserror::Error;

pub use client::GmpClient;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("engine authentication failed: {0}")]
    AuthFailed(String),

    #[error("engine protocol error: {0}")]
    Protocol(String),

    #[error("engine operation timed out")]
    Timeout,
}

impl EngineError {
    /// Transport-level failures are worth another attempt; auth and
    /// protocol errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Unavailable(_) | EngineError::Timeout)
    }
}

/// The authoritative observable for a running task. Never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub status: String,
    pub progress: i32,
}

/// Fixed operation set against one scan engine.
///
/// Target and task creation are keyed by adapter-chosen names
/// (`scan-<scan_id>`), and implementations must reuse a pre-existing object
/// of the same name instead of duplicating it; that is what makes retries
/// and crash recovery safe.
#[async_trait]
pub trait ScanEngine: Send + Sync {
    /// Cheap liveness call used by the health endpoint.
    async fn ping(&self) -> Result<(), EngineError>;

    /// Create (or find) the engine target resource; returns its id.
    async fn create_target(
        &self,
        name: &str,
        host: &str,
        ports: Option<&[u16]>,
    ) -> Result<String, EngineError>;

    /// Create (or find) the engine task binding the target to the
    /// configured scan configuration; returns its id.
    async fn create_task(&self, name: &str, target_id: &str) -> Result<String, EngineError>;

    /// Start the task; returns the engine report id.
    async fn start_task(&self, task_id: &str) -> Result<String, EngineError>;

    /// Current status string and progress percentage.
    async fn get_task(&self, task_id: &str) -> Result<TaskStatus, EngineError>;

    /// The final report as an opaque XML blob.
    async fn get_report(&self, report_id: &str) -> Result<String, EngineError>;

    /// Request the engine to stop a running task.
    async fn stop_task(&self, task_id: &str) -> Result<(), EngineError>;

    async fn delete_task(&self, task_id: &str) -> Result<(), EngineError>;

    async fn delete_target(&self, target_id: &str) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        assert!(EngineError::Unavailable("refused".into()).is_retryable());
        assert!(EngineError::Timeout.is_retryable());
        assert!(!EngineError::AuthFailed("bad creds".into()).is_retryable());
        assert!(!EngineError::Protocol("bad xml".into()).is_retryable());
    }
}
