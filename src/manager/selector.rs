use std::collections::{HashMap, VecDeque};

/// Deterministic probe choice over (configured probes, live active counts,
/// recent dispatch history).
///
/// Candidates are the probes with the fewest active scans; a probe that won
/// the last `max_consecutive` dispatches is excluded unless it is the only
/// candidate left. Ties break in name order, so the outcome is a pure
/// function of the inputs.
pub struct ProbeSelector {
    history: VecDeque<String>,
    max_consecutive: usize,
}

impl ProbeSelector {
    pub fn new(max_consecutive: usize) -> Self {
        Self {
            history: VecDeque::new(),
            max_consecutive: max_consecutive.max(1),
        }
    }

    /// Pick the next probe. `active` maps probe name to its live scan
    /// count; absent probes count zero. Returns `None` when no probes are
    /// configured.
    pub fn select(&self, probes: &[String], active: &HashMap<String, i64>) -> Option<String> {
        let min_active = probes
            .iter()
            .map(|name| active.get(name).copied().unwrap_or(0))
            .min()?;

        let mut candidates: Vec<&String> = probes
            .iter()
            .filter(|name| active.get(*name).copied().unwrap_or(0) == min_active)
            .collect();

        if let Some(streaky) = self.streak_probe() {
            let reduced: Vec<&String> = candidates
                .iter()
                .copied()
                .filter(|name| *name != &streaky)
                .collect();
            // Single-probe deployments must still dispatch.
            if !reduced.is_empty() {
                candidates = reduced;
            }
        }

        candidates.into_iter().min().cloned()
    }

    /// Record a dispatch, explicit or selected.
    pub fn record(&mut self, probe: &str) {
        self.history.push_back(probe.to_string());
        while self.history.len() > self.max_consecutive {
            self.history.pop_front();
        }
    }

    /// The probe that took the whole recent window, if any.
    fn streak_probe(&self) -> Option<String> {
        if self.history.len() < self.max_consecutive {
            return None;
        }
        let first = self.history.front()?;
        self.history
            .iter()
            .all(|name| name == first)
            .then(|| first.clone())
    }
}
