//! Per-worker points ledger.
//!
//! The worker is the authority for its own points; the platform only sees
//! totals replicated through heartbeats. Totals never decrease except for
//! the period counter under an explicit reset command.

use guardant_core::{points, ServiceType};
use parking_lot::Mutex;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PointsSnapshot {
    pub total: f64,
    pub current_period: f64,
}

#[derive(Default)]
struct LedgerState {
    total: f64,
    current_period: f64,
    /// Regions this worker has already been first in during the current
    /// period; the first-in-region bonus pays once per region per period.
    first_regions: HashSet<String>,
}

#[derive(Default)]
pub struct PointsLedger {
    state: Mutex<LedgerState>,
}

impl PointsLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one successful probe. Returns the points granted.
    pub fn record_success(&self, service_type: ServiceType, region: &str) -> f64 {
        let mut state = self.state.lock();
        let first_in_region = state.first_regions.insert(region.to_string());
        let granted = points::award(service_type, first_in_region);
        state.total += granted;
        state.current_period += granted;
        granted
    }

    /// Zero the period counter, keep the lifetime total.
    pub fn reset_period(&self) {
        let mut state = self.state.lock();
        state.current_period = 0.0;
        state.first_regions.clear();
    }

    pub fn snapshot(&self) -> PointsSnapshot {
        let state = self.state.lock();
        PointsSnapshot {
            total: state.total,
            current_period: state.current_period,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_accumulate_and_survive_reset() {
        let ledger = PointsLedger::new();
        let first = ledger.record_success(ServiceType::Web, "eu-central-1");
        assert_eq!(first, 1.5); // base + first-in-region bonus
        let second = ledger.record_success(ServiceType::Web, "eu-central-1");
        assert_eq!(second, 1.0);

        let before = ledger.snapshot();
        assert_eq!(before.total, 2.5);
        assert_eq!(before.current_period, 2.5);

        ledger.reset_period();
        let after = ledger.snapshot();
        assert_eq!(after.total, 2.5);
        assert_eq!(after.current_period, 0.0);

        // Bonus available again in the fresh period.
        assert_eq!(ledger.record_success(ServiceType::Web, "eu-central-1"), 1.5);
    }
}
