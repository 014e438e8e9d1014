//! Optional per-call timing sink.
//!
//! Timings are host-side: a unit's launch time is how long enqueueing took, not
//! how long the device ran it. Device time is only covered by `total` when the
//! call blocked.

use std::time::Duration;

use crate::schedule::WorkUnitId;

/// Host time spent launching one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitTiming {
    pub unit: WorkUnitId,
    pub label: String,
    pub launch: Duration,
}

/// Filled in by [`Executable::execute`](crate::Executable::execute) when passed.
#[derive(Debug, Clone, Default)]
pub struct ExecutionProfile {
    pub units: Vec<UnitTiming>,
    /// Wall time of the whole call.
    pub total: Duration,
    /// The call blocked until device work completed.
    pub synchronized: bool,
    /// Allocator requests made for this call.
    pub fresh_allocations: usize,
    /// Module globals were already resolved for the device.
    pub globals_cached: bool,
}

impl ExecutionProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_unit(&mut self, unit: WorkUnitId, label: String, launch: Duration) {
        self.units.push(UnitTiming { unit, label, launch });
    }

    /// Sum of launch times over all units.
    pub fn launch_time(&self) -> Duration {
        self.units.iter().map(|u| u.launch).sum()
    }
}
