//! Server statistics
//!
//! Each counter sits behind its own lock so bumping one never waits on
//! another.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Point-in-time copy of the counters, as returned by STATS
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Completed operations
    pub op_counter: u64,
    /// Time spent inside table operations, in microseconds
    pub computed_time_micros: u64,
    /// Currently connected clients
    pub active_clients: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Current total of completed operations: {}", self.op_counter)?;
        writeln!(f, "Current amount of clients: {}", self.active_clients)?;
        write!(
            f,
            "Current amount of computation time (micro s): {}",
            self.computed_time_micros
        )
    }
}

#[derive(Debug, Default)]
pub struct Statistics {
    op_counter: Mutex<u64>,
    computed_time_micros: Mutex<u64>,
    active_clients: Mutex<u64>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_op_counter(&self) {
        *self.op_counter.lock() += 1;
    }

    pub fn add_computed_time(&self, micros: u64) {
        let mut total = self.computed_time_micros.lock();
        *total = total.saturating_add(micros);
    }

    pub fn increment_active_clients(&self) {
        *self.active_clients.lock() += 1;
    }

    pub fn decrement_active_clients(&self) {
        let mut active = self.active_clients.lock();
        *active = active.saturating_sub(1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            op_counter: *self.op_counter.lock(),
            computed_time_micros: *self.computed_time_micros.lock(),
            active_clients: *self.active_clients.lock(),
        }
    }
}
