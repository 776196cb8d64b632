use std::time::{Duration, Instant};

use crate::state::DeviceState;

/// Where the cached snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSource {
    Advertisement,
    Command,
}

/// Cached device state. Starts `Unknown`; every successful decode replaces the
/// whole snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceStatus {
    Unknown,
    Known {
        state: DeviceState,
        updated_at: Instant,
        source: StateSource,
    },
}

impl Default for DeviceStatus {
    fn default() -> Self {
        DeviceStatus::Unknown
    }
}

impl DeviceStatus {
    pub fn install(&mut self, state: DeviceState, source: StateSource) {
        *self = DeviceStatus::Known {
            state,
            updated_at: Instant::now(),
            source,
        };
    }

    pub fn state(&self) -> Option<&DeviceState> {
        match self {
            DeviceStatus::Unknown => None,
            DeviceStatus::Known { state, .. } => Some(state),
        }
    }

    pub fn age(&self) -> Option<Duration> {
        match self {
            DeviceStatus::Unknown => None,
            DeviceStatus::Known { updated_at, .. } => Some(updated_at.elapsed()),
        }
    }

    /// Unknown state counts as stale.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.age().map_or(true, |age| age > max_age)
    }
}
