//! Byte-count telemetry sinks.
//!
//! Counters are normally owned by a stats wrapper around the connection. Once a direction
//! switches to direct copy the wrapper is bypassed, so the Vision stream keeps feeding the
//! counters it recovered while unwrapping.

use std::sync::atomic::{AtomicU64, Ordering};

pub trait Counter: Send + Sync + std::fmt::Debug {
    /// Adds `delta` and returns the new total.
    fn add(&self, delta: u64) -> u64;

    fn value(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct AtomicCounter {
    value: AtomicU64,
}

impl AtomicCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Counter for AtomicCounter {
    fn add(&self, delta: u64) -> u64 {
        self.value.fetch_add(delta, Ordering::Relaxed) + delta
    }

    fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accumulates() {
        let counter = AtomicCounter::new();
        assert_eq!(counter.value(), 0);
        assert_eq!(counter.add(10), 10);
        assert_eq!(counter.add(5), 15);
        assert_eq!(counter.value(), 15);
    }
}
