//! Internal observability metrics for prom-relay
//!
//! The relay keeps a small set of counters describing its own operation.
//! They live in an explicit [`RelayMetrics`] context object that is created
//! once at startup and shared with the routers; there is no ambient global
//! state. An external metrics collaborator can read the counters through
//! [`RelayMetrics::snapshot`].
//!
//! # Counters
//!
//! - `batches_total` - input batches processed
//! - `samples_filtered_total` - samples dropped because no rule or filter matched
//! - `serialize_total` - samples that reached the marshal step
//! - `serialize_failed_total` - per-record marshal failures
//! - `render_failed_total` - topic template render failures (template router only)

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counter using atomic operations
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter initialized to 0
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increment the counter by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a specific amount
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Reset the counter to 0
    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        Self {
            value: AtomicU64::new(self.get()),
        }
    }
}

/// Counters describing the relay's own operation
///
/// Constructed once at startup and passed into the routers; the routers only
/// ever increment, so the struct can be shared freely behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct RelayMetrics {
    /// Input batches processed
    pub batches_total: Counter,
    /// Samples dropped by rule selection or the static filter
    pub samples_filtered_total: Counter,
    /// Samples that reached the marshal step
    pub serialize_total: Counter,
    /// Per-record marshal failures
    pub serialize_failed_total: Counter,
    /// Topic template render failures
    pub render_failed_total: Counter,
}

impl RelayMetrics {
    /// Create a new metrics context with all counters at 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a point-in-time copy of all counter values
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches: self.batches_total.get(),
            filtered: self.samples_filtered_total.get(),
            serialized: self.serialize_total.get(),
            serialize_failures: self.serialize_failed_total.get(),
            render_failures: self.render_failed_total.get(),
        }
    }
}

/// Point-in-time counter values, for the external metrics collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub batches: u64,
    pub filtered: u64,
    pub serialized: u64,
    pub serialize_failures: u64,
    pub render_failures: u64,
}
