//! In-process engine metrics.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Thread-safe atomic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe atomic gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters shared by every session of one manager.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub events_parsed: Counter,
    pub malformed_lines: Counter,
    pub events_dropped: Counter,
    pub recoveries: Counter,
    pub busy_rejections: Counter,
    pub processes_started: Counter,
    pub running_processes: Gauge,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_parsed: self.events_parsed.get(),
            malformed_lines: self.malformed_lines.get(),
            events_dropped: self.events_dropped.get(),
            recoveries: self.recoveries.get(),
            busy_rejections: self.busy_rejections.get(),
            processes_started: self.processes_started.get(),
            running_processes: self.running_processes.get(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub events_parsed: u64,
    pub malformed_lines: u64,
    pub events_dropped: u64,
    pub recoveries: u64,
    pub busy_rejections: u64,
    pub processes_started: u64,
    pub running_processes: i64,
}
