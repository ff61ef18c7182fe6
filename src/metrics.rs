//! Metrics collection module for the quality governor.
//!
//! Tracks tick, adjustment and persistence counts for the status surface.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Metrics data exposed via IPC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Optimization ticks since start
    pub total_ticks: u64,
    /// Ticks that lowered quality
    pub throttle_steps: u64,
    /// Ticks that raised quality
    pub recovery_steps: u64,
    /// Adjustments in the last hour
    pub adjustments_per_hour: u64,
    /// Profile writes
    pub persists: u64,
    /// Persist slots skipped because of external heat factors
    pub persist_skips: u64,
    /// Analytics session flushes
    pub flushes: u64,
    /// Active workload changes
    pub workload_switches: u64,
    /// Uptime in seconds
    pub uptime_sec: u64,
}

/// Metrics collector for the governor
pub struct GovernorMetrics {
    start_time: Instant,
    total_ticks: AtomicU64,
    throttle_steps: AtomicU64,
    recovery_steps: AtomicU64,
    persists: AtomicU64,
    persist_skips: AtomicU64,
    flushes: AtomicU64,
    workload_switches: AtomicU64,
    /// Recent adjustments with timestamps for per-hour calculation
    recent_adjustments: RwLock<Vec<Instant>>,
}

impl GovernorMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_ticks: AtomicU64::new(0),
            throttle_steps: AtomicU64::new(0),
            recovery_steps: AtomicU64::new(0),
            persists: AtomicU64::new(0),
            persist_skips: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            workload_switches: AtomicU64::new(0),
            recent_adjustments: RwLock::new(Vec::new()),
        }
    }

    pub fn record_tick(&self) {
        self.total_ticks.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a change of operating point; `lowered` tells the direction.
    pub fn record_adjustment(&self, lowered: bool) {
        let now = Instant::now();
        if lowered {
            self.throttle_steps.fetch_add(1, Ordering::SeqCst);
        } else {
            self.recovery_steps.fetch_add(1, Ordering::SeqCst);
        }

        if let Ok(mut adjustments) = self.recent_adjustments.write() {
            adjustments.push(now);
            // Keep only last hour of adjustments
            if let Some(hour_ago) = now.checked_sub(Duration::from_secs(3600)) {
                adjustments.retain(|t| *t > hour_ago);
            }
        }
    }

    pub fn record_persist(&self) {
        self.persists.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_persist_skip(&self) {
        self.persist_skips.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_workload_switch(&self) {
        self.workload_switches.fetch_add(1, Ordering::SeqCst);
    }

    /// Get current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Instant::now();
        let uptime = now.duration_since(self.start_time);

        let adjustments_per_hour = self
            .recent_adjustments
            .read()
            .map(|adjustments| match now.checked_sub(Duration::from_secs(3600)) {
                Some(hour_ago) => adjustments.iter().filter(|t| **t > hour_ago).count() as u64,
                None => adjustments.len() as u64,
            })
            .unwrap_or(0);

        MetricsSnapshot {
            total_ticks: self.total_ticks.load(Ordering::SeqCst),
            throttle_steps: self.throttle_steps.load(Ordering::SeqCst),
            recovery_steps: self.recovery_steps.load(Ordering::SeqCst),
            adjustments_per_hour,
            persists: self.persists.load(Ordering::SeqCst),
            persist_skips: self.persist_skips.load(Ordering::SeqCst),
            flushes: self.flushes.load(Ordering::SeqCst),
            workload_switches: self.workload_switches.load(Ordering::SeqCst),
            uptime_sec: uptime.as_secs(),
        }
    }
}

impl Default for GovernorMetrics {
    fn default() -> Self {
        Self::new()
    }
}
