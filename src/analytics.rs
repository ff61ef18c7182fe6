//! Analytics events and per-session aggregation.
//!
//! Purely observational: nothing here feeds back into control. The
//! controller reports every adjustment and periodically flushes a session
//! summary tagged with why it was flushed.

use crate::profile::QualityLevels;
use crate::thermal::ThermalState;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::info;

/// Why a session summary was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    ShaderChanged,
    Background,
    Periodic,
}

/// Where the values of an adjustment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentSource {
    Adaptive,
    LowPower,
    Override,
}

impl AdjustmentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentSource::Adaptive => "adaptive",
            AdjustmentSource::LowPower => "low_power",
            AdjustmentSource::Override => "override",
        }
    }
}

/// One tick's change of operating point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentEvent {
    pub workload_id: String,
    pub tick: u64,
    pub thermal_state: ThermalState,
    pub effective_momentum: f64,
    pub fps_boost: f64,
    pub previous: QualityLevels,
    pub next: QualityLevels,
    pub source: AdjustmentSource,
}

/// Aggregate of one workload session window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub workload_id: String,
    pub reason: FlushReason,
    pub ticks: u64,
    pub adjustments: u64,
    pub low_power_ticks: u64,
    pub mean_momentum: f64,
    pub peak_momentum: f64,
    pub peak_thermal: ThermalState,
    pub lowest: QualityLevels,
    pub final_levels: QualityLevels,
    pub overrides_active: bool,
    pub duration_secs: f64,
}

/// Receiver of analytics.
pub trait AnalyticsSink: Send + Sync {
    fn record_adjustment(&self, event: &AdjustmentEvent);

    fn flush(&self, summary: &SessionSummary);
}

/// Sink that writes analytics into the structured log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAnalyticsSink;

impl AnalyticsSink for TracingAnalyticsSink {
    fn record_adjustment(&self, event: &AdjustmentEvent) {
        info!(
            target: "quality_governor::analytics",
            workload = %event.workload_id,
            tick = event.tick,
            source = event.source.as_str(),
            thermal = %event.thermal_state,
            momentum = event.effective_momentum,
            fps_boost = event.fps_boost,
            rate = event.next.rate,
            scale = event.next.scale,
            detail = event.next.detail,
            "quality adjusted"
        );
    }

    fn flush(&self, summary: &SessionSummary) {
        info!(
            target: "quality_governor::analytics",
            workload = %summary.workload_id,
            reason = ?summary.reason,
            ticks = summary.ticks,
            adjustments = summary.adjustments,
            low_power_ticks = summary.low_power_ticks,
            mean_momentum = summary.mean_momentum,
            peak_thermal = %summary.peak_thermal,
            lowest_rate = summary.lowest.rate,
            lowest_scale = summary.lowest.scale,
            lowest_detail = summary.lowest.detail,
            overrides_active = summary.overrides_active,
            duration_secs = summary.duration_secs,
            "session flushed"
        );
    }
}

/// Running aggregate for the active workload.
#[derive(Debug, Clone)]
pub struct SessionAggregator {
    workload_id: String,
    started: Instant,
    ticks: u64,
    adjustments: u64,
    low_power_ticks: u64,
    momentum_sum: f64,
    peak_momentum: f64,
    peak_thermal: ThermalState,
    lowest: QualityLevels,
    last: QualityLevels,
}

impl SessionAggregator {
    pub fn new(workload_id: impl Into<String>, levels: QualityLevels, now: Instant) -> Self {
        Self {
            workload_id: workload_id.into(),
            started: now,
            ticks: 0,
            adjustments: 0,
            low_power_ticks: 0,
            momentum_sum: 0.0,
            peak_momentum: 0.0,
            peak_thermal: ThermalState::Nominal,
            lowest: levels,
            last: levels,
        }
    }

    pub fn workload_id(&self) -> &str {
        &self.workload_id
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Fold one tick in.
    pub fn observe_tick(
        &mut self,
        thermal: ThermalState,
        effective_momentum: f64,
        levels: QualityLevels,
        low_power: bool,
    ) {
        self.ticks += 1;
        if low_power {
            self.low_power_ticks += 1;
        }
        self.momentum_sum += effective_momentum;
        self.peak_momentum = self.peak_momentum.max(effective_momentum);
        if thermal.normalized() > self.peak_thermal.normalized() {
            self.peak_thermal = thermal;
        }
        self.lowest = self.lowest.min_each(levels);
        self.last = levels;
    }

    pub fn observe_adjustment(&mut self) {
        self.adjustments += 1;
    }

    /// Summarise the window so far.
    pub fn summary(&self, reason: FlushReason, overrides_active: bool, now: Instant) -> SessionSummary {
        let mean_momentum = if self.ticks == 0 {
            0.0
        } else {
            self.momentum_sum / self.ticks as f64
        };
        SessionSummary {
            workload_id: self.workload_id.clone(),
            reason,
            ticks: self.ticks,
            adjustments: self.adjustments,
            low_power_ticks: self.low_power_ticks,
            mean_momentum,
            peak_momentum: self.peak_momentum,
            peak_thermal: self.peak_thermal,
            lowest: self.lowest,
            final_levels: self.last,
            overrides_active,
            duration_secs: now.saturating_duration_since(self.started).as_secs_f64(),
        }
    }

    /// Start a fresh window from the latest levels.
    pub fn restart(&mut self, now: Instant) {
        *self = Self::new(std::mem::take(&mut self.workload_id), self.last, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_aggregator_summary() {
        let start = Instant::now();
        let mut agg = SessionAggregator::new("ocean", QualityLevels::MAX, start);
        agg.observe_tick(ThermalState::Fair, 0.4, QualityLevels::new(55.0, 0.9, 0.9), false);
        agg.observe_adjustment();
        agg.observe_tick(ThermalState::Critical, 0.8, QualityLevels::new(50.0, 0.8, 0.8), false);
        agg.observe_adjustment();
        agg.observe_tick(ThermalState::Serious, 0.0, QualityLevels::new(30.0, 0.6, 0.5), true);

        let summary = agg.summary(FlushReason::Periodic, false, start + Duration::from_secs(15));
        assert_eq!(summary.ticks, 3);
        assert_eq!(summary.adjustments, 2);
        assert_eq!(summary.low_power_ticks, 1);
        assert!((summary.mean_momentum - 0.4).abs() < 1e-9);
        assert_eq!(summary.peak_momentum, 0.8);
        assert_eq!(summary.peak_thermal, ThermalState::Critical);
        assert_eq!(summary.lowest, QualityLevels::new(30.0, 0.6, 0.5));
        assert_eq!(summary.duration_secs, 15.0);
    }

    #[test]
    fn test_restart_keeps_workload_and_levels() {
        let start = Instant::now();
        let mut agg = SessionAggregator::new("ocean", QualityLevels::MAX, start);
        agg.observe_tick(ThermalState::Fair, 0.4, QualityLevels::new(55.0, 0.9, 0.9), false);
        agg.restart(start + Duration::from_secs(300));

        assert_eq!(agg.workload_id(), "ocean");
        assert_eq!(agg.ticks(), 0);
        let summary = agg.summary(FlushReason::Background, true, start + Duration::from_secs(300));
        assert_eq!(summary.final_levels, QualityLevels::new(55.0, 0.9, 0.9));
        assert_eq!(summary.mean_momentum, 0.0);
        assert!(summary.overrides_active);
    }

    #[test]
    fn test_flush_reason_serialization() {
        let json = serde_json::to_string(&FlushReason::ShaderChanged).unwrap();
        assert_eq!(json, "\"shader_changed\"");
        assert_eq!(AdjustmentSource::Override.as_str(), "override");
    }
}
