//! Per-workload quality profile.
//!
//! A profile is the learned operating point (rate, scale, detail) for one
//! workload plus the bookkeeping needed to tell when it has settled. Fresh
//! profiles start at maximum quality on every axis.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Closed range of one quality axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisRange {
    pub min: f64,
    pub max: f64,
}

impl AxisRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    pub fn clamp(&self, value: f64) -> f64 {
        if value.is_nan() {
            return self.max;
        }
        value.clamp(self.min, self.max)
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Target execution rate in executions per second.
pub const RATE_RANGE: AxisRange = AxisRange::new(15.0, 60.0);
/// Linear render-resolution multiplier.
pub const SCALE_RANGE: AxisRange = AxisRange::new(0.5, 1.0);
/// Shader level of detail, 1.0 = full quality.
pub const DETAIL_RANGE: AxisRange = AxisRange::new(0.0, 1.0);

/// One operating point on the three quality axes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityLevels {
    pub rate: f64,
    pub scale: f64,
    pub detail: f64,
}

impl QualityLevels {
    /// No throttling on any axis.
    pub const MAX: QualityLevels = QualityLevels {
        rate: RATE_RANGE.max,
        scale: SCALE_RANGE.max,
        detail: DETAIL_RANGE.max,
    };

    pub fn new(rate: f64, scale: f64, detail: f64) -> Self {
        Self { rate, scale, detail }
    }

    pub fn clamped(self) -> Self {
        Self {
            rate: RATE_RANGE.clamp(self.rate),
            scale: SCALE_RANGE.clamp(self.scale),
            detail: DETAIL_RANGE.clamp(self.detail),
        }
    }

    /// The more conservative (lower) value on every axis.
    pub fn min_each(self, other: QualityLevels) -> Self {
        Self {
            rate: self.rate.min(other.rate),
            scale: self.scale.min(other.scale),
            detail: self.detail.min(other.detail),
        }
    }

    /// Move each axis `fraction` of the way toward its maximum.
    pub fn toward_max(self, fraction: f64) -> Self {
        let fraction = fraction.clamp(0.0, 1.0);
        Self {
            rate: self.rate + (RATE_RANGE.max - self.rate) * fraction,
            scale: self.scale + (SCALE_RANGE.max - self.scale) * fraction,
            detail: self.detail + (DETAIL_RANGE.max - self.detail) * fraction,
        }
        .clamped()
    }
}

impl Default for QualityLevels {
    fn default() -> Self {
        Self::MAX
    }
}

fn default_rate() -> f64 {
    RATE_RANGE.max
}

fn default_scale() -> f64 {
    SCALE_RANGE.max
}

fn default_detail() -> f64 {
    DETAIL_RANGE.max
}

fn default_timestamp() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Persisted quality state of one workload.
///
/// Every field except the id carries a serde default so a profile written
/// before a field existed still decodes, with quality fields at maximum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityProfile {
    pub workload_id: String,
    #[serde(default = "default_rate")]
    pub rate: f64,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default = "default_detail")]
    pub detail: f64,
    /// Last recorded signal momentum, diagnostics only
    #[serde(default)]
    pub momentum: f64,
    #[serde(with = "time::serde::rfc3339", default = "default_timestamp")]
    pub last_updated: OffsetDateTime,
    #[serde(default)]
    pub sample_count: u64,
    #[serde(default)]
    pub stabilized: bool,
    #[serde(default)]
    pub sessions_to_stability: Option<u64>,
}

impl QualityProfile {
    /// Fresh profile at maximum quality.
    pub fn new(workload_id: impl Into<String>) -> Self {
        Self {
            workload_id: workload_id.into(),
            rate: RATE_RANGE.max,
            scale: SCALE_RANGE.max,
            detail: DETAIL_RANGE.max,
            momentum: 0.0,
            last_updated: OffsetDateTime::now_utc(),
            sample_count: 0,
            stabilized: false,
            sessions_to_stability: None,
        }
    }

    pub fn levels(&self) -> QualityLevels {
        QualityLevels::new(self.rate, self.scale, self.detail)
    }

    /// Apply one optimizer result. Values are clamped to their ranges.
    pub fn update(&mut self, rate: f64, scale: f64, detail: f64) {
        self.rate = RATE_RANGE.clamp(rate);
        self.scale = SCALE_RANGE.clamp(scale);
        self.detail = DETAIL_RANGE.clamp(detail);
        self.sample_count += 1;
        self.last_updated = OffsetDateTime::now_utc();
    }

    pub fn apply(&mut self, levels: QualityLevels) {
        self.update(levels.rate, levels.scale, levels.detail);
    }

    /// Mark the profile as settled. Only the first call records anything.
    pub fn mark_stabilized(&mut self) {
        if self.stabilized {
            return;
        }
        self.stabilized = true;
        self.sessions_to_stability = Some(self.sample_count);
    }

    /// Re-clamp fields of a decoded profile that may come from an older
    /// or tampered encoding.
    pub fn sanitized(mut self) -> Self {
        let levels = self.levels().clamped();
        self.rate = levels.rate;
        self.scale = levels.scale;
        self.detail = levels.detail;
        if !self.momentum.is_finite() {
            self.momentum = 0.0;
        }
        self
    }
}
