//! Signal tracker turning discrete thermal readings into momentum.
//!
//! Momentum is an exponential moving average of the normalized thermal
//! delta. A hysteresis-gated direction sits on top of it so the classification
//! does not chatter when momentum hovers near a threshold, and a separate
//! recovery magnitude tracks how fast the device is cooling.

use crate::thermal::ThermalState;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// EMA weight of the newest delta
pub const SMOOTHING_FACTOR: f64 = 0.3;
/// EMA weight of the newest cooling magnitude
pub const RECOVERY_SMOOTHING: f64 = 0.2;
/// Per-sample decay of the recovery magnitude when not cooling
pub const RECOVERY_DECAY: f64 = 0.8;
/// Momentum needed to commit to heating or cooling
pub const ENTRY_THRESHOLD: f64 = 0.15;
/// Momentum needed to fall back to stable
pub const EXIT_THRESHOLD: f64 = 0.05;
/// Ceiling of the recovery speed multiplier
pub const MAX_RECOVERY_SCALE: f64 = 3.0;

/// Committed trend classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Heating,
    Cooling,
    #[default]
    Stable,
}

impl Direction {
    /// Apply the hysteresis gate to a new momentum value.
    ///
    /// Entry needs |momentum| > 0.15, exit needs it back inside 0.05. The
    /// 0.10 band between them absorbs vsync-level noise.
    pub fn next(self, momentum: f64) -> Direction {
        match self {
            Direction::Stable => {
                if momentum > ENTRY_THRESHOLD {
                    Direction::Heating
                } else if momentum < -ENTRY_THRESHOLD {
                    Direction::Cooling
                } else {
                    Direction::Stable
                }
            }
            Direction::Heating => {
                if momentum < EXIT_THRESHOLD {
                    Direction::Stable
                } else {
                    Direction::Heating
                }
            }
            Direction::Cooling => {
                if momentum > -EXIT_THRESHOLD {
                    Direction::Stable
                } else {
                    Direction::Cooling
                }
            }
        }
    }
}

/// Momentum tracker for one workload session.
#[derive(Debug, Clone, Default)]
pub struct SignalTracker {
    momentum: f64,
    direction: Direction,
    recovery_magnitude: f64,
    last_state: Option<ThermalState>,
    last_update: Option<Instant>,
}

impl SignalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn momentum(&self) -> f64 {
        self.momentum
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn recovery_magnitude(&self) -> f64 {
        self.recovery_magnitude
    }

    pub fn last_state(&self) -> Option<ThermalState> {
        self.last_state
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }

    /// Multiplier for the recovery step, in [1.0, 3.0].
    pub fn recovery_scale(&self) -> f64 {
        (1.0 + self.recovery_magnitude * 2.0).min(MAX_RECOVERY_SCALE)
    }

    /// Fold a new reading into the momentum and return it.
    pub fn record(&mut self, reading: ThermalState) -> f64 {
        self.record_at(reading, Instant::now())
    }

    /// Record with explicit timestamp (for testing).
    pub fn record_at(&mut self, reading: ThermalState, now: Instant) -> f64 {
        let current = reading.normalized();

        match self.last_state {
            None => {
                // Cold start under pressure reacts immediately instead of
                // waiting for a second sample to form a delta.
                self.momentum = seed_momentum(reading);
            }
            Some(previous) => {
                let delta = current - previous.normalized();
                self.momentum = (SMOOTHING_FACTOR * delta
                    + (1.0 - SMOOTHING_FACTOR) * self.momentum)
                    .clamp(-1.0, 1.0);

                if delta < 0.0 {
                    self.recovery_magnitude = RECOVERY_SMOOTHING * delta.abs()
                        + (1.0 - RECOVERY_SMOOTHING) * self.recovery_magnitude;
                } else {
                    self.recovery_magnitude *= RECOVERY_DECAY;
                }
            }
        }

        self.direction = self.direction.next(self.momentum);
        self.last_state = Some(reading);
        self.last_update = Some(now);
        self.momentum
    }

    /// Re-initialise from a reading known to be current, e.g. on resume.
    ///
    /// Unlike [`reset`](Self::reset) this keeps the device's present heat in
    /// view, so a hot resume throttles on the very next tick.
    pub fn seed_from_current_state(&mut self, reading: ThermalState) {
        self.seed_from_current_state_at(reading, Instant::now());
    }

    pub fn seed_from_current_state_at(&mut self, reading: ThermalState, now: Instant) {
        self.momentum = seed_momentum(reading);
        self.recovery_magnitude = 0.0;
        self.direction = Direction::Stable;
        self.last_state = Some(reading);
        self.last_update = Some(now);
    }

    /// Forget everything; used when the intervening state is unknown.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn seed_momentum(reading: ThermalState) -> f64 {
    let normalized = reading.normalized();
    if normalized > 0.0 {
        normalized * SMOOTHING_FACTOR
    } else {
        0.0
    }
}
