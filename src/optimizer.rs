//! Multi-axis quality optimizer.
//!
//! A pure transform from (current levels, momentum) to the next levels. No
//! state, no I/O: everything that decides *when* to call it lives in the
//! controller.
//!
//! # Algorithm
//! - |momentum| <= dead zone: unchanged.
//! - Heating: every axis steps down by `min(m, 1) * 0.5 * weight * width`,
//!   in perceptual order detail, scale, rate.
//! - Cooling: the same formula at half the step size, in order scale,
//!   rate, detail.
//! - Inside the last 10% before the bound being approached the step is
//!   damped by `max(distance / margin, 0.3)`. A step never reaches the
//!   bound while 0.3 of the nominal step still fits short of it, so
//!   the axis approaches the bound and lands on it only once that
//!   floor covers the remaining distance.

use crate::profile::{
    AxisRange, QualityLevels, QualityProfile, DETAIL_RANGE, RATE_RANGE, SCALE_RANGE,
};

/// Momentum magnitude below which nothing moves.
pub const DEAD_ZONE: f64 = 0.1;
/// Step size per unit of momentum when heating.
pub const HEATING_STEP: f64 = 0.5;
/// Cooling step relative to the heating step.
pub const RECOVERY_RATIO: f64 = 0.5;
/// Fraction of the range treated as the boundary zone.
pub const BOUNDARY_MARGIN: f64 = 0.1;
/// Smallest share of the nominal step admitted inside the boundary zone.
pub const MIN_DAMPING: f64 = 0.3;

pub const DETAIL_WEIGHT: f64 = 0.2;
pub const SCALE_WEIGHT: f64 = 0.6;
pub const RATE_WEIGHT: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Rate,
    Scale,
    Detail,
}

impl Axis {
    fn range(self) -> AxisRange {
        match self {
            Axis::Rate => RATE_RANGE,
            Axis::Scale => SCALE_RANGE,
            Axis::Detail => DETAIL_RANGE,
        }
    }

    fn weight(self) -> f64 {
        match self {
            Axis::Rate => RATE_WEIGHT,
            Axis::Scale => SCALE_WEIGHT,
            Axis::Detail => DETAIL_WEIGHT,
        }
    }

    fn get(self, levels: &QualityLevels) -> f64 {
        match self {
            Axis::Rate => levels.rate,
            Axis::Scale => levels.scale,
            Axis::Detail => levels.detail,
        }
    }

    fn set(self, levels: &mut QualityLevels, value: f64) {
        match self {
            Axis::Rate => levels.rate = value,
            Axis::Scale => levels.scale = value,
            Axis::Detail => levels.detail = value,
        }
    }
}

/// Least visible first.
const REDUCTION_ORDER: [Axis; 3] = [Axis::Detail, Axis::Scale, Axis::Rate];
/// Most valuable first.
const RECOVERY_ORDER: [Axis; 3] = [Axis::Scale, Axis::Rate, Axis::Detail];

/// Next levels for a profile under the given momentum.
pub fn optimize(profile: &QualityProfile, momentum: f64) -> QualityLevels {
    optimize_levels(profile.levels(), momentum)
}

/// [`optimize`] on bare levels.
pub fn optimize_levels(levels: QualityLevels, momentum: f64) -> QualityLevels {
    if !momentum.is_finite() || momentum.abs() <= DEAD_ZONE {
        return levels;
    }
    apply_step(levels, momentum)
}

/// Cooling step of the given strength, applied regardless of the dead zone.
///
/// Used for gradual recovery while momentum is flat.
pub fn recover(levels: QualityLevels, strength: f64) -> QualityLevels {
    if !strength.is_finite() || strength <= 0.0 {
        return levels;
    }
    apply_step(levels, -strength)
}

/// Nominal (undamped) step of an axis for a momentum, signed.
fn nominal_step(axis: Axis, momentum: f64) -> f64 {
    let magnitude = momentum.abs().min(1.0) * HEATING_STEP;
    let magnitude = if momentum < 0.0 {
        magnitude * RECOVERY_RATIO
    } else {
        magnitude
    };
    magnitude * axis.weight() * axis.range().width()
}

fn apply_step(levels: QualityLevels, momentum: f64) -> QualityLevels {
    let mut next = levels;
    let (order, sign) = if momentum > 0.0 {
        (REDUCTION_ORDER, -1.0)
    } else {
        (RECOVERY_ORDER, 1.0)
    };

    for axis in order {
        let range = axis.range();
        let current = range.clamp(axis.get(&next));
        let bound = if sign < 0.0 { range.min } else { range.max };
        let step = damped_step(nominal_step(axis, momentum), current, bound, range);
        axis.set(&mut next, range.clamp(current + sign * step));
    }
    next
}

/// Step actually taken toward `bound`.
///
/// While the floor step still fits inside the remaining distance the
/// result stops short of the bound, leaving at least `MIN_DAMPING` of the
/// distance (or whatever the floor leaves). Once the floor covers the
/// distance the axis lands on the bound.
fn damped_step(nominal: f64, value: f64, bound: f64, range: AxisRange) -> f64 {
    let step = nominal * boundary_damping(value, bound, range);
    let distance = (value - bound).abs();
    let floor = nominal * MIN_DAMPING;
    if floor >= distance {
        return step;
    }
    step.min((distance * (1.0 - MIN_DAMPING)).max(floor))
}

/// Damping factor for a step heading toward `bound`.
fn boundary_damping(value: f64, bound: f64, range: AxisRange) -> f64 {
    let margin = range.width() * BOUNDARY_MARGIN;
    let distance = (value - bound).abs();
    if distance >= margin {
        1.0
    } else {
        (distance / margin).max(MIN_DAMPING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn levels_strategy() -> impl Strategy<Value = QualityLevels> {
        (15.0f64..=60.0, 0.5f64..=1.0, 0.0f64..=1.0)
            .prop_map(|(rate, scale, detail)| QualityLevels::new(rate, scale, detail))
    }

    fn mid() -> QualityLevels {
        QualityLevels::new(37.5, 0.75, 0.5)
    }

    #[test]
    fn test_heating_reduces_every_axis() {
        let next = optimize_levels(QualityLevels::MAX, 1.0);
        assert!((next.detail - 0.9).abs() < 1e-9);
        assert!((next.scale - 0.85).abs() < 1e-9);
        assert!((next.rate - 55.5).abs() < 1e-9);
    }

    #[test]
    fn test_cooling_restores_at_half_speed() {
        let start = mid();
        let down = optimize_levels(start, 0.6);
        let up = optimize_levels(start, -0.6);

        assert!(((up.rate - start.rate) / (start.rate - down.rate) - 0.5).abs() < 1e-9);
        assert!(((up.scale - start.scale) / (start.scale - down.scale) - 0.5).abs() < 1e-9);
        assert!(((up.detail - start.detail) / (start.detail - down.detail) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_profile_entry_point_matches_levels() {
        let mut profile = QualityProfile::new("ocean");
        profile.update(40.0, 0.8, 0.6);
        assert_eq!(optimize(&profile, 0.5), optimize_levels(profile.levels(), 0.5));
    }

    #[test]
    fn test_damping_near_lower_bound_admits_partial_step() {
        // detail 0.08 is inside the 0.1 margin: factor 0.8.
        let start = QualityLevels::new(37.5, 0.75, 0.08);
        let next = optimize_levels(start, 0.5);
        let nominal = 0.5 * 0.5 * DETAIL_WEIGHT * 1.0;
        let taken = start.detail - next.detail;
        assert!(taken >= MIN_DAMPING * nominal - 1e-12);
        assert!(taken < nominal);
        assert!(next.detail > DETAIL_RANGE.min);
    }

    #[test]
    fn test_damped_step_stops_short_of_bound() {
        // scale 0.54: nominal 0.075, damped 0.06, floor 0.0225 < 0.04 left
        let start = QualityLevels::new(37.5, 0.54, 0.5);
        let next = optimize_levels(start, 0.5);
        let taken = start.scale - next.scale;
        assert!(next.scale > SCALE_RANGE.min);
        assert!(taken >= MIN_DAMPING * 0.075 - 1e-12);
        assert!((next.scale - 0.512).abs() < 1e-9);
    }

    #[test]
    fn test_repeated_heating_approaches_then_lands() {
        let mut levels = QualityLevels::new(37.5, 0.6, 0.5);
        let mut trail = Vec::new();
        for _ in 0..10 {
            levels = optimize_levels(levels, 1.0);
            trail.push(levels.scale);
        }
        let first_min = trail.iter().position(|s| *s == SCALE_RANGE.min).unwrap();
        assert!(first_min > 0);
        assert!(trail[first_min - 1] > SCALE_RANGE.min);
        assert!(trail[first_min - 1] - SCALE_RANGE.min <= MIN_DAMPING * 0.15);
    }

    #[test]
    fn test_damping_never_stalls() {
        let start = QualityLevels::new(15.0001, 0.5001, 0.0001);
        let next = optimize_levels(start, 1.0);
        assert_eq!(next.rate, RATE_RANGE.min);
        assert_eq!(next.scale, SCALE_RANGE.min);
        assert_eq!(next.detail, DETAIL_RANGE.min);
    }

    #[test]
    fn test_recover_ignores_dead_zone() {
        let start = mid();
        let next = recover(start, 0.05);
        assert!(next.rate > start.rate);
        assert!(next.scale > start.scale);
        assert!(next.detail > start.detail);
        assert_eq!(recover(start, 0.0), start);
        assert_eq!(recover(start, f64::NAN), start);
    }

    #[test]
    fn test_non_finite_momentum_is_ignored() {
        assert_eq!(optimize_levels(mid(), f64::NAN), mid());
        assert_eq!(optimize_levels(mid(), f64::INFINITY), mid());
    }

    proptest! {
        #[test]
        fn prop_dead_zone_is_identity(
            levels in levels_strategy(),
            momentum in -DEAD_ZONE..=DEAD_ZONE,
        ) {
            prop_assert_eq!(optimize_levels(levels, momentum), levels);
        }

        #[test]
        fn prop_heating_never_increases(
            levels in levels_strategy(),
            momentum in 0.1001f64..5.0,
        ) {
            let next = optimize_levels(levels, momentum);
            prop_assert!(next.rate <= levels.rate);
            prop_assert!(next.scale <= levels.scale);
            prop_assert!(next.detail <= levels.detail);
            prop_assert!(RATE_RANGE.contains(next.rate));
            prop_assert!(SCALE_RANGE.contains(next.scale));
            prop_assert!(DETAIL_RANGE.contains(next.detail));
        }

        #[test]
        fn prop_cooling_never_decreases(
            levels in levels_strategy(),
            momentum in -5.0f64..-0.1001,
        ) {
            let next = optimize_levels(levels, momentum);
            prop_assert!(next.rate >= levels.rate);
            prop_assert!(next.scale >= levels.scale);
            prop_assert!(next.detail >= levels.detail);
            prop_assert!(RATE_RANGE.contains(next.rate));
            prop_assert!(SCALE_RANGE.contains(next.scale));
            prop_assert!(DETAIL_RANGE.contains(next.detail));
        }

        #[test]
        fn prop_recovery_slower_than_reduction(magnitude in 0.11f64..1.0) {
            let start = mid();
            let down = optimize_levels(start, magnitude);
            let up = optimize_levels(start, -magnitude);
            prop_assert!(up.rate - start.rate < start.rate - down.rate);
            prop_assert!(up.scale - start.scale < start.scale - down.scale);
            prop_assert!(up.detail - start.detail < start.detail - down.detail);
        }

        #[test]
        fn prop_heating_stays_inside_while_floor_fits(
            levels in levels_strategy(),
            momentum in 0.11f64..1.0,
        ) {
            let next = optimize_levels(levels, momentum);
            for axis in [Axis::Rate, Axis::Scale, Axis::Detail] {
                let floor = MIN_DAMPING * nominal_step(axis, momentum).abs();
                if axis.get(&levels) - axis.range().min > floor + 1e-9 {
                    prop_assert!(axis.get(&next) > axis.range().min, "{:?} {:?}", axis, next);
                }
            }
        }

        #[test]
        fn prop_cooling_stays_inside_while_floor_fits(
            levels in levels_strategy(),
            momentum in -1.0f64..-0.11,
        ) {
            let next = optimize_levels(levels, momentum);
            for axis in [Axis::Rate, Axis::Scale, Axis::Detail] {
                let floor = MIN_DAMPING * nominal_step(axis, momentum).abs();
                if axis.range().max - axis.get(&levels) > floor + 1e-9 {
                    prop_assert!(axis.get(&next) < axis.range().max, "{:?} {:?}", axis, next);
                }
            }
        }

        #[test]
        fn prop_damped_step_at_least_floor(
            detail in 0.0f64..0.1,
            momentum in 0.11f64..1.0,
        ) {
            let start = QualityLevels::new(37.5, 0.75, detail);
            let next = optimize_levels(start, momentum);
            let nominal = momentum.min(1.0) * HEATING_STEP * DETAIL_WEIGHT;
            let floor = (MIN_DAMPING * nominal).min(detail);
            prop_assert!(detail - next.detail >= floor - 1e-12);
        }
    }
}
