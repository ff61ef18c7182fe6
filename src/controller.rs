//! Quality controller.
//!
//! Ties the signal tracker, the optimizer and the profile store together.
//! The controller is synchronous and owns all mutable governor state; the
//! async [`Governor`](crate::governor::Governor) serializes callers onto it
//! and drives the periodic tick.
//!
//! Each adaptive tick computes
//!
//! ```text
//! thermal   = max(signal momentum, normalized reading) * mode multiplier
//! effective = min(thermal + fps boost, 1.0)
//! ```
//!
//! Resolution and detail follow `effective`; the rate axis follows `thermal`
//! alone, so a missed frame target is fixed by resolution first.

use crate::analytics::{
    AdjustmentEvent, AdjustmentSource, AnalyticsSink, FlushReason, SessionAggregator,
};
use crate::config::{GovernorConfig, QualityMode};
use crate::metrics::GovernorMetrics;
use crate::momentum::{Direction, SignalTracker};
use crate::optimizer::{optimize, optimize_levels, recover, DEAD_ZONE};
use crate::profile::{QualityLevels, QualityProfile, RATE_RANGE};
use crate::store::ProfileStore;
use crate::thermal::{DeviceContext, ThermalState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Fixed operating point while the device is in low-power mode.
pub const LOW_POWER_LEVELS: QualityLevels = QualityLevels {
    rate: 30.0,
    scale: 0.6,
    detail: 0.5,
};

/// Gain applied to the normalized frame-rate deficit.
pub const FPS_BOOST_GAIN: f64 = 0.5;
/// Upper bound of the reactive boost.
pub const MAX_FPS_BOOST: f64 = 0.5;
/// Per-tick decay of the reactive boost.
pub const FPS_BOOST_DECAY: f64 = 0.5;
/// Base strength of the gradual recovery inside the dead zone.
pub const RECOVERY_STRENGTH: f64 = 0.2;
/// Largest share of the gap to maximum granted on resume.
pub const COOLDOWN_BONUS_FRACTION: f64 = 0.2;
/// Time in the background after which the full bonus applies.
pub const FULL_COOLDOWN: Duration = Duration::from_secs(600);
/// Consecutive unchanged ticks before a profile counts as stabilized.
pub const STABILITY_TICKS: u64 = 36;
/// Interpolation needs the effective rate at least this share of max.
pub const INTERPOLATION_RATE_FRACTION: f64 = 0.9;

/// Fixed display-time values that bypass the adaptive output.
///
/// Overrides never touch the learned profile and are not clamped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DebugOverrides {
    pub rate: Option<f64>,
    pub scale: Option<f64>,
    pub detail: Option<f64>,
}

impl DebugOverrides {
    pub fn is_active(&self) -> bool {
        self.rate.is_some() || self.scale.is_some() || self.detail.is_some()
    }

    fn apply(&self, levels: QualityLevels) -> QualityLevels {
        QualityLevels {
            rate: self.rate.unwrap_or(levels.rate),
            scale: self.scale.unwrap_or(levels.scale),
            detail: self.detail.unwrap_or(levels.detail),
        }
    }
}

/// What the renderer reads once per display frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveParams {
    pub workload_id: Option<String>,
    pub rate: f64,
    pub scale: f64,
    pub detail: f64,
    pub interpolation_enabled: bool,
    /// Workload execution rate; half the display rate while interpolating
    pub shader_rate: f64,
    pub source: AdjustmentSource,
    pub mode: QualityMode,
    pub thermal_state: ThermalState,
    pub direction: Direction,
    pub effective_momentum: f64,
    pub fps_boost: f64,
    pub stabilized: bool,
}

impl Default for EffectiveParams {
    fn default() -> Self {
        let levels = QualityLevels::MAX;
        Self {
            workload_id: None,
            rate: levels.rate,
            scale: levels.scale,
            detail: levels.detail,
            interpolation_enabled: false,
            shader_rate: levels.rate,
            source: AdjustmentSource::Adaptive,
            mode: QualityMode::default(),
            thermal_state: ThermalState::Nominal,
            direction: Direction::Stable,
            effective_momentum: 0.0,
            fps_boost: 0.0,
            stabilized: false,
        }
    }
}

/// Synchronous governor core.
pub struct QualityController {
    config: GovernorConfig,
    context: Arc<dyn DeviceContext>,
    store: ProfileStore,
    analytics: Arc<dyn AnalyticsSink>,
    metrics: Arc<GovernorMetrics>,
    overrides: DebugOverrides,
    tracker: SignalTracker,
    profile: Option<QualityProfile>,
    session: Option<SessionAggregator>,
    fps_boost: f64,
    effective_momentum: f64,
    last_thermal: ThermalState,
    low_power_active: bool,
    tick_count: u64,
    unchanged_ticks: u64,
    backgrounded_at: Option<Instant>,
}

impl QualityController {
    pub fn new(
        config: GovernorConfig,
        context: Arc<dyn DeviceContext>,
        store: ProfileStore,
        analytics: Arc<dyn AnalyticsSink>,
        overrides: DebugOverrides,
    ) -> Self {
        if overrides.is_active() {
            warn!(source = "override", ?overrides, "Debug overrides active");
        }
        Self {
            config,
            context,
            store,
            analytics,
            metrics: Arc::new(GovernorMetrics::new()),
            overrides,
            tracker: SignalTracker::new(),
            profile: None,
            session: None,
            fps_boost: 0.0,
            effective_momentum: 0.0,
            last_thermal: ThermalState::Nominal,
            low_power_active: false,
            tick_count: 0,
            unchanged_ticks: 0,
            backgrounded_at: None,
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<GovernorMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn profile(&self) -> Option<&QualityProfile> {
        self.profile.as_ref()
    }

    pub fn tracker(&self) -> &SignalTracker {
        &self.tracker
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    pub fn active_workload(&self) -> Option<&str> {
        self.profile.as_ref().map(|p| p.workload_id.as_str())
    }

    pub fn effective_momentum(&self) -> f64 {
        self.effective_momentum
    }

    pub fn fps_boost(&self) -> f64 {
        self.fps_boost
    }

    pub fn overrides(&self) -> DebugOverrides {
        self.overrides
    }

    /// Switch to another workload.
    ///
    /// When the device is already warm the loaded profile is tightened to
    /// the more conservative of itself and the thermally adjusted optimizer
    /// output, so an unthrottled workload does not spike on a hot device.
    pub fn set_active_workload(&mut self, workload_id: &str, now: Instant) {
        if self.active_workload() == Some(workload_id) {
            debug!("Workload {} already active", workload_id);
            return;
        }

        if let Some(previous) = self.profile.take() {
            self.flush_session(FlushReason::ShaderChanged, now);
            self.store.save(&previous);
            self.metrics.record_workload_switch();
        }

        let mut profile = self.store.load(workload_id);
        let thermal = self.context.thermal_state();
        if !thermal.is_nominal() {
            let momentum = thermal.normalized() * self.config.mode.momentum_multiplier();
            let tightened = profile.levels().min_each(optimize(&profile, momentum));
            if tightened != profile.levels() {
                info!(
                    workload = workload_id,
                    thermal = %thermal,
                    rate = tightened.rate,
                    scale = tightened.scale,
                    detail = tightened.detail,
                    "Tightened profile for warm device"
                );
                profile.apply(tightened);
            }
        }

        info!(
            workload = workload_id,
            rate = profile.rate,
            scale = profile.scale,
            detail = profile.detail,
            stabilized = profile.stabilized,
            "Active workload set"
        );
        self.session = Some(SessionAggregator::new(workload_id, profile.levels(), now));
        self.profile = Some(profile);
        self.last_thermal = thermal;
        self.unchanged_ticks = 0;
        self.fps_boost = 0.0;
    }

    /// Resume after suspension.
    ///
    /// The tracker is seeded from the present reading; an unknown reading
    /// gives no usable baseline, so the tracker is reset instead.
    pub fn on_foreground(&mut self, now: Instant) {
        let thermal = self.context.thermal_state();
        if thermal == ThermalState::Unknown {
            self.tracker.reset();
        } else {
            self.tracker.seed_from_current_state_at(thermal, now);
        }
        self.last_thermal = thermal;

        if let Some(since) = self.backgrounded_at.take() {
            let away = now.saturating_duration_since(since);
            if away > self.config.background_threshold() {
                self.apply_cooldown_bonus(away);
            }
        }

        if let Some(session) = self.session.as_mut() {
            session.restart(now);
        }
        info!(thermal = %thermal, "Foregrounded");
    }

    /// Suspend: flush analytics and persist the current profile right away.
    pub fn on_background(&mut self, now: Instant) {
        self.flush_session(FlushReason::Background, now);
        if let Some(profile) = self.profile.as_ref() {
            self.store.save(profile);
            self.metrics.record_persist();
        }
        self.fps_boost = 0.0;
        self.backgrounded_at = Some(now);
        info!("Backgrounded");
    }

    /// Fold a measured display rate into the reactive boost.
    pub fn report_measured_rate(&mut self, observed: f64) {
        if self.backgrounded_at.is_some() {
            debug!("Backgrounded, ignoring measured rate {}", observed);
            return;
        }
        if !observed.is_finite() || observed < 0.0 {
            debug!("Ignoring measured rate {}", observed);
            return;
        }
        let target = self.effective_levels().rate;
        if target <= 0.0 {
            return;
        }
        let deficit = target - observed;
        if deficit <= self.config.rate_tolerance {
            return;
        }

        let boost = (deficit / target * FPS_BOOST_GAIN).min(MAX_FPS_BOOST);
        if boost > self.fps_boost {
            debug!(
                target_rate = target,
                observed, boost, "Measured rate below target"
            );
            self.fps_boost = boost;
        }
    }

    /// One optimization step.
    pub fn tick(&mut self, now: Instant) {
        let Some(profile) = self.profile.as_mut() else {
            return;
        };

        self.metrics.record_tick();
        self.tick_count += 1;

        let thermal = self.context.thermal_state();
        self.last_thermal = thermal;
        let signal = self.tracker.record_at(thermal, now);
        let thermal_momentum = signal.max(thermal.normalized()) * self.config.mode.momentum_multiplier();
        let effective = (thermal_momentum + self.fps_boost).min(1.0);
        let boost = self.fps_boost;
        self.fps_boost *= FPS_BOOST_DECAY;
        self.effective_momentum = effective;

        let persist_slot = self.tick_count % self.config.persist_every_ticks.max(1) == 0;

        if self.context.is_low_power_mode() {
            if !self.low_power_active {
                info!(source = AdjustmentSource::LowPower.as_str(), "Low-power mode entered");
                let event = AdjustmentEvent {
                    workload_id: profile.workload_id.clone(),
                    tick: self.tick_count,
                    thermal_state: thermal,
                    effective_momentum: effective,
                    fps_boost: boost,
                    previous: profile.levels(),
                    next: LOW_POWER_LEVELS,
                    source: AdjustmentSource::LowPower,
                };
                self.analytics.record_adjustment(&event);
            }
            self.low_power_active = true;
            if let Some(session) = self.session.as_mut() {
                session.observe_tick(thermal, effective, LOW_POWER_LEVELS, true);
            }
            if persist_slot {
                self.metrics.record_persist_skip();
            }
            return;
        }
        if self.low_power_active {
            info!("Low-power mode left");
            self.low_power_active = false;
        }

        let previous = profile.levels();
        let mut next = optimize_levels(previous, effective);
        next.rate = optimize_levels(previous, thermal_momentum.min(1.0)).rate;
        if effective < DEAD_ZONE {
            next = recover(next, RECOVERY_STRENGTH * self.tracker.recovery_scale());
        }

        profile.momentum = signal;
        profile.apply(next);
        let next = profile.levels();

        if next != previous {
            let lowered = next.rate < previous.rate
                || next.scale < previous.scale
                || next.detail < previous.detail;
            self.metrics.record_adjustment(lowered);
            let event = AdjustmentEvent {
                workload_id: profile.workload_id.clone(),
                tick: self.tick_count,
                thermal_state: thermal,
                effective_momentum: effective,
                fps_boost: boost,
                previous,
                next,
                source: AdjustmentSource::Adaptive,
            };
            self.analytics.record_adjustment(&event);
            if let Some(session) = self.session.as_mut() {
                session.observe_adjustment();
            }
            self.unchanged_ticks = 0;
        } else {
            self.unchanged_ticks += 1;
            if self.unchanged_ticks >= STABILITY_TICKS && !profile.stabilized {
                profile.mark_stabilized();
                info!(
                    workload = %profile.workload_id,
                    samples = profile.sample_count,
                    "Profile stabilized"
                );
            }
        }

        if let Some(session) = self.session.as_mut() {
            session.observe_tick(thermal, effective, next, false);
        }

        if persist_slot {
            if self.context.has_external_heat_factors() {
                debug!("External heat factors active, not persisting");
                self.metrics.record_persist_skip();
            } else {
                self.store.save(profile);
                self.metrics.record_persist();
            }
        }
    }

    /// Send the session summary to the analytics sink and start a new window.
    pub fn flush_session(&mut self, reason: FlushReason, now: Instant) {
        let overrides_active = self.overrides.is_active();
        if let Some(session) = self.session.as_mut() {
            let summary = session.summary(reason, overrides_active, now);
            self.analytics.flush(&summary);
            self.metrics.record_flush();
            session.restart(now);
        }
    }

    pub fn set_overrides(&mut self, overrides: DebugOverrides) {
        if overrides.is_active() {
            warn!(source = "override", ?overrides, "Debug overrides active");
        } else if self.overrides.is_active() {
            info!("Debug overrides cleared");
        }
        self.overrides = overrides;
    }

    pub fn set_mode(&mut self, mode: QualityMode) {
        if self.config.mode != mode {
            info!(mode = mode.as_str(), "Quality mode changed");
            self.config.mode = mode;
        }
    }

    pub fn effective_rate(&self) -> f64 {
        self.effective_levels().rate
    }

    pub fn effective_scale(&self) -> f64 {
        self.effective_levels().scale
    }

    pub fn effective_detail(&self) -> f64 {
        self.effective_levels().detail
    }

    /// Whether the renderer should interpolate between workload frames.
    ///
    /// Resolution already under pressure while the rate is still near its
    /// maximum; low-power mode always interpolates.
    pub fn effective_interpolation_enabled(&self) -> bool {
        if self.low_power_active {
            return true;
        }
        let levels = self.effective_levels();
        levels.scale < self.config.mode.interpolation_scale_threshold()
            && levels.rate >= RATE_RANGE.max * INTERPOLATION_RATE_FRACTION
    }

    pub fn effective_shader_rate(&self) -> f64 {
        let rate = self.effective_rate();
        if self.effective_interpolation_enabled() {
            rate / 2.0
        } else {
            rate
        }
    }

    /// Consistent snapshot of every effective value.
    pub fn effective_params(&self) -> EffectiveParams {
        let levels = self.effective_levels();
        let source = if self.overrides.is_active() {
            AdjustmentSource::Override
        } else if self.low_power_active {
            AdjustmentSource::LowPower
        } else {
            AdjustmentSource::Adaptive
        };
        EffectiveParams {
            workload_id: self.active_workload().map(str::to_string),
            rate: levels.rate,
            scale: levels.scale,
            detail: levels.detail,
            interpolation_enabled: self.effective_interpolation_enabled(),
            shader_rate: self.effective_shader_rate(),
            source,
            mode: self.config.mode,
            thermal_state: self.last_thermal,
            direction: self.tracker.direction(),
            effective_momentum: self.effective_momentum,
            fps_boost: self.fps_boost,
            stabilized: self.profile.as_ref().map(|p| p.stabilized).unwrap_or(false),
        }
    }

    fn effective_levels(&self) -> QualityLevels {
        let base = if self.low_power_active {
            LOW_POWER_LEVELS
        } else {
            self.profile
                .as_ref()
                .map(QualityProfile::levels)
                .unwrap_or(QualityLevels::MAX)
        };
        self.overrides.apply(base)
    }

    fn apply_cooldown_bonus(&mut self, away: Duration) {
        let Some(profile) = self.profile.as_mut() else {
            return;
        };
        let share = (away.as_secs_f64() / FULL_COOLDOWN.as_secs_f64()).min(1.0);
        let bumped = profile.levels().toward_max(COOLDOWN_BONUS_FRACTION * share);
        if bumped != profile.levels() {
            info!(
                away_secs = away.as_secs(),
                rate = bumped.rate,
                scale = bumped.scale,
                detail = bumped.detail,
                "Applied cooldown bonus"
            );
            profile.apply(bumped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::SessionSummary;
    use crate::interpolator::{FrameInterpolator, DEFAULT_MAX_FRAME_GAP};
    use crate::profile::{DETAIL_RANGE, SCALE_RANGE};
    use crate::store::{profile_key, KeyValueStore, MemoryKeyValueStore};
    use crate::thermal::PushDeviceContext;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<AdjustmentEvent>>,
        flushes: Mutex<Vec<SessionSummary>>,
    }

    impl AnalyticsSink for RecordingSink {
        fn record_adjustment(&self, event: &AdjustmentEvent) {
            self.events.lock().unwrap().push(event.clone());
        }

        fn flush(&self, summary: &SessionSummary) {
            self.flushes.lock().unwrap().push(summary.clone());
        }
    }

    struct Fixture {
        context: Arc<PushDeviceContext>,
        medium: Arc<MemoryKeyValueStore>,
        sink: Arc<RecordingSink>,
        controller: QualityController,
    }

    fn fixture_with_store(store_setup: impl FnOnce(&mut ProfileStore)) -> Fixture {
        let context = Arc::new(PushDeviceContext::new());
        let medium = Arc::new(MemoryKeyValueStore::new());
        let sink = Arc::new(RecordingSink::default());
        let mut store = ProfileStore::open(Box::new(Arc::clone(&medium)), "test-device");
        store_setup(&mut store);
        let controller = QualityController::new(
            GovernorConfig::default(),
            context.clone(),
            store,
            sink.clone(),
            DebugOverrides::default(),
        );
        Fixture {
            context,
            medium,
            sink,
            controller,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_store(|_| {})
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn levels(c: &QualityController) -> QualityLevels {
        QualityLevels::new(c.effective_rate(), c.effective_scale(), c.effective_detail())
    }

    fn run(f: &mut Fixture, readings: &[ThermalState], start: Instant, offset: &mut u64) {
        for reading in readings {
            f.context.set_thermal_state(*reading);
            *offset += 5;
            f.controller.tick(start + secs(*offset));
        }
    }

    #[test]
    fn test_heating_sequence_lowers_every_axis() {
        let mut f = fixture();
        let start = Instant::now();
        f.controller.set_active_workload("ocean", start);
        assert_eq!(levels(&f.controller), QualityLevels::MAX);

        let sequence = [
            ThermalState::Nominal,
            ThermalState::Fair,
            ThermalState::Serious,
            ThermalState::Critical,
            ThermalState::Critical,
        ];
        let mut history = vec![levels(&f.controller)];
        let mut offset = 0;
        for reading in sequence {
            run(&mut f, &[reading], start, &mut offset);
            history.push(levels(&f.controller));
        }

        // Nominal first reading leaves max quality alone
        assert_eq!(history[1], QualityLevels::MAX);
        for pair in history[1..].windows(2) {
            assert!(pair[1].rate < pair[0].rate, "{:?}", pair);
            assert!(pair[1].scale < pair[0].scale, "{:?}", pair);
            assert!(pair[1].detail < pair[0].detail, "{:?}", pair);
        }
        assert!(f.controller.effective_momentum() > DEAD_ZONE);
    }

    #[test]
    fn test_measured_deficit_lowers_scale_not_rate() {
        let mut f = fixture();
        let start = Instant::now();
        f.controller.set_active_workload("ocean", start);

        f.controller.report_measured_rate(15.0);
        assert!((f.controller.fps_boost() - 0.375).abs() < 1e-9);
        f.controller.tick(start + secs(5));

        assert!(f.controller.effective_scale() < 1.0);
        assert!(f.controller.effective_detail() < 1.0);
        assert_eq!(f.controller.effective_rate(), 60.0);
    }

    #[test]
    fn test_deficit_within_tolerance_is_ignored() {
        let mut f = fixture();
        f.controller.set_active_workload("ocean", Instant::now());
        f.controller.report_measured_rate(58.0);
        f.controller.report_measured_rate(f64::NAN);
        assert_eq!(f.controller.fps_boost(), 0.0);

        // Deficit boost is capped
        f.controller.report_measured_rate(0.0);
        assert_eq!(f.controller.fps_boost(), MAX_FPS_BOOST);
    }

    #[test]
    fn test_rate_reports_ignored_while_backgrounded() {
        let mut f = fixture();
        let start = Instant::now();
        f.controller.set_active_workload("ocean", start);
        f.controller.on_background(start + secs(1));

        f.controller.report_measured_rate(15.0);
        assert_eq!(f.controller.fps_boost(), 0.0);

        f.controller.on_foreground(start + secs(2));
        f.controller.tick(start + secs(7));
        assert_eq!(levels(&f.controller), QualityLevels::MAX);

        f.controller.report_measured_rate(15.0);
        assert!(f.controller.fps_boost() > 0.0);
    }

    #[test]
    fn test_fps_boost_decays() {
        let mut f = fixture();
        let start = Instant::now();
        f.controller.set_active_workload("ocean", start);
        f.controller.report_measured_rate(30.0);
        let initial = f.controller.fps_boost();
        f.controller.tick(start + secs(5));
        assert!((f.controller.fps_boost() - initial * FPS_BOOST_DECAY).abs() < 1e-12);
    }

    #[test]
    fn test_cooling_sequence_restores_quality() {
        let mut f = fixture();
        let start = Instant::now();
        f.controller.set_active_workload("ocean", start);
        let mut offset = 0;

        run(&mut f, &[ThermalState::Critical; 30], start, &mut offset);
        let throttled = levels(&f.controller);
        assert_eq!(throttled.rate, RATE_RANGE.min);
        assert_eq!(throttled.scale, SCALE_RANGE.min);
        assert_eq!(throttled.detail, DETAIL_RANGE.min);

        run(
            &mut f,
            &[
                ThermalState::Critical,
                ThermalState::Serious,
                ThermalState::Fair,
                ThermalState::Nominal,
            ],
            start,
            &mut offset,
        );
        run(&mut f, &[ThermalState::Nominal; 10], start, &mut offset);

        let restored = levels(&f.controller);
        assert!(restored.rate > throttled.rate);
        assert!(restored.scale > throttled.scale);
        assert!(restored.detail > throttled.detail);
        assert!(restored.rate <= RATE_RANGE.max);
        assert!(restored.scale <= SCALE_RANGE.max);
        assert!(restored.detail <= DETAIL_RANGE.max);
    }

    #[test]
    fn test_warm_device_tightens_loaded_profile() {
        let mut f = fixture();
        f.context.set_thermal_state(ThermalState::Serious);
        f.controller.set_active_workload("ocean", Instant::now());

        let current = levels(&f.controller);
        assert!(current.scale < 1.0);
        assert!(current.rate < 60.0);
        assert!(current.detail < 1.0);
    }

    #[test]
    fn test_switch_flushes_and_persists_previous() {
        let mut f = fixture();
        let start = Instant::now();
        f.controller.set_active_workload("ocean", start);
        f.context.set_thermal_state(ThermalState::Critical);
        f.controller.tick(start + secs(5));

        f.controller.set_active_workload("forest", start + secs(10));
        assert_eq!(f.controller.active_workload(), Some("forest"));

        let flushes = f.sink.flushes.lock().unwrap();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].workload_id, "ocean");
        assert_eq!(flushes[0].reason, FlushReason::ShaderChanged);
        assert!(f.medium.get(&profile_key("ocean")).unwrap().is_some());
    }

    #[test]
    fn test_same_workload_is_noop() {
        let mut f = fixture();
        let start = Instant::now();
        f.controller.set_active_workload("ocean", start);
        f.controller.set_active_workload("ocean", start);
        assert!(f.sink.flushes.lock().unwrap().is_empty());
        assert_eq!(f.controller.metrics().snapshot().workload_switches, 0);
    }

    #[test]
    fn test_persists_every_twelfth_tick() {
        let mut f = fixture();
        let start = Instant::now();
        f.controller.set_active_workload("ocean", start);
        let mut offset = 0;

        run(&mut f, &[ThermalState::Fair; 11], start, &mut offset);
        assert!(f.medium.get(&profile_key("ocean")).unwrap().is_none());

        run(&mut f, &[ThermalState::Fair], start, &mut offset);
        assert!(f.medium.get(&profile_key("ocean")).unwrap().is_some());
        assert_eq!(f.controller.metrics().snapshot().persists, 1);
    }

    #[test]
    fn test_charging_blocks_persistence() {
        let mut f = fixture();
        let start = Instant::now();
        f.controller.set_active_workload("ocean", start);
        f.context.set_charging(true);
        let mut offset = 0;

        run(&mut f, &[ThermalState::Serious; 12], start, &mut offset);
        assert!(f.medium.get(&profile_key("ocean")).unwrap().is_none());
        assert_eq!(f.controller.metrics().snapshot().persist_skips, 1);
        // Still adapting
        assert!(f.controller.effective_scale() < 1.0);
    }

    #[test]
    fn test_low_power_forces_fixed_values() {
        let mut f = fixture();
        let start = Instant::now();
        f.controller.set_active_workload("ocean", start);
        f.context.set_low_power_mode(true);
        let mut offset = 0;

        run(&mut f, &[ThermalState::Nominal; 12], start, &mut offset);
        assert_eq!(levels(&f.controller), LOW_POWER_LEVELS);
        assert!(f.controller.effective_interpolation_enabled());
        assert_eq!(f.controller.effective_shader_rate(), 15.0);
        assert_eq!(f.controller.effective_params().source, AdjustmentSource::LowPower);

        // Profile untouched and not persisted
        assert_eq!(f.controller.profile().map(|p| p.levels()), Some(QualityLevels::MAX));
        assert!(f.medium.get(&profile_key("ocean")).unwrap().is_none());
        let events = f.sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, AdjustmentSource::LowPower);
        drop(events);

        f.context.set_low_power_mode(false);
        run(&mut f, &[ThermalState::Nominal], start, &mut offset);
        assert_eq!(levels(&f.controller), QualityLevels::MAX);
    }

    #[test]
    fn test_background_flushes_and_persists() {
        let mut f = fixture();
        let start = Instant::now();
        f.controller.set_active_workload("ocean", start);
        f.controller.tick(start + secs(5));
        f.controller.on_background(start + secs(6));

        let flushes = f.sink.flushes.lock().unwrap();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].reason, FlushReason::Background);
        assert_eq!(flushes[0].ticks, 1);
        assert!(f.medium.get(&profile_key("ocean")).unwrap().is_some());
    }

    #[test]
    fn test_cooldown_bonus_after_long_background() {
        let mut f = fixture_with_store(|store| {
            let mut profile = QualityProfile::new("ocean");
            profile.apply(QualityLevels::new(30.0, 0.6, 0.4));
            store.save(&profile);
        });
        let start = Instant::now();
        f.controller.set_active_workload("ocean", start);
        f.controller.on_background(start);
        f.controller.on_foreground(start + secs(600));

        let bumped = levels(&f.controller);
        assert!((bumped.rate - 36.0).abs() < 1e-9);
        assert!((bumped.scale - 0.68).abs() < 1e-9);
        assert!((bumped.detail - 0.52).abs() < 1e-9);
    }

    #[test]
    fn test_short_background_grants_no_bonus() {
        let mut f = fixture_with_store(|store| {
            let mut profile = QualityProfile::new("ocean");
            profile.apply(QualityLevels::new(30.0, 0.6, 0.4));
            store.save(&profile);
        });
        let start = Instant::now();
        f.controller.set_active_workload("ocean", start);
        f.controller.on_background(start);
        f.controller.on_foreground(start + secs(30));
        assert_eq!(levels(&f.controller), QualityLevels::new(30.0, 0.6, 0.4));
    }

    #[test]
    fn test_foreground_seeds_or_resets_tracker() {
        let mut f = fixture();
        let start = Instant::now();
        f.controller.set_active_workload("ocean", start);

        f.context.set_thermal_state(ThermalState::Critical);
        f.controller.on_foreground(start);
        assert!((f.controller.tracker().momentum() - 0.3).abs() < 1e-9);

        f.context.set_thermal_state(ThermalState::Unknown);
        f.controller.on_foreground(start);
        assert_eq!(f.controller.tracker().momentum(), 0.0);
        assert_eq!(f.controller.tracker().last_state(), None);
    }

    #[test]
    fn test_overrides_are_display_only() {
        let mut f = fixture();
        let start = Instant::now();
        f.controller.set_active_workload("ocean", start);
        f.controller.set_overrides(DebugOverrides {
            rate: Some(24.0),
            scale: None,
            detail: Some(1.5),
        });

        assert_eq!(f.controller.effective_rate(), 24.0);
        assert_eq!(f.controller.effective_scale(), 1.0);
        assert_eq!(f.controller.effective_detail(), 1.5);
        assert_eq!(f.controller.effective_params().source, AdjustmentSource::Override);
        assert_eq!(f.controller.profile().map(|p| p.rate), Some(60.0));

        f.controller.on_background(start + secs(1));
        assert!(f.sink.flushes.lock().unwrap()[0].overrides_active);

        f.controller.set_overrides(DebugOverrides::default());
        assert_eq!(f.controller.effective_rate(), 60.0);
    }

    #[test]
    fn test_interpolation_gate() {
        let mut f = fixture_with_store(|store| {
            let mut fast = QualityProfile::new("fast");
            fast.apply(QualityLevels::new(60.0, 0.8, 0.9));
            store.save(&fast);
            let mut slow = QualityProfile::new("slow");
            slow.apply(QualityLevels::new(50.0, 0.8, 0.9));
            store.save(&slow);
        });
        let start = Instant::now();

        f.controller.set_active_workload("fast", start);
        assert!(f.controller.effective_interpolation_enabled());
        assert_eq!(f.controller.effective_shader_rate(), 30.0);

        f.controller.set_mode(QualityMode::Quality);
        assert!(!f.controller.effective_interpolation_enabled());
        assert_eq!(f.controller.effective_shader_rate(), 60.0);

        f.controller.set_mode(QualityMode::Balanced);
        f.controller.set_active_workload("slow", start);
        assert!(!f.controller.effective_interpolation_enabled());
    }

    #[test]
    fn test_shader_rate_paces_interpolator() {
        let mut f = fixture_with_store(|store| {
            let mut fast = QualityProfile::new("fast");
            fast.apply(QualityLevels::new(60.0, 0.8, 0.9));
            store.save(&fast);
        });
        let start = Instant::now();
        f.controller.set_active_workload("fast", start);

        let mut interp = FrameInterpolator::new(f.controller.effective_rate(), DEFAULT_MAX_FRAME_GAP);
        interp.set_execution_rate(f.controller.effective_shader_rate());
        assert!((interp.execution_interval().as_secs_f64() - 1.0 / 30.0).abs() < 1e-9);

        // Display frames at 60 Hz: the workload runs on every other one.
        let frame = Duration::from_micros(16_667);
        let mut executed = 0;
        for n in 0..12u32 {
            let now = start + frame * n;
            if interp.should_execute_workload(now) {
                interp.record_execution(now);
                executed += 1;
            }
        }
        assert_eq!(executed, 7);
        assert_eq!(interp.reset_count(), 0);
    }

    #[test]
    fn test_stabilizes_after_quiet_ticks() {
        let mut f = fixture();
        let start = Instant::now();
        f.controller.set_active_workload("ocean", start);
        let mut offset = 0;

        run(&mut f, &[ThermalState::Nominal; 35], start, &mut offset);
        assert!(!f.controller.effective_params().stabilized);
        run(&mut f, &[ThermalState::Nominal], start, &mut offset);
        let profile = f.controller.profile().unwrap();
        assert!(profile.stabilized);
        assert_eq!(profile.sessions_to_stability, Some(36));
    }

    #[test]
    fn test_tick_without_workload_is_noop() {
        let mut f = fixture();
        f.controller.tick(Instant::now());
        assert_eq!(f.controller.metrics().snapshot().total_ticks, 0);
        assert_eq!(f.controller.effective_params(), EffectiveParams::default());
    }
}
