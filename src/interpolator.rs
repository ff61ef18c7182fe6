//! Frame interpolation bookkeeping.
//!
//! Decouples the workload's execution rate from the display rate: the
//! workload runs at a lower rate and the presentation loop blends the two
//! most recent results in between. This type only tracks timing and
//! validity; the pixel work belongs to the renderer that owns it.
//!
//! Readiness is implied by the valid-frame counter:
//! - 0: nothing rendered yet, always execute
//! - 1: one frame, execute; it can be shown as-is but not blended
//! - 2: both buffers valid, blending is safe

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Gap after which cached frames are considered stale.
pub const DEFAULT_MAX_FRAME_GAP: Duration = Duration::from_millis(250);

/// Valid frames needed before blending.
const READY_FRAMES: u8 = 2;

/// Pixel format of the cached frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Rgba8,
    Bgra8,
    Rgba16Float,
}

/// Shape of the two cached frame buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameBufferSpec {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// What the presentation loop should show this display frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Presentation {
    /// No cached frame; the workload output must be shown directly.
    Render,
    /// Exactly one valid frame; show it without blending.
    Current,
    /// Blend previous and current by `factor` (0 = previous, 1 = current).
    Blend { factor: f64 },
}

/// Per-renderer interpolation state.
#[derive(Debug, Clone)]
pub struct FrameInterpolator {
    buffers: Option<FrameBufferSpec>,
    previous: Option<Instant>,
    current: Option<Instant>,
    valid_frames: u8,
    execution_interval: Duration,
    max_frame_gap: Duration,
    /// Stale-gap resets, a proxy for visible hiccups
    reset_count: u64,
    /// Bumped each time the buffers are recreated
    buffer_generation: u64,
}

impl FrameInterpolator {
    /// Interpolator for a workload running at `execution_rate` per second.
    pub fn new(execution_rate: f64, max_frame_gap: Duration) -> Self {
        Self {
            buffers: None,
            previous: None,
            current: None,
            valid_frames: 0,
            execution_interval: interval_for(execution_rate),
            max_frame_gap,
            reset_count: 0,
            buffer_generation: 0,
        }
    }

    /// Change the workload execution rate, e.g. to the governor's shader rate.
    pub fn set_execution_rate(&mut self, execution_rate: f64) {
        self.execution_interval = interval_for(execution_rate);
    }

    pub fn execution_interval(&self) -> Duration {
        self.execution_interval
    }

    pub fn max_frame_gap(&self) -> Duration {
        self.max_frame_gap
    }

    pub fn valid_frames(&self) -> u8 {
        self.valid_frames
    }

    pub fn is_ready(&self) -> bool {
        self.valid_frames >= READY_FRAMES
    }

    pub fn reset_count(&self) -> u64 {
        self.reset_count
    }

    pub fn buffer_generation(&self) -> u64 {
        self.buffer_generation
    }

    pub fn buffers(&self) -> Option<FrameBufferSpec> {
        self.buffers
    }

    /// Whether the workload itself must run this display frame.
    pub fn should_execute_workload(&self, now: Instant) -> bool {
        if !self.is_ready() {
            return true;
        }
        match self.current {
            Some(last) => {
                let elapsed = now.saturating_duration_since(last);
                elapsed > self.max_frame_gap || elapsed >= self.execution_interval
            }
            None => true,
        }
    }

    /// Record that the workload produced a fresh frame at `now`.
    pub fn record_execution(&mut self, now: Instant) {
        if let Some(last) = self.current {
            if now.saturating_duration_since(last) > self.max_frame_gap {
                self.reset_count += 1;
                debug!(
                    "Frame gap {:?} exceeds {:?}, dropping cached frames",
                    now.saturating_duration_since(last),
                    self.max_frame_gap
                );
                self.clear_frames();
            }
        }

        self.previous = self.current;
        self.current = Some(now);
        self.valid_frames = (self.valid_frames + 1).min(READY_FRAMES);
    }

    /// Fraction of the way from the previous frame to the current one.
    ///
    /// Measured as time since the current frame over the spacing of the
    /// two frames, clamped to [0, 1]. 1.0 when there is no previous frame.
    pub fn blend_factor(&self, now: Instant) -> f64 {
        let (previous, current) = match (self.previous, self.current) {
            (Some(previous), Some(current)) => (previous, current),
            _ => return 1.0,
        };
        let span = current.saturating_duration_since(previous).as_secs_f64();
        if span <= 0.0 {
            return 1.0;
        }
        let elapsed = now.saturating_duration_since(current).as_secs_f64();
        (elapsed / span).clamp(0.0, 1.0)
    }

    /// Decide how to present the current display frame.
    pub fn presentation(&self, now: Instant) -> Presentation {
        match self.valid_frames {
            0 => Presentation::Render,
            1 => Presentation::Current,
            _ => Presentation::Blend {
                factor: self.blend_factor(now),
            },
        }
    }

    /// Recreate the frame buffers if the shape changed.
    ///
    /// Returns true when the buffers were recreated. Recreation drops every
    /// cached frame: stale content must never be blended after a resize.
    pub fn update_buffers(&mut self, width: u32, height: u32, format: PixelFormat) -> bool {
        let spec = FrameBufferSpec {
            width,
            height,
            format,
        };
        if self.buffers == Some(spec) {
            return false;
        }

        debug!("Recreating frame buffers as {}x{} {:?}", width, height, format);
        self.buffers = Some(spec);
        self.buffer_generation += 1;
        self.reset();
        true
    }

    /// Drop all cached frames.
    pub fn reset(&mut self) {
        self.clear_frames();
    }

    fn clear_frames(&mut self) {
        self.previous = None;
        self.current = None;
        self.valid_frames = 0;
    }
}

fn interval_for(rate: f64) -> Duration {
    if rate.is_finite() && rate > 0.0 {
        Duration::from_secs_f64(1.0 / rate)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interpolator() -> FrameInterpolator {
        // 30 executions per second, 33.3ms apart
        FrameInterpolator::new(30.0, Duration::from_millis(100))
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_readiness_counter() {
        let mut interp = interpolator();
        let start = Instant::now();
        assert_eq!(interp.valid_frames(), 0);
        assert!(interp.should_execute_workload(start));
        assert_eq!(interp.presentation(start), Presentation::Render);

        interp.record_execution(start);
        assert!(!interp.is_ready());
        assert_eq!(interp.presentation(start), Presentation::Current);
        assert!(interp.should_execute_workload(start));

        interp.record_execution(start + ms(33));
        assert!(interp.is_ready());

        interp.record_execution(start + ms(66));
        assert_eq!(interp.valid_frames(), 2);
    }

    #[test]
    fn test_gap_resets_to_one_frame() {
        let mut interp = interpolator();
        let start = Instant::now();
        interp.record_execution(start);
        interp.record_execution(start + ms(33));
        assert!(interp.is_ready());

        interp.record_execution(start + ms(500));
        assert_eq!(interp.valid_frames(), 1);
        assert!(!interp.is_ready());
        assert_eq!(interp.reset_count(), 1);
        assert_eq!(interp.blend_factor(start + ms(510)), 1.0);
    }

    #[test]
    fn test_should_execute_respects_interval() {
        let mut interp = interpolator();
        let start = Instant::now();
        interp.record_execution(start);
        interp.record_execution(start + ms(34));

        // Between executions: blend instead
        assert!(!interp.should_execute_workload(start + ms(50)));
        // Interval elapsed
        assert!(interp.should_execute_workload(start + ms(68)));
        // Stale
        assert!(interp.should_execute_workload(start + ms(400)));
    }

    #[test]
    fn test_blend_factor_is_linear_and_clamped() {
        let mut interp = interpolator();
        let start = Instant::now();
        assert_eq!(interp.blend_factor(start), 1.0);

        interp.record_execution(start);
        interp.record_execution(start + ms(40));
        assert_eq!(interp.blend_factor(start + ms(40)), 0.0);
        assert!((interp.blend_factor(start + ms(60)) - 0.5).abs() < 1e-9);
        assert_eq!(interp.blend_factor(start + ms(200)), 1.0);
        assert_eq!(interp.blend_factor(start), 0.0);

        match interp.presentation(start + ms(50)) {
            Presentation::Blend { factor } => assert!((factor - 0.25).abs() < 1e-9),
            other => panic!("expected blend, got {:?}", other),
        }
    }

    #[test]
    fn test_buffers_recreated_only_on_change() {
        let mut interp = interpolator();
        let start = Instant::now();
        assert!(interp.update_buffers(1280, 800, PixelFormat::Rgba8));
        interp.record_execution(start);
        interp.record_execution(start + ms(33));

        assert!(!interp.update_buffers(1280, 800, PixelFormat::Rgba8));
        assert!(interp.is_ready());
        assert_eq!(interp.buffer_generation(), 1);

        assert!(interp.update_buffers(1280, 800, PixelFormat::Rgba16Float));
        assert_eq!(interp.valid_frames(), 0);
        assert_eq!(interp.buffer_generation(), 2);

        assert!(interp.update_buffers(640, 400, PixelFormat::Rgba16Float));
        assert_eq!(interp.buffers().map(|b| b.width), Some(640));
    }

    #[test]
    fn test_execution_rate_change() {
        let mut interp = interpolator();
        interp.set_execution_rate(15.0);
        assert!((interp.execution_interval().as_secs_f64() - 1.0 / 15.0).abs() < 1e-9);
        interp.set_execution_rate(0.0);
        assert_eq!(interp.execution_interval(), Duration::ZERO);
    }
}
