//! Adaptive speed governor.
//!
//! A PI loop that turns alignment-error samples into a scroll velocity.
//!
//! ## Per-tick algorithm
//!
//! ```text
//! soft start?  ── yes ──► base · easeOutCubic(elapsed / soft_start)
//!     │ no
//! eligible sample? (feedback on, no recent manual adjust, sample fresh)
//!     │ no ──► target = base
//!     │ yes
//! deadband / low confidence? ── yes ──► integrator decays, target = base
//!     │ no
//! PI: integrator += sign·ki·dt; adj = clamp(sign·kp + integrator, ±max)
//!     target = base · (1 + adj)
//!     │
//! slew: velocity moves toward target by ≤ base · max · dt
//! ```
//!
//! The governor knows nothing about modes; the router activates it, feeds it
//! samples and polls `tick()` once per frame.

use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::config::GovernorConfig;
use crate::ipc::events::{GovernorDiagnostic, GovernorPhase};

/// `dt` is floored at one millisecond.
const MIN_DT_SECS: f64 = 0.001;

/// One alignment measurement from the speech/VAD bridge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignmentSample {
    /// Distance between the speech position and the reading marker. Positive
    /// when the view has to advance faster to reach the speech position.
    pub error_distance: f64,
    /// Aligner confidence in [0, 1].
    pub confidence: f64,
    pub timestamp_ms: u64,
}

impl AlignmentSample {
    pub fn new(error_distance: f64, confidence: f64, timestamp_ms: u64) -> Self {
        Self {
            error_distance,
            confidence,
            timestamp_ms,
        }
    }

    fn is_well_formed(&self) -> bool {
        self.error_distance.is_finite() && self.confidence.is_finite()
    }
}

/// Everything the governor mutates. Reset on every activation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GovernorState {
    pub base_speed: f64,
    pub current_velocity: f64,
    pub integrator: f64,
    pub manual_hold_until: Option<u64>,
    pub soft_start_until: Option<u64>,
    pub activated_at: Option<u64>,
    pub last_tick_ms: Option<u64>,
    pub last_sample: Option<AlignmentSample>,
}

/// PI speed controller with soft start, deadband, anti-windup and slew limiting.
#[derive(Debug)]
pub struct SpeedGovernor {
    config: GovernorConfig,
    state: GovernorState,
    active: bool,
    feedback: bool,
    diag_tx: Option<broadcast::Sender<GovernorDiagnostic>>,
}

impl SpeedGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            state: GovernorState::default(),
            active: false,
            feedback: false,
            diag_tx: None,
        }
    }

    /// Publish a [`GovernorDiagnostic`] on every tick.
    pub fn with_diagnostics(mut self, tx: broadcast::Sender<GovernorDiagnostic>) -> Self {
        self.diag_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn state(&self) -> &GovernorState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn velocity(&self) -> f64 {
        self.state.current_velocity
    }

    pub fn base_speed(&self) -> f64 {
        self.state.base_speed
    }

    /// Enable error feedback (hybrid) or run at fixed base speed (timed, wpm).
    pub fn set_feedback(&mut self, enabled: bool) {
        if self.feedback != enabled {
            self.state.integrator = 0.0;
        }
        self.feedback = enabled;
    }

    /// Start driving. Clears all loop history and begins the soft start.
    pub fn activate(&mut self, now_ms: u64) {
        let base_speed = self.state.base_speed;
        self.state = GovernorState {
            base_speed,
            soft_start_until: Some(now_ms + self.config.soft_start_ms),
            activated_at: Some(now_ms),
            last_tick_ms: Some(now_ms),
            ..GovernorState::default()
        };
        self.active = true;
        debug!(base_speed, "governor activated");
    }

    /// Stop driving. Velocity drops to zero and all windows are cancelled;
    /// only the base speed survives.
    pub fn deactivate(&mut self) {
        let base_speed = self.state.base_speed;
        self.state = GovernorState {
            base_speed,
            ..GovernorState::default()
        };
        if self.active {
            debug!("governor deactivated");
        }
        self.active = false;
    }

    /// Replace the base speed (timed setting, wpm estimate). Velocity follows
    /// through the slew limiter.
    pub fn set_base(&mut self, speed: f64) {
        if !speed.is_finite() || speed < 0.0 {
            trace!(speed, "ignoring invalid base speed");
            return;
        }
        self.state.base_speed = speed;
    }

    /// User-driven speed change: replaces the base speed and suspends
    /// adaptation for the debounce window. Velocity follows through the slew
    /// limiter like any other base change.
    pub fn on_manual_adjust(&mut self, speed: f64, now_ms: u64) {
        if !speed.is_finite() || speed < 0.0 {
            trace!(speed, "ignoring invalid manual speed");
            return;
        }
        self.state.base_speed = speed;
        self.state.integrator = 0.0;
        self.state.manual_hold_until = Some(now_ms + self.config.manual_debounce_ms);
        debug!(speed, "manual speed adjust");
    }

    pub fn on_speech_sample(&mut self, sample: AlignmentSample) {
        if !sample.is_well_formed() {
            trace!(?sample, "ignoring malformed alignment sample");
            return;
        }
        self.state.last_sample = Some(sample);
    }

    /// Advance one frame and return the velocity (px/s) to apply.
    pub fn tick(&mut self, now_ms: u64) -> f64 {
        if !self.active {
            self.state.current_velocity = 0.0;
            return 0.0;
        }

        let dt = self
            .state
            .last_tick_ms
            .map(|last| now_ms.saturating_sub(last) as f64 / 1000.0)
            .unwrap_or(0.0)
            .max(MIN_DT_SECS);
        self.state.last_tick_ms = Some(now_ms);

        let base = self.state.base_speed;
        let (phase, target, error) = self.step(now_ms, dt, base);

        if !self.state.current_velocity.is_finite() || !self.state.integrator.is_finite() {
            warn!("governor produced a non-finite state, resetting loop");
            self.state.current_velocity = 0.0;
            self.state.integrator = 0.0;
        }

        if let Some(tx) = &self.diag_tx {
            let _ = tx.send(GovernorDiagnostic {
                at_ms: now_ms,
                phase,
                base_speed: base,
                target,
                velocity: self.state.current_velocity,
                integrator: self.state.integrator,
                error,
            });
        }

        self.state.current_velocity
    }

    fn step(&mut self, now_ms: u64, dt: f64, base: f64) -> (GovernorPhase, f64, Option<f64>) {
        if let (Some(until), Some(start)) = (self.state.soft_start_until, self.state.activated_at)
        {
            if now_ms < until {
                let span = until.saturating_sub(start).max(1) as f64;
                let frac = (now_ms.saturating_sub(start) as f64 / span).clamp(0.0, 1.0);
                let velocity = base * ease_out_cubic(frac);
                self.state.current_velocity = velocity;
                return (GovernorPhase::Ramp, velocity, None);
            }
            // Ramp finished: hand over exactly at base speed.
            self.state.soft_start_until = None;
            self.state.current_velocity = base;
        }

        let (phase, target, error) = match self.eligible_sample(now_ms) {
            None => (GovernorPhase::Cruise, base, None),
            Some(sample) => {
                let error = sample.error_distance;
                if error.abs() <= self.config.deadband_px
                    || sample.confidence < self.config.min_confidence
                {
                    self.state.integrator *= self.config.integrator_decay;
                    (GovernorPhase::Hold, base, Some(error))
                } else {
                    let adjust = self.pi_adjust(error, dt);
                    (GovernorPhase::Adapt, base * (1.0 + adjust), Some(error))
                }
            }
        };

        // The bound scales with the current base, so after a large base drop
        // velocity comes down at the new, slower rate.
        let max_step = base * self.config.max_adjust_fraction * dt;
        let delta = (target - self.state.current_velocity).clamp(-max_step, max_step);
        self.state.current_velocity += delta;
        (phase, target, error)
    }

    fn pi_adjust(&mut self, error: f64, dt: f64) -> f64 {
        let sign = if error > 0.0 { 1.0 } else { -1.0 };
        self.state.integrator += sign * self.config.ki * dt;
        let raw = sign * self.config.kp + self.state.integrator;
        let max = self.config.max_adjust_fraction;
        let clamped = raw.clamp(-max, max);
        if clamped != raw {
            self.state.integrator *= self.config.windup_decay;
        }
        clamped
    }

    fn eligible_sample(&self, now_ms: u64) -> Option<AlignmentSample> {
        if !self.feedback {
            return None;
        }
        if let Some(hold) = self.state.manual_hold_until {
            if now_ms < hold {
                return None;
            }
        }
        self.state.last_sample.filter(|s| {
            now_ms.saturating_sub(s.timestamp_ms) <= self.config.sample_freshness_ms
        })
    }
}

fn ease_out_cubic(t: f64) -> f64 {
    1.0 - (1.0 - t).powi(3)
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;

    const FRAME_MS: u64 = 16;

    fn governor(base: f64) -> SpeedGovernor {
        let mut g = SpeedGovernor::new(GovernorConfig::default());
        g.set_base(base);
        g.set_feedback(true);
        g
    }

    /// Activate at 0 and run past the soft start.
    fn cruising(base: f64) -> (SpeedGovernor, u64) {
        let mut g = governor(base);
        g.activate(0);
        let mut now = 0;
        while now < 1_200 {
            now += FRAME_MS;
            g.tick(now);
        }
        (g, now)
    }

    #[test]
    fn inactive_governor_reports_zero() {
        let mut g = governor(100.0);
        assert_eq!(g.tick(1_000), 0.0);
    }

    #[test]
    fn soft_start_ramps_from_zero_to_base() {
        let mut g = governor(100.0);
        g.activate(0);
        assert_eq!(g.tick(0), 0.0);

        let mid = g.tick(600);
        assert_relative_eq!(mid, 100.0 * 0.875, epsilon = 1e-9);

        let end = g.tick(1_200);
        assert_relative_eq!(end, 100.0, epsilon = 1e-6);
    }

    #[test]
    fn soft_start_ignores_feedback() {
        let mut g = governor(100.0);
        g.activate(0);
        g.on_speech_sample(AlignmentSample::new(500.0, 1.0, 300));
        g.tick(300);
        assert_eq!(g.state().integrator, 0.0);
    }

    #[test]
    fn deadband_only_decays_integrator() {
        let (mut g, mut now) = cruising(100.0);

        // Build up some integral with a large error first.
        for _ in 0..10 {
            now += FRAME_MS;
            g.on_speech_sample(AlignmentSample::new(80.0, 0.9, now));
            g.tick(now);
        }
        let before = g.state().integrator;
        assert!(before > 0.0);

        for error in [14.0, -14.0, 3.0, 0.0] {
            now += FRAME_MS;
            let prior = g.state().integrator;
            g.on_speech_sample(AlignmentSample::new(error, 0.9, now));
            g.tick(now);
            assert_relative_eq!(g.state().integrator, prior * 0.96, epsilon = 1e-12);
        }
    }

    #[test]
    fn low_confidence_sample_is_treated_like_deadband() {
        let (mut g, mut now) = cruising(100.0);
        now += FRAME_MS;
        g.on_speech_sample(AlignmentSample::new(200.0, 0.39, now));
        g.tick(now);
        assert_eq!(g.state().integrator, 0.0);
        assert_relative_eq!(g.velocity(), 100.0, epsilon = 1e-9);
    }

    #[test]
    fn velocity_respects_slew_bound() {
        let (mut g, mut now) = cruising(100.0);
        let mut prev = g.velocity();
        for i in 0..200u64 {
            now += FRAME_MS;
            let error = if (i / 40) % 2 == 0 { 400.0 } else { -400.0 };
            g.on_speech_sample(AlignmentSample::new(error, 1.0, now));
            let v = g.tick(now);
            let bound = 100.0 * 0.18 * (FRAME_MS as f64 / 1000.0);
            assert!((v - prev).abs() <= bound + 1e-9, "jump {} > {}", (v - prev).abs(), bound);
            prev = v;
        }
    }

    #[test]
    fn positive_error_speeds_up_within_clamp() {
        let (mut g, mut now) = cruising(100.0);
        for _ in 0..600 {
            now += FRAME_MS;
            g.on_speech_sample(AlignmentSample::new(120.0, 1.0, now));
            g.tick(now);
        }
        let v = g.velocity();
        assert!(v > 100.0);
        assert!(v <= 118.0 + 1e-9, "velocity {v} exceeds clamp");
        assert!(g.state().integrator <= 0.18);
    }

    #[test]
    fn stale_sample_is_not_used() {
        let (mut g, now) = cruising(100.0);
        g.on_speech_sample(AlignmentSample::new(300.0, 1.0, now));
        let later = now + 351;
        g.tick(later);
        assert_eq!(g.state().integrator, 0.0);
    }

    #[test]
    fn manual_adjust_resets_and_debounces() {
        let (mut g, mut now) = cruising(100.0);
        for _ in 0..20 {
            now += FRAME_MS;
            g.on_speech_sample(AlignmentSample::new(200.0, 1.0, now));
            g.tick(now);
        }
        assert!(g.state().integrator > 0.0);

        let before = g.velocity();
        g.on_manual_adjust(150.0, now);
        assert_eq!(g.base_speed(), 150.0);
        assert_eq!(g.state().integrator, 0.0);
        assert_eq!(g.state().manual_hold_until, Some(now + 1_500));
        assert_eq!(g.velocity(), before);

        // Fresh, large errors during the debounce window are ignored; velocity
        // only climbs toward the new base.
        let hold_end = now + 1_500;
        let mut prev = before;
        while now + FRAME_MS < hold_end {
            now += FRAME_MS;
            g.on_speech_sample(AlignmentSample::new(300.0, 1.0, now));
            let v = g.tick(now);
            assert_eq!(g.state().integrator, 0.0);
            assert!(v >= prev && v <= 150.0 + 1e-9, "velocity {v} after {prev}");
            prev = v;
        }

        now = hold_end;
        g.on_speech_sample(AlignmentSample::new(300.0, 1.0, now));
        g.tick(now);
        assert!(g.state().integrator > 0.0);
    }

    #[test]
    fn malformed_samples_are_ignored() {
        let (mut g, now) = cruising(100.0);
        g.on_speech_sample(AlignmentSample::new(f64::NAN, 1.0, now));
        g.on_speech_sample(AlignmentSample::new(50.0, f64::INFINITY, now));
        assert_eq!(g.state().last_sample, None);
    }

    #[test]
    fn deactivate_zeroes_velocity_and_clears_history() {
        let (mut g, mut now) = cruising(100.0);
        now += FRAME_MS;
        g.on_speech_sample(AlignmentSample::new(200.0, 1.0, now));
        g.tick(now);

        g.deactivate();
        assert_eq!(g.velocity(), 0.0);
        assert_eq!(g.state().integrator, 0.0);
        assert_eq!(g.state().last_sample, None);
        assert_eq!(g.base_speed(), 100.0);
        assert_eq!(g.tick(now + FRAME_MS), 0.0);
    }

    #[test]
    fn base_change_is_slew_limited() {
        let (mut g, mut now) = cruising(100.0);
        g.set_feedback(false);
        g.set_base(200.0);
        now += 100;
        let v = g.tick(now);
        assert_relative_eq!(v, 100.0 + 200.0 * 0.18 * 0.1, epsilon = 1e-9);
    }

    #[test]
    fn manual_adjust_is_slew_limited() {
        let (mut g, mut now) = cruising(100.0);
        let before = g.velocity();
        g.on_manual_adjust(200.0, now);

        let bound = 200.0 * 0.18 * (FRAME_MS as f64 / 1000.0);
        let mut prev = before;
        for _ in 0..60 {
            now += FRAME_MS;
            let v = g.tick(now);
            assert!(v > prev, "velocity stalled at {v}");
            assert!(v - prev <= bound + 1e-9, "jump {} > {}", v - prev, bound);
            prev = v;
        }
        assert!(prev < 200.0);
    }

    #[test]
    fn manual_adjust_during_soft_start_keeps_the_ramp() {
        let mut g = governor(100.0);
        g.activate(0);
        g.tick(300);
        g.on_manual_adjust(200.0, 300);
        assert_eq!(g.state().soft_start_until, Some(1_200));

        let end = g.tick(1_200);
        assert_relative_eq!(end, 200.0, epsilon = 1e-9);
    }

    #[test]
    fn base_drop_descends_at_the_new_base_rate() {
        let (mut g, mut now) = cruising(300.0);
        g.set_feedback(false);
        g.set_base(30.0);

        now += FRAME_MS;
        let v = g.tick(now);
        assert_relative_eq!(v, 300.0 - 30.0 * 0.18 * 0.016, epsilon = 1e-9);

        // 270 px/s at 0.54 px/s per second takes far longer than a second.
        for _ in 0..62 {
            now += FRAME_MS;
            g.tick(now);
        }
        assert!(g.velocity() > 290.0);
    }

    #[test]
    fn diagnostics_are_published_per_tick() {
        let (tx, mut rx) = broadcast::channel(16);
        let mut g = governor(100.0).with_diagnostics(tx);
        g.activate(0);
        g.tick(100);
        let diag = rx.try_recv().expect("diagnostic");
        assert_eq!(diag.phase, GovernorPhase::Ramp);
        assert_eq!(diag.at_ms, 100);
    }
}
