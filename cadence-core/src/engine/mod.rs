//! `CadenceEngine`: the mode router.
//!
//! Owns the governor, the matcher and the scheduler, and decides per mode
//! which of them may move the view.
//!
//! ## Frame
//!
//! ```text
//! frame()
//!   ├─► drain queued speech input   (fragments, samples, voice, pacing)
//!   ├─► matcher.poll()              (stats flush, idle rescue → tween)
//!   ├─► governor.tick()             → velocity
//!   ├─► manual write this frame? ── yes ──► no continuous output
//!   │        │ no
//!   │   tween running? ── yes ──► request_write(tween step)
//!   │        │ no
//!   │   request_scroll_by(velocity · dt)
//!   └─► scheduler.flush()           (at most one physical write)
//! ```
//!
//! ## Transitions
//!
//! `set_mode(next)` is a no-op when `next` is already active. Otherwise the
//! governor is deactivated (velocity 0), the tween and any pending write are
//! dropped, matcher history is reset when asr/hybrid is left or entered, and
//! only then are the sub-engines of `next` enabled. A mode whose input is
//! missing (asr without a script, wpm without an estimate) still becomes
//! active; it holds position or runs at the default speed until the input
//! arrives.

pub mod bridge;
pub mod layout;
pub mod mode;
pub mod tween;

pub use bridge::{SharedEngine, SpeechInput};
pub use layout::{LineBox, LineLayout};
pub use mode::{GovernorRole, MatcherRole, ModeProfile, ScrollMode, StepRole};
pub use tween::LineTween;

use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::{
    clock::Clock,
    config::{EngineConfig, RouterConfig},
    governor::{AlignmentSample, SpeedGovernor},
    ipc::events::{CommitEvent, GovernorDiagnostic, MatcherEvent, ModeChangedEvent},
    matcher::{AlignmentMatcher, MatchOutcome},
    scheduler::{ScrollScheduler, ScrollSurface, SurfaceMetrics},
    script::Script,
};

use bridge::SpeechBridge;

/// Broadcast channel capacity: 256 events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// Words per line assumed for the wpm conversion when the script has no
/// spoken lines.
const FALLBACK_WORDS_PER_LINE: f64 = 8.0;

/// Manual navigation command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepCommand {
    /// Move the marker by whole lines.
    Line(i32),
    /// Move by `page_fraction` of the viewport.
    Page(i32),
}

/// Where a one-off jump should land.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScrollTarget {
    Offset(f64),
    /// Center this line under the reading marker.
    Line(usize),
}

/// What one call to [`CadenceEngine::frame`] did.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameReport {
    pub at_ms: u64,
    pub mode: ScrollMode,
    pub velocity: f64,
    /// Offset physically written this frame, if any.
    pub written: Option<f64>,
}

/// The scroll synchronization engine.
///
/// Single-threaded: the host calls [`Self::frame`] once per render frame.
/// Wrap in a [`SharedEngine`] when speech callbacks need to reach it from
/// another thread, or feed them through [`Self::speech_sender`].
pub struct CadenceEngine {
    config: RouterConfig,
    clock: Box<dyn Clock>,
    mode: ScrollMode,
    governor: SpeedGovernor,
    matcher: AlignmentMatcher,
    scheduler: ScrollScheduler,
    layout: Option<LineLayout>,
    tween: Option<LineTween>,
    voice_active: bool,
    pacing_wpm: Option<f64>,
    /// Last absolute speed chosen by the presenter.
    manual_speed: Option<f64>,
    /// A manual write was requested since the last frame.
    manual_write: bool,
    last_frame_ms: Option<u64>,
    /// Monotonically increasing mode change counter.
    seq: u64,
    mode_tx: broadcast::Sender<ModeChangedEvent>,
    governor_tx: broadcast::Sender<GovernorDiagnostic>,
    speech: SpeechBridge,
}

impl CadenceEngine {
    /// Create an engine in `initial` mode. No surface and no script are
    /// attached yet; no mode change event fires for the initial mode.
    pub fn new<C: Clock>(config: EngineConfig, initial: ScrollMode, clock: C) -> Self {
        let (mode_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (governor_tx, _) = broadcast::channel(BROADCAST_CAP);
        let EngineConfig {
            governor,
            matcher,
            router,
        } = config;

        let mut governor = SpeedGovernor::new(governor).with_diagnostics(governor_tx.clone());
        governor.set_base(router.default_speed);

        let mut engine = Self {
            config: router,
            clock: Box::new(clock),
            mode: initial,
            governor,
            matcher: AlignmentMatcher::new(matcher, Script::default()),
            scheduler: ScrollScheduler::new(),
            layout: None,
            tween: None,
            voice_active: false,
            pacing_wpm: None,
            manual_speed: None,
            manual_write: false,
            last_frame_ms: None,
            seq: 0,
            mode_tx,
            governor_tx,
            speech: SpeechBridge::new(),
        };
        let now = engine.clock.now_ms();
        engine.enable(initial, now);
        info!(mode = %initial, "cadence engine ready");
        engine
    }

    /// Move into an [`Arc`]/[`Mutex`] handle for cross-thread use.
    pub fn into_shared(self) -> SharedEngine {
        Arc::new(Mutex::new(self))
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn mode(&self) -> ScrollMode {
        self.mode
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Current governor output in px/s (0 whenever the governor is off).
    pub fn velocity(&self) -> f64 {
        self.governor.velocity()
    }

    pub fn governor(&self) -> &SpeedGovernor {
        &self.governor
    }

    pub fn matcher(&self) -> &AlignmentMatcher {
        &self.matcher
    }

    pub fn scheduler(&self) -> &ScrollScheduler {
        &self.scheduler
    }

    pub fn script(&self) -> &Script {
        self.matcher.script()
    }

    pub fn layout(&self) -> Option<&LineLayout> {
        self.layout.as_ref()
    }

    pub fn tween(&self) -> Option<&LineTween> {
        self.tween.as_ref()
    }

    pub fn voice_active(&self) -> bool {
        self.voice_active
    }

    /// Number of continuous engines currently moving the view. Never above 1.
    pub fn driving_engines(&self) -> usize {
        let governor = usize::from(self.governor.is_active());
        let matcher = usize::from(
            self.mode.profile().matcher == MatcherRole::Driver && self.matcher.is_operational(),
        );
        governor + matcher
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    pub fn subscribe_modes(&self) -> broadcast::Receiver<ModeChangedEvent> {
        self.mode_tx.subscribe()
    }

    pub fn subscribe_governor(&self) -> broadcast::Receiver<GovernorDiagnostic> {
        self.governor_tx.subscribe()
    }

    pub fn subscribe_matcher(&self) -> broadcast::Receiver<MatcherEvent> {
        self.matcher.subscribe()
    }

    // -----------------------------------------------------------------------
    // Host wiring
    // -----------------------------------------------------------------------

    pub fn attach_surface<S: ScrollSurface>(&mut self, surface: S) {
        self.scheduler.attach(Box::new(surface));
        debug!("scroll surface attached");
    }

    /// Detach the surface. Pending output is dropped; the engine keeps
    /// running but writes nothing until a surface is attached again.
    pub fn detach_surface(&mut self) -> Option<Box<dyn ScrollSurface>> {
        self.tween = None;
        self.scheduler.cancel();
        self.scheduler.detach()
    }

    /// Replace the script. Matcher history restarts at line 0.
    pub fn set_script(&mut self, script: Script) {
        let now = self.clock.now_ms();
        self.tween = None;
        self.matcher.set_script(script, now);
        if self.mode.profile().governor == GovernorRole::Paced {
            self.refresh_paced_base(now);
        }
        info!(lines = self.matcher.script().len(), "script loaded");
    }

    /// Install measured line geometry. A running tween is re-aimed at the
    /// new position of its line.
    pub fn set_line_layout(&mut self, layout: LineLayout) {
        self.layout = (!layout.is_empty()).then_some(layout);
        if let (Some(tween), Some(metrics)) = (self.tween, self.scheduler.metrics()) {
            let target = metrics.clamp(self.center_offset(tween.line, &metrics));
            self.tween = Some(LineTween::new(tween.line, target));
        }
        if self.mode.profile().governor == GovernorRole::Paced {
            let now = self.clock.now_ms();
            self.refresh_paced_base(now);
        }
    }

    // -----------------------------------------------------------------------
    // Mode transitions
    // -----------------------------------------------------------------------

    /// Switch the driving strategy. Returns `false` if `next` was already
    /// active.
    pub fn set_mode(&mut self, next: ScrollMode) -> bool {
        if next == self.mode {
            trace!(mode = %next, "mode unchanged");
            return false;
        }
        let now = self.clock.now_ms();
        let previous = self.mode;

        self.governor.deactivate();
        self.governor.set_feedback(false);
        self.tween = None;
        self.scheduler.cancel();
        if previous.uses_matcher() || next.uses_matcher() {
            self.matcher.disable(now);
        }

        self.mode = next;
        self.enable(next, now);

        self.seq += 1;
        let _ = self.mode_tx.send(ModeChangedEvent {
            seq: self.seq,
            previous,
            mode: next,
            at_ms: now,
        });
        info!(%previous, mode = %next, "scroll mode changed");
        true
    }

    fn enable(&mut self, mode: ScrollMode, now: u64) {
        let profile = mode.profile();
        match profile.governor {
            GovernorRole::Fixed => {
                let speed = self.manual_speed.unwrap_or(self.config.default_speed);
                self.governor.set_base(speed);
                self.governor.activate(now);
            }
            GovernorRole::Paced => {
                let speed = match self.pacing_speed() {
                    Some(speed) => speed,
                    None => {
                        warn!("wpm mode without a pacing estimate; using the default speed");
                        self.config.default_speed
                    }
                };
                self.governor.set_base(speed);
                self.governor.activate(now);
            }
            GovernorRole::Adaptive => {
                let speed = self
                    .manual_speed
                    .or_else(|| self.pacing_speed())
                    .unwrap_or(self.config.default_speed);
                self.governor.set_base(speed);
                self.governor.set_feedback(true);
                if self.voice_active {
                    self.governor.activate(now);
                } else {
                    debug!("hybrid waiting for voice activity");
                }
            }
            GovernorRole::ForcedZero | GovernorRole::Off => {}
        }

        let wants_matcher = match profile.matcher {
            MatcherRole::Driver => true,
            MatcherRole::Observer => self.config.hybrid_matcher_feedback,
            MatcherRole::Off => false,
        };
        if wants_matcher {
            if self.matcher.enable(now) {
                if let Some(metrics) = self.scheduler.metrics() {
                    let line = self.line_under_marker(metrics.scroll_top, &metrics);
                    self.matcher.reanchor(line, now);
                }
            } else {
                warn!(%mode, "no script loaded; holding position until one arrives");
            }
        }

        debug_assert!(self.driving_engines() <= 1, "two engines driving in {mode}");
    }

    // -----------------------------------------------------------------------
    // Inputs
    // -----------------------------------------------------------------------

    /// Voice activity from the VAD. In hybrid, silence parks the view and
    /// speech restarts the governor with a fresh soft start.
    pub fn on_voice_activity(&mut self, active: bool) {
        if self.voice_active == active {
            return;
        }
        self.voice_active = active;
        if self.mode.profile().governor != GovernorRole::Adaptive {
            return;
        }
        if active {
            let now = self.clock.now_ms();
            self.governor.activate(now);
            debug!("voice resumed; governor soft start");
        } else {
            self.governor.deactivate();
            self.scheduler.cancel();
            debug!("voice inactive; holding position");
        }
    }

    /// Words-per-minute estimate from the pacing analyzer.
    pub fn on_pacing_estimate(&mut self, wpm: f64) {
        if !wpm.is_finite() || wpm <= 0.0 {
            trace!(wpm, "ignoring invalid pacing estimate");
            return;
        }
        self.pacing_wpm = Some(wpm);
        let now = self.clock.now_ms();
        match self.mode.profile().governor {
            GovernorRole::Paced => self.refresh_paced_base(now),
            GovernorRole::Adaptive if self.manual_speed.is_none() => self.refresh_paced_base(now),
            _ => {}
        }
    }

    pub fn on_speech_sample(&mut self, sample: AlignmentSample) {
        if self.mode.profile().governor != GovernorRole::Adaptive {
            trace!(mode = %self.mode, "alignment sample outside hybrid ignored");
            return;
        }
        self.governor.on_speech_sample(sample);
    }

    /// Single entry point for transcript fragments.
    pub fn on_fragment(&mut self, text: &str, is_final: bool, confidence: f64) -> MatchOutcome {
        let now = self.clock.now_ms();
        let outcome = self.matcher.on_fragment(text, is_final, confidence, now);
        if let Some(commit) = outcome.commit() {
            self.apply_commit(commit, now);
        }
        outcome
    }

    /// Presenter-confirmed position ("I'm on this line"). Forward-only.
    pub fn commit_line(&mut self, index: usize) -> MatchOutcome {
        let now = self.clock.now_ms();
        let outcome = self.matcher.commit_index(index, 1.0, now);
        if let Some(commit) = outcome.commit() {
            self.apply_commit(commit, now);
        }
        outcome
    }

    /// Absolute speed chosen by the presenter. Replaces the base speed at once
    /// and suspends adaptation for the debounce window; velocity follows under
    /// the governor's slew limit.
    pub fn set_manual_speed(&mut self, speed: f64) {
        if !speed.is_finite() || speed < 0.0 {
            trace!(speed, "ignoring invalid manual speed");
            return;
        }
        let speed = speed.min(self.config.max_speed);
        let now = self.clock.now_ms();
        self.manual_speed = Some(speed);
        self.governor.on_manual_adjust(speed, now);
    }

    /// Relative speed change on top of the current base speed.
    pub fn nudge_speed(&mut self, delta: f64) {
        if !delta.is_finite() {
            trace!(delta, "ignoring invalid speed nudge");
            return;
        }
        let speed = (self.governor.base_speed() + delta).clamp(0.0, self.config.max_speed);
        self.set_manual_speed(speed);
    }

    /// Manual line or page step. Returns whether a write was requested.
    pub fn step(&mut self, command: StepCommand) -> bool {
        if self.mode.profile().step == StepRole::Off {
            debug!(mode = %self.mode, ?command, "step ignored");
            return false;
        }
        let Some(metrics) = self.scheduler.metrics() else {
            debug!(?command, "step without a scroll surface");
            return false;
        };
        let from = self
            .scheduler
            .pending()
            .map(|p| metrics.clamp(p.offset))
            .unwrap_or(metrics.scroll_top);

        let target = match command {
            StepCommand::Line(delta) => {
                let current = self.line_under_marker(from, &metrics) as i64;
                let mut line = (current + i64::from(delta)).max(0) as usize;
                if let Some(last) = self.line_count().checked_sub(1) {
                    line = line.min(last);
                }
                self.center_offset(line, &metrics)
            }
            StepCommand::Page(pages) => {
                from + f64::from(pages) * metrics.viewport_height * self.config.page_fraction
            }
        };
        let now = self.clock.now_ms();
        self.manual_write(metrics.clamp(target), &metrics, now);
        true
    }

    /// One-off jump (search result, outline click). Blocked in rehearsal.
    pub fn jump_to(&mut self, target: ScrollTarget) -> bool {
        if !self.mode.profile().programmatic_writes {
            debug!(mode = %self.mode, ?target, "jump ignored");
            return false;
        }
        let Some(metrics) = self.scheduler.metrics() else {
            debug!(?target, "jump without a scroll surface");
            return false;
        };
        let offset = match target {
            ScrollTarget::Offset(offset) if offset.is_finite() => offset,
            ScrollTarget::Offset(offset) => {
                trace!(offset, "ignoring non-finite jump");
                return false;
            }
            ScrollTarget::Line(line) => self.center_offset(line, &metrics),
        };
        let now = self.clock.now_ms();
        self.manual_write(metrics.clamp(offset), &metrics, now);
        true
    }

    /// The presenter scrolled the surface directly (wheel, touch, scrollbar).
    pub fn on_user_scroll(&mut self) {
        self.tween = None;
        self.scheduler.cancel();
        let Some(metrics) = self.scheduler.metrics() else {
            return;
        };
        if self.matcher.is_operational() {
            let now = self.clock.now_ms();
            let line = self.line_under_marker(metrics.scroll_top, &metrics);
            self.matcher.reanchor(line, now);
        }
    }

    // -----------------------------------------------------------------------
    // Speech bridge
    // -----------------------------------------------------------------------

    /// Sender for producers on other threads.
    pub fn speech_sender(&self) -> Sender<SpeechInput> {
        self.speech.sender()
    }

    /// Apply everything queued on the speech bridge. Returns the count.
    pub fn drain_speech(&mut self) -> usize {
        let inputs = self.speech.take_pending();
        let count = inputs.len();
        for input in inputs {
            match input {
                SpeechInput::Fragment {
                    text,
                    is_final,
                    confidence,
                } => {
                    self.on_fragment(&text, is_final, confidence);
                }
                SpeechInput::Sample(sample) => self.on_speech_sample(sample),
                SpeechInput::VoiceActivity(active) => self.on_voice_activity(active),
                SpeechInput::Pacing(wpm) => self.on_pacing_estimate(wpm),
            }
        }
        count
    }

    // -----------------------------------------------------------------------
    // Frame
    // -----------------------------------------------------------------------

    /// Per-frame callback. Performs at most one physical scroll write.
    pub fn frame(&mut self) -> FrameReport {
        let now = self.clock.now_ms();
        self.drain_speech();

        let dt_secs = self
            .last_frame_ms
            .map(|last| now.saturating_sub(last) as f64 / 1000.0)
            .unwrap_or(0.0);
        self.last_frame_ms = Some(now);

        if let Some(rescue) = self.matcher.poll(now) {
            self.apply_commit(&rescue, now);
        }

        let velocity = self.governor.tick(now);
        let profile = self.mode.profile();
        if !profile.programmatic_writes {
            self.scheduler.cancel();
        } else if self.manual_write {
            trace!("manual write this frame; continuous output suppressed");
        } else if profile.continuous_writes {
            self.continuous_output(velocity, dt_secs, now);
        }
        self.manual_write = false;

        let written = self.scheduler.flush();
        FrameReport {
            at_ms: now,
            mode: self.mode,
            velocity,
            written,
        }
    }

    fn continuous_output(&mut self, velocity: f64, dt_secs: f64, now: u64) {
        if let Some(mut tween) = self.tween.take() {
            let Some(metrics) = self.scheduler.metrics() else {
                return;
            };
            let step = tween.advance(
                metrics.scroll_top,
                self.config.tween_factor,
                self.config.tween_snap_px,
            );
            self.scheduler.request_write(step.offset, now);
            if step.done {
                trace!(line = tween.line, steps = tween.steps(), "line tween finished");
                self.matcher.record_tween_steps(tween.steps());
            } else {
                self.tween = Some(tween);
            }
            return;
        }
        if velocity > 0.0 && dt_secs > 0.0 {
            self.scheduler.request_scroll_by(velocity * dt_secs, now);
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn apply_commit(&mut self, commit: &CommitEvent, now: u64) {
        let Some(metrics) = self.scheduler.metrics() else {
            debug!(index = commit.index, "commit without a scroll surface");
            return;
        };
        match self.mode.profile().matcher {
            MatcherRole::Driver => {
                if let Some(previous) = self.tween.take() {
                    if previous.steps() > 0 {
                        self.matcher.record_tween_steps(previous.steps());
                    }
                }
                let target = metrics.clamp(self.center_offset(commit.index, &metrics));
                self.tween = Some(LineTween::new(commit.index, target));
                debug!(index = commit.index, target, "centering committed line");
            }
            MatcherRole::Observer => {
                let error = self.center_offset(commit.index, &metrics) - metrics.scroll_top;
                self.governor
                    .on_speech_sample(AlignmentSample::new(error, commit.score, now));
                trace!(index = commit.index, error, "commit fed to governor");
            }
            MatcherRole::Off => {}
        }
    }

    fn manual_write(&mut self, offset: f64, metrics: &SurfaceMetrics, now: u64) {
        self.scheduler.request_write(offset, now);
        self.manual_write = true;
        self.tween = None;
        if self.matcher.is_operational() {
            let line = self.line_under_marker(offset, metrics);
            self.matcher.reanchor(line, now);
        }
    }

    fn refresh_paced_base(&mut self, now: u64) {
        let in_manual_hold = self
            .governor
            .state()
            .manual_hold_until
            .is_some_and(|until| now < until);
        if in_manual_hold {
            return;
        }
        if let Some(speed) = self.pacing_speed() {
            self.governor.set_base(speed);
            trace!(speed, "base speed from pacing estimate");
        }
    }

    /// `wpm / 60 / words_per_line * line_height`, capped at `max_speed`.
    fn pacing_speed(&self) -> Option<f64> {
        let wpm = self.pacing_wpm?;
        let words_per_line = self
            .matcher
            .script()
            .avg_words_per_line()
            .unwrap_or(FALLBACK_WORDS_PER_LINE);
        let line_height = self
            .layout
            .as_ref()
            .and_then(|l| l.avg_line_height())
            .unwrap_or(self.config.line_height);
        Some((wpm / 60.0 / words_per_line * line_height).clamp(0.0, self.config.max_speed))
    }

    fn line_count(&self) -> usize {
        match &self.layout {
            Some(layout) => layout.len(),
            None => self.matcher.script().len(),
        }
    }

    fn line_box(&self, index: usize) -> LineBox {
        self.layout
            .as_ref()
            .and_then(|l| l.line_box(index))
            .unwrap_or(LineBox {
                top: index as f64 * self.config.line_height,
                height: self.config.line_height,
            })
    }

    /// Scroll offset that puts the centre of `index` on the reading marker.
    fn center_offset(&self, index: usize, metrics: &SurfaceMetrics) -> f64 {
        self.line_box(index).center() - metrics.viewport_height * self.config.marker_ratio
    }

    /// Line under the reading marker when scrolled to `scroll_top`.
    fn line_under_marker(&self, scroll_top: f64, metrics: &SurfaceMetrics) -> usize {
        let marker = scroll_top + metrics.viewport_height * self.config.marker_ratio;
        let line = match &self.layout {
            Some(layout) => layout.line_at(marker).unwrap_or(0),
            None if self.config.line_height > 0.0 => {
                (marker.max(0.0) / self.config.line_height).floor() as usize
            }
            None => 0,
        };
        match self.line_count().checked_sub(1) {
            Some(last) => line.min(last),
            None => line,
        }
    }
}

impl std::fmt::Debug for CadenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CadenceEngine")
            .field("mode", &self.mode)
            .field("velocity", &self.governor.velocity())
            .field("matcher_index", &self.matcher.current_index())
            .field("voice_active", &self.voice_active)
            .field("has_surface", &self.scheduler.has_surface())
            .finish_non_exhaustive()
    }
}
