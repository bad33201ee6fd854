//! Alignment matcher: transcript fragments → committed script lines.
//!
//! ## Commit gating (in order)
//!
//! ```text
//! best candidate in window (score ≥ min_score)
//!   1. freeze window          → Suppressed(Freeze)
//!   2. monotonicity           → Suppressed(Backwards)
//!   3. leap gate              → Suppressed(Leap) | Deferred(LeapPending)
//!   4. duplicate / low gain   → Suppressed(Duplicate)
//!   5. low-score corroboration→ Deferred(AwaitingCorroboration)
//!   6. silent-line skip
//!   → commit
//! ```
//!
//! After a commit the matcher rests past any silent lines that follow the
//! committed one; the committed line itself stays in the window.
//!
//! Rescue paths (idle, stuck, weak final) submit their candidates through the
//! same pipeline; they never commit around it.
//!
//! Fragments can arrive at any time relative to frames. All windows are
//! deadlines on the caller-supplied clock, so back-to-back calls are safe.

pub mod scoring;
pub mod state;
pub mod telemetry;

use std::collections::BTreeSet;

use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::config::MatcherConfig;
use crate::ipc::events::{
    CommitEvent, CommitOrigin, MatcherEvent, MatcherStats, RescueEvent, RescueReason,
    SuppressionCounts,
};
use crate::script::{tokenize, Script};

use scoring::{best_candidate, coverage, MatchWindow};
use state::{CommitState, PendingCandidate};
use telemetry::MatcherTelemetry;

pub use telemetry::SuppressReason;

/// Broadcast channel capacity for matcher events.
const EVENT_CAP: usize = 256;

/// Why a candidate is being held back for another observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    LeapPending,
    AwaitingCorroboration,
}

/// Result of offering a candidate to the matcher.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// Matcher disabled, no corpus, or malformed/empty input.
    Ignored,
    Committed(CommitEvent),
    Deferred(DeferReason),
    Suppressed(SuppressReason),
}

impl MatchOutcome {
    pub fn commit(&self) -> Option<&CommitEvent> {
        match self {
            MatchOutcome::Committed(event) => Some(event),
            _ => None,
        }
    }
}

/// Maps streaming transcript fragments onto script lines.
pub struct AlignmentMatcher {
    config: MatcherConfig,
    script: Script,
    enabled: bool,
    state: CommitState,
    telemetry: MatcherTelemetry,
    seq: u64,
    events_tx: broadcast::Sender<MatcherEvent>,
}

impl AlignmentMatcher {
    pub fn new(config: MatcherConfig, script: Script) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAP);
        let telemetry = MatcherTelemetry::new(config.stats_interval_ms, 0);
        Self {
            config,
            script,
            enabled: false,
            state: CommitState::default(),
            telemetry,
            seq: 0,
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MatcherEvent> {
        self.events_tx.subscribe()
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn state(&self) -> &CommitState {
        &self.state
    }

    /// Suppressions (and deferrals) counted since the last stats flush.
    pub fn suppression_counts(&self) -> SuppressionCounts {
        self.telemetry.suppressed()
    }

    pub fn current_index(&self) -> usize {
        self.state.current_index
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enabled and holding a corpus to match against.
    pub fn is_operational(&self) -> bool {
        self.enabled && !self.script.is_empty()
    }

    /// Replace the corpus. Commit history refers to the old corpus and is
    /// dropped.
    pub fn set_script(&mut self, script: Script, now_ms: u64) {
        self.script = script;
        self.state = CommitState::starting_at(0, now_ms);
        if self.enabled && self.script.is_empty() {
            warn!("matcher enabled without a script; idle until one is supplied");
        }
    }

    /// Start matching from line 0 with fresh state.
    ///
    /// Returns whether the matcher can actually operate; without a corpus it
    /// stays a no-op until [`Self::set_script`] supplies one.
    pub fn enable(&mut self, now_ms: u64) -> bool {
        self.enabled = true;
        self.state = CommitState::starting_at(0, now_ms);
        self.telemetry.reset(now_ms);
        if self.script.is_empty() {
            warn!("matcher enabled without a script; idle until one is supplied");
            return false;
        }
        debug!(lines = self.script.len(), "matcher enabled");
        true
    }

    /// Stop matching. The partial telemetry window is published; all state
    /// and pending windows are discarded.
    pub fn disable(&mut self, now_ms: u64) {
        if self.enabled {
            if let Some(stats) = self.telemetry.flush_partial(now_ms) {
                self.publish_stats(stats);
            }
            debug!(index = self.state.current_index, "matcher disabled");
        }
        self.enabled = false;
        self.state = CommitState::default();
        self.telemetry.reset(0);
    }

    /// Move the window to `index` without committing (manual scroll or step).
    ///
    /// This is the only way `current_index` moves backwards. The next
    /// observation of the anchor line bypasses duplicate suppression.
    pub fn reanchor(&mut self, index: usize, now_ms: u64) {
        if !self.is_operational() {
            return;
        }
        let index = index.min(self.script.len() - 1);
        self.state = CommitState {
            nudge_pending: true,
            ..CommitState::starting_at(index, now_ms)
        };
        debug!(index, "matcher re-anchored");
    }

    /// Record the step count of a finished line tween for telemetry.
    pub fn record_tween_steps(&mut self, steps: u32) {
        self.telemetry.record_tween(steps);
    }

    /// Ingest one transcript fragment.
    pub fn on_fragment(
        &mut self,
        text: &str,
        is_final: bool,
        confidence: f64,
        now_ms: u64,
    ) -> MatchOutcome {
        if !self.is_operational() {
            return MatchOutcome::Ignored;
        }
        if !confidence.is_finite() {
            trace!(confidence, "ignoring fragment with non-finite confidence");
            return MatchOutcome::Ignored;
        }
        let confidence = confidence.clamp(0.0, 1.0);
        let tokens: BTreeSet<String> = tokenize(text).collect();
        if tokens.is_empty() {
            return MatchOutcome::Ignored;
        }
        self.state.fragments_since_commit = self.state.fragments_since_commit.saturating_add(1);

        let window = MatchWindow::new(
            self.state.current_index,
            self.config.window_size,
            self.script.len(),
        )
        .reaching_back_to(self.state.window_start());
        let candidate = best_candidate(&self.script, window, &tokens, confidence, &self.config)
            .filter(|c| c.score >= self.config.min_score);

        let Some(candidate) = candidate else {
            self.telemetry
                .record_suppression(SuppressReason::BelowThreshold);
            if is_final {
                if let Some(outcome) = self.weak_final_rescue(&tokens, now_ms) {
                    return outcome;
                }
            }
            return MatchOutcome::Suppressed(SuppressReason::BelowThreshold);
        };

        trace!(
            index = candidate.index,
            score = candidate.score,
            is_final,
            "fragment candidate"
        );

        let outcome = self.gate(
            candidate.index,
            candidate.score,
            tokens.len(),
            CommitOrigin::Fragment,
            now_ms,
        );

        if outcome == MatchOutcome::Suppressed(SuppressReason::Duplicate) {
            if let Some(rescued) = self.stuck_rescue(now_ms) {
                return rescued;
            }
        }
        outcome
    }

    /// Direct commit, bypassing scoring gates. Forward-only; counts as a
    /// manual nudge.
    pub fn commit_index(&mut self, index: usize, score: f64, now_ms: u64) -> MatchOutcome {
        if !self.is_operational() {
            return MatchOutcome::Ignored;
        }
        let score = if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if index < self.state.current_index {
            self.telemetry.record_suppression(SuppressReason::Backwards);
            return MatchOutcome::Suppressed(SuppressReason::Backwards);
        }
        let target = self.skip_silent(index.min(self.script.len() - 1));
        let event = self.commit(target, score, CommitOrigin::Manual, 0, false, now_ms);
        self.state.nudge_pending = true;
        MatchOutcome::Committed(event)
    }

    /// Per-frame housekeeping: telemetry flush and the idle rescue. A
    /// disabled matcher publishes nothing.
    ///
    /// Returns the rescue commit, if one fired.
    pub fn poll(&mut self, now_ms: u64) -> Option<CommitEvent> {
        if self.enabled {
            if let Some(stats) = self.telemetry.maybe_flush(now_ms) {
                self.publish_stats(stats);
            }
        }

        if !self.is_operational() || self.state.fragments_since_commit == 0 {
            return None;
        }
        let reference = self
            .state
            .last_commit_ms
            .unwrap_or(0)
            .max(self.state.idle_anchor_ms);
        if now_ms.saturating_sub(reference) < self.config.idle_rescue_ms {
            return None;
        }

        // One attempt per idle period, whatever the gates decide.
        self.state.idle_anchor_ms = now_ms;
        let next = self.state.current_index + 1;
        self.try_rescue(next, RescueReason::Idle, now_ms)
            .and_then(|outcome| outcome.commit().cloned())
    }

    fn publish_stats(&self, stats: MatcherStats) {
        debug!(
            commits = stats.commits,
            suppressed = stats.suppressed.total(),
            p95_gap_ms = ?stats.p95_gap_ms,
            "matcher stats"
        );
        let _ = self.events_tx.send(MatcherEvent::Stats(stats));
    }

    // ── Gating pipeline ──────────────────────────────────────────────────────

    fn gate(
        &mut self,
        index: usize,
        score: f64,
        token_count: usize,
        origin: CommitOrigin,
        now_ms: u64,
    ) -> MatchOutcome {
        let cfg = &self.config;
        let st = &mut self.state;

        if st.is_frozen(now_ms) {
            return self.suppress(SuppressReason::Freeze, index);
        }

        // The committed line itself stays matchable when only silent lines
        // separate it from `current_index`.
        if index < st.current_index && st.last_committed_index != Some(index) {
            return self.suppress(SuppressReason::Backwards, index);
        }

        let mut latency_ms = 0;
        let distance = index.saturating_sub(st.current_index);
        let is_leap = distance >= cfg.leap_size;
        if is_leap {
            if distance > cfg.leap_max_distance
                || token_count < cfg.leap_min_tokens
                || score < cfg.leap_min_score
            {
                return self.suppress(SuppressReason::Leap, index);
            }
            let confirmed = st
                .pending_leap
                .is_some_and(|p| p.confirms(index, now_ms, cfg.leap_confirm_window_ms));
            if confirmed {
                latency_ms = st
                    .pending_leap
                    .map_or(0, |p| now_ms.saturating_sub(p.first_seen_ms));
            } else {
                if now_ms < st.leap_cooldown_until {
                    return self.suppress(SuppressReason::Leap, index);
                }
                if score < cfg.leap_confirm_score {
                    st.pending_leap = Some(PendingCandidate::new(index, now_ms));
                    self.telemetry.record_suppression(SuppressReason::Leap);
                    debug!(index, score, "leap pending confirmation");
                    return MatchOutcome::Deferred(DeferReason::LeapPending);
                }
            }
        }

        if st.last_committed_index == Some(index) && !st.nudge_pending {
            let gain = score - st.last_score;
            let elapsed = st
                .last_commit_ms
                .map_or(u64::MAX, |t| now_ms.saturating_sub(t));
            if gain < cfg.duplicate_min_gain || elapsed < cfg.duplicate_min_interval_ms {
                return self.suppress(SuppressReason::Duplicate, index);
            }
        }

        if score < cfg.soft_score {
            let corroborated = st
                .pending_weak
                .is_some_and(|p| p.confirms(index, now_ms, cfg.corroborate_window_ms));
            if !corroborated {
                st.pending_weak = Some(PendingCandidate::new(index, now_ms));
                self.telemetry
                    .record_suppression(SuppressReason::LowConfidence);
                return MatchOutcome::Deferred(DeferReason::AwaitingCorroboration);
            }
            latency_ms = latency_ms.max(
                st.pending_weak
                    .map_or(0, |p| now_ms.saturating_sub(p.first_seen_ms)),
            );
        }

        let target = self.skip_silent(index);
        MatchOutcome::Committed(self.commit(target, score, origin, latency_ms, is_leap, now_ms))
    }

    fn suppress(&mut self, reason: SuppressReason, index: usize) -> MatchOutcome {
        trace!(?reason, index, current = self.state.current_index, "candidate suppressed");
        self.telemetry.record_suppression(reason);
        MatchOutcome::Suppressed(reason)
    }

    fn skip_silent(&self, mut index: usize) -> usize {
        while index + 1 < self.script.len()
            && self.script.get(index).is_some_and(|l| l.is_silent)
        {
            index += 1;
        }
        index
    }

    /// Last line of the silent run directly after `index` (or `index`).
    fn past_silent_run(&self, mut index: usize) -> usize {
        while self.script.get(index + 1).is_some_and(|l| l.is_silent) {
            index += 1;
        }
        index
    }

    fn commit(
        &mut self,
        index: usize,
        score: f64,
        origin: CommitOrigin,
        latency_ms: u64,
        is_leap: bool,
        now_ms: u64,
    ) -> CommitEvent {
        let resting = self.past_silent_run(index);
        let st = &mut self.state;
        if resting != st.current_index {
            st.last_index_change_ms = now_ms;
        }
        st.current_index = resting;
        st.last_committed_index = Some(index);
        st.last_score = score;
        st.last_commit_ms = Some(now_ms);
        st.freeze_until = now_ms + self.config.freeze_ms;
        if is_leap {
            st.leap_cooldown_until = now_ms + self.config.leap_cooldown_ms;
        }
        st.pending_leap = None;
        st.pending_weak = None;
        st.nudge_pending = false;
        st.fragments_since_commit = 0;
        st.idle_anchor_ms = now_ms;

        self.telemetry.record_commit(score, latency_ms, now_ms);

        let event = CommitEvent {
            seq: self.seq,
            index,
            score,
            origin,
            latency_ms,
            at_ms: now_ms,
        };
        self.seq += 1;
        info!(index, score, ?origin, latency_ms, "line committed");
        let _ = self.events_tx.send(MatcherEvent::Commit(event.clone()));
        event
    }

    // ── Rescue paths ─────────────────────────────────────────────────────────

    fn try_rescue(
        &mut self,
        index: usize,
        reason: RescueReason,
        now_ms: u64,
    ) -> Option<MatchOutcome> {
        if index >= self.script.len() {
            return None;
        }
        let outcome = self.gate(
            index,
            self.config.rescue_score,
            usize::MAX,
            CommitOrigin::Rescue,
            now_ms,
        );
        if let MatchOutcome::Committed(commit) = &outcome {
            warn!(index = commit.index, ?reason, "rescue advanced position");
            let _ = self.events_tx.send(MatcherEvent::Rescue(RescueEvent {
                seq: commit.seq,
                index: commit.index,
                reason,
                at_ms: now_ms,
            }));
        }
        Some(outcome)
    }

    fn stuck_rescue(&mut self, now_ms: u64) -> Option<MatchOutcome> {
        let st = &self.state;
        if st.last_committed_index.is_none()
            || now_ms.saturating_sub(st.last_index_change_ms) <= self.config.stuck_rescue_ms
        {
            return None;
        }
        let next = st.current_index + 1;
        self.try_rescue(next, RescueReason::Stuck, now_ms)
            .filter(|outcome| outcome.commit().is_some())
    }

    /// A final fragment that matched nothing well: advance to the first of the
    /// next few lines it overlaps at all.
    fn weak_final_rescue(&mut self, tokens: &BTreeSet<String>, now_ms: u64) -> Option<MatchOutcome> {
        let current = self.state.current_index;
        let target = (1..=self.config.weak_final_max_steps)
            .map(|step| current + step)
            .take_while(|&index| index < self.script.len())
            .find(|&index| {
                self.script
                    .get(index)
                    .is_some_and(|line| coverage(line, tokens, &self.config) > 0.0)
            })?;
        self.try_rescue(target, RescueReason::WeakFinal, now_ms)
            .filter(|outcome| outcome.commit().is_some())
    }
}

impl std::fmt::Debug for AlignmentMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignmentMatcher")
            .field("enabled", &self.enabled)
            .field("lines", &self.script.len())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::script::ScriptLine;

    /// Twenty lines of five unique words each: line `i` is `wia wib … wie`.
    fn numbered_script(silent: &[usize]) -> Script {
        let lines = (0..20)
            .map(|i| {
                let text = format!("w{i}a w{i}b w{i}c w{i}d w{i}e");
                ScriptLine::new(i, &text, silent.contains(&i))
            })
            .collect();
        Script::new(lines)
    }

    fn line_text(i: usize) -> String {
        format!("w{i}a w{i}b w{i}c w{i}d w{i}e")
    }

    fn matcher() -> AlignmentMatcher {
        let mut m = AlignmentMatcher::new(MatcherConfig::default(), numbered_script(&[]));
        assert!(m.enable(0));
        m
    }

    fn committed_index(outcome: &MatchOutcome) -> Option<usize> {
        outcome.commit().map(|c| c.index)
    }

    #[test]
    fn disabled_matcher_ignores_fragments() {
        let mut m = AlignmentMatcher::new(MatcherConfig::default(), numbered_script(&[]));
        assert_eq!(m.on_fragment(&line_text(0), true, 1.0, 0), MatchOutcome::Ignored);
    }

    #[test]
    fn empty_script_is_a_no_op_until_supplied() {
        let mut m = AlignmentMatcher::new(MatcherConfig::default(), Script::default());
        assert!(!m.enable(0));
        assert_eq!(m.on_fragment("anything", true, 1.0, 10), MatchOutcome::Ignored);

        m.set_script(numbered_script(&[]), 20);
        assert!(m.is_operational());
        assert_eq!(committed_index(&m.on_fragment(&line_text(0), true, 1.0, 30)), Some(0));
    }

    #[test]
    fn malformed_fragments_are_ignored() {
        let mut m = matcher();
        assert_eq!(m.on_fragment("   ", true, 1.0, 0), MatchOutcome::Ignored);
        assert_eq!(m.on_fragment("...", true, 1.0, 0), MatchOutcome::Ignored);
        assert_eq!(m.on_fragment(&line_text(0), true, f64::NAN, 0), MatchOutcome::Ignored);
    }

    #[test]
    fn strong_fragment_commits_and_advances() {
        let mut m = matcher();
        let outcome = m.on_fragment(&line_text(1), false, 0.9, 100);
        let commit = outcome.commit().expect("commit");
        assert_eq!(commit.index, 1);
        assert!((commit.score - 0.9).abs() < 1e-9);
        assert_eq!(commit.origin, CommitOrigin::Fragment);
        assert_eq!(m.current_index(), 1);
    }

    #[test]
    fn below_threshold_is_discarded() {
        let mut m = matcher();
        // Two of five words at full confidence: 0.4 < 0.45.
        let outcome = m.on_fragment("w1a w1b", false, 1.0, 100);
        assert_eq!(outcome, MatchOutcome::Suppressed(SuppressReason::BelowThreshold));
        assert_eq!(m.current_index(), 0);
    }

    #[test]
    fn freeze_window_blocks_any_commit() {
        let mut m = matcher();
        assert!(m.on_fragment(&line_text(0), false, 1.0, 1_000).commit().is_some());

        for t in [1_001, 1_100, 1_249] {
            let outcome = m.on_fragment(&line_text(1), true, 1.0, t);
            assert_eq!(outcome, MatchOutcome::Suppressed(SuppressReason::Freeze));
        }
        assert_eq!(committed_index(&m.on_fragment(&line_text(1), true, 1.0, 1_250)), Some(1));
    }

    #[test]
    fn leap_with_high_score_commits_immediately() {
        let mut m = matcher();
        let outcome = m.on_fragment(&line_text(4), false, 0.80, 100);
        assert_eq!(committed_index(&outcome), Some(4));
    }

    #[test]
    fn leap_with_medium_score_needs_confirmation_in_window() {
        let mut m = matcher();
        let first = m.on_fragment(&line_text(4), false, 0.70, 100);
        assert_eq!(first, MatchOutcome::Deferred(DeferReason::LeapPending));
        assert_eq!(m.current_index(), 0);

        let second = m.on_fragment(&line_text(4), false, 0.70, 650);
        let commit = second.commit().expect("confirmed leap");
        assert_eq!(commit.index, 4);
        assert_eq!(commit.latency_ms, 550);
    }

    #[test]
    fn leap_confirmation_expires() {
        let mut m = matcher();
        assert_eq!(
            m.on_fragment(&line_text(4), false, 0.70, 100),
            MatchOutcome::Deferred(DeferReason::LeapPending)
        );
        let late = m.on_fragment(&line_text(4), false, 0.70, 701);
        assert_eq!(late.commit(), None);
        assert_eq!(m.current_index(), 0);
    }

    #[test]
    fn leap_rejections() {
        let mut m = matcher();
        // Too far: 9 > hard cap of 8.
        assert_eq!(
            m.on_fragment(&line_text(9), false, 1.0, 100),
            MatchOutcome::Suppressed(SuppressReason::Leap)
        );
        // Below the leap minimum score.
        assert_eq!(
            m.on_fragment(&line_text(5), false, 0.6, 200),
            MatchOutcome::Suppressed(SuppressReason::Leap)
        );
        // Too few tokens, even though the two-word line is fully covered.
        let mut short = AlignmentMatcher::new(
            MatcherConfig::default(),
            Script::from_text("a b c d e\nf g\nh i\nj k\nl m\nn o"),
        );
        short.enable(0);
        assert_eq!(
            short.on_fragment("l m", false, 1.0, 100),
            MatchOutcome::Suppressed(SuppressReason::Leap)
        );
        assert_eq!(m.suppression_counts().leap, 2);
    }

    #[test]
    fn leap_cooldown_blocks_back_to_back_leaps() {
        let mut m = matcher();
        assert_eq!(committed_index(&m.on_fragment(&line_text(4), false, 0.9, 100)), Some(4));
        // After the freeze but inside the 900 ms cooldown.
        assert_eq!(
            m.on_fragment(&line_text(8), false, 0.9, 500),
            MatchOutcome::Suppressed(SuppressReason::Leap)
        );
        assert_eq!(committed_index(&m.on_fragment(&line_text(8), false, 0.9, 1_001)), Some(8));
    }

    #[test]
    fn backwards_candidates_cannot_occur_inside_the_window() {
        let mut m = matcher();
        m.on_fragment(&line_text(2), false, 1.0, 100);
        // Line 1 is outside the window now; nothing in range overlaps.
        let outcome = m.on_fragment(&line_text(1), false, 1.0, 1_000);
        assert_eq!(outcome, MatchOutcome::Suppressed(SuppressReason::BelowThreshold));
        assert_eq!(m.current_index(), 2);
    }

    #[test]
    fn commit_index_rejects_backwards_override() {
        let mut m = matcher();
        m.on_fragment(&line_text(2), false, 1.0, 100);
        assert_eq!(
            m.commit_index(1, 1.0, 1_000),
            MatchOutcome::Suppressed(SuppressReason::Backwards)
        );
        let outcome = m.commit_index(3, 1.0, 1_000);
        let commit = outcome.commit().expect("manual commit");
        assert_eq!(commit.index, 3);
        assert_eq!(commit.origin, CommitOrigin::Manual);
    }

    #[test]
    fn duplicate_needs_gain_and_time() {
        let mut m = matcher();
        m.on_fragment("w1a w1b w1c", false, 1.0, 100); // 0.6, commits line 1
        assert_eq!(m.current_index(), 1);

        // Same score after the freeze: duplicate.
        assert_eq!(
            m.on_fragment("w1a w1b w1c", false, 1.0, 400),
            MatchOutcome::Suppressed(SuppressReason::Duplicate)
        );
        // Enough gain but too soon (< 350 ms after the commit).
        assert_eq!(
            m.on_fragment(&line_text(1), false, 1.0, 420),
            MatchOutcome::Suppressed(SuppressReason::Duplicate)
        );
        // Enough gain and enough time.
        let outcome = m.on_fragment(&line_text(1), false, 1.0, 460);
        assert_eq!(committed_index(&outcome), Some(1));
    }

    #[test]
    fn first_observation_after_nudge_is_accepted() {
        let mut m = matcher();
        m.commit_index(2, 0.9, 100);
        // Same line, no gain, only just out of the freeze window.
        let outcome = m.on_fragment(&line_text(2), false, 0.9, 360);
        assert_eq!(committed_index(&outcome), Some(2));
        // The nudge allowance is spent.
        assert_eq!(
            m.on_fragment(&line_text(2), false, 0.9, 800),
            MatchOutcome::Suppressed(SuppressReason::Duplicate)
        );
    }

    #[test]
    fn low_score_needs_corroboration() {
        let mut m = matcher();
        // 3/5 coverage at 0.85 confidence = 0.51 < 0.55.
        let first = m.on_fragment("w1a w1b w1c", false, 0.85, 100);
        assert_eq!(first, MatchOutcome::Deferred(DeferReason::AwaitingCorroboration));
        let second = m.on_fragment("w1a w1b w1c", false, 0.85, 900);
        assert_eq!(committed_index(&second), Some(1));
    }

    #[test]
    fn low_score_corroboration_expires() {
        let mut m = matcher();
        m.on_fragment("w1a w1b w1c", false, 0.85, 100);
        let late = m.on_fragment("w1a w1b w1c", false, 0.85, 1_400);
        assert_eq!(late, MatchOutcome::Deferred(DeferReason::AwaitingCorroboration));
        assert_eq!(m.current_index(), 0);
    }

    #[test]
    fn commit_skips_silent_lines() {
        let mut m = AlignmentMatcher::new(MatcherConfig::default(), numbered_script(&[3, 4]));
        m.enable(0);
        m.on_fragment(&line_text(1), false, 1.0, 100);
        let outcome = m.commit_index(3, 1.0, 1_000);
        assert_eq!(committed_index(&outcome), Some(5));
    }

    #[test]
    fn silent_lines_after_a_commit_do_not_count_toward_leaps() {
        let mut m = AlignmentMatcher::new(MatcherConfig::default(), numbered_script(&[1, 2, 3, 4]));
        m.enable(0);
        let first = m.on_fragment(&line_text(0), true, 1.0, 100);
        assert_eq!(committed_index(&first), Some(0));
        assert_eq!(m.current_index(), 4);
        assert_eq!(m.state().last_committed_index, Some(0));

        // Line 5 is the very next spoken line, not a five-line leap.
        let next = m.on_fragment(&line_text(5), true, 1.0, 1_000);
        let commit = next.commit().expect("next spoken line");
        assert_eq!(commit.index, 5);
        assert_eq!(commit.origin, CommitOrigin::Fragment);
        assert_eq!(m.suppression_counts().leap, 0);
    }

    #[test]
    fn committed_line_before_silence_still_reads_as_duplicate() {
        let mut m = AlignmentMatcher::new(MatcherConfig::default(), numbered_script(&[4, 5]));
        m.enable(0);
        m.on_fragment(&line_text(3), false, 0.9, 100);
        assert_eq!(m.current_index(), 5);

        assert_eq!(
            m.on_fragment(&line_text(3), false, 0.9, 1_500),
            MatchOutcome::Suppressed(SuppressReason::Duplicate)
        );
        assert_eq!(m.current_index(), 5);

        // Still repeating well past the stuck threshold: move to line 6.
        let outcome = m.on_fragment(&line_text(3), false, 0.9, 2_700);
        let commit = outcome.commit().expect("stuck rescue");
        assert_eq!(commit.index, 6);
        assert_eq!(commit.origin, CommitOrigin::Rescue);
    }

    #[test]
    fn idle_rescue_advances_one_line() {
        let mut m = matcher();
        let mut rx = m.subscribe();
        m.on_fragment(&line_text(0), false, 1.0, 100);

        // Unmatched speech keeps arriving.
        m.on_fragment("nothing relevant here", false, 1.0, 1_000);
        assert_eq!(m.poll(3_599), None);

        let rescue = m.poll(3_600).expect("idle rescue");
        assert_eq!(rescue.index, 1);
        assert_eq!(rescue.origin, CommitOrigin::Rescue);

        let mut saw_rescue = false;
        while let Ok(event) = rx.try_recv() {
            if let MatcherEvent::Rescue(r) = event {
                assert_eq!(r.reason, RescueReason::Idle);
                assert_eq!(r.index, 1);
                saw_rescue = true;
            }
        }
        assert!(saw_rescue);
    }

    #[test]
    fn idle_rescue_waits_for_speech() {
        let mut m = matcher();
        m.on_fragment(&line_text(0), false, 1.0, 100);
        assert_eq!(m.poll(10_000), None);
        assert_eq!(m.current_index(), 0);
    }

    #[test]
    fn idle_rescue_fires_once_per_idle_period() {
        let mut m = AlignmentMatcher::new(
            MatcherConfig {
                freeze_ms: 10_000,
                ..MatcherConfig::default()
            },
            numbered_script(&[]),
        );
        m.enable(0);
        m.on_fragment(&line_text(0), false, 1.0, 100);
        m.on_fragment("unmatched", false, 1.0, 200);
        // Frozen: the attempt is suppressed, and not retried every frame.
        assert_eq!(m.poll(3_600), None);
        assert_eq!(m.state().idle_anchor_ms, 3_600);
        assert_eq!(m.poll(3_616), None);
        assert_eq!(m.state().idle_anchor_ms, 3_600);
    }

    #[test]
    fn stuck_rescue_moves_past_a_repeating_line() {
        let mut m = matcher();
        m.on_fragment(&line_text(3), false, 0.9, 100);
        assert_eq!(m.current_index(), 3);

        // The recognizer keeps hearing line 3.
        assert_eq!(
            m.on_fragment(&line_text(3), false, 0.9, 1_500),
            MatchOutcome::Suppressed(SuppressReason::Duplicate)
        );
        let outcome = m.on_fragment(&line_text(3), false, 0.9, 2_700);
        let commit = outcome.commit().expect("stuck rescue");
        assert_eq!(commit.index, 4);
        assert_eq!(commit.origin, CommitOrigin::Rescue);
    }

    #[test]
    fn weak_final_rescue_looks_two_lines_ahead() {
        let mut m = matcher();
        m.on_fragment(&line_text(0), false, 1.0, 100);

        // Final fragment overlapping line 2 by a single word: far below threshold.
        let outcome = m.on_fragment("w2c unrelated", true, 1.0, 1_000);
        assert_eq!(committed_index(&outcome), Some(2));

        // Partial fragments never trigger it.
        let outcome = m.on_fragment("w3c unrelated", false, 1.0, 2_000);
        assert_eq!(outcome, MatchOutcome::Suppressed(SuppressReason::BelowThreshold));

        // Overlap three lines ahead is out of reach.
        let outcome = m.on_fragment("w5c unrelated", true, 1.0, 3_000);
        assert_eq!(outcome, MatchOutcome::Suppressed(SuppressReason::BelowThreshold));
    }

    #[test]
    fn rescues_respect_the_freeze_window() {
        let mut m = matcher();
        m.on_fragment(&line_text(0), false, 1.0, 100);
        let outcome = m.on_fragment("w1c unrelated", true, 1.0, 200);
        assert_eq!(outcome, MatchOutcome::Suppressed(SuppressReason::BelowThreshold));
        assert_eq!(m.current_index(), 0);
    }

    #[test]
    fn reanchor_is_the_only_way_back() {
        let mut m = matcher();
        m.on_fragment(&line_text(5), false, 0.9, 100);
        assert_eq!(m.current_index(), 5);
        m.reanchor(2, 1_000);
        assert_eq!(m.current_index(), 2);
        assert_eq!(m.state().last_committed_index, None);
        assert!(m.state().nudge_pending);
        assert_eq!(committed_index(&m.on_fragment(&line_text(2), false, 0.9, 1_010)), Some(2));
    }

    #[test]
    fn disable_resets_commit_state() {
        let mut m = matcher();
        m.on_fragment(&line_text(3), false, 0.9, 100);
        m.disable(500);
        assert_eq!(m.state(), &CommitState::default());
        assert_eq!(m.on_fragment(&line_text(4), false, 0.9, 1_000), MatchOutcome::Ignored);
        m.enable(2_000);
        assert_eq!(m.current_index(), 0);
    }

    #[test]
    fn current_index_never_decreases_under_fragments() {
        let mut m = matcher();
        let mut seed: u64 = 0x5eed;
        let mut now = 0u64;
        let mut last = m.current_index();
        for _ in 0..2_000 {
            seed = seed
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            let line = ((seed >> 33) % 20) as usize;
            let words = 1 + ((seed >> 20) % 5) as usize;
            let confidence = 0.3 + ((seed >> 40) % 70) as f64 / 100.0;
            let is_final = (seed >> 50) % 3 == 0;
            let text: Vec<String> = ["a", "b", "c", "d", "e"]
                .iter()
                .take(words)
                .map(|s| format!("w{line}{s}"))
                .collect();
            now += (seed >> 10) % 400;

            m.on_fragment(&text.join(" "), is_final, confidence, now);
            m.poll(now);
            assert!(m.current_index() >= last, "index went backwards");
            last = m.current_index();
        }
    }

    #[test]
    fn disabled_matcher_publishes_no_stats() {
        let mut m = AlignmentMatcher::new(MatcherConfig::default(), numbered_script(&[]));
        let mut rx = m.subscribe();
        for now in (0..12_000).step_by(16) {
            m.poll(now);
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disable_publishes_the_partial_window() {
        let mut m = matcher();
        let mut rx = m.subscribe();
        m.on_fragment(&line_text(0), false, 1.0, 100);
        m.on_fragment(&line_text(1), false, 1.0, 1_000);
        m.disable(2_000);

        let stats: Vec<MatcherStats> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                MatcherEvent::Stats(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].commits, 2);
        assert_eq!(stats[0].window_ms, 2_000);
        assert_eq!(stats[0].p95_gap_ms, Some(900));

        // Nothing left to report on a second disable.
        m.disable(3_000);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stats_are_published_on_interval() {
        let mut m = matcher();
        let mut rx = m.subscribe();
        m.on_fragment(&line_text(0), false, 1.0, 100);
        m.on_fragment(&line_text(1), false, 1.0, 200); // frozen
        m.record_tween_steps(10);
        m.poll(5_000);

        let stats = std::iter::from_fn(|| rx.try_recv().ok())
            .find_map(|e| match e {
                MatcherEvent::Stats(s) => Some(s),
                _ => None,
            })
            .expect("stats event");
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.suppressed.freeze, 1);
        assert_eq!(stats.avg_tween_steps, Some(10.0));
    }
}
