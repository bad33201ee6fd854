//! Rolling matcher telemetry, flushed on a fixed interval.

use crate::ipc::events::{MatcherStats, SuppressionCounts};

/// Why a candidate was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    Duplicate,
    Backwards,
    Leap,
    Freeze,
    LowConfidence,
    BelowThreshold,
}

#[derive(Debug, Clone)]
pub struct MatcherTelemetry {
    interval_ms: u64,
    window_start_ms: u64,
    seq: u64,
    commits: u32,
    suppressed: SuppressionCounts,
    score_sum: f64,
    latency_sum: u64,
    gaps_ms: Vec<u64>,
    tween_steps_sum: u64,
    tweens: u32,
    /// Survives flushes so the first gap of a window is measured correctly.
    last_commit_ms: Option<u64>,
}

impl MatcherTelemetry {
    pub fn new(interval_ms: u64, now_ms: u64) -> Self {
        Self {
            interval_ms,
            window_start_ms: now_ms,
            seq: 0,
            commits: 0,
            suppressed: SuppressionCounts::default(),
            score_sum: 0.0,
            latency_sum: 0,
            gaps_ms: Vec::new(),
            tween_steps_sum: 0,
            tweens: 0,
            last_commit_ms: None,
        }
    }

    /// Discard everything, including the inter-commit reference.
    pub fn reset(&mut self, now_ms: u64) {
        let seq = self.seq;
        *self = Self::new(self.interval_ms, now_ms);
        self.seq = seq;
    }

    pub fn record_commit(&mut self, score: f64, latency_ms: u64, now_ms: u64) {
        self.commits += 1;
        self.score_sum += score;
        self.latency_sum += latency_ms;
        if let Some(last) = self.last_commit_ms {
            self.gaps_ms.push(now_ms.saturating_sub(last));
        }
        self.last_commit_ms = Some(now_ms);
    }

    pub fn record_suppression(&mut self, reason: SuppressReason) {
        let counts = &mut self.suppressed;
        match reason {
            SuppressReason::Duplicate => counts.duplicate += 1,
            SuppressReason::Backwards => counts.backwards += 1,
            SuppressReason::Leap => counts.leap += 1,
            SuppressReason::Freeze => counts.freeze += 1,
            SuppressReason::LowConfidence => counts.low_confidence += 1,
            SuppressReason::BelowThreshold => counts.below_threshold += 1,
        }
    }

    pub fn record_tween(&mut self, steps: u32) {
        self.tween_steps_sum += u64::from(steps);
        self.tweens += 1;
    }

    pub fn suppressed(&self) -> SuppressionCounts {
        self.suppressed
    }

    pub fn commits(&self) -> u32 {
        self.commits
    }

    /// Emit and reset the counters once the interval has elapsed.
    pub fn maybe_flush(&mut self, now_ms: u64) -> Option<MatcherStats> {
        if now_ms.saturating_sub(self.window_start_ms) < self.interval_ms {
            return None;
        }
        Some(self.take(now_ms))
    }

    /// Emit whatever the current, possibly short, window recorded. An empty
    /// window yields nothing.
    pub fn flush_partial(&mut self, now_ms: u64) -> Option<MatcherStats> {
        let idle = self.commits == 0 && self.suppressed.total() == 0 && self.tweens == 0;
        (!idle).then(|| self.take(now_ms))
    }

    fn take(&mut self, now_ms: u64) -> MatcherStats {
        let elapsed = now_ms.saturating_sub(self.window_start_ms);
        let commits = self.commits;
        let stats = MatcherStats {
            seq: self.seq,
            window_ms: elapsed,
            commits,
            suppressed: self.suppressed,
            avg_score: (commits > 0).then(|| self.score_sum / f64::from(commits)),
            avg_latency_ms: (commits > 0).then(|| self.latency_sum as f64 / f64::from(commits)),
            p95_gap_ms: percentile_95(&mut self.gaps_ms),
            avg_tween_steps: (self.tweens > 0)
                .then(|| self.tween_steps_sum as f64 / f64::from(self.tweens)),
        };

        let last_commit_ms = self.last_commit_ms;
        self.reset(now_ms);
        self.seq = stats.seq + 1;
        self.last_commit_ms = last_commit_ms;
        stats
    }
}

/// Nearest-rank 95th percentile. Sorts in place.
fn percentile_95(values: &mut [u64]) -> Option<u64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let rank = ((values.len() as f64) * 0.95).ceil() as usize;
    values.get(rank.saturating_sub(1)).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_uses_nearest_rank() {
        let mut gaps: Vec<u64> = (1..=20).map(|g| g * 100).collect();
        assert_eq!(percentile_95(&mut gaps), Some(1_900));
        assert_eq!(percentile_95(&mut [42]), Some(42));
        assert_eq!(percentile_95(&mut []), None);
    }

    #[test]
    fn flush_waits_for_the_interval_then_resets() {
        let mut t = MatcherTelemetry::new(5_000, 0);
        t.record_commit(0.8, 0, 1_000);
        t.record_commit(0.6, 200, 1_500);
        t.record_suppression(SuppressReason::Freeze);
        t.record_suppression(SuppressReason::Duplicate);
        t.record_tween(12);

        assert!(t.maybe_flush(4_999).is_none());

        let stats = t.maybe_flush(5_000).expect("stats due");
        assert_eq!(stats.seq, 0);
        assert_eq!(stats.commits, 2);
        assert_eq!(stats.suppressed.freeze, 1);
        assert_eq!(stats.suppressed.duplicate, 1);
        assert!((stats.avg_score.unwrap_or_default() - 0.7).abs() < 1e-9);
        assert_eq!(stats.avg_latency_ms, Some(100.0));
        assert_eq!(stats.p95_gap_ms, Some(500));
        assert_eq!(stats.avg_tween_steps, Some(12.0));

        assert_eq!(t.commits(), 0);
        assert_eq!(t.suppressed().total(), 0);

        // The gap across the flush boundary is still measured.
        t.record_commit(0.9, 0, 6_500);
        let next = t.maybe_flush(10_000).expect("second window");
        assert_eq!(next.seq, 1);
        assert_eq!(next.p95_gap_ms, Some(5_000));
    }

    #[test]
    fn empty_window_reports_no_averages() {
        let mut t = MatcherTelemetry::new(5_000, 0);
        let stats = t.maybe_flush(5_000).expect("stats due");
        assert_eq!(stats.commits, 0);
        assert_eq!(stats.avg_score, None);
        assert_eq!(stats.p95_gap_ms, None);
    }

    #[test]
    fn partial_flush_skips_empty_windows() {
        let mut t = MatcherTelemetry::new(5_000, 1_000);
        assert!(t.flush_partial(2_000).is_none());

        t.record_commit(0.9, 0, 2_500);
        let stats = t.flush_partial(3_000).expect("partial window");
        assert_eq!(stats.window_ms, 2_000);
        assert_eq!(stats.commits, 1);
        assert!(t.flush_partial(3_500).is_none());
    }
}
