//! Tunable constants for every engine.
//!
//! The defaults below were tuned by ear against live presenters; none of them
//! is derived from a model. Hosts may load overrides from JSON; any field
//! left out keeps its default.

use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};

/// Configuration for the whole engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct EngineConfig {
    pub governor: GovernorConfig,
    pub matcher: MatcherConfig,
    pub router: RouterConfig,
}

/// PI loop tuning for [`crate::governor::SpeedGovernor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct GovernorConfig {
    /// Ease-in duration after activation. Default: 1200 ms.
    pub soft_start_ms: u64,
    /// Adaptation is suspended this long after a manual speed change.
    /// Default: 1500 ms.
    pub manual_debounce_ms: u64,
    /// A speech sample older than this no longer drives adaptation.
    /// Default: 350 ms.
    pub sample_freshness_ms: u64,
    /// Errors at or below this magnitude are treated as noise. Default: 14 px.
    pub deadband_px: f64,
    /// Samples below this confidence are treated as noise. Default: 0.4.
    pub min_confidence: f64,
    /// Per-tick integrator decay while inside the deadband. Default: 0.96.
    pub integrator_decay: f64,
    /// Proportional gain, as a fraction of base speed. Default: 0.06.
    pub kp: f64,
    /// Integral gain, fraction of base speed per second. Default: 0.05.
    pub ki: f64,
    /// Output clamp and slew rate, fraction of base speed (per second for
    /// the slew). Default: 0.18.
    pub max_adjust_fraction: f64,
    /// Integrator decay applied when the output saturates. Default: 0.9.
    pub windup_decay: f64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            soft_start_ms: 1_200,
            manual_debounce_ms: 1_500,
            sample_freshness_ms: 350,
            deadband_px: 14.0,
            min_confidence: 0.4,
            integrator_decay: 0.96,
            kp: 0.06,
            ki: 0.05,
            max_adjust_fraction: 0.18,
            windup_decay: 0.9,
        }
    }
}

/// Commit gating for [`crate::matcher::AlignmentMatcher`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct MatcherConfig {
    /// Lines scored per fragment, starting at the current index.
    pub window_size: usize,
    /// Candidates scoring below this are discarded. Default: 0.45.
    pub min_score: f64,
    /// Post-commit cooldown. Default: 250 ms.
    pub freeze_ms: u64,
    /// Distance (in lines) at which a candidate counts as a leap. Default: 4.
    pub leap_size: usize,
    /// Leaps further than this are never taken. Default: 8.
    pub leap_max_distance: usize,
    /// Minimum fragment token count for a leap. Default: 3.
    pub leap_min_tokens: usize,
    /// Minimum score for a leap to be considered at all. Default: 0.68.
    pub leap_min_score: f64,
    /// Leaps at or above this score commit immediately. Default: 0.75.
    pub leap_confirm_score: f64,
    /// A pending leap must be re-observed within this window. Default: 600 ms.
    pub leap_confirm_window_ms: u64,
    /// No new leap is attempted this soon after a committed one. Default: 900 ms.
    pub leap_cooldown_ms: u64,
    /// Re-commits of the same line need at least this score gain. Default: 0.12.
    pub duplicate_min_gain: f64,
    /// ...or at least this much elapsed time. Default: 350 ms.
    pub duplicate_min_interval_ms: u64,
    /// Scores below this need a second observation. Default: 0.55.
    pub soft_score: f64,
    /// Window for that second observation. Default: 1200 ms.
    pub corroborate_window_ms: u64,
    /// Advance one line after this long without a commit. Default: 3500 ms.
    pub idle_rescue_ms: u64,
    /// Advance one line after sitting on the same index this long. Default: 2500 ms.
    pub stuck_rescue_ms: u64,
    /// Lines a weak final fragment may look ahead. Default: 2.
    pub weak_final_max_steps: usize,
    /// Score submitted through the gates by rescue attempts. Default: 0.6.
    pub rescue_score: f64,
    /// Telemetry flush interval. Default: 5000 ms.
    pub stats_interval_ms: u64,
    /// Normalized Levenshtein similarity at which two tokens match. Default: 0.85.
    pub fuzzy_token_similarity: f64,
    /// Shorter tokens only match exactly. Default: 5.
    pub fuzzy_min_token_len: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            min_score: 0.45,
            freeze_ms: 250,
            leap_size: 4,
            leap_max_distance: 8,
            leap_min_tokens: 3,
            leap_min_score: 0.68,
            leap_confirm_score: 0.75,
            leap_confirm_window_ms: 600,
            leap_cooldown_ms: 900,
            duplicate_min_gain: 0.12,
            duplicate_min_interval_ms: 350,
            soft_score: 0.55,
            corroborate_window_ms: 1_200,
            idle_rescue_ms: 3_500,
            stuck_rescue_ms: 2_500,
            weak_final_max_steps: 2,
            rescue_score: 0.6,
            stats_interval_ms: 5_000,
            fuzzy_token_similarity: 0.85,
            fuzzy_min_token_len: 5,
        }
    }
}

/// Mode routing, geometry fallbacks and the asr line tween.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct RouterConfig {
    /// Base speed (px/s) for timed mode and the wpm fallback. Default: 60.
    pub default_speed: f64,
    /// Upper bound for any base speed (px/s). Default: 2000.
    pub max_speed: f64,
    /// Uniform line height used when the host supplies no layout. Default: 48 px.
    pub line_height: f64,
    /// Reading marker position as a fraction of the viewport. Default: 0.5.
    pub marker_ratio: f64,
    /// Page step as a fraction of the viewport. Default: 0.85.
    pub page_fraction: f64,
    /// Fraction of the remaining distance covered per frame by the line tween.
    /// Default: 0.25.
    pub tween_factor: f64,
    /// The tween snaps to its target below this distance. Default: 0.5 px.
    pub tween_snap_px: f64,
    /// Run the matcher as an observer in hybrid mode, turning its commits
    /// into alignment samples for the governor. Default: false.
    pub hybrid_matcher_feedback: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_speed: 60.0,
            max_speed: 2_000.0,
            line_height: 48.0,
            marker_ratio: 0.5,
            page_fraction: 0.85,
            tween_factor: 0.25,
            tween_snap_px: 0.5,
            hybrid_matcher_feedback: false,
        }
    }
}

impl EngineConfig {
    /// Parse a (possibly partial) JSON document, then normalize and validate it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(json)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Clamp every value into its usable range.
    pub fn normalize(&mut self) {
        let g = &mut self.governor;
        g.deadband_px = g.deadband_px.max(0.0);
        g.min_confidence = g.min_confidence.clamp(0.0, 1.0);
        g.integrator_decay = g.integrator_decay.clamp(0.0, 1.0);
        g.windup_decay = g.windup_decay.clamp(0.0, 1.0);
        g.max_adjust_fraction = g.max_adjust_fraction.clamp(0.0, 1.0);
        g.kp = g.kp.max(0.0);
        g.ki = g.ki.max(0.0);

        let m = &mut self.matcher;
        m.window_size = m.window_size.max(1);
        m.leap_size = m.leap_size.max(1);
        m.leap_max_distance = m.leap_max_distance.max(m.leap_size);
        m.min_score = m.min_score.clamp(0.0, 1.0);
        m.soft_score = m.soft_score.clamp(0.0, 1.0);
        m.leap_min_score = m.leap_min_score.clamp(0.0, 1.0);
        m.leap_confirm_score = m.leap_confirm_score.clamp(0.0, 1.0);
        m.rescue_score = m.rescue_score.clamp(0.0, 1.0);
        m.fuzzy_token_similarity = m.fuzzy_token_similarity.clamp(0.0, 1.0);
        m.stats_interval_ms = m.stats_interval_ms.max(100);

        let r = &mut self.router;
        r.max_speed = r.max_speed.max(1.0);
        r.default_speed = r.default_speed.clamp(0.0, r.max_speed);
        r.line_height = r.line_height.max(1.0);
        r.marker_ratio = r.marker_ratio.clamp(0.0, 1.0);
        r.page_fraction = r.page_fraction.clamp(0.05, 1.0);
        r.tween_factor = r.tween_factor.clamp(0.01, 1.0);
        r.tween_snap_px = r.tween_snap_px.max(0.01);
    }

    /// Reject values `normalize` cannot repair.
    pub fn validate(&self) -> Result<()> {
        let floats: [(&'static str, f64); 14] = [
            ("governor.deadbandPx", self.governor.deadband_px),
            ("governor.kp", self.governor.kp),
            ("governor.ki", self.governor.ki),
            ("governor.maxAdjustFraction", self.governor.max_adjust_fraction),
            ("governor.minConfidence", self.governor.min_confidence),
            ("matcher.minScore", self.matcher.min_score),
            ("matcher.softScore", self.matcher.soft_score),
            ("matcher.leapMinScore", self.matcher.leap_min_score),
            ("matcher.leapConfirmScore", self.matcher.leap_confirm_score),
            ("matcher.rescueScore", self.matcher.rescue_score),
            ("router.defaultSpeed", self.router.default_speed),
            ("router.lineHeight", self.router.line_height),
            ("router.markerRatio", self.router.marker_ratio),
            ("router.tweenFactor", self.router.tween_factor),
        ];
        for (field, value) in floats {
            if !value.is_finite() {
                return Err(CadenceError::InvalidConfig {
                    field,
                    reason: format!("must be finite, got {value}"),
                });
            }
        }

        if self.matcher.leap_confirm_score < self.matcher.leap_min_score {
            return Err(CadenceError::InvalidConfig {
                field: "matcher.leapConfirmScore",
                reason: "must not be below leapMinScore".into(),
            });
        }
        if self.matcher.leap_size > self.matcher.window_size {
            return Err(CadenceError::InvalidConfig {
                field: "matcher.leapSize",
                reason: format!(
                    "{} exceeds windowSize {}",
                    self.matcher.leap_size, self.matcher.window_size
                ),
            });
        }
        Ok(())
    }
}
