//! Events emitted by the engine.
//!
//! | Event | Source | Subscription |
//! |-------|--------|--------------|
//! | `ModeChangedEvent` | mode router | `CadenceEngine::subscribe_modes` |
//! | `GovernorDiagnostic` | speed governor | `CadenceEngine::subscribe_governor` |
//! | `MatcherEvent` | alignment matcher | `CadenceEngine::subscribe_matcher` |

use serde::{Deserialize, Serialize};

use crate::engine::mode::ScrollMode;

// ---------------------------------------------------------------------------
// Mode events
// ---------------------------------------------------------------------------

/// Emitted whenever the active mode actually changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeChangedEvent {
    pub seq: u64,
    pub previous: ScrollMode,
    pub mode: ScrollMode,
    pub at_ms: u64,
}

// ---------------------------------------------------------------------------
// Governor diagnostics
// ---------------------------------------------------------------------------

/// What the governor did on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GovernorPhase {
    /// Soft start ramp, no feedback applied.
    Ramp,
    /// Tracking base speed (no eligible sample, or feedback disabled).
    Cruise,
    /// PI correction applied.
    Adapt,
    /// Sample inside the deadband or below confidence; integrator decaying.
    Hold,
}

/// One tick worth of governor internals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernorDiagnostic {
    pub at_ms: u64,
    pub phase: GovernorPhase,
    pub base_speed: f64,
    pub target: f64,
    pub velocity: f64,
    pub integrator: f64,
    /// Error of the sample that drove this tick, if any.
    pub error: Option<f64>,
}

// ---------------------------------------------------------------------------
// Matcher events
// ---------------------------------------------------------------------------

/// What produced a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitOrigin {
    Fragment,
    Rescue,
    Manual,
}

/// A line became the matcher's current position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEvent {
    pub seq: u64,
    pub index: usize,
    pub score: f64,
    pub origin: CommitOrigin,
    /// Time between the first observation of this candidate and its commit.
    pub latency_ms: u64,
    pub at_ms: u64,
}

/// Why a rescue fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RescueReason {
    Idle,
    Stuck,
    WeakFinal,
}

/// A rescue path advanced the position.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RescueEvent {
    pub seq: u64,
    pub index: usize,
    pub reason: RescueReason,
    pub at_ms: u64,
}

/// Per-reason suppression counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuppressionCounts {
    pub duplicate: u32,
    pub backwards: u32,
    pub leap: u32,
    pub freeze: u32,
    pub low_confidence: u32,
    pub below_threshold: u32,
}

impl SuppressionCounts {
    pub fn total(&self) -> u32 {
        self.duplicate
            + self.backwards
            + self.leap
            + self.freeze
            + self.low_confidence
            + self.below_threshold
    }
}

/// Periodic matcher telemetry; counters reset after each emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatcherStats {
    pub seq: u64,
    pub window_ms: u64,
    pub commits: u32,
    pub suppressed: SuppressionCounts,
    pub avg_score: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    /// 95th percentile gap between consecutive commits.
    pub p95_gap_ms: Option<u64>,
    pub avg_tween_steps: Option<f64>,
}

/// Everything the matcher publishes, on one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MatcherEvent {
    Commit(CommitEvent),
    Rescue(RescueEvent),
    Stats(MatcherStats),
}
