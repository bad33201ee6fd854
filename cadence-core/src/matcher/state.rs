//! Commit bookkeeping owned by the matcher.

/// A candidate seen once and awaiting a confirming observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCandidate {
    pub index: usize,
    pub first_seen_ms: u64,
}

impl PendingCandidate {
    pub fn new(index: usize, first_seen_ms: u64) -> Self {
        Self {
            index,
            first_seen_ms,
        }
    }

    /// Whether `index` re-observed at `now_ms` confirms this candidate.
    pub fn confirms(&self, index: usize, now_ms: u64, window_ms: u64) -> bool {
        self.index == index && now_ms.saturating_sub(self.first_seen_ms) <= window_ms
    }
}

/// Everything the gating pipeline remembers between fragments.
///
/// Created on enable, replaced wholesale on disable or re-anchor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitState {
    /// Start of the match window. Never decreases while ingesting fragments.
    pub current_index: usize,
    pub last_committed_index: Option<usize>,
    pub last_score: f64,
    pub last_commit_ms: Option<u64>,
    /// When `current_index` last changed (or the state was created).
    pub last_index_change_ms: u64,
    pub pending_leap: Option<PendingCandidate>,
    /// Low-score candidate awaiting corroboration.
    pub pending_weak: Option<PendingCandidate>,
    pub freeze_until: u64,
    pub leap_cooldown_until: u64,
    /// Set by a manual nudge; the next observation bypasses duplicate
    /// suppression.
    pub nudge_pending: bool,
    /// Fragments ingested since the last commit.
    pub fragments_since_commit: u32,
    /// Reference point for the idle rescue deadline.
    pub idle_anchor_ms: u64,
}

impl CommitState {
    pub fn starting_at(index: usize, now_ms: u64) -> Self {
        Self {
            current_index: index,
            last_index_change_ms: now_ms,
            idle_anchor_ms: now_ms,
            ..Self::default()
        }
    }

    /// First line a fragment may match: the last committed line, which sits
    /// behind `current_index` when silent lines follow it.
    pub fn window_start(&self) -> usize {
        self.last_committed_index
            .map_or(self.current_index, |i| i.min(self.current_index))
    }

    pub fn is_frozen(&self, now_ms: u64) -> bool {
        now_ms < self.freeze_until
    }
}
