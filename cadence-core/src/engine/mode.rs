//! Scroll modes and the sub-engine table each one enables.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CadenceError;

/// The driving strategy. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollMode {
    /// Fixed speed.
    Timed,
    /// Speed derived from a words-per-minute estimate.
    Wpm,
    /// Speed with alignment feedback, gated by voice activity.
    Hybrid,
    /// Speech recognition commits lines; the view centers on them.
    Asr,
    /// Manual line/page steps only.
    Step,
    /// Hands off: only the presenter's own wheel/touch moves the view.
    Rehearsal,
}

/// How the governor participates in a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorRole {
    Off,
    /// Base speed, no error feedback.
    Fixed,
    /// Base speed from the pacing estimate, no error feedback.
    Paced,
    /// Base speed plus PI feedback, gated by voice activity.
    Adaptive,
    /// Held at zero while another engine drives.
    ForcedZero,
}

/// How the matcher participates in a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherRole {
    Off,
    /// Commits become alignment samples for the governor; never scrolls.
    Observer,
    /// Commits drive line centering.
    Driver,
}

/// How manual step commands are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRole {
    Off,
    Helper,
    Primary,
}

/// Sub-engine wiring for one mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeProfile {
    pub governor: GovernorRole,
    pub matcher: MatcherRole,
    pub step: StepRole,
    /// Per-frame (governor or tween) writes may be issued.
    pub continuous_writes: bool,
    /// Any write at all may be issued by the engine.
    pub programmatic_writes: bool,
}

impl ScrollMode {
    pub const ALL: [ScrollMode; 6] = [
        ScrollMode::Timed,
        ScrollMode::Wpm,
        ScrollMode::Hybrid,
        ScrollMode::Asr,
        ScrollMode::Step,
        ScrollMode::Rehearsal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ScrollMode::Timed => "timed",
            ScrollMode::Wpm => "wpm",
            ScrollMode::Hybrid => "hybrid",
            ScrollMode::Asr => "asr",
            ScrollMode::Step => "step",
            ScrollMode::Rehearsal => "rehearsal",
        }
    }

    /// Modes whose matcher commit history must not survive a transition.
    pub fn uses_matcher(self) -> bool {
        matches!(self, ScrollMode::Asr | ScrollMode::Hybrid)
    }

    pub fn profile(self) -> ModeProfile {
        use GovernorRole as G;
        use MatcherRole as M;
        use StepRole as S;

        let (governor, matcher, step, continuous_writes, programmatic_writes) = match self {
            ScrollMode::Timed => (G::Fixed, M::Off, S::Helper, true, true),
            ScrollMode::Wpm => (G::Paced, M::Off, S::Helper, true, true),
            ScrollMode::Hybrid => (G::Adaptive, M::Observer, S::Helper, true, true),
            ScrollMode::Asr => (G::ForcedZero, M::Driver, S::Helper, true, true),
            ScrollMode::Step => (G::Off, M::Off, S::Primary, false, true),
            ScrollMode::Rehearsal => (G::Off, M::Off, S::Off, false, false),
        };
        ModeProfile {
            governor,
            matcher,
            step,
            continuous_writes,
            programmatic_writes,
        }
    }
}

impl fmt::Display for ScrollMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScrollMode {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ScrollMode::ALL
            .into_iter()
            .find(|m| m.as_str() == wanted)
            .ok_or_else(|| CadenceError::UnknownMode(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!("ASR".parse::<ScrollMode>().ok(), Some(ScrollMode::Asr));
        assert_eq!(" rehearsal ".parse::<ScrollMode>().ok(), Some(ScrollMode::Rehearsal));
        assert!(matches!(
            "autopilot".parse::<ScrollMode>(),
            Err(CadenceError::UnknownMode(name)) if name == "autopilot"
        ));
    }

    #[test]
    fn display_round_trips_through_from_str() {
        for mode in ScrollMode::ALL {
            assert_eq!(mode.to_string().parse::<ScrollMode>().ok(), Some(mode));
        }
    }

    #[test]
    fn at_most_one_engine_drives_in_every_mode() {
        for mode in ScrollMode::ALL {
            let p = mode.profile();
            let governor_drives = matches!(
                p.governor,
                GovernorRole::Fixed | GovernorRole::Paced | GovernorRole::Adaptive
            );
            let matcher_drives = p.matcher == MatcherRole::Driver;
            assert!(
                !(governor_drives && matcher_drives),
                "{mode} enables two continuous engines"
            );
        }
    }

    #[test]
    fn only_rehearsal_blocks_programmatic_writes() {
        for mode in ScrollMode::ALL {
            let p = mode.profile();
            assert_eq!(p.programmatic_writes, mode != ScrollMode::Rehearsal);
        }
        assert!(!ScrollMode::Step.profile().continuous_writes);
        assert_eq!(ScrollMode::Step.profile().step, StepRole::Primary);
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_string(&ScrollMode::Wpm).expect("serialize mode");
        assert_eq!(json, r#""wpm""#);
    }
}
