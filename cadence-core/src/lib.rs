//! # cadence-core
//!
//! Scroll synchronization engine for teleprompter-style script displays.
//!
//! ## Architecture
//!
//! ```text
//! speech / VAD / pacing / manual input
//!            │
//!      CadenceEngine (mode router)
//!       │            │
//!  SpeedGovernor   AlignmentMatcher
//!  (velocity)      (committed line → tween)
//!       │            │
//!       └─► ScrollScheduler ◄─┘
//!                 │  one write per frame
//!           ScrollSurface (host)
//! ```
//!
//! Exactly one of governor and matcher drives the view at a time; which one is
//! decided by the active [`ScrollMode`]. All timing is measured against an
//! injected [`Clock`].

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod governor;
pub mod ipc;
pub mod matcher;
pub mod scheduler;
pub mod script;

// Convenience re-exports for downstream crates
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, GovernorConfig, MatcherConfig, RouterConfig};
pub use engine::{
    CadenceEngine, FrameReport, LineBox, LineLayout, ScrollMode, ScrollTarget, SharedEngine,
    SpeechInput, StepCommand,
};
pub use error::{CadenceError, Result};
pub use governor::{AlignmentSample, SpeedGovernor};
pub use ipc::events::{
    CommitEvent, CommitOrigin, GovernorDiagnostic, GovernorPhase, MatcherEvent, MatcherStats,
    ModeChangedEvent, RescueEvent, RescueReason, SuppressionCounts,
};
pub use matcher::{AlignmentMatcher, MatchOutcome};
pub use scheduler::{MemorySurface, ScrollScheduler, ScrollSurface, SurfaceMetrics};
pub use script::{Script, ScriptLine};
