//! Event types exposed to collaborators (UI, display mirrors, telemetry sinks).
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so hosts can
//! forward them over whatever channel they use.

pub mod events;
