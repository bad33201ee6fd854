//! Off-frame input from speech and VAD producers.
//!
//! Recognizer callbacks usually run on their own thread. They can either
//! push [`SpeechInput`]s through the sender returned by
//! `CadenceEngine::speech_sender` (drained at the start of every frame), or
//! lock a [`SharedEngine`] and call the engine directly.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use super::CadenceEngine;
use crate::governor::AlignmentSample;

/// Engine shared between the frame loop and speech threads.
pub type SharedEngine = Arc<Mutex<CadenceEngine>>;

/// One queued input for the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeechInput {
    Fragment {
        text: String,
        is_final: bool,
        confidence: f64,
    },
    Sample(AlignmentSample),
    VoiceActivity(bool),
    /// Words-per-minute estimate from the pacing analyzer.
    Pacing(f64),
}

pub(crate) struct SpeechBridge {
    tx: Sender<SpeechInput>,
    rx: Receiver<SpeechInput>,
}

impl SpeechBridge {
    pub(crate) fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    pub(crate) fn sender(&self) -> Sender<SpeechInput> {
        self.tx.clone()
    }

    /// Everything queued so far, in arrival order.
    pub(crate) fn take_pending(&self) -> Vec<SpeechInput> {
        self.rx.try_iter().collect()
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.rx.len()
    }
}
