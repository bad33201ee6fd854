//! Scroll write scheduler.
//!
//! ## Frame contract
//!
//! ```text
//! request_write / request_scroll_by   (any number, any time)
//!          │  last value wins
//!          ▼
//!     PendingWrite (at most one)
//!          │  flush(), once per frame
//!          ▼
//!   clamp → physical write → queued reads
//! ```
//!
//! Reads are flushed after the write so layout measurements never force a
//! synchronous reflow between two writes. The scheduler keeps nothing across
//! frames except the single pending value.

pub mod surface;

pub use surface::{MemorySurface, ScrollSurface, SurfaceMetrics};

use tracing::{debug, trace};

/// Offsets closer than this to the current scroll position are not written.
const REDUNDANT_WRITE_EPSILON: f64 = 1e-3;

/// A layout read deferred until after this frame's write.
pub type ReadRequest = Box<dyn FnOnce(&SurfaceMetrics) + Send>;

/// The single in-flight write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingWrite {
    pub offset: f64,
    pub requested_at_ms: u64,
}

/// Counters for observability. Never reset by `flush`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerCounters {
    pub requests: u64,
    pub coalesced: u64,
    pub writes: u64,
    pub redundant_skipped: u64,
    pub dropped_without_surface: u64,
}

/// Coalesces scroll writes into one physical write per frame.
#[derive(Default)]
pub struct ScrollScheduler {
    surface: Option<Box<dyn ScrollSurface>>,
    pending: Option<PendingWrite>,
    reads: Vec<ReadRequest>,
    counters: SchedulerCounters,
}

impl ScrollScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_surface<S: ScrollSurface>(surface: S) -> Self {
        Self {
            surface: Some(Box::new(surface)),
            ..Self::default()
        }
    }

    pub fn attach(&mut self, surface: Box<dyn ScrollSurface>) {
        self.surface = Some(surface);
    }

    /// Remove the scroller. Until a new one is attached every request is a no-op.
    pub fn detach(&mut self) -> Option<Box<dyn ScrollSurface>> {
        self.pending = None;
        self.reads.clear();
        self.surface.take()
    }

    pub fn has_surface(&self) -> bool {
        self.surface.is_some()
    }

    /// Current scroller measurements, if a scroller is attached.
    pub fn metrics(&self) -> Option<SurfaceMetrics> {
        self.surface.as_ref().map(|s| s.metrics())
    }

    pub fn pending(&self) -> Option<PendingWrite> {
        self.pending
    }

    pub fn counters(&self) -> SchedulerCounters {
        self.counters
    }

    /// Request an absolute scroll offset for this frame.
    pub fn request_write(&mut self, offset: f64, now_ms: u64) {
        if !offset.is_finite() {
            trace!(offset, "ignoring non-finite scroll write");
            return;
        }
        self.counters.requests += 1;
        if self.pending.is_some() {
            self.counters.coalesced += 1;
        }
        self.pending = Some(PendingWrite {
            offset,
            requested_at_ms: now_ms,
        });
    }

    /// Request a scroll relative to the pending offset, or to the current
    /// position when nothing is pending.
    pub fn request_scroll_by(&mut self, delta: f64, now_ms: u64) {
        if !delta.is_finite() {
            trace!(delta, "ignoring non-finite scroll delta");
            return;
        }
        let Some(metrics) = self.metrics() else {
            self.counters.dropped_without_surface += 1;
            return;
        };
        let base = self
            .pending
            .map(|p| metrics.clamp(p.offset))
            .unwrap_or(metrics.scroll_top);
        self.request_write(base + delta, now_ms);
    }

    /// Queue a layout read to run after this frame's write.
    pub fn request_read<F>(&mut self, read: F)
    where
        F: FnOnce(&SurfaceMetrics) + Send + 'static,
    {
        self.reads.push(Box::new(read));
    }

    /// Drop the pending write without performing it.
    pub fn cancel(&mut self) {
        if self.pending.take().is_some() {
            debug!("pending scroll write cancelled");
        }
    }

    /// Perform at most one physical write, then run queued reads.
    ///
    /// Returns the offset actually written, if any.
    pub fn flush(&mut self) -> Option<f64> {
        let pending = self.pending.take();
        let reads = std::mem::take(&mut self.reads);

        let Some(surface) = self.surface.as_mut() else {
            if pending.is_some() {
                self.counters.dropped_without_surface += 1;
            }
            return None;
        };

        let mut written = None;
        if let Some(write) = pending {
            let metrics = surface.metrics();
            let offset = metrics.clamp(write.offset);
            if (offset - metrics.scroll_top).abs() <= REDUNDANT_WRITE_EPSILON {
                self.counters.redundant_skipped += 1;
            } else {
                surface.write_scroll_top(offset);
                self.counters.writes += 1;
                written = Some(offset);
            }
        }

        if !reads.is_empty() {
            let metrics = surface.metrics();
            for read in reads {
                read(&metrics);
            }
        }

        written
    }
}

impl std::fmt::Debug for ScrollScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScrollScheduler")
            .field("has_surface", &self.surface.is_some())
            .field("pending", &self.pending)
            .field("queued_reads", &self.reads.len())
            .field("counters", &self.counters)
            .finish()
    }
}
