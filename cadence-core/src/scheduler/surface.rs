//! Host renderer seam.

use std::sync::Arc;

use parking_lot::Mutex;

/// Layout measurements read from the scroller.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SurfaceMetrics {
    pub scroll_top: f64,
    pub viewport_height: f64,
    pub content_height: f64,
}

impl SurfaceMetrics {
    /// Largest valid scroll offset.
    pub fn max_scroll(&self) -> f64 {
        (self.content_height - self.viewport_height).max(0.0)
    }

    pub fn clamp(&self, offset: f64) -> f64 {
        offset.clamp(0.0, self.max_scroll())
    }
}

/// The physical scroller the scheduler writes into.
///
/// Implementations are expected to be cheap to query; the scheduler reads
/// metrics once per flush.
pub trait ScrollSurface: Send + 'static {
    fn metrics(&self) -> SurfaceMetrics;

    /// Perform the physical scroll. `offset` is already clamped.
    fn write_scroll_top(&mut self, offset: f64);
}

#[derive(Debug, Default)]
struct MemoryInner {
    metrics: SurfaceMetrics,
    writes: Vec<f64>,
}

/// In-memory scroller that records every physical write.
///
/// Clones share state, so a test (or the simulator) can keep one handle while
/// the scheduler owns another.
#[derive(Debug, Clone, Default)]
pub struct MemorySurface {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemorySurface {
    pub fn new(viewport_height: f64, content_height: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                metrics: SurfaceMetrics {
                    scroll_top: 0.0,
                    viewport_height,
                    content_height,
                },
                writes: Vec::new(),
            })),
        }
    }

    /// Simulate a user-driven scroll (wheel/touch); not recorded as a write.
    pub fn user_scroll_to(&self, offset: f64) {
        let mut inner = self.inner.lock();
        inner.metrics.scroll_top = inner.metrics.clamp(offset);
    }

    pub fn set_content_height(&self, content_height: f64) {
        self.inner.lock().metrics.content_height = content_height;
    }

    pub fn scroll_top(&self) -> f64 {
        self.inner.lock().metrics.scroll_top
    }

    pub fn writes(&self) -> Vec<f64> {
        self.inner.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.inner.lock().writes.len()
    }

    pub fn clear_writes(&self) {
        self.inner.lock().writes.clear();
    }
}

impl ScrollSurface for MemorySurface {
    fn metrics(&self) -> SurfaceMetrics {
        self.inner.lock().metrics
    }

    fn write_scroll_top(&mut self, offset: f64) {
        let mut inner = self.inner.lock();
        inner.metrics.scroll_top = offset;
        inner.writes.push(offset);
    }
}
