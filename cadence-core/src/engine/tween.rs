//! Exponential approach used to glide onto a committed line.

/// Give up gliding after this many frames and snap.
const MAX_TWEEN_STEPS: u32 = 240;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineTween {
    pub line: usize,
    target: f64,
    steps: u32,
}

/// One frame of tween output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TweenStep {
    pub offset: f64,
    pub done: bool,
}

impl LineTween {
    /// `target` must already be clamped to the scrollable range.
    pub fn new(line: usize, target: f64) -> Self {
        Self {
            line,
            target,
            steps: 0,
        }
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    /// Cover `factor` of the remaining distance; snap once within `snap_px`.
    pub fn advance(&mut self, current: f64, factor: f64, snap_px: f64) -> TweenStep {
        self.steps += 1;
        let next = current + (self.target - current) * factor;
        if (self.target - next).abs() <= snap_px || self.steps >= MAX_TWEEN_STEPS {
            return TweenStep {
                offset: self.target,
                done: true,
            };
        }
        TweenStep {
            offset: next,
            done: false,
        }
    }
}
