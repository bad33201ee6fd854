//! Line geometry supplied by the host renderer.

/// Vertical extent of one rendered script line, in content coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineBox {
    pub top: f64,
    pub height: f64,
}

impl LineBox {
    pub fn center(&self) -> f64 {
        self.top + self.height / 2.0
    }
}

/// Measured line boxes, ordered by line index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineLayout {
    boxes: Vec<LineBox>,
}

impl LineLayout {
    /// Boxes must be ordered by `top`; non-finite entries are dropped along
    /// with everything after them.
    pub fn new(boxes: Vec<LineBox>) -> Self {
        let valid = boxes
            .iter()
            .take_while(|b| b.top.is_finite() && b.height.is_finite() && b.height >= 0.0)
            .count();
        let mut boxes = boxes;
        boxes.truncate(valid);
        Self { boxes }
    }

    /// Evenly spaced lines.
    pub fn uniform(count: usize, line_height: f64) -> Self {
        Self::new(
            (0..count)
                .map(|i| LineBox {
                    top: i as f64 * line_height,
                    height: line_height,
                })
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn line_box(&self, index: usize) -> Option<LineBox> {
        self.boxes.get(index).copied()
    }

    pub fn avg_line_height(&self) -> Option<f64> {
        if self.boxes.is_empty() {
            return None;
        }
        Some(self.boxes.iter().map(|b| b.height).sum::<f64>() / self.boxes.len() as f64)
    }

    /// Index of the last line starting at or above `offset`.
    pub fn line_at(&self, offset: f64) -> Option<usize> {
        if self.boxes.is_empty() {
            return None;
        }
        let after = self.boxes.partition_point(|b| b.top <= offset);
        Some(after.saturating_sub(1))
    }
}
