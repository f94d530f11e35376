//! Box geometry shared by anchors, proposals, targets and detections
//!
//! Boxes are stored as `(y1, x1, y2, x2)`. Unless a function says otherwise the
//! coordinates are normalized to the image (0.0-1.0).

use crate::EPS;
use ndarray::{Array2, ArrayView2, ArrayViewMut1};
use serde::{Deserialize, Serialize};

/// Axis-aligned box in `(y1, x1, y2, x2)` order
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoxCoords {
    /// Top edge
    pub y1: f32,
    /// Left edge
    pub x1: f32,
    /// Bottom edge
    pub y2: f32,
    /// Right edge
    pub x2: f32,
}

impl BoxCoords {
    /// Create a new box
    #[must_use]
    pub fn new(y1: f32, x1: f32, y2: f32, x2: f32) -> Self {
        Self { y1, x1, y2, x2 }
    }

    /// Build a box from a `[y1, x1, y2, x2]` row
    #[must_use]
    pub fn from_array(row: [f32; 4]) -> Self {
        Self::new(row[0], row[1], row[2], row[3])
    }

    /// Box as a `[y1, x1, y2, x2]` row
    #[must_use]
    pub fn to_array(&self) -> [f32; 4] {
        [self.y1, self.x1, self.y2, self.x2]
    }

    /// Read every row of a `[n, 4]` view
    #[must_use]
    pub fn rows(view: ArrayView2<f32>) -> Vec<BoxCoords> {
        view.outer_iter()
            .map(|row| Self::new(row[0], row[1], row[2], row[3]))
            .collect()
    }

    /// Write this box into a row of length 4
    pub fn write_row(&self, mut row: ArrayViewMut1<f32>) {
        row[0] = self.y1;
        row[1] = self.x1;
        row[2] = self.y2;
        row[3] = self.x2;
    }

    /// A padded slot: every coordinate is exactly zero
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.y1 == 0.0 && self.x1 == 0.0 && self.y2 == 0.0 && self.x2 == 0.0
    }

    /// Finite coordinates with `y1 <= y2` and `x1 <= x2`
    #[must_use]
    pub fn is_ordered(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite()) && self.y1 <= self.y2 && self.x1 <= self.x2
    }

    #[must_use]
    #[inline]
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    #[must_use]
    #[inline]
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    #[must_use]
    #[inline]
    pub fn area(&self) -> f32 {
        self.height() * self.width()
    }

    /// Center as `(cy, cx)`
    #[must_use]
    pub fn center(&self) -> (f32, f32) {
        (self.y1 + 0.5 * self.height(), self.x1 + 0.5 * self.width())
    }

    /// Calculate Intersection over Union (`IoU`) with another box
    #[must_use]
    #[inline]
    pub fn iou(&self, other: &BoxCoords) -> f32 {
        let y1 = self.y1.max(other.y1);
        let x1 = self.x1.max(other.x1);
        let y2 = self.y2.min(other.y2);
        let x2 = self.x2.min(other.x2);

        let intersection = (y2 - y1).max(0.0) * (x2 - x1).max(0.0);
        if intersection <= 0.0 {
            return 0.0;
        }

        let union = self.area() + other.area() - intersection;
        intersection / (union + EPS)
    }

    /// Multiply y coordinates by `sy` and x coordinates by `sx`
    #[must_use]
    pub fn scale(&self, sy: f32, sx: f32) -> Self {
        Self::new(self.y1 * sy, self.x1 * sx, self.y2 * sy, self.x2 * sx)
    }

    /// Clamp every edge into `window`
    #[must_use]
    pub fn clip(&self, window: &BoxCoords) -> Self {
        Self::new(
            self.y1.clamp(window.y1, window.y2),
            self.x1.clamp(window.x1, window.x2),
            self.y2.clamp(window.y1, window.y2),
            self.x2.clamp(window.x1, window.x2),
        )
    }

    /// Round every coordinate to the nearest integer
    #[must_use]
    pub fn round(&self) -> Self {
        Self::new(
            self.y1.round(),
            self.x1.round(),
            self.y2.round(),
            self.x2.round(),
        )
    }

    /// Apply a regression delta to this box
    ///
    /// Decoding:
    /// ```text
    /// cy' = cy + dy * h      h' = h * exp(dh)
    /// cx' = cx + dx * w      w' = w * exp(dw)
    /// ```
    #[must_use]
    pub fn apply_delta(&self, delta: &BoxDelta) -> Self {
        let (cy, cx) = self.center();
        let height = self.height();
        let width = self.width();

        let cy = cy + delta.dy * height;
        let cx = cx + delta.dx * width;
        let height = height * delta.dh.exp();
        let width = width * delta.dw.exp();

        Self::new(
            cy - 0.5 * height,
            cx - 0.5 * width,
            cy + 0.5 * height,
            cx + 0.5 * width,
        )
    }

    /// Delta that moves this box onto `target`, normalized by this box's size
    #[must_use]
    pub fn delta_to(&self, target: &BoxCoords) -> BoxDelta {
        let (cy, cx) = self.center();
        let (gt_cy, gt_cx) = target.center();
        let height = self.height();
        let width = self.width();

        BoxDelta {
            dy: (gt_cy - cy) / (height + EPS),
            dx: (gt_cx - cx) / (width + EPS),
            dh: (target.height() / (height + EPS)).max(EPS).ln(),
            dw: (target.width() / (width + EPS)).max(EPS).ln(),
        }
    }
}

/// Box regression delta `(dy, dx, log(dh), log(dw))`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoxDelta {
    pub dy: f32,
    pub dx: f32,
    pub dh: f32,
    pub dw: f32,
}

impl BoxDelta {
    #[must_use]
    pub fn from_array(row: [f32; 4]) -> Self {
        Self {
            dy: row[0],
            dx: row[1],
            dh: row[2],
            dw: row[3],
        }
    }

    #[must_use]
    pub fn to_array(&self) -> [f32; 4] {
        [self.dy, self.dx, self.dh, self.dw]
    }

    /// Multiply each component by the matching standard deviation
    #[must_use]
    pub fn denormalize(&self, std_dev: &[f32; 4]) -> Self {
        Self {
            dy: self.dy * std_dev[0],
            dx: self.dx * std_dev[1],
            dh: self.dh * std_dev[2],
            dw: self.dw * std_dev[3],
        }
    }

    /// Divide each component by the matching standard deviation
    #[must_use]
    pub fn normalize(&self, std_dev: &[f32; 4]) -> Self {
        Self {
            dy: self.dy / (std_dev[0] + EPS),
            dx: self.dx / (std_dev[1] + EPS),
            dh: self.dh / (std_dev[2] + EPS),
            dw: self.dw / (std_dev[3] + EPS),
        }
    }
}

/// Pairwise `IoU` matrix, `[a.len(), b.len()]`
#[must_use]
pub fn overlaps(a: &[BoxCoords], b: &[BoxCoords]) -> Array2<f32> {
    Array2::from_shape_fn((a.len(), b.len()), |(i, j)| a[i].iou(&b[j]))
}
