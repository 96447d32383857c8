//! geometry — rectangles, overlap areas and the 3-axis error vector
//!
//! The control loop reasons about a target as an `f3`: (center x, center y,
//! √area).  Everything that converts between boxes, landmark sets and that
//! vector lives here so the manager and the control loop stay arithmetic-free.

use nalgebra::Vector3;

/// 3-axis value used for errors and filter state: (x, y, size).
pub type F3 = Vector3<f32>;

// ── Rectangles ───────────────────────────────────────────────────────────────

/// Integer bounding box in original-frame pixels with a detection/track score.
///
/// A valid box has `x0 <= x1` and `y0 <= y1`; a NaN score marks the box
/// invalid and is treated as zero everywhere.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
    pub score: f32,
}

impl Rect {
    pub fn new(x0: i32, y0: i32, x1: i32, y1: i32, score: f32) -> Self {
        Self { x0, y0, x1, y1, score }
    }

    pub fn width(&self) -> i32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> i32 {
        self.y1 - self.y0
    }

    pub fn area(&self) -> f32 {
        self.width() as f32 * self.height() as f32
    }

    /// Grow the box by per-side fractions of its own width/height.  Negative
    /// fractions shrink the side.
    pub fn upsized(&self, left: f32, right: f32, top: f32, bottom: f32) -> Rect {
        let w = self.width() as f32;
        let h = self.height() as f32;
        Rect {
            x0: self.x0 - (w * left) as i32,
            x1: self.x1 + (w * right) as i32,
            y0: self.y0 - (h * top) as i32,
            y1: self.y1 + (h * bottom) as i32,
            score: self.score,
        }
    }
}

/// Floating bounding box; used for crop-window bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RectF {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl RectF {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }
}

/// A single facial landmark in original-frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointF {
    pub x: f32,
    pub y: f32,
}

// ── Overlap ──────────────────────────────────────────────────────────────────

/// Length of the intersection of [a0,a1] and [b0,b1]; 0 when disjoint.
fn common_length(a0: i32, a1: i32, b0: i32, b1: i32) -> i32 {
    (a1.min(b1) - a0.max(b0)).max(0)
}

/// Intersection area of two boxes (scores ignored).
pub fn common_area(a: &Rect, b: &Rect) -> f32 {
    (common_length(a.x0, a.x1, b.x0, b.x1) * common_length(a.y0, a.y1, b.y0, b.y1)) as f32
}

// ── f3 conversions ───────────────────────────────────────────────────────────

/// Box → (center x, center y, √area).
pub fn rect_to_f3(r: &Rect) -> F3 {
    F3::new(
        (r.x0 + r.x1) as f32 * 0.5,
        (r.y0 + r.y1) as f32 * 0.5,
        (r.width() as f32 * r.height() as f32).max(0.0).sqrt(),
    )
}

/// Crop window → (center x, center y, √area).
pub fn rectf_to_f3(r: &RectF) -> F3 {
    F3::new(
        (r.x0 + r.x1) * 0.5,
        (r.y0 + r.y1) * 0.5,
        (r.width() * r.height()).max(0.0).sqrt(),
    )
}

/// Inverse of [`rect_to_f3`] for a frame with the given aspect: the box
/// centered on (u.x, u.y) whose area is u.z² and whose aspect matches w:h.
pub fn f3_to_rectf(u: &F3, w: f32, h: f32) -> RectF {
    let srwh = (w * h).sqrt();
    let s2w = w / srwh;
    let s2h = h / srwh;
    RectF {
        x0: u.x - s2w * u.z * 0.5,
        x1: u.x + s2w * u.z * 0.5,
        y0: u.y - s2h * u.z * 0.5,
        y1: u.y + s2h * u.z * 0.5,
    }
}

pub fn f3_is_nan(u: &F3) -> bool {
    u.x.is_nan() || u.y.is_nan() || u.z.is_nan()
}

/// Decibel → linear amplitude.
pub fn from_db(x: f32) -> f32 {
    (x * (std::f32::consts::LN_10 / 20.0)).exp()
}

// ── Landmarks ────────────────────────────────────────────────────────────────

// Perimeter walks for the two shape models we understand.  First index is the
// pivot used to reduce cancellation in the shoelace sum.
const OUTLINE_5: &[usize] = &[1, 0, 1, 3, 2, 4, 0];
const OUTLINE_68: &[usize] = &[
    30, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 26, 25, 24, 23, 22, 21, 20, 19,
    18, 17, 0,
];

/// Signed polygon area of the landmark outline; 0 for unknown model sizes.
pub fn landmark_area(landmark: &[PointF]) -> f32 {
    let outline = match landmark.len() {
        5 => OUTLINE_5,
        68 => OUTLINE_68,
        _ => return 0.0,
    };

    let c = landmark[outline[0]];
    let mut area = 0.0f32;
    for pair in outline[1..].windows(2) {
        let x1 = landmark[pair[0]].x - c.x;
        let y1 = landmark[pair[0]].y - c.y;
        let x2 = landmark[pair[1]].x - c.x;
        let y2 = landmark[pair[1]].y - c.y;
        area += (x2 * y1 - x1 * y2) * 0.5;
    }
    area
}

/// Mean of all landmark points.
pub fn landmark_center(landmark: &[PointF]) -> PointF {
    let mut cx = 0.0f32;
    let mut cy = 0.0f32;
    for p in landmark {
        cx += p.x;
        cy += p.y;
    }
    let n = landmark.len().max(1) as f32;
    PointF { x: cx / n, y: cy / n }
}

/// Landmark set → (centroid x, centroid y, equal-area-circle diameter).
pub fn landmark_to_f3(landmark: &[PointF]) -> F3 {
    let c = landmark_center(landmark);
    let a = landmark_area(landmark).abs();
    F3::new(c.x, c.y, 2.0 * (a / std::f32::consts::PI).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_area_matches_hand_computation() {
        let a = Rect::new(0, 0, 10, 10, 1.0);
        let b = Rect::new(5, 5, 15, 15, 1.0);
        assert_eq!(common_area(&a, &b), 25.0);
        // Containment
        let c = Rect::new(2, 2, 4, 4, 1.0);
        assert_eq!(common_area(&a, &c), 4.0);
        // Disjoint
        let d = Rect::new(20, 20, 30, 30, 1.0);
        assert_eq!(common_area(&a, &d), 0.0);
    }

    #[test]
    fn upsize_expands_asymmetrically() {
        let r = Rect::new(100, 100, 200, 200, 1.0).upsized(0.2, 0.2, 0.2, 0.2);
        assert_eq!((r.x0, r.y0, r.x1, r.y1), (80, 80, 220, 220));

        let r = Rect::new(100, 100, 200, 200, 1.0).upsized(0.2, 0.2, 0.3, 0.1);
        assert_eq!((r.x0, r.y0, r.x1, r.y1), (80, 70, 220, 210));
    }

    #[test]
    fn rect_f3_roundtrip() {
        let r = Rect::new(80, 80, 220, 220, 1.0);
        let u = rect_to_f3(&r);
        assert_eq!(u.x, 150.0);
        assert_eq!(u.y, 150.0);
        assert!((u.z - 140.0).abs() < 1e-3);

        let back = f3_to_rectf(&u, 140.0, 140.0);
        assert!((back.x0 - 80.0).abs() < 1e-3);
        assert!((back.y1 - 220.0).abs() < 1e-3);
    }

    #[test]
    fn from_db_known_points() {
        assert!((from_db(0.0) - 1.0).abs() < 1e-6);
        assert!((from_db(20.0) - 10.0).abs() < 1e-4);
        assert!((from_db(-0.45) - 0.9495).abs() < 1e-3);
    }

    #[test]
    fn landmark_area_of_square_five_point() {
        // Unit square corners + center, laid out in the 5-point order
        // (outer eye, outer eye, nose-ish points).
        let pts = [
            PointF { x: 0.0, y: 0.0 },
            PointF { x: 1.0, y: 0.0 },
            PointF { x: 0.0, y: 1.0 },
            PointF { x: 1.0, y: 1.0 },
            PointF { x: 0.0, y: 1.0 },
        ];
        // Walk 0→1→3→2→4→0 traces the square (4 reuses corner 2's position).
        assert!((landmark_area(&pts).abs() - 1.0).abs() < 1e-6);
        let c = landmark_center(&pts);
        assert!((c.x - 0.4).abs() < 1e-6);
    }

    #[test]
    fn unknown_landmark_model_has_zero_area() {
        let pts = vec![PointF { x: 0.0, y: 0.0 }; 7];
        assert_eq!(landmark_area(&pts), 0.0);
    }
}
