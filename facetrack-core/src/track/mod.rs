//! track — per-target single-object trackers
//!
//! A tracker is seeded once with a detection box and then nudged along with
//! every new frame.  The contract is [`FaceTracker`]; [`TrackerStep`] adapts
//! an implementation to the worker loop (stage / re-seed / read back under
//! the worker's lock).
//!
//! The bundled [`NccTracker`] is a normalized template matcher over the
//! grayscale plane: cheap enough to run every tick, with a score that decays
//! as the match quality degrades so the manager's attenuation can retire a
//! drifting target.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use image::GrayImage;
use imageproc::template_matching::{find_extremes, match_template, MatchTemplateMethod};
use tracing::{debug, warn};

use crate::detect::MIN_INPUT_DIM;
use crate::frame::FrameBuffer;
use crate::geometry::{PointF, Rect};
use crate::worker::{ErrorBurst, WorkStep};

/// Single-object visual tracker contract.
///
/// `update` returns the tracked box in original-frame coordinates, with a
/// score that starts at the seed's confidence and decays as tracking quality
/// drops; `None` means the tracker has lost the target entirely.
pub trait FaceTracker: Send + 'static {
    fn begin(&mut self, frame: &FrameBuffer, seed: Rect);
    fn update(&mut self, frame: &FrameBuffer) -> Option<Rect>;

    /// Facial landmarks for the current box, when the implementation has a
    /// landmark model loaded.
    fn landmarks(&self) -> Option<Vec<PointF>> {
        None
    }

    /// Load a landmark model; implementations without landmark support accept
    /// and ignore the path.
    fn set_landmark_model(&mut self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

// ── Worker step ──────────────────────────────────────────────────────────────

/// Work step owning a boxed tracker plus staged frame, pending seed and the
/// latest tracked box.
pub struct TrackerStep {
    tracker: Box<dyn FaceTracker>,
    staged: Option<Arc<FrameBuffer>>,
    seed: Option<Rect>,
    rect: Option<Rect>,
    burst: ErrorBurst,
}

impl TrackerStep {
    pub fn new(tracker: Box<dyn FaceTracker>) -> Self {
        Self { tracker, staged: None, seed: None, rect: None, burst: ErrorBurst::default() }
    }

    /// Stage the next frame to track against.
    pub fn stage(&mut self, frame: Arc<FrameBuffer>) {
        self.staged = Some(frame);
    }

    /// Re-seed the tracker on the next work step.
    pub fn set_position(&mut self, seed: Rect) {
        self.seed = Some(seed);
        self.rect = None;
    }

    /// Latest tracked box; `None` until the first track completes or after
    /// the target is lost.
    pub fn face(&self) -> Option<Rect> {
        self.rect
    }

    pub fn landmarks(&self) -> Option<Vec<PointF>> {
        self.tracker.landmarks()
    }

    pub fn set_landmark_model(&mut self, path: &Path) {
        if let Err(e) = self.tracker.set_landmark_model(path) {
            warn!(error = %e, "failed to load landmark model");
        }
    }
}

impl WorkStep for TrackerStep {
    fn run(&mut self) {
        let Some(frame) = self.staged.take() else {
            return;
        };
        if frame.width() < MIN_INPUT_DIM || frame.height() < MIN_INPUT_DIM {
            if self.burst.failed() {
                warn!(width = frame.width(), height = frame.height(), "tracker input too small");
            }
            return;
        }
        self.burst.succeeded();

        if let Some(seed) = self.seed.take() {
            self.tracker.begin(&frame, seed);
            // The seed box itself is the first result; the manager publishes
            // nothing until the first real update confirms it.
            self.rect = Some(seed);
        } else {
            self.rect = self.tracker.update(&frame);
        }
    }
}

// ── Bundled template-matching tracker ────────────────────────────────────────

/// Search margin around the previous box, as a fraction of the template edge.
const SEARCH_MARGIN: f32 = 0.5;
/// Above this normalized squared error the target counts as lost.
const MAX_MATCH_ERROR: f32 = 1.5;

/// Template-matching tracker over the grayscale plane, scored by normalized
/// sum of squared errors (zero for a perfect match).
///
/// Score model follows the correlation-filter convention: the seed confidence
/// decays by the ratio of best-to-worst match quality seen so far, scaled by
/// elapsed wall time, so a target that keeps matching cleanly keeps most of
/// its confidence.
pub struct NccTracker {
    template: Option<GrayImage>,
    // Position in scaled-frame pixels.
    pos: (i32, i32),
    score: f32,
    resp_max: f32,
    resp_min: f32,
    last_update: Option<Instant>,
}

impl NccTracker {
    pub fn new() -> Self {
        Self {
            template: None,
            pos: (0, 0),
            score: 0.0,
            resp_max: 0.0,
            resp_min: f32::INFINITY,
            last_update: None,
        }
    }

    /// Copy a clamped window out of the gray plane; returns the image plus
    /// the effective origin after clamping.
    fn crop_gray(frame: &FrameBuffer, x: i32, y: i32, w: u32, h: u32) -> (GrayImage, i32, i32) {
        let fw = frame.width() as i32;
        let fh = frame.height() as i32;
        let x = x.clamp(0, (fw - w as i32).max(0));
        let y = y.clamp(0, (fh - h as i32).max(0));
        let w = w.min(fw as u32);
        let h = h.min(fh as u32);
        let gray = frame.gray();
        let mut out = Vec::with_capacity((w * h) as usize);
        for row in 0..h as usize {
            let start = (y as usize + row) * fw as usize + x as usize;
            out.extend_from_slice(&gray[start..start + w as usize]);
        }
        (GrayImage::from_raw(w, h, out).unwrap_or_else(|| GrayImage::new(1, 1)), x, y)
    }
}

impl Default for NccTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FaceTracker for NccTracker {
    fn begin(&mut self, frame: &FrameBuffer, seed: Rect) {
        let s = frame.scale().max(1) as i32;
        let x = seed.x0 / s;
        let y = seed.y0 / s;
        let w = (seed.width() / s).max(1) as u32;
        let h = (seed.height() / s).max(1) as u32;
        let (template, tx, ty) = Self::crop_gray(frame, x, y, w, h);
        self.template = Some(template);
        self.pos = (tx, ty);
        self.score = if seed.score.is_nan() { 0.0 } else { seed.score };
        self.resp_max = 0.0;
        self.resp_min = f32::INFINITY;
        self.last_update = Some(Instant::now());
        debug!(x, y, w, h, score = self.score, "template tracker seeded");
    }

    fn update(&mut self, frame: &FrameBuffer) -> Option<Rect> {
        let template = self.template.as_ref()?;
        let (tw, th) = template.dimensions();

        let margin_x = ((tw as f32 * SEARCH_MARGIN) as i32).max(4);
        let margin_y = ((th as f32 * SEARCH_MARGIN) as i32).max(4);
        let sw = tw + 2 * margin_x as u32;
        let sh = th + 2 * margin_y as u32;
        let (window, wx, wy) =
            Self::crop_gray(frame, self.pos.0 - margin_x, self.pos.1 - margin_y, sw, sh);
        if window.width() < tw || window.height() < th {
            return None;
        }

        let response =
            match_template(&window, template, MatchTemplateMethod::SumOfSquaredErrorsNormalized);
        let extremes = find_extremes(&response);
        let err = extremes.min_value;
        if !err.is_finite() || err > MAX_MATCH_ERROR {
            self.template = None;
            return None;
        }

        let (px, py) = extremes.min_value_location;
        self.pos = (wx + px as i32, wy + py as i32);

        // Quality-ratio decay: a widening spread between the best and worst
        // match seen shortens the target's remaining confidence.
        let peak = 1.0 / (1.0 + err);
        self.resp_max = self.resp_max.max(peak);
        self.resp_min = self.resp_min.min(peak);
        let now = Instant::now();
        let dt = self
            .last_update
            .map(|t| now.duration_since(t).as_secs_f32())
            .unwrap_or(0.0);
        self.last_update = Some(now);
        let spread = if self.resp_min > 0.0 { self.resp_max / self.resp_min } else { 1.0 };
        self.score /= 1.0 + spread * dt;

        let s = frame.scale().max(1) as i32;
        Some(Rect::new(
            self.pos.0 * s,
            self.pos.1 * s,
            (self.pos.0 + tw as i32) * s,
            (self.pos.1 + th as i32) * s,
            self.score,
        ))
    }
}
