//! detect — whole-frame face detection
//!
//! The detector is a black box behind [`FaceDetector`]: given a frame
//! snapshot and crop margins it returns face boxes in original-frame
//! coordinates.  [`DetectorStep`] adapts any implementation to the worker
//! loop, guarding undersized inputs and absorbing per-cycle failures.
//!
//! The bundled [`OnnxFaceDetector`] runs a single-class YOLOv8-style face
//! model: letterbox-free resize to the model input, NCHW f32 tensor, decode,
//! greedy NMS.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use fast_image_resize as fr;
use ort::session::Session;
use ort::value::Tensor;
use rayon::prelude::*;
use tracing::warn;

use crate::frame::FrameBuffer;
use crate::geometry::Rect;
use crate::worker::{ErrorBurst, WorkStep};

/// Smallest usable detector input edge, in scaled pixels.
pub const MIN_INPUT_DIM: u32 = 80;

/// Margins trimmed off the frame before detection, in original-frame pixels.
#[derive(Debug, Clone, Copy, Default)]
pub struct CropMargins {
    pub left: i32,
    pub right: i32,
    pub top: i32,
    pub bottom: i32,
}

/// Whole-frame face detection contract.  Implementations are selected at
/// construction; results are in original-frame coordinates.
pub trait FaceDetector: Send + 'static {
    fn detect(&mut self, frame: &FrameBuffer, crop: CropMargins) -> Result<Vec<Rect>>;
}

// ── Worker step ──────────────────────────────────────────────────────────────

/// Work step owning a boxed detector plus the staged frame and latest results.
pub struct DetectorStep {
    detector: Box<dyn FaceDetector>,
    crop: CropMargins,
    staged: Option<Arc<FrameBuffer>>,
    results: Vec<Rect>,
    burst: ErrorBurst,
}

impl DetectorStep {
    pub fn new(detector: Box<dyn FaceDetector>) -> Self {
        Self {
            detector,
            crop: CropMargins::default(),
            staged: None,
            results: Vec::new(),
            burst: ErrorBurst::default(),
        }
    }

    pub fn set_crop(&mut self, crop: CropMargins) {
        self.crop = crop;
    }

    /// Stage the next frame; the handle is released as soon as one detection
    /// pass has consumed it.
    pub fn stage(&mut self, frame: Arc<FrameBuffer>) {
        self.staged = Some(frame);
    }

    /// Latest completed results.
    pub fn faces(&self) -> Vec<Rect> {
        self.results.clone()
    }
}

impl WorkStep for DetectorStep {
    fn run(&mut self) {
        let Some(frame) = self.staged.take() else {
            return;
        };

        let scale = frame.scale().max(1) as i32;
        let cw = frame.width() as i32 - (self.crop.left + self.crop.right) / scale;
        let ch = frame.height() as i32 - (self.crop.top + self.crop.bottom) / scale;
        if cw < MIN_INPUT_DIM as i32 || ch < MIN_INPUT_DIM as i32 {
            if self.burst.failed() {
                warn!(
                    width = frame.width(),
                    height = frame.height(),
                    "detector input too small after crop, skipping"
                );
            }
            return;
        }

        match self.detector.detect(&frame, self.crop) {
            Ok(rects) => {
                self.burst.succeeded();
                self.results = rects;
            }
            Err(e) => {
                if self.burst.failed() {
                    warn!(error = %e, "face detection failed");
                }
            }
        }
    }
}

// ── Bundled ONNX detector ────────────────────────────────────────────────────

/// Model input edge (square).
const INPUT_SIZE: u32 = 640;
/// Confidence threshold below which proposals are dropped.
const CONF_THRESHOLD: f32 = 0.5;
/// IoU threshold for greedy NMS.
const IOU_THRESHOLD: f32 = 0.45;

/// Single-class YOLOv8-style face detector on ONNX Runtime.
pub struct OnnxFaceDetector {
    session: Session,
    resizer: fr::Resizer,
    resize_buf: Vec<u8>,
}

impl OnnxFaceDetector {
    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let session = Session::builder()
            .context("failed to create ONNX session builder")?
            .with_intra_threads(1)
            .context("failed to set intra threads")?
            .with_inter_threads(1)
            .context("failed to set inter threads")?
            .commit_from_file(model_path.as_ref())
            .context("failed to load face detection model")?;
        Ok(Self {
            session,
            resizer: fr::Resizer::new(),
            resize_buf: vec![0u8; (INPUT_SIZE * INPUT_SIZE * 3) as usize],
        })
    }

    fn preprocess(&mut self, frame: &FrameBuffer, region: (u32, u32, u32, u32)) -> Result<Vec<f32>> {
        let (rx, ry, rw, rh) = region;

        // Copy the cropped region out row by row, then resize to the model
        // input.
        let stride = frame.width() as usize * 3;
        let mut region_buf = vec![0u8; (rw * rh * 3) as usize];
        let src_rgb = frame.rgb();
        for row in 0..rh as usize {
            let src_start = (ry as usize + row) * stride + rx as usize * 3;
            let dst_start = row * rw as usize * 3;
            region_buf[dst_start..dst_start + rw as usize * 3]
                .copy_from_slice(&src_rgb[src_start..src_start + rw as usize * 3]);
        }

        let src = fr::images::ImageRef::new(rw, rh, &region_buf, fr::PixelType::U8x3)
            .context("failed to wrap detector input region")?;
        let mut dst = fr::images::Image::from_vec_u8(
            INPUT_SIZE,
            INPUT_SIZE,
            std::mem::take(&mut self.resize_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create detector resize destination")?;
        let options =
            fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("detector input resize failed")?;
        self.resize_buf = dst.into_vec();

        // NCHW f32 planes, normalized to [0, 1].
        let size = (INPUT_SIZE * INPUT_SIZE) as usize;
        let raw = &self.resize_buf;
        let mut tensor = vec![0f32; 3 * size];
        let (r_plane, gb) = tensor.split_at_mut(size);
        let (g_plane, b_plane) = gb.split_at_mut(size);
        rayon::join(
            || {
                r_plane
                    .par_iter_mut()
                    .enumerate()
                    .for_each(|(i, out)| *out = raw[i * 3] as f32 / 255.0)
            },
            || {
                rayon::join(
                    || {
                        g_plane
                            .par_iter_mut()
                            .enumerate()
                            .for_each(|(i, out)| *out = raw[i * 3 + 1] as f32 / 255.0)
                    },
                    || {
                        b_plane
                            .par_iter_mut()
                            .enumerate()
                            .for_each(|(i, out)| *out = raw[i * 3 + 2] as f32 / 255.0)
                    },
                )
            },
        );
        Ok(tensor)
    }
}

impl FaceDetector for OnnxFaceDetector {
    fn detect(&mut self, frame: &FrameBuffer, crop: CropMargins) -> Result<Vec<Rect>> {
        let scale = frame.scale().max(1) as i32;
        let rx = (crop.left / scale).clamp(0, frame.width() as i32 - 1) as u32;
        let ry = (crop.top / scale).clamp(0, frame.height() as i32 - 1) as u32;
        let rw = (frame.width() as i32 - rx as i32 - crop.right / scale).max(1) as u32;
        let rh = (frame.height() as i32 - ry as i32 - crop.bottom / scale).max(1) as u32;

        let tensor_data = self.preprocess(frame, (rx, ry, rw, rh))?;
        let shape = [1usize, 3, INPUT_SIZE as usize, INPUT_SIZE as usize];
        let input = Tensor::from_array((shape, tensor_data.into_boxed_slice()))
            .context("failed to create detector input tensor")?
            .into_dyn();

        let outputs = self
            .session
            .run(ort::inputs!["images" => input])
            .context("face detection inference failed")?;
        let (out_shape, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .context("failed to extract detector output tensor")?;

        // Output layout [1, 4 + 1, N]: cx, cy, w, h, face score, stored
        // column-major across the rows.
        let dims: Vec<i64> = out_shape.iter().copied().collect();
        anyhow::ensure!(dims.len() == 3 && dims[1] >= 5, "unexpected detector output {dims:?}");
        let n = dims[2] as usize;

        let sx = rw as f32 / INPUT_SIZE as f32;
        let sy = rh as f32 / INPUT_SIZE as f32;

        let mut candidates: Vec<Rect> = (0..n)
            .filter_map(|i| {
                let score = data[4 * n + i];
                if score < CONF_THRESHOLD {
                    return None;
                }
                let cx = data[i];
                let cy = data[n + i];
                let w = data[2 * n + i];
                let h = data[3 * n + i];
                // Model space → region space → original-frame space.
                let x0 = ((cx - w / 2.0) * sx + rx as f32) * scale as f32;
                let y0 = ((cy - h / 2.0) * sy + ry as f32) * scale as f32;
                let x1 = ((cx + w / 2.0) * sx + rx as f32) * scale as f32;
                let y1 = ((cy + h / 2.0) * sy + ry as f32) * scale as f32;
                Some(Rect::new(x0 as i32, y0 as i32, x1 as i32, y1 as i32, score))
            })
            .collect();

        candidates = nms(candidates, IOU_THRESHOLD);
        Ok(candidates)
    }
}

/// Greedy NMS: keep the highest-confidence box, suppress everything that
/// overlaps it beyond `iou_thresh`, repeat.
fn nms(mut boxes: Vec<Rect>, iou_thresh: f32) -> Vec<Rect> {
    boxes.sort_unstable_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Rect> = Vec::new();
    let mut suppressed = vec![false; boxes.len()];
    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        kept.push(boxes[i]);
        for j in (i + 1)..boxes.len() {
            if iou(&boxes[i], &boxes[j]) > iou_thresh {
                suppressed[j] = true;
            }
        }
    }
    kept
}

fn iou(a: &Rect, b: &Rect) -> f32 {
    let inter = crate::geometry::common_area(a, b);
    if inter <= 0.0 {
        return 0.0;
    }
    inter / (a.area() + b.area() - inter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RgbFrame;

    struct FixedDetector {
        rects: Vec<Rect>,
    }

    impl FaceDetector for FixedDetector {
        fn detect(&mut self, _frame: &FrameBuffer, _crop: CropMargins) -> Result<Vec<Rect>> {
            Ok(self.rects.clone())
        }
    }

    struct FailingDetector;

    impl FaceDetector for FailingDetector {
        fn detect(&mut self, _frame: &FrameBuffer, _crop: CropMargins) -> Result<Vec<Rect>> {
            anyhow::bail!("model exploded")
        }
    }

    fn frame(w: u32, h: u32) -> Arc<FrameBuffer> {
        let f = RgbFrame { data: vec![0u8; (w * h * 3) as usize], width: w, height: h, pts: 0 };
        FrameBuffer::from_rgb(&f, 1, 0).unwrap()
    }

    #[test]
    fn step_runs_detector_and_keeps_results() {
        let rect = Rect::new(10, 10, 50, 50, 0.9);
        let mut step = DetectorStep::new(Box::new(FixedDetector { rects: vec![rect] }));
        step.stage(frame(640, 480));
        step.run();
        assert_eq!(step.faces(), vec![rect]);
        // No staged frame: nothing happens, results stay.
        step.run();
        assert_eq!(step.faces(), vec![rect]);
    }

    #[test]
    fn step_skips_undersized_input() {
        let mut step =
            DetectorStep::new(Box::new(FixedDetector { rects: vec![Rect::new(0, 0, 1, 1, 1.0)] }));
        step.stage(frame(64, 64));
        step.run();
        assert!(step.faces().is_empty());
    }

    #[test]
    fn step_absorbs_detector_errors() {
        let mut step = DetectorStep::new(Box::new(FailingDetector));
        for _ in 0..5 {
            step.stage(frame(640, 480));
            step.run();
        }
        assert!(step.faces().is_empty());
    }

    #[test]
    fn nms_suppresses_overlapping_boxes() {
        let boxes = vec![
            Rect::new(0, 0, 100, 100, 0.9),
            Rect::new(5, 5, 105, 105, 0.8),
            Rect::new(200, 200, 300, 300, 0.7),
        ];
        let kept = nms(boxes, 0.45);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].score, 0.9);
        assert_eq!(kept[1].score, 0.7);
    }
}
