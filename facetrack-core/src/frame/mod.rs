//! frame — shared, scale-tagged frame snapshots
//!
//! The tick thread, the detector thread and every tracker thread may hold the
//! same frame at once.  `FrameBuffer` is therefore immutable after
//! construction and handed around as `Arc<FrameBuffer>`; the buffer is freed
//! exactly when the last holder drops its handle, no matter which thread that
//! is.  The grayscale plane is derived lazily because only the trackers need
//! it.

use std::sync::{Arc, OnceLock};

use anyhow::{ensure, Context, Result};
use fast_image_resize as fr;

use crate::geometry::RectF;

/// A single decoded video frame in packed RGB24, row-major, plus its
/// presentation timestamp in the source time base.
pub struct RgbFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub pts: i64,
}

/// Immutable snapshot of a frame at a reduced scale.
///
/// `crop` records which sub-rectangle of the original frame the pixels cover,
/// in original-frame coordinates; detector and tracker results are mapped
/// back through `scale` so downstream code only ever sees original-frame
/// boxes.
pub struct FrameBuffer {
    width: u32,
    height: u32,
    scale: u32,
    crop: RectF,
    tick: u64,
    rgb: Vec<u8>,
    gray: OnceLock<Vec<u8>>,
}

impl FrameBuffer {
    /// Downscale `frame` by the integer factor `scale` and snapshot it.
    pub fn from_rgb(frame: &RgbFrame, scale: u32, tick: u64) -> Result<Arc<Self>> {
        let scale = scale.max(1);
        let width = (frame.width / scale).max(1);
        let height = (frame.height / scale).max(1);
        ensure!(
            frame.data.len() >= (frame.width * frame.height * 3) as usize,
            "frame buffer too short for {}x{}",
            frame.width,
            frame.height
        );

        let rgb = if scale == 1 {
            frame.data.clone()
        } else {
            let src =
                fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
                    .context("failed to wrap source frame for downscale")?;
            let mut dst = fr::images::Image::new(width, height, fr::PixelType::U8x3);
            let options = fr::ResizeOptions::new()
                .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
            fr::Resizer::new()
                .resize(&src, &mut dst, Some(&options))
                .context("frame downscale failed")?;
            dst.into_vec()
        };

        Ok(Arc::new(Self {
            width,
            height,
            scale,
            crop: RectF::new(0.0, 0.0, frame.width as f32, frame.height as f32),
            tick,
            rgb,
            gray: OnceLock::new(),
        }))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Downscale factor relative to the original frame.
    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// Sub-rectangle of the original frame these pixels cover.
    pub fn crop(&self) -> RectF {
        self.crop
    }

    /// Manager tick that produced this snapshot.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Packed RGB24 pixels at the reduced scale.
    pub fn rgb(&self) -> &[u8] {
        &self.rgb
    }

    /// BT.601 luma plane, computed on first use and cached for every later
    /// holder of the same handle.
    pub fn gray(&self) -> &[u8] {
        self.gray.get_or_init(|| {
            self.rgb
                .chunks_exact(3)
                .map(|px| {
                    ((306 * px[0] as u32 + 601 * px[1] as u32 + 117 * px[2] as u32) / 1024) as u8
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(w: u32, h: u32, rgb: [u8; 3]) -> RgbFrame {
        RgbFrame {
            data: rgb.iter().copied().cycle().take((w * h * 3) as usize).collect(),
            width: w,
            height: h,
            pts: 0,
        }
    }

    #[test]
    fn downscale_halves_dimensions() {
        let buf = FrameBuffer::from_rgb(&solid_frame(64, 48, [10, 20, 30]), 2, 7).unwrap();
        assert_eq!((buf.width(), buf.height()), (32, 24));
        assert_eq!(buf.scale(), 2);
        assert_eq!(buf.tick(), 7);
        assert_eq!(buf.crop().x1, 64.0);
        assert_eq!(buf.rgb().len(), 32 * 24 * 3);
    }

    #[test]
    fn gray_is_bt601_and_cached() {
        let buf = FrameBuffer::from_rgb(&solid_frame(8, 8, [255, 0, 0]), 1, 0).unwrap();
        let g = buf.gray();
        assert_eq!(g.len(), 64);
        // 306*255/1024 = 76
        assert_eq!(g[0], 76);
        assert!(std::ptr::eq(g.as_ptr(), buf.gray().as_ptr()));
    }

    #[test]
    fn shared_across_threads() {
        let buf = FrameBuffer::from_rgb(&solid_frame(16, 16, [1, 2, 3]), 1, 0).unwrap();
        let b2 = Arc::clone(&buf);
        let handle = std::thread::spawn(move || b2.gray().len());
        assert_eq!(handle.join().unwrap(), 256);
    }
}
