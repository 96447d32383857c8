//! control — framing error → shaped, rate-limited actuator speeds
//!
//! Once per tick the published targets are collapsed into a confidence
//! weighted error vector (center x, center y, size), shaped through a
//! deadband with a quadratic blend, run through a PI filter with anti-windup
//! plus a low-passed derivative path, and quantized into device speed units.
//! Pan/tilt gain shrinks with the camera's zoom factor: the same physical
//! speed sweeps a smaller angle when zoomed in.

use tracing::debug;

use crate::geometry::{
    f3_is_nan, landmark_area, landmark_to_f3, rect_to_f3, rectf_to_f3, F3,
};
use crate::manager::WeightedTarget;

/// Integral gain below which the anti-windup clamp is bypassed.
const KI_EPSILON: f32 = 1.0e-10;
/// Exponent of the speed quantization curve; >1 keeps fine resolution near
/// zero and saturates at the device maximum.
const QUANT_EXPONENT: f32 = 1.5;

/// Control knobs; all gains already linear (converted from dB upstream).
#[derive(Debug, Clone)]
pub struct ControlSettings {
    /// Desired framing offset, as a fraction of the crop window.
    pub track_x: f32,
    pub track_y: f32,
    /// Desired target size relative to the frame.
    pub track_z: f32,
    /// Proportional gain per axis.
    pub kp: F3,
    /// Integral gain.
    pub ki: f32,
    /// Derivative gain per axis (Td × Kp).
    pub klpf: F3,
    /// Time constant of the derivative low-pass, seconds.
    pub tlpf: f32,
    /// Deadband per axis, fraction of √(frame area).
    pub e_deadband: F3,
    /// Nonlinear-band width per axis, fraction of √(frame area).
    pub e_nonlinear: F3,
    /// Time constant of the integral decay while no face is found, seconds.
    pub lost_decay_s: f32,
    /// Frame targets by landmark centroid/area when landmarks are present.
    pub use_landmarks: bool,
    /// Face-lost timeout before the preset recall fires, ms; `None` disables.
    pub lost_preset_timeout_ms: Option<u64>,
    pub lost_preset: i32,
    /// Face-lost timeout before a zoom-out nudge starts, ms; `None` disables.
    pub lost_zoomout_timeout_ms: Option<u64>,
    /// Device speed maxima per axis.
    pub max_pan: i32,
    pub max_tilt: i32,
    pub max_zoom: i32,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            track_x: 0.0,
            track_y: 0.0,
            track_z: 0.70,
            kp: F3::new(0.95, 0.95, 0.95),
            ki: 0.3,
            klpf: F3::new(0.42 * 0.95, 0.42 * 0.95, 0.42 * 0.95),
            tlpf: 2.0,
            e_deadband: F3::zeros(),
            e_nonlinear: F3::zeros(),
            lost_decay_s: 1.0,
            use_landmarks: false,
            lost_preset_timeout_ms: None,
            lost_preset: 0,
            lost_zoomout_timeout_ms: None,
            max_pan: 24,
            max_tilt: 20,
            max_zoom: 7,
        }
    }
}

/// Quantized command for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlOutput {
    pub pan: i32,
    pub tilt: i32,
    pub zoom: i32,
    pub recall_preset: Option<i32>,
}

pub struct ControlLoop {
    settings: ControlSettings,
    detect_err: F3,
    filter_int: F3,
    filter_lpf: F3,
    face_found: bool,
    face_found_last: bool,
    lost_for_s: f32,
    preset_recalled: bool,
}

impl ControlLoop {
    pub fn new(settings: ControlSettings) -> Self {
        Self {
            settings,
            detect_err: F3::zeros(),
            filter_int: F3::zeros(),
            filter_lpf: F3::zeros(),
            face_found: false,
            face_found_last: false,
            lost_for_s: 0.0,
            preset_recalled: false,
        }
    }

    /// Zero all filter state; used by the engine's reset operation.
    pub fn reset(&mut self) {
        self.detect_err = F3::zeros();
        self.filter_int = F3::zeros();
        self.filter_lpf = F3::zeros();
        self.face_found = false;
        self.face_found_last = false;
        self.lost_for_s = 0.0;
        self.preset_recalled = false;
    }

    /// Raw error of the last tick; sidecar material.
    pub fn error(&self) -> F3 {
        self.detect_err
    }

    pub fn face_found(&self) -> bool {
        self.face_found
    }

    /// One control tick: fold the published targets into an error, run the
    /// filter, and emit quantized actuator speeds.
    pub fn tick(
        &mut self,
        dt: f32,
        targets: &[WeightedTarget],
        frame_width: u32,
        frame_height: u32,
        zoom_factor: f32,
    ) -> ControlOutput {
        self.face_found_last = self.face_found;
        self.calculate_error(targets);

        if self.face_found {
            self.lost_for_s = 0.0;
            self.preset_recalled = false;
        } else {
            self.lost_for_s += dt;
        }

        let u = self.tick_filter(dt, frame_width, frame_height);

        // Normalize: error is in pixels, speeds are dimensionless.  Pan/tilt
        // additionally shrink with zoom.
        let srwh = (frame_width as f32 * frame_height as f32).sqrt().max(1.0);
        let zf = zoom_factor.max(1.0);
        let mut out = ControlOutput {
            pan: quantize_speed(u.x / (srwh * zf), self.settings.max_pan),
            tilt: quantize_speed(u.y / (srwh * zf), self.settings.max_tilt),
            zoom: quantize_zoom(u.z / srwh, self.settings.max_zoom),
            recall_preset: None,
        };

        if !self.face_found {
            if let Some(timeout) = self.settings.lost_preset_timeout_ms {
                if self.lost_for_s * 1000.0 >= timeout as f32 && !self.preset_recalled {
                    out.recall_preset = Some(self.settings.lost_preset);
                    self.preset_recalled = true;
                }
            }
            if let Some(timeout) = self.settings.lost_zoomout_timeout_ms {
                if self.lost_for_s * 1000.0 >= timeout as f32 {
                    // Gentle wide nudge so a reappearing subject lands in frame.
                    out.zoom = 1;
                }
            }
        }

        out
    }

    /// Confidence-weighted average framing error over all valid targets.
    fn calculate_error(&mut self, targets: &[WeightedTarget]) {
        let s = &self.settings;
        let mut e_tot = F3::zeros();
        let mut sc_tot = 0.0f32;
        let mut found = false;

        for t in targets {
            let mut r = match &t.landmarks {
                Some(lm) if s.use_landmarks && landmark_area(lm).abs() > 0.0 => landmark_to_f3(lm),
                _ => rect_to_f3(&t.rect),
            };
            r.x -= t.crop_rect.width() * s.track_x;
            r.y += t.crop_rect.height() * s.track_y;
            r.z /= s.track_z;
            let w = rectf_to_f3(&t.crop_rect);
            let score = t.rect.score;
            let e = (r - w) * score;
            if score > 0.0 && !f3_is_nan(&e) {
                e_tot += e;
                sc_tot += score;
                found = true;
            }
        }

        if found {
            self.detect_err = e_tot * (1.0 / sc_tot);
        } else {
            self.detect_err = F3::zeros();
        }
        self.face_found = found;
    }

    /// Shape each axis, advance the integral (with anti-windup) and the
    /// derivative low-pass, and combine into the unnormalized output.
    fn tick_filter(&mut self, dt: f32, frame_width: u32, frame_height: u32) -> F3 {
        let s = &self.settings;
        let srwh = (frame_width as f32 * frame_height as f32).sqrt();

        let mut e = self.detect_err;
        let mut e_int = e;
        for i in 0..3 {
            let x_raw = e[i];
            let d = srwh * s.e_deadband[i];
            let n = srwh * s.e_nonlinear[i];
            let x = shape_axis(x_raw, d, n);
            if dt * s.ki > KI_EPSILON {
                // Clamp the integrand so the accumulator never integrates
                // past the raw error's zero-crossing.
                if self.filter_int[i] < 0.0 && x_raw > 0.0 {
                    e_int[i] = x_raw.min(-self.filter_int[i] / (dt * s.ki));
                } else if self.filter_int[i] > 0.0 && x_raw < 0.0 {
                    e_int[i] = x_raw.max(-self.filter_int[i] / (dt * s.ki));
                } else {
                    e_int[i] = x;
                }
            }
            e[i] = x;
        }

        if self.face_found {
            self.filter_int += e_int * (dt * s.ki);
        } else if s.lost_decay_s > 0.0 {
            // No target: bleed the integral toward zero instead of freezing.
            self.filter_int *= s.lost_decay_s / (s.lost_decay_s + dt);
        }
        self.filter_lpf = (self.filter_lpf * s.tlpf + e * dt) * (1.0 / (s.tlpf + dt));

        let mut u = e.component_mul(&s.kp) + self.filter_int;
        // Derivative path only once the target has been held for two ticks;
        // otherwise first acquisition kicks the camera.
        if self.face_found && self.face_found_last {
            u += self.filter_lpf.component_mul(&s.klpf);
        }

        debug!(
            e_x = e.x,
            e_y = e.y,
            e_z = e.z,
            int_x = self.filter_int.x,
            found = self.face_found,
            "control filter tick"
        );
        u
    }
}

/// Deadband + quadratic blend: exactly zero inside the deadband, a smooth
/// parabola across the nonlinear band, then linear with the corner shaved
/// off.
fn shape_axis(x: f32, deadband: f32, nonlinear: f32) -> f32 {
    let a = x.abs();
    if a <= deadband {
        0.0
    } else if nonlinear > 0.0 && a < deadband + nonlinear {
        let q = (a - deadband) * (a - deadband) / (2.0 * nonlinear);
        q.copysign(x)
    } else {
        (a - deadband - nonlinear * 0.5).copysign(x)
    }
}

/// Map a normalized speed to device units with fine resolution near zero.
fn quantize_speed(u: f32, max: i32) -> i32 {
    if !u.is_finite() || max <= 0 {
        return 0;
    }
    let a = u.abs().min(1.0);
    let raw = (a.powf(QUANT_EXPONENT) * max as f32).round() as i32;
    raw.min(max) * if u < 0.0 { -1 } else { 1 }
}

/// Zoom takes the plain rounded mapping.
fn quantize_zoom(u: f32, max: i32) -> i32 {
    if !u.is_finite() || max <= 0 {
        return 0;
    }
    (u * max as f32).round().clamp(-(max as f32), max as f32) as i32
}
