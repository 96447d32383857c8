//! config — flat engine configuration with documented defaults
//!
//! Loaded from JSON; every field has a default so a partial file (or none at
//! all) still yields a working engine.  Gains are entered in dB and converted
//! once, here, so the control loop only ever sees linear values.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::control::ControlSettings;
use crate::detect::CropMargins;
use crate::geometry::{from_db, F3};
use crate::manager::ManagerSettings;
use crate::ptz::http::{CameraModelTable, HttpBackend, HttpConfig};
use crate::ptz::visca::{ViscaBackend, ViscaConfig};
use crate::ptz::{DummyBackend, PtzBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Log-only sink.
    #[default]
    Dummy,
    /// VISCA over TCP.
    Visca,
    /// Templated HTTP requests.
    Http,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    // Detection / tracking.
    /// Seed-box expansion fractions applied to a fresh detection.
    pub upsize_l: f32,
    pub upsize_r: f32,
    pub upsize_t: f32,
    pub upsize_b: f32,
    /// Integer downscale applied to frames before any CV work.
    pub scale: u32,
    /// Eviction threshold relative to a target's first-track score, dB.
    pub tracking_threshold_db: f32,
    /// ONNX face detection model.
    pub detector_model: Option<PathBuf>,
    /// Optional landmark model enabling per-tracker landmark output.
    pub landmark_model: Option<PathBuf>,
    /// Margins cut off the detector input, original-frame pixels.
    pub detector_crop_l: i32,
    pub detector_crop_r: i32,
    pub detector_crop_t: i32,
    pub detector_crop_b: i32,
    /// Seconds between detector passes.
    pub detect_interval_s: f32,

    // Target framing.
    pub track_x: f32,
    pub track_y: f32,
    pub track_z: f32,
    /// Frame on landmarks instead of the tracked box when available.
    pub landmark_framing: bool,

    // Control gains.
    pub kp_x_db: f32,
    pub kp_y_db: f32,
    pub kp_z_db: f32,
    pub ki: f32,
    pub td: f32,
    pub td_lpf: f32,
    /// Deadband per axis, percent of √(frame area).
    pub e_deadband_x: f32,
    pub e_deadband_y: f32,
    pub e_deadband_z: f32,
    /// Nonlinear band per axis, percent of √(frame area).
    pub e_nonlinear_x: f32,
    pub e_nonlinear_y: f32,
    pub e_nonlinear_z: f32,
    /// Integral decay time constant while no face is found, seconds.
    pub lost_decay_s: f32,

    // Face-lost behavior.
    pub face_lost_preset_timeout_ms: Option<u64>,
    pub face_lost_preset: i32,
    pub face_lost_zoomout_timeout_ms: Option<u64>,

    // Actuator.
    pub ptz_max_pan: i32,
    pub ptz_max_tilt: i32,
    pub ptz_max_zoom: i32,
    pub backend: BackendKind,
    pub visca_address: String,
    pub visca_port: u16,
    pub http_host: String,
    pub http_camera_model: String,
    pub camera_models_path: Option<PathBuf>,

    // Debug sidecars.
    pub debug_tracker_path: Option<PathBuf>,
    pub debug_error_path: Option<PathBuf>,
    pub debug_control_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upsize_l: 0.2,
            upsize_r: 0.2,
            upsize_t: 0.3,
            upsize_b: 0.1,
            scale: 2,
            tracking_threshold_db: -35.0,
            detector_model: None,
            landmark_model: None,
            detector_crop_l: 0,
            detector_crop_r: 0,
            detector_crop_t: 0,
            detector_crop_b: 0,
            detect_interval_s: 2.0,
            track_x: 0.0,
            track_y: 0.0,
            track_z: 0.70,
            landmark_framing: false,
            kp_x_db: -0.45,
            kp_y_db: -0.45,
            kp_z_db: -0.45,
            ki: 0.3,
            td: 0.42,
            td_lpf: 2.0,
            e_deadband_x: 0.0,
            e_deadband_y: 0.0,
            e_deadband_z: 0.0,
            e_nonlinear_x: 0.0,
            e_nonlinear_y: 0.0,
            e_nonlinear_z: 0.0,
            lost_decay_s: 1.0,
            face_lost_preset_timeout_ms: None,
            face_lost_preset: 0,
            face_lost_zoomout_timeout_ms: None,
            ptz_max_pan: 24,
            ptz_max_tilt: 20,
            ptz_max_zoom: 7,
            backend: BackendKind::Dummy,
            visca_address: String::new(),
            visca_port: 5678,
            http_host: String::new(),
            http_camera_model: String::new(),
            camera_models_path: None,
            debug_tracker_path: None,
            debug_error_path: None,
            debug_control_path: None,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config: {}", path.as_ref().display()))?;
        serde_json::from_str(&json).context("failed to parse config")
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            upsize: [self.upsize_l, self.upsize_r, self.upsize_t, self.upsize_b],
            tracking_threshold: from_db(self.tracking_threshold_db),
            detect_interval_s: self.detect_interval_s,
            detector_crop: CropMargins {
                left: self.detector_crop_l,
                right: self.detector_crop_r,
                top: self.detector_crop_t,
                bottom: self.detector_crop_b,
            },
            landmark_model: self.landmark_model.clone(),
        }
    }

    pub fn control_settings(&self) -> ControlSettings {
        let kp = F3::new(from_db(self.kp_x_db), from_db(self.kp_y_db), from_db(self.kp_z_db));
        ControlSettings {
            track_x: self.track_x,
            track_y: self.track_y,
            track_z: self.track_z,
            kp,
            ki: self.ki,
            klpf: kp * self.td,
            tlpf: self.td_lpf,
            e_deadband: F3::new(self.e_deadband_x, self.e_deadband_y, self.e_deadband_z) * 1e-2,
            e_nonlinear: F3::new(self.e_nonlinear_x, self.e_nonlinear_y, self.e_nonlinear_z) * 1e-2,
            lost_decay_s: self.lost_decay_s,
            use_landmarks: self.landmark_framing,
            lost_preset_timeout_ms: self.face_lost_preset_timeout_ms,
            lost_preset: self.face_lost_preset,
            lost_zoomout_timeout_ms: self.face_lost_zoomout_timeout_ms,
            max_pan: self.ptz_max_pan,
            max_tilt: self.ptz_max_tilt,
            max_zoom: self.ptz_max_zoom,
        }
    }

    /// Build the configured backend.  Bad or missing backend parameters fall
    /// back to the logging sink so the pipeline keeps running.
    pub fn make_backend(&self) -> Box<dyn PtzBackend> {
        match self.backend {
            BackendKind::Dummy => Box::new(DummyBackend::default()),
            BackendKind::Visca => {
                if self.visca_address.is_empty() {
                    warn!("visca backend selected but no address configured");
                    return Box::new(DummyBackend::default());
                }
                Box::new(ViscaBackend::new(ViscaConfig {
                    address: self.visca_address.clone(),
                    port: self.visca_port,
                }))
            }
            BackendKind::Http => {
                let table = match &self.camera_models_path {
                    Some(path) => match CameraModelTable::from_file(path) {
                        Ok(table) => table,
                        Err(e) => {
                            warn!(error = %e, "failed to load camera models; HTTP backend disabled");
                            return Box::new(DummyBackend::default());
                        }
                    },
                    None => {
                        warn!("http backend selected but no camera_models_path configured");
                        return Box::new(DummyBackend::default());
                    }
                };
                Box::new(HttpBackend::new(
                    HttpConfig {
                        host: self.http_host.clone(),
                        camera_model: self.http_camera_model.clone(),
                    },
                    &table,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(
            (c.upsize_l, c.upsize_r, c.upsize_t, c.upsize_b),
            (0.2, 0.2, 0.3, 0.1)
        );
        assert_eq!(c.scale, 2);
        assert_eq!(c.track_z, 0.70);
        assert_eq!((c.ki, c.td, c.td_lpf), (0.3, 0.42, 2.0));
        assert_eq!((c.ptz_max_pan, c.ptz_max_tilt, c.ptz_max_zoom), (24, 20, 7));
        // Kp of -0.45 dB is the familiar 0.95 linear.
        assert!((c.control_settings().kp.x - 0.95).abs() < 5e-3);
    }

    #[test]
    fn partial_json_keeps_defaults_elsewhere() {
        let c: Config =
            serde_json::from_str(r#"{ "track_z": 0.5, "backend": "visca", "visca_address": "10.0.0.9" }"#)
                .unwrap();
        assert_eq!(c.track_z, 0.5);
        assert_eq!(c.backend, BackendKind::Visca);
        assert_eq!(c.visca_port, 5678);
        assert_eq!(c.upsize_t, 0.3);
    }

    #[test]
    fn deadbands_are_entered_as_percent() {
        let c: Config = serde_json::from_str(r#"{ "e_deadband_x": 5.0 }"#).unwrap();
        assert!((c.control_settings().e_deadband.x - 0.05).abs() < 1e-6);
    }

    #[test]
    fn misconfigured_backend_degrades_to_dummy() {
        let c: Config = serde_json::from_str(r#"{ "backend": "visca" }"#).unwrap();
        // No address: must not panic, must still produce a working sink.
        let mut b = c.make_backend();
        b.set_pantilt_speed(1, 1);
        assert!(b.can_send());
    }
}
