//! engine — one tick of the whole follow pipeline
//!
//! Per frame, in order: manager tick (publish + detector cadence), control
//! tick over the previous frame's published targets, command send gated on
//! the backend's `can_send`, backend tick, then staging the new frame to the
//! detector and trackers.  The control step is skipped for the very first
//! frame so the filter never runs against an unpublished state.

use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::info;

use crate::config::Config;
use crate::control::ControlLoop;
use crate::detect::{FaceDetector, OnnxFaceDetector};
use crate::frame::{FrameBuffer, RgbFrame};
use crate::manager::{TrackerFactory, TrackingManager, WeightedTarget};
use crate::ptz::PtzBackend;
use crate::sidecar::DebugSidecars;
use crate::track::NccTracker;

pub struct FollowEngine {
    manager: TrackingManager,
    control: ControlLoop,
    backend: Box<dyn PtzBackend>,
    sidecars: DebugSidecars,
    scale: u32,
    frame_tick: u64,
    known_width: u32,
    known_height: u32,
    rendered: bool,
    started: Instant,
    prof_frames: u64,
    prof_control: Duration,
}

impl FollowEngine {
    /// Build the full stack from configuration: ONNX detector, template
    /// trackers and the configured backend.
    pub fn from_config(config: &Config) -> Result<Self> {
        let model = config
            .detector_model
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("detector_model is required"))?;
        let detector = OnnxFaceDetector::load(model)?;
        Ok(Self::with_parts(
            config,
            Box::new(detector),
            Box::new(|| Box::new(NccTracker::new())),
            config.make_backend(),
        ))
    }

    /// Assemble from explicit collaborators; the seam used by tests and by
    /// hosts that bring their own detector, tracker or actuator.
    pub fn with_parts(
        config: &Config,
        detector: Box<dyn FaceDetector>,
        factory: TrackerFactory,
        backend: Box<dyn PtzBackend>,
    ) -> Self {
        let manager = TrackingManager::new(detector, factory, config.manager_settings());
        let control = ControlLoop::new(config.control_settings());
        let mut sidecars = DebugSidecars::default();
        sidecars.tracker.set_path(config.debug_tracker_path.as_deref());
        sidecars.error.set_path(config.debug_error_path.as_deref());
        sidecars.control.set_path(config.debug_control_path.as_deref());

        Self {
            manager,
            control,
            backend,
            sidecars,
            scale: config.scale.max(1),
            frame_tick: 0,
            known_width: 0,
            known_height: 0,
            rendered: false,
            started: Instant::now(),
            prof_frames: 0,
            prof_control: Duration::ZERO,
        }
    }

    /// Published targets of the last processed frame.
    pub fn targets(&self) -> &[WeightedTarget] {
        self.manager.targets()
    }

    pub fn face_found(&self) -> bool {
        self.control.face_found()
    }

    /// Zero the control filters; tracking state is left alone.
    pub fn reset(&mut self) {
        self.control.reset();
    }

    /// Feed one decoded frame; `dt` is the time since the previous one.
    pub fn process_frame(&mut self, frame: &RgbFrame, dt: f32) -> Result<()> {
        self.manager.tick(dt);

        if self.rendered && self.known_width > 0 && self.known_height > 0 {
            let t0 = Instant::now();
            self.run_control(dt);
            self.prof_control += t0.elapsed();
        }

        self.known_width = frame.width;
        self.known_height = frame.height;

        let buffer = FrameBuffer::from_rgb(frame, self.scale, self.frame_tick)?;
        self.frame_tick += 1;
        self.manager.stage(&buffer);
        self.rendered = true;

        self.prof_frames += 1;
        if self.prof_frames % 300 == 0 {
            info!(
                frames = self.prof_frames,
                live_targets = self.manager.live_targets(),
                control_us_per_frame =
                    self.prof_control.as_micros() as u64 / self.prof_frames.max(1) as u64,
                "engine timings"
            );
        }
        Ok(())
    }

    fn run_control(&mut self, dt: f32) {
        let now = self.started.elapsed().as_secs_f64();
        let zoom = self.backend.zoom_factor();
        let out = self.control.tick(
            dt,
            self.manager.targets(),
            self.known_width,
            self.known_height,
            zoom,
        );

        if self.backend.can_send() {
            self.backend.set_pantilt_speed(out.pan, out.tilt);
            self.backend.set_zoom_speed(out.zoom);
        }
        if let Some(preset) = out.recall_preset {
            self.backend.recall_preset(preset);
        }
        self.backend.tick();

        if self.sidecars.tracker.enabled() {
            for t in self.manager.targets() {
                self.sidecars.tracker.write_line(
                    now,
                    format_args!(
                        "{}\t{}\t{}\t{}\t{}",
                        t.rect.x0, t.rect.y0, t.rect.x1, t.rect.y1, t.rect.score
                    ),
                );
            }
        }
        if self.sidecars.error.enabled() {
            let e = self.control.error();
            self.sidecars.error.write_line(
                now,
                format_args!("{}\t{}\t{}\t{}", e.x, e.y, e.z, u8::from(self.control.face_found())),
            );
        }
        if self.sidecars.control.enabled() {
            self.sidecars
                .control
                .write_line(now, format_args!("{}\t{}\t{}\t{}", out.pan, out.tilt, out.zoom, zoom));
        }
    }

    /// Synchronous shutdown of every worker thread.
    pub fn stop(&mut self) {
        self.manager.stop();
        self.sidecars.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::CropMargins;
    use crate::geometry::Rect;
    use crate::ptz::DummyBackend;
    use crate::track::FaceTracker;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    /// Returns its rects on the first pass, nothing afterwards.
    struct OneShotDetector {
        rects: Vec<Rect>,
    }

    impl FaceDetector for OneShotDetector {
        fn detect(&mut self, _f: &FrameBuffer, _c: CropMargins) -> Result<Vec<Rect>> {
            Ok(std::mem::take(&mut self.rects))
        }
    }

    struct EchoTracker {
        rect: Option<Rect>,
    }

    impl FaceTracker for EchoTracker {
        fn begin(&mut self, _f: &FrameBuffer, seed: Rect) {
            self.rect = Some(seed);
        }
        fn update(&mut self, _f: &FrameBuffer) -> Option<Rect> {
            self.rect
        }
    }

    /// Backend that records the last command it accepted.
    #[derive(Default)]
    struct RecordingBackend {
        last_pan: Arc<AtomicI32>,
    }

    impl PtzBackend for RecordingBackend {
        fn set_pantilt_speed(&mut self, pan: i32, _tilt: i32) {
            self.last_pan.store(pan, Ordering::SeqCst);
        }
        fn set_zoom_speed(&mut self, _zoom: i32) {}
    }

    fn test_config() -> Config {
        let mut c = Config::default();
        c.scale = 1;
        c.detect_interval_s = 0.0;
        c
    }

    fn gray_frame() -> RgbFrame {
        RgbFrame { data: vec![40u8; 320 * 240 * 3], width: 320, height: 240, pts: 0 }
    }

    #[test]
    fn engine_acquires_target_and_commands_backend() {
        let last_pan = Arc::new(AtomicI32::new(0));
        let backend = RecordingBackend { last_pan: Arc::clone(&last_pan) };
        // Off-center detection far to the right drives a positive pan.
        let detector = OneShotDetector {
            rects: vec![Rect::new(240, 60, 300, 120, 1.0)],
        };
        let mut engine = FollowEngine::with_parts(
            &test_config(),
            Box::new(detector),
            Box::new(|| Box::new(EchoTracker { rect: None })),
            Box::new(backend),
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        let frame = gray_frame();
        while Instant::now() < deadline {
            engine.process_frame(&frame, 1.0 / 30.0).unwrap();
            if last_pan.load(Ordering::SeqCst) > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(last_pan.load(Ordering::SeqCst) > 0, "backend never saw a pan command");
        engine.stop();
    }

    #[test]
    fn engine_without_targets_commands_nothing() {
        let last_pan = Arc::new(AtomicI32::new(i32::MIN));
        let backend = RecordingBackend { last_pan: Arc::clone(&last_pan) };
        let detector = OneShotDetector { rects: vec![] };
        let mut engine = FollowEngine::with_parts(
            &test_config(),
            Box::new(detector),
            Box::new(|| Box::new(EchoTracker { rect: None })),
            Box::new(backend),
        );

        let frame = gray_frame();
        for _ in 0..20 {
            engine.process_frame(&frame, 1.0 / 30.0).unwrap();
        }
        // Zero error everywhere: pan stays 0 on every send.
        let pan = last_pan.load(Ordering::SeqCst);
        assert!(pan == 0 || pan == i32::MIN);
        engine.stop();
    }

    #[test]
    fn sidecars_record_error_stream() {
        let path = std::env::temp_dir()
            .join(format!("facetrack-engine-{}-err.tsv", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let mut config = test_config();
        config.debug_error_path = Some(path.clone());
        let detector = OneShotDetector { rects: vec![] };
        let mut engine = FollowEngine::with_parts(
            &config,
            Box::new(detector),
            Box::new(|| Box::new(EchoTracker { rect: None })),
            Box::new(DummyBackend::default()),
        );

        let frame = gray_frame();
        for _ in 0..5 {
            engine.process_frame(&frame, 1.0 / 30.0).unwrap();
        }
        engine.stop();

        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.lines().count() >= 3);
        let first = body.lines().next().unwrap();
        // timestamp + ex + ey + ez + found flag
        assert_eq!(first.split('\t').count(), 5);
        let _ = std::fs::remove_file(&path);
    }
}
