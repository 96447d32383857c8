//! manager — orchestrates the detector and the per-target tracker pool
//!
//! The tick thread never waits on a worker.  Every handoff goes through
//! `try_lock`: a busy worker is skipped this tick and polled again next tick,
//! so the cost of one manager tick is O(live targets) regardless of how long
//! any CV call takes.
//!
//! Per-target lifecycle: `ResetTexture` (spawned alongside a detector pass)
//! → `Constructing` (seeded from the best detection) → `FirstTrack` (first
//! update in flight) → `Available` (published).  Retired instances park their
//! worker thread in an idle pool; threads are only destroyed at shutdown.

pub mod fusion;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::detect::{CropMargins, DetectorStep, FaceDetector};
use crate::frame::FrameBuffer;
use crate::geometry::{PointF, Rect, RectF};
use crate::track::{FaceTracker, TrackerStep};
use crate::worker::Worker;
use fusion::FusionTarget;

/// Produces a fresh tracker algorithm instance for each new target.
pub type TrackerFactory = Box<dyn Fn() -> Box<dyn FaceTracker> + Send>;

/// One published target: the tracked box with its score already attenuated,
/// the crop window it was tracked against, and landmarks when available.
#[derive(Debug, Clone)]
pub struct WeightedTarget {
    pub rect: Rect,
    pub crop_rect: RectF,
    pub landmarks: Option<Vec<PointF>>,
}

/// Manager knobs; a subset of the full engine configuration.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Per-side seed-box expansion fractions (left, right, top, bottom).
    pub upsize: [f32; 4],
    /// Absolute eviction threshold relative to a target's first-track score
    /// (linear, already converted from dB).
    pub tracking_threshold: f32,
    /// Wall-clock seconds between detector passes.
    pub detect_interval_s: f32,
    /// Margins cut off the detector input, in original-frame pixels.
    pub detector_crop: CropMargins,
    /// Landmark model handed to each new tracker, when configured.
    pub landmark_model: Option<PathBuf>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            upsize: [0.2, 0.2, 0.3, 0.1],
            tracking_threshold: crate::geometry::from_db(-35.0),
            detect_interval_s: 2.0,
            detector_crop: CropMargins::default(),
            landmark_model: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackerState {
    /// Frame staged, waiting for the detector pass that spawned us.
    ResetTexture,
    /// Seeded from a detection; tracker construction pending on its thread.
    Constructing,
    /// First update in flight.
    FirstTrack,
    /// Producing results; published every tick.
    Available,
}

struct TrackerInstance {
    worker: Worker<TrackerStep>,
    state: TrackerState,
    rect: Rect,
    /// Crop window of the frame currently staged to the worker.
    crop_tracker: RectF,
    /// Crop window `rect` was computed against.
    crop_rect: RectF,
    att: f32,
    score_first: f32,
    /// Manager tick of the detector pass that spawned this instance.
    tick: u64,
    landmarks: Option<Vec<PointF>>,
}

pub struct TrackingManager {
    settings: ManagerSettings,
    factory: TrackerFactory,

    detector: Worker<DetectorStep>,
    detector_in_progress: bool,
    detect_tick: u64,
    next_detect_tick: u64,

    tick_cnt: u64,
    crop_cur: RectF,

    detect_rects: Vec<Rect>,
    trackers: VecDeque<TrackerInstance>,
    idle_pool: VecDeque<Worker<TrackerStep>>,
    workers_spawned: usize,

    published: Vec<WeightedTarget>,
}

impl TrackingManager {
    pub fn new(detector: Box<dyn FaceDetector>, factory: TrackerFactory, settings: ManagerSettings) -> Self {
        let mut detector = Worker::new("face-det", DetectorStep::new(detector));
        detector.start();
        Self {
            settings,
            factory,
            detector,
            detector_in_progress: false,
            detect_tick: 0,
            next_detect_tick: 0,
            tick_cnt: 0,
            crop_cur: RectF::default(),
            detect_rects: Vec::new(),
            trackers: VecDeque::new(),
            idle_pool: VecDeque::new(),
            workers_spawned: 0,
            published: Vec::new(),
        }
    }

    /// Advance the tick counter, schedule the next detector pass and rebuild
    /// the published target list.
    pub fn tick(&mut self, dt: f32) {
        if self.detect_tick == self.tick_cnt && dt > 0.0 {
            self.next_detect_tick = self.tick_cnt + (self.settings.detect_interval_s / dt) as u64;
        }
        self.tick_cnt += 1;
        self.publish();
    }

    /// Targets published by the last [`tick`](Self::tick); valid until the
    /// next one.
    pub fn targets(&self) -> &[WeightedTarget] {
        &self.published
    }

    /// Raw detections from the most recent completed detector pass.
    pub fn detections(&self) -> &[Rect] {
        &self.detect_rects
    }

    /// Number of tracker worker threads created so far (pool high-water mark).
    pub fn workers_spawned(&self) -> usize {
        self.workers_spawned
    }

    pub fn live_targets(&self) -> usize {
        self.trackers.len()
    }

    /// Hand the latest frame to whichever workers are ready for it.
    pub fn stage(&mut self, frame: &Arc<FrameBuffer>) {
        self.crop_cur = frame.crop();
        self.stage_to_detector(frame);
        self.stage_to_trackers(frame);
    }

    /// Synchronously stop every worker thread (live and pooled).
    pub fn stop(&mut self) {
        self.detector.stop();
        for mut t in self.trackers.drain(..) {
            t.worker.stop();
        }
        for mut w in self.idle_pool.drain(..) {
            w.stop();
        }
    }

    // ── Detector staging ─────────────────────────────────────────────────────

    fn stage_to_detector(&mut self, frame: &Arc<FrameBuffer>) {
        // Peek: a busy detector means no results to collect and no staging.
        let completed = {
            let Some(guard) = self.detector.try_lock() else {
                return;
            };
            self.detector_in_progress.then(|| guard.faces())
        };

        if let Some(rects) = completed {
            self.detect_rects = rects;
            debug!(
                detections = self.detect_rects.len(),
                live = self.trackers.len(),
                "detector pass completed"
            );
            self.run_fusion();
            self.promote_pending();
            self.detector_in_progress = false;
        }

        if self.next_detect_tick > self.tick_cnt {
            return;
        }

        // Parked and due: stage the frame and spawn the companion tracker
        // instance that will adopt whatever this pass finds.
        let staged = {
            if let Some(mut guard) = self.detector.try_lock() {
                guard.set_crop(self.settings.detector_crop);
                guard.stage(Arc::clone(frame));
                true
            } else {
                false
            }
        };
        if staged {
            self.detector.signal();
            self.detector_in_progress = true;
            self.detect_tick = self.tick_cnt;

            let worker = self.acquire_worker();
            worker.lock().stage(Arc::clone(frame));
            self.trackers.push_back(TrackerInstance {
                worker,
                state: TrackerState::ResetTexture,
                rect: Rect::new(0, 0, 0, 0, 0.0),
                crop_tracker: self.crop_cur,
                crop_rect: self.crop_cur,
                att: 0.0,
                score_first: 0.0,
                tick: self.tick_cnt,
                landmarks: None,
            });
        }
    }

    fn acquire_worker(&mut self) -> Worker<TrackerStep> {
        // Prefer a pooled worker, but only one that is actually parked: a
        // retired worker may still be finishing its last in-flight update,
        // and the tick thread must not wait for it.
        for _ in 0..self.idle_pool.len() {
            let worker = self.idle_pool.pop_front().expect("pool length checked");
            if worker.try_lock().is_some() {
                return worker;
            }
            self.idle_pool.push_back(worker);
        }
        self.workers_spawned += 1;
        let mut step = TrackerStep::new((self.factory)());
        if let Some(path) = &self.settings.landmark_model {
            step.set_landmark_model(path);
        }
        Worker::new(format!("face-trk-{}", self.workers_spawned), step)
    }

    /// Seed the instance waiting on the just-finished detector pass, or
    /// discard it when the pass found nothing.
    fn promote_pending(&mut self) {
        let Some(ix) = self
            .trackers
            .iter()
            .position(|t| t.tick == self.detect_tick && t.state == TrackerState::ResetTexture)
        else {
            return;
        };

        if self.detect_rects.is_empty() {
            self.retire(ix);
            return;
        }

        let [l, r, top, bottom] = self.settings.upsize;
        let seed = self.detect_rects[0].upsized(l, r, top, bottom);
        let t = &mut self.trackers[ix];
        // Worker is parked (fresh or suspended), so a blocking lock is cheap
        // here; this is the only place the manager waits on a tracker.
        t.worker.lock().set_position(seed);
        t.worker.start();
        t.state = TrackerState::Constructing;
        debug!(?seed, "seeded new tracker");
    }

    // ── Tracker staging ──────────────────────────────────────────────────────

    fn stage_to_trackers(&mut self, frame: &Arc<FrameBuffer>) {
        let mut newly_available = false;

        for t in self.trackers.iter_mut() {
            match t.state {
                TrackerState::ResetTexture => {}
                TrackerState::Constructing => {
                    if let Some(mut guard) = t.worker.try_lock() {
                        guard.stage(Arc::clone(frame));
                        t.crop_tracker = self.crop_cur;
                        drop(guard);
                        t.worker.signal();
                        t.state = TrackerState::FirstTrack;
                    }
                }
                TrackerState::FirstTrack => {
                    if let Some(mut guard) = t.worker.try_lock() {
                        let face = guard.face();
                        if let Some(rect) = face {
                            t.rect = rect;
                            t.landmarks = guard.landmarks();
                        }
                        t.crop_rect = t.crop_tracker;
                        t.att = 1.0;
                        guard.stage(Arc::clone(frame));
                        t.crop_tracker = self.crop_cur;
                        drop(guard);
                        t.worker.signal();
                        if face.is_some() {
                            t.score_first = t.rect.score;
                            t.state = TrackerState::Available;
                            newly_available = true;
                        }
                    }
                }
                TrackerState::Available => {
                    if let Some(mut guard) = t.worker.try_lock() {
                        match guard.face() {
                            Some(rect) => {
                                t.rect = rect;
                                t.landmarks = guard.landmarks();
                            }
                            // Target lost by the tracker itself: keep the box
                            // but zero its score so eviction reaps it.
                            None => t.rect.score = 0.0,
                        }
                        t.crop_rect = t.crop_tracker;
                        guard.stage(Arc::clone(frame));
                        t.crop_tracker = self.crop_cur;
                        drop(guard);
                        t.worker.signal();
                    }
                }
            }
        }

        if newly_available {
            self.remove_duplicates();
        }
    }

    // ── Fusion ───────────────────────────────────────────────────────────────

    fn fusion_view(&self) -> Vec<FusionTarget> {
        self.trackers
            .iter()
            .map(|t| FusionTarget {
                rect: t.rect,
                att: t.att,
                score_first: t.score_first,
                available: t.state == TrackerState::Available,
            })
            .collect()
    }

    fn run_fusion(&mut self) {
        let view = self.fusion_view();
        let retired = fusion::suppress_overlaps(&self.detect_rects, &view);
        self.retire_all(retired);

        let mut view = self.fusion_view();
        fusion::attenuate(&self.detect_rects, &mut view);
        for (t, v) in self.trackers.iter_mut().zip(view.iter()) {
            t.att = v.att;
        }

        let evicted = fusion::evict_low_confidence(&view, self.settings.tracking_threshold);
        self.retire_all(evicted);
    }

    fn remove_duplicates(&mut self) {
        let view = self.fusion_view();
        let retired = fusion::find_duplicates(&view);
        self.retire_all(retired);
    }

    fn retire_all(&mut self, mut indices: Vec<usize>) {
        indices.sort_unstable();
        for ix in indices.into_iter().rev() {
            self.retire(ix);
        }
    }

    /// Move an instance's worker to the idle pool; its thread stays parked
    /// until the next detection cycle reuses it.
    fn retire(&mut self, ix: usize) {
        let Some(inst) = self.trackers.remove(ix) else {
            return;
        };
        inst.worker.request_suspend();
        self.idle_pool.push_front(inst.worker);
        debug!(live = self.trackers.len(), pooled = self.idle_pool.len(), "retired tracker");
    }

    // ── Publishing ───────────────────────────────────────────────────────────

    fn publish(&mut self) {
        self.published.clear();
        for t in &self.trackers {
            if t.state != TrackerState::Available {
                continue;
            }
            let score = t.rect.score * t.att;
            if score.is_nan() || score <= 0.0 {
                continue;
            }
            self.published.push(WeightedTarget {
                rect: Rect { score, ..t.rect },
                crop_rect: t.crop_rect,
                landmarks: t.landmarks.clone(),
            });
        }
    }
}

impl Drop for TrackingManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RgbFrame;
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// Detector returning a scripted sequence of results, one per pass.
    struct ScriptedDetector {
        script: Arc<Mutex<VecDeque<Vec<Rect>>>>,
        passes: Arc<AtomicUsize>,
    }

    impl FaceDetector for ScriptedDetector {
        fn detect(&mut self, _frame: &FrameBuffer, _crop: CropMargins) -> Result<Vec<Rect>> {
            self.passes.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            Ok(script.pop_front().unwrap_or_default())
        }
    }

    /// Tracker that always reports its seed box back.
    struct EchoTracker {
        rect: Option<Rect>,
    }

    impl FaceTracker for EchoTracker {
        fn begin(&mut self, _frame: &FrameBuffer, seed: Rect) {
            self.rect = Some(seed);
        }
        fn update(&mut self, _frame: &FrameBuffer) -> Option<Rect> {
            self.rect
        }
    }

    /// Tracker that wedges inside update() until released.
    struct WedgedTracker {
        entered: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
        first: bool,
    }

    impl FaceTracker for WedgedTracker {
        fn begin(&mut self, _frame: &FrameBuffer, _seed: Rect) {}
        fn update(&mut self, _frame: &FrameBuffer) -> Option<Rect> {
            if self.first {
                self.first = false;
                let _ = self.entered.send(());
                let _ = self.release.recv();
            }
            None
        }
    }

    fn frame(tick: u64) -> Arc<FrameBuffer> {
        let f = RgbFrame { data: vec![0u8; 320 * 240 * 3], width: 320, height: 240, pts: 0 };
        FrameBuffer::from_rgb(&f, 1, tick).unwrap()
    }

    fn settings() -> ManagerSettings {
        ManagerSettings {
            upsize: [0.2, 0.2, 0.2, 0.2],
            detect_interval_s: 0.0, // detect every tick in tests
            ..ManagerSettings::default()
        }
    }

    /// Run tick+stage cycles until `pred` holds or the deadline passes.
    fn pump(mgr: &mut TrackingManager, mut pred: impl FnMut(&TrackingManager) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut tick = 0u64;
        while Instant::now() < deadline {
            mgr.tick(1.0 / 30.0);
            mgr.stage(&frame(tick));
            tick += 1;
            if pred(mgr) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn detection_spawns_tracker_and_publishes_upsized_seed() {
        let script = Arc::new(Mutex::new(VecDeque::from(vec![vec![Rect::new(
            100, 100, 200, 200, 1.0,
        )]])));
        let passes = Arc::new(AtomicUsize::new(0));
        let det = ScriptedDetector { script, passes };
        let mut mgr = TrackingManager::new(
            Box::new(det),
            Box::new(|| Box::new(EchoTracker { rect: None })),
            settings(),
        );

        assert!(pump(&mut mgr, |m| !m.targets().is_empty()), "target never published");

        let t = &mgr.targets()[0];
        // 100x100 detection, 0.2 margins all around: (80,80)-(220,220).
        assert_eq!((t.rect.x0, t.rect.y0, t.rect.x1, t.rect.y1), (80, 80, 220, 220));
        // att starts at 1.0 and the tracker echoes score 1.0; a couple of
        // empty detector passes may already have attenuated it slightly by
        // the time the published list is observed.
        assert!(t.rect.score > 0.6, "score {}", t.rect.score);
        mgr.stop();
    }

    #[test]
    fn tick_stays_fast_while_a_worker_is_wedged() {
        let script = Arc::new(Mutex::new(VecDeque::from(vec![vec![Rect::new(
            50, 50, 150, 150, 1.0,
        )]])));
        let passes = Arc::new(AtomicUsize::new(0));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let slots = Arc::new(Mutex::new(VecDeque::from(vec![(entered_tx, release_rx)])));

        let slots2 = Arc::clone(&slots);
        let mut mgr = TrackingManager::new(
            Box::new(ScriptedDetector { script, passes }),
            Box::new(move || -> Box<dyn FaceTracker> {
                // First tracker wedges; any later ones (spawned while the
                // wedged worker sits in the pool) behave normally.
                match slots2.lock().unwrap().pop_front() {
                    Some((entered, release)) => {
                        Box::new(WedgedTracker { entered, release, first: true })
                    }
                    None => Box::new(EchoTracker { rect: None }),
                }
            }),
            settings(),
        );

        // Wait until the tracker is wedged inside its update call.
        assert!(pump(&mut mgr, |_| entered_rx.try_recv().is_ok()), "tracker never ran");

        // With the worker stuck, 200 tick+stage rounds must still be quick:
        // every handoff is a failed try_lock.
        let t0 = Instant::now();
        for tick in 0..200 {
            mgr.tick(1.0 / 30.0);
            mgr.stage(&frame(1000 + tick));
        }
        assert!(t0.elapsed() < Duration::from_millis(500), "tick blocked on wedged worker");

        release_tx.send(()).unwrap();
        mgr.stop();
    }

    #[test]
    fn idle_pool_bounds_thread_creation() {
        // Every detector pass returns nothing, so each cycle spawns a
        // ResetTexture instance that is immediately discarded back to the
        // pool.  Thread creation must not grow with the number of cycles.
        let script = Arc::new(Mutex::new(VecDeque::new()));
        let passes = Arc::new(AtomicUsize::new(0));
        let passes2 = Arc::clone(&passes);
        let mut mgr = TrackingManager::new(
            Box::new(ScriptedDetector { script, passes }),
            Box::new(|| Box::new(EchoTracker { rect: None })),
            settings(),
        );

        assert!(
            pump(&mut mgr, |_| passes2.load(Ordering::SeqCst) >= 10),
            "detector never cycled"
        );
        assert!(mgr.workers_spawned() <= 2, "spawned {} workers", mgr.workers_spawned());
        mgr.stop();
    }

    #[test]
    fn published_scores_are_attenuated_without_confirmation() {
        // One detection seeds the tracker; afterwards the detector reports
        // nothing, so att decays on every pass and published scores shrink.
        let script = Arc::new(Mutex::new(VecDeque::from(vec![vec![Rect::new(
            100, 100, 200, 200, 1.0,
        )]])));
        let passes = Arc::new(AtomicUsize::new(0));
        let mut mgr = TrackingManager::new(
            Box::new(ScriptedDetector { script, passes }),
            Box::new(|| Box::new(EchoTracker { rect: None })),
            settings(),
        );

        assert!(pump(&mut mgr, |m| !m.targets().is_empty()));
        let s0 = mgr.targets()[0].rect.score;
        assert!(pump(&mut mgr, |m| {
            m.targets().first().map(|t| t.rect.score < s0 * 0.9).unwrap_or(true)
        }));
        mgr.stop();
    }
}
