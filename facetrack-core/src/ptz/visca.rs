//! VISCA-over-TCP backend.
//!
//! The wire I/O runs on its own detached-style thread: the engine stages the
//! latest speeds into atomics and the thread ships whatever changed, retrying
//! a rejected command a bounded number of times and reconnecting after
//! repeated failures or a config change.  The engine-side state is only the
//! inquiry cycle that paces commands and the zoom read-back.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{Coalesce, InquiryCycle, InquiryKind, PtzBackend};

/// Consecutive send failures before the connection is torn down and rebuilt.
const MAX_FAILURES: u32 = 4;
/// Wire-level retries for a command the camera answered with an error.
const MAX_RETRIES: u32 = 3;
/// Idle poll interval of the I/O thread.
const IDLE_SLEEP: Duration = Duration::from_millis(50);
/// Settle time around a preset recall.
const PRESET_SLEEP: Duration = Duration::from_millis(48);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViscaConfig {
    pub address: String,
    pub port: u16,
}

struct Shared {
    pan: AtomicI64,
    tilt: AtomicI64,
    zoom: AtomicI64,
    zoom_got: AtomicI64,
    preset: AtomicI64,
    preset_changed: AtomicBool,
    inquiry_requested: AtomicBool,
    inquiry_kind_zoom: AtomicBool,
    inquiry_acked: AtomicBool,
    stop: AtomicBool,
    config: Mutex<ViscaConfig>,
    config_changed: AtomicBool,
}

pub struct ViscaBackend {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    inquiry: InquiryCycle,
    pantilt_coalesce: Coalesce<(i32, i32)>,
    zoom_coalesce: Coalesce<i32>,
}

impl ViscaBackend {
    pub fn new(config: ViscaConfig) -> Self {
        let shared = Arc::new(Shared {
            pan: AtomicI64::new(0),
            tilt: AtomicI64::new(0),
            zoom: AtomicI64::new(0),
            zoom_got: AtomicI64::new(0),
            preset: AtomicI64::new(0),
            preset_changed: AtomicBool::new(false),
            inquiry_requested: AtomicBool::new(false),
            inquiry_kind_zoom: AtomicBool::new(false),
            inquiry_acked: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            config: Mutex::new(config),
            config_changed: AtomicBool::new(true),
        });

        let io_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("visca-io".into())
            .spawn(move || io_loop(&io_shared))
            .expect("failed to spawn VISCA I/O thread");

        Self {
            shared,
            thread: Some(thread),
            inquiry: InquiryCycle::default(),
            pantilt_coalesce: Coalesce::default(),
            zoom_coalesce: Coalesce::default(),
        }
    }

    pub fn set_config(&mut self, config: ViscaConfig) {
        let mut held = self.shared.config.lock().unwrap_or_else(PoisonError::into_inner);
        if *held != config {
            *held = config;
            self.shared.config_changed.store(true, Ordering::Release);
        }
    }

    /// Raw 0..=0x4000 zoom position → optical magnification, per the common
    /// 20x block: factor = exp(raw · ln 20 / 16384).
    pub fn raw_to_zoom_factor(raw: i64) -> f32 {
        ((raw as f32) * (20.0f32.ln() / 16384.0)).exp()
    }
}

impl PtzBackend for ViscaBackend {
    fn can_send(&self) -> bool {
        self.inquiry.can_send()
    }

    fn tick(&mut self) {
        self.inquiry.tick();

        if self.shared.inquiry_acked.swap(false, Ordering::AcqRel) {
            self.inquiry.acknowledge();
        }

        match self.inquiry.outstanding() {
            // Keep exactly one inquiry in flight, cycling pan/tilt → zoom.
            None => {
                let kind = self.inquiry.begin();
                self.shared
                    .inquiry_kind_zoom
                    .store(kind == InquiryKind::Zoom, Ordering::Release);
                self.shared.inquiry_requested.store(true, Ordering::Release);
            }
            // Timed out with no answer: abandon it.  The gate stays open for
            // one tick so a queued command can go out before the next
            // inquiry closes it again.
            Some(_) if self.inquiry.can_send() => self.inquiry.acknowledge(),
            Some(_) => {}
        }
    }

    fn set_pantilt_speed(&mut self, pan: i32, tilt: i32) {
        if self.pantilt_coalesce.should_send((pan, tilt)) {
            self.shared.pan.store(pan as i64, Ordering::Release);
            self.shared.tilt.store(tilt as i64, Ordering::Release);
        }
    }

    fn set_zoom_speed(&mut self, zoom: i32) {
        if self.zoom_coalesce.should_send(zoom) {
            self.shared.zoom.store(zoom as i64, Ordering::Release);
        }
    }

    fn recall_preset(&mut self, preset: i32) {
        self.shared.preset.store(preset as i64, Ordering::Release);
        self.shared.preset_changed.store(true, Ordering::Release);
    }

    fn zoom_factor(&self) -> f32 {
        Self::raw_to_zoom_factor(self.shared.zoom_got.load(Ordering::Acquire))
    }
}

impl Drop for ViscaBackend {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// ── I/O thread ───────────────────────────────────────────────────────────────

fn io_loop(shared: &Shared) {
    let mut conn: Option<TcpStream> = None;
    let mut pan_prev = i64::MIN;
    let mut tilt_prev = i64::MIN;
    let mut zoom_prev = i64::MIN;
    let mut failures = 0u32;

    while !shared.stop.load(Ordering::Acquire) {
        if shared.config_changed.swap(false, Ordering::AcqRel) || failures > MAX_FAILURES {
            conn = connect(shared);
            pan_prev = i64::MIN;
            tilt_prev = i64::MIN;
            zoom_prev = i64::MIN;
            failures = 0;
        }
        let Some(stream) = conn.as_mut() else {
            std::thread::sleep(IDLE_SLEEP);
            // Try again on the next config change or failure-triggered pass.
            failures = MAX_FAILURES + 1;
            continue;
        };

        let pan = shared.pan.load(Ordering::Acquire);
        let tilt = shared.tilt.load(Ordering::Acquire);
        let zoom = shared.zoom.load(Ordering::Acquire);
        let mut sent_any = false;

        if pan != pan_prev || tilt != tilt_prev {
            if send_pantilt(stream, pan as i32, tilt as i32) {
                pan_prev = pan;
                tilt_prev = tilt;
                sent_any = true;
                failures = 0;
            } else {
                failures += 1;
            }
        }
        if zoom != zoom_prev {
            if send_zoom(stream, zoom as i32) {
                zoom_prev = zoom;
                sent_any = true;
                failures = 0;
            } else {
                failures += 1;
            }
        }

        if shared.preset_changed.swap(false, Ordering::AcqRel) {
            let preset = shared.preset.load(Ordering::Acquire) as u8;
            std::thread::sleep(PRESET_SLEEP);
            debug!(preset, "recalling preset");
            if !send_command(stream, &[0x81, 0x01, 0x04, 0x3F, 0x02, preset & 0x7F, 0xFF], 0) {
                failures += 1;
            }
            std::thread::sleep(PRESET_SLEEP);
        }

        if shared.inquiry_requested.swap(false, Ordering::AcqRel) {
            let zoom_inquiry = shared.inquiry_kind_zoom.load(Ordering::Acquire);
            match run_inquiry(stream, zoom_inquiry) {
                Ok(reply) => {
                    if zoom_inquiry {
                        if let Some(raw) = decode_zoom_reply(&reply) {
                            shared.zoom_got.store(raw, Ordering::Release);
                        }
                    }
                    shared.inquiry_acked.store(true, Ordering::Release);
                }
                Err(e) => {
                    warn!(error = %e, "VISCA inquiry failed");
                    failures += 1;
                }
            }
        }

        if !sent_any {
            std::thread::sleep(IDLE_SLEEP);
        }
    }
}

fn connect(shared: &Shared) -> Option<TcpStream> {
    let config = shared
        .config
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    if config.address.is_empty() {
        return None;
    }
    debug!(address = %config.address, port = config.port, "connecting to VISCA device");
    match TcpStream::connect((config.address.as_str(), config.port)) {
        Ok(stream) => {
            let _ = stream.set_read_timeout(Some(Duration::from_millis(500)));
            let _ = stream.set_write_timeout(Some(Duration::from_millis(500)));
            let mut stream = stream;
            // IF_CLEAR flushes the command buffers on both sockets.
            let _ = write_packet(&mut stream, &[0x88, 0x01, 0x00, 0x01, 0xFF]);
            let _ = read_reply(&mut stream);
            info!(address = %config.address, port = config.port, "VISCA device connected");
            Some(stream)
        }
        Err(e) => {
            warn!(address = %config.address, port = config.port, error = %e, "VISCA connect failed");
            None
        }
    }
}

fn send_pantilt(stream: &mut TcpStream, pan: i32, tilt: i32) -> bool {
    let pan_speed = pan.unsigned_abs().min(0x18) as u8;
    let tilt_speed = tilt.unsigned_abs().min(0x14) as u8;
    let pan_dir: u8 = match pan.signum() {
        -1 => 0x01, // left
        1 => 0x02,  // right
        _ => 0x03,
    };
    let tilt_dir: u8 = match tilt.signum() {
        -1 => 0x01, // up
        1 => 0x02,  // down
        _ => 0x03,
    };
    send_command(
        stream,
        &[0x81, 0x01, 0x06, 0x01, pan_speed.max(1), tilt_speed.max(1), pan_dir, tilt_dir, 0xFF],
        0,
    )
}

fn send_zoom(stream: &mut TcpStream, zoom: i32) -> bool {
    let speed = zoom.unsigned_abs().min(7) as u8;
    // Positive is wide (out), negative tele (in).
    let op: u8 = match zoom.signum() {
        1 => 0x30 | speed,
        -1 => 0x20 | speed,
        _ => 0x00,
    };
    send_command(stream, &[0x81, 0x01, 0x04, 0x07, op, 0xFF], 0)
}

fn send_command(stream: &mut TcpStream, packet: &[u8], retry: u32) -> bool {
    if write_packet(stream, packet).is_err() {
        return false;
    }
    match read_reply(stream) {
        Ok(reply) => {
            // 0x6y in the second byte is an error reply; retry a few times.
            if reply.len() >= 2 && reply[1] & 0xF0 == 0x60 && retry < MAX_RETRIES {
                debug!(retry, "VISCA error reply, retrying");
                return send_command(stream, packet, retry + 1);
            }
            true
        }
        Err(_) => false,
    }
}

fn run_inquiry(stream: &mut TcpStream, zoom: bool) -> std::io::Result<Vec<u8>> {
    let packet: &[u8] = if zoom {
        &[0x81, 0x09, 0x04, 0x47, 0xFF] // CAM_ZoomPosInq
    } else {
        &[0x81, 0x09, 0x06, 0x12, 0xFF] // PanTiltPosInq
    };
    write_packet(stream, packet)?;
    read_reply(stream)
}

/// Reply `90 50 0p 0q 0r 0s FF` packs the zoom position in four nibbles.
fn decode_zoom_reply(reply: &[u8]) -> Option<i64> {
    if reply.len() < 7 || reply[1] != 0x50 {
        return None;
    }
    let raw = ((reply[2] as i64 & 0x0F) << 12)
        | ((reply[3] as i64 & 0x0F) << 8)
        | ((reply[4] as i64 & 0x0F) << 4)
        | (reply[5] as i64 & 0x0F);
    Some(raw)
}

fn write_packet(stream: &mut TcpStream, packet: &[u8]) -> std::io::Result<()> {
    stream.write_all(packet)
}

/// Read bytes until the 0xFF terminator.
fn read_reply(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut reply = Vec::with_capacity(16);
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte)?;
        reply.push(byte[0]);
        if byte[0] == 0xFF || reply.len() > 32 {
            return Ok(reply);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zoom_factor_mapping() {
        assert!((ViscaBackend::raw_to_zoom_factor(0) - 1.0).abs() < 1e-6);
        assert!((ViscaBackend::raw_to_zoom_factor(16384) - 20.0).abs() < 1e-3);
        // Halfway in raw is √20 in magnification.
        assert!((ViscaBackend::raw_to_zoom_factor(8192) - 20.0f32.sqrt()).abs() < 1e-3);
    }

    #[test]
    fn zoom_reply_decoding() {
        assert_eq!(decode_zoom_reply(&[0x90, 0x50, 0x01, 0x02, 0x03, 0x04, 0xFF]), Some(0x1234));
        assert_eq!(decode_zoom_reply(&[0x90, 0x41, 0xFF]), None);
        assert_eq!(decode_zoom_reply(&[]), None);
    }

    #[test]
    fn backend_with_empty_address_stays_inert() {
        // No device: commands queue into atomics, nothing explodes, and the
        // inquiry pacing still runs.
        let mut b = ViscaBackend::new(ViscaConfig { address: String::new(), port: 5678 });
        assert!(b.can_send());
        b.set_pantilt_speed(3, -2);
        b.set_zoom_speed(1);
        b.tick();
        assert!(!b.can_send()); // inquiry outstanding, no ack will come
        for _ in 0..super::super::ACK_TIMEOUT_TICKS {
            b.tick();
        }
        // Timeout path keeps the loop making progress.
        assert!(b.can_send());
        assert!((b.zoom_factor() - 1.0).abs() < 1e-6);
    }
}
