//! ptz — actuator backends and the command/acknowledgement pacing
//!
//! All backends speak the same four-message contract: speed commands, preset
//! recall, a `can_send` gate and a per-tick advance.  Wire encoding is the
//! only thing that differs, so everything protocol-agnostic (duplicate
//! coalescing, the inquiry/ack cycle) lives here.

pub mod http;
pub mod visca;

use tracing::info;

/// A pan-tilt-zoom actuator.
///
/// Speeds are signed device units; zero stops the axis.  Positive zoom moves
/// wide (out), negative tele (in).  Implementations queue the latest value
/// and are free to drop commands the device cannot accept yet.
pub trait PtzBackend: Send {
    /// True when the device can accept a new command this tick.
    fn can_send(&self) -> bool {
        true
    }

    /// Advance the inquiry cycle and harvest any pending device responses.
    fn tick(&mut self) {}

    fn set_pantilt_speed(&mut self, pan: i32, tilt: i32);

    fn set_zoom_speed(&mut self, zoom: i32);

    /// Combined command for devices that only take one message; the default
    /// splits it.
    fn set_pantiltzoom_speed(&mut self, pan: i32, tilt: i32, zoom: i32) {
        self.set_pantilt_speed(pan, tilt);
        self.set_zoom_speed(zoom);
    }

    /// Recall an absolute preset; a slow command, independent of the speed
    /// channel.
    fn recall_preset(&mut self, _preset: i32) {}

    /// Current optical zoom as a magnification factor (1.0 = wide end); used
    /// by the control loop's gain computation.
    fn zoom_factor(&self) -> f32 {
        1.0
    }
}

// ── Inquiry/acknowledgement cycle ────────────────────────────────────────────

/// Ticks without an acknowledgement after which sending is allowed anyway.
/// The timeout path keeps the loop making progress over a lossy link.
pub const ACK_TIMEOUT_TICKS: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InquiryKind {
    PanTilt,
    Zoom,
}

/// The cyclic inquiry state machine: idle → pan/tilt query → zoom query →
/// idle.  `can_send` gates outgoing commands on the last inquiry having been
/// answered, with the timeout fallback.
#[derive(Debug)]
pub struct InquiryCycle {
    now: u32,
    outstanding: Option<(InquiryKind, u32)>,
    next_kind: InquiryKind,
}

impl Default for InquiryCycle {
    fn default() -> Self {
        Self { now: 0, outstanding: None, next_kind: InquiryKind::PanTilt }
    }
}

impl InquiryCycle {
    pub fn tick(&mut self) {
        self.now += 1;
    }

    pub fn can_send(&self) -> bool {
        match self.outstanding {
            None => true,
            Some((_, sent)) => self.now >= sent + ACK_TIMEOUT_TICKS,
        }
    }

    /// Start the next inquiry in the cycle; returns which one to put on the
    /// wire.  Callers only do this when [`can_send`](Self::can_send) holds.
    pub fn begin(&mut self) -> InquiryKind {
        let kind = self.next_kind;
        self.outstanding = Some((kind, self.now));
        self.next_kind = match kind {
            InquiryKind::PanTilt => InquiryKind::Zoom,
            InquiryKind::Zoom => InquiryKind::PanTilt,
        };
        kind
    }

    /// The device answered the outstanding inquiry.
    pub fn acknowledge(&mut self) {
        self.outstanding = None;
    }

    pub fn outstanding(&self) -> Option<InquiryKind> {
        self.outstanding.map(|(k, _)| k)
    }
}

// ── Duplicate coalescing ─────────────────────────────────────────────────────

/// Consecutive repeats of an unchanged value that are still sent, to guard
/// against a dropped packet.
const FORCED_REPEATS: u32 = 3;

/// Per-channel latch: suppresses duplicate-valued sends after a few forced
/// repeats have gone through.
#[derive(Debug, Default)]
pub(crate) struct Coalesce<T: PartialEq + Copy> {
    last: Option<T>,
    repeats: u32,
}

impl<T: PartialEq + Copy> Coalesce<T> {
    /// True when `value` should actually be sent.
    pub fn should_send(&mut self, value: T) -> bool {
        if self.last == Some(value) {
            if self.repeats >= FORCED_REPEATS {
                return false;
            }
            self.repeats += 1;
            return true;
        }
        self.last = Some(value);
        self.repeats = 0;
        true
    }
}

// ── Dummy backend ────────────────────────────────────────────────────────────

/// Logging sink standing in for a real device; also the fallback when a
/// backend's configuration is missing or invalid, so tracking keeps running
/// with no functioning actuator.
#[derive(Default)]
pub struct DummyBackend {
    pantilt: Coalesce<(i32, i32)>,
    zoom: Coalesce<i32>,
}

impl PtzBackend for DummyBackend {
    fn set_pantilt_speed(&mut self, pan: i32, tilt: i32) {
        if self.pantilt.should_send((pan, tilt)) {
            info!(pan, tilt, "ptz pan/tilt speed");
        }
    }

    fn set_zoom_speed(&mut self, zoom: i32) {
        if self.zoom.should_send(zoom) {
            info!(zoom, "ptz zoom speed");
        }
    }

    fn recall_preset(&mut self, preset: i32) {
        info!(preset, "ptz preset recall");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_send_scenario() {
        let mut q = InquiryCycle::default();

        // t = 0, no prior inquiry.
        assert!(q.can_send());

        // Immediately after an inquiry with no ack: blocked.
        let kind = q.begin();
        assert_eq!(kind, InquiryKind::PanTilt);
        assert!(!q.can_send());

        // Stays blocked until the timeout, then opens regardless of ack.
        for _ in 0..ACK_TIMEOUT_TICKS - 1 {
            q.tick();
            assert!(!q.can_send());
        }
        q.tick();
        assert!(q.can_send());
    }

    #[test]
    fn ack_reopens_immediately() {
        let mut q = InquiryCycle::default();
        q.begin();
        q.tick();
        assert!(!q.can_send());
        q.acknowledge();
        assert!(q.can_send());
    }

    #[test]
    fn inquiries_cycle_pantilt_then_zoom() {
        let mut q = InquiryCycle::default();
        assert_eq!(q.begin(), InquiryKind::PanTilt);
        q.acknowledge();
        assert_eq!(q.begin(), InquiryKind::Zoom);
        q.acknowledge();
        assert_eq!(q.begin(), InquiryKind::PanTilt);
    }

    #[test]
    fn coalesce_allows_forced_repeats_then_suppresses() {
        let mut c = Coalesce::default();
        assert!(c.should_send(5)); // first
        assert!(c.should_send(5)); // repeats 1..=3 forced through
        assert!(c.should_send(5));
        assert!(c.should_send(5));
        assert!(!c.should_send(5)); // now coalesced
        assert!(!c.should_send(5));
        assert!(c.should_send(7)); // value change resets the repeat allowance
        assert!(c.should_send(7));
    }
}
