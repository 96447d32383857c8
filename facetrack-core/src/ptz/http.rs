//! HTTP backend: templated requests for cameras with a web control API.
//!
//! Camera models live in a JSON table; each entry carries a request template
//! with `{name}` placeholders plus a per-axis `linear-int` mapping from the
//! control output to the device's integer range.  A missing or unknown model
//! leaves the backend as an inert sink; face tracking keeps running without
//! an actuator.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::PtzBackend;

/// Poll interval of the send thread.
const SEND_INTERVAL: Duration = Duration::from_millis(50);

// ── Camera model table ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CameraModelTable {
    #[serde(rename = "camera-models", default)]
    pub models: Vec<CameraModel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraModel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub settings: ModelSettings,
    #[serde(rename = "control-function")]
    pub control: ControlFunctions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelSettings {
    #[serde(rename = "ptz-method", default = "default_method")]
    pub method: String,
    #[serde(rename = "ptz-url")]
    pub url: String,
    #[serde(rename = "ptz-payload", default)]
    pub payload: String,
}

fn default_method() -> String {
    "GET".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlFunctions {
    pub p: LinearInt,
    pub t: LinearInt,
    pub z: LinearInt,
}

/// `u_int = clamp(k1·u + k0, ±max)`.
#[derive(Debug, Clone, Deserialize)]
pub struct LinearInt {
    #[serde(default)]
    pub k1: f64,
    #[serde(default)]
    pub k0: f64,
    pub max: i64,
}

impl CameraModelTable {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("failed to parse camera model table")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read camera models: {}", path.display()))?;
        Self::from_json(&json)
    }

    pub fn find(&self, id: &str) -> Option<&CameraModel> {
        self.models.iter().find(|m| m.id == id)
    }
}

/// Replace `{name}` in `template` with values from `data`; `{{}` escapes a
/// literal brace.  Unknown names expand to nothing.
pub fn replace_placeholder(template: &str, data: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        if let Some(stripped) = tail.strip_prefix("{{}") {
            out.push('{');
            rest = stripped;
            continue;
        }
        match tail[1..].find('}') {
            Some(close) => {
                let name = &tail[1..1 + close];
                if let Some(value) = data.get(name) {
                    out.push_str(value);
                }
                rest = &tail[close + 2..];
            }
            None => {
                out.push_str(tail);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Change-detecting integer mapping for one control axis.
#[derive(Debug, Default)]
struct ControlChange {
    value: Option<i64>,
}

impl ControlChange {
    /// Map `u` through `f`; true when the resulting integer differs from the
    /// last one sent.
    fn update(&mut self, u: f64, f: &LinearInt) -> bool {
        let next = ((f.k1 * u + f.k0) as i64).clamp(-f.max, f.max);
        if self.value == Some(next) {
            return false;
        }
        self.value = Some(next);
        true
    }
}

// ── Backend ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub camera_model: String,
}

struct Shared {
    pan: AtomicI64,
    tilt: AtomicI64,
    zoom: AtomicI64,
    stop: AtomicBool,
}

pub struct HttpBackend {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl HttpBackend {
    /// `table` usually comes from the configured camera-models JSON file.  An
    /// unknown model id degrades to an inert backend.
    pub fn new(config: HttpConfig, table: &CameraModelTable) -> Self {
        let shared = Arc::new(Shared {
            pan: AtomicI64::new(0),
            tilt: AtomicI64::new(0),
            zoom: AtomicI64::new(0),
            stop: AtomicBool::new(false),
        });

        let thread = match table.find(&config.camera_model) {
            Some(model) => {
                info!(model = %model.id, host = %config.host, "HTTP PTZ backend ready");
                let model = model.clone();
                let host = config.host.clone();
                let io_shared = Arc::clone(&shared);
                Some(
                    std::thread::Builder::new()
                        .name("ptz-http".into())
                        .spawn(move || send_loop(&io_shared, &model, &host))
                        .expect("failed to spawn HTTP PTZ thread"),
                )
            }
            None => {
                warn!(model = %config.camera_model, "camera model not found; HTTP backend disabled");
                None
            }
        };

        Self { shared, thread }
    }
}

impl PtzBackend for HttpBackend {
    fn set_pantilt_speed(&mut self, pan: i32, tilt: i32) {
        self.shared.pan.store(pan as i64, Ordering::Release);
        self.shared.tilt.store(tilt as i64, Ordering::Release);
    }

    fn set_zoom_speed(&mut self, zoom: i32) {
        self.shared.zoom.store(zoom as i64, Ordering::Release);
    }
}

impl Drop for HttpBackend {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn send_loop(shared: &Shared, model: &CameraModel, host: &str) {
    let mut up = ControlChange::default();
    let mut ut = ControlChange::default();
    let mut uz = ControlChange::default();
    let mut dirty = false;

    while !shared.stop.load(Ordering::Acquire) {
        let pan = shared.pan.load(Ordering::Acquire) as f64;
        let tilt = shared.tilt.load(Ordering::Acquire) as f64;
        let zoom = shared.zoom.load(Ordering::Acquire) as f64;

        dirty |= up.update(pan, &model.control.p);
        dirty |= ut.update(tilt, &model.control.t);
        dirty |= uz.update(zoom, &model.control.z);

        if dirty && send_ptz(model, host, &up, &ut, &uz) {
            dirty = false;
        }

        std::thread::sleep(SEND_INTERVAL);
    }
}

fn send_ptz(model: &CameraModel, host: &str, p: &ControlChange, t: &ControlChange, z: &ControlChange) -> bool {
    let mut data = HashMap::new();
    data.insert("host".to_string(), host.to_string());
    data.insert("p".to_string(), p.value.unwrap_or(0).to_string());
    data.insert("t".to_string(), t.value.unwrap_or(0).to_string());
    data.insert("z".to_string(), z.value.unwrap_or(0).to_string());

    let url = replace_placeholder(&model.settings.url, &data);
    let payload = replace_placeholder(&model.settings.payload, &data);
    debug!(method = %model.settings.method, url = %url, "sending PTZ request");

    let result = match model.settings.method.as_str() {
        "POST" => ureq::post(&url).send_string(&payload).map(|_| ()),
        _ => ureq::get(&url).call().map(|_| ()),
    };

    match result {
        Ok(()) => true,
        Err(e) => {
            // Dropped command; the next change retries.
            warn!(url = %url, error = %e, "PTZ request failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"{
        "camera-models": [{
            "id": "generic-cgi",
            "name": "Generic CGI camera",
            "settings": {
                "ptz-method": "GET",
                "ptz-url": "http://{host}/cgi?pan={p}&tilt={t}&zoom={z}"
            },
            "control-function": {
                "p": { "type": "linear-int", "k1": 1.0, "k0": 0.0, "max": 24 },
                "t": { "type": "linear-int", "k1": 1.0, "k0": 0.0, "max": 20 },
                "z": { "type": "linear-int", "k1": 1.0, "k0": 0.0, "max": 7 }
            }
        }]
    }"#;

    #[test]
    fn placeholder_substitution() {
        let mut data = HashMap::new();
        data.insert("host".into(), "cam.local".into());
        data.insert("p".into(), "-3".into());
        assert_eq!(
            replace_placeholder("http://{host}/x?p={p}&q={missing}", &data),
            "http://cam.local/x?p=-3&q="
        );
        assert_eq!(replace_placeholder("a{{}b}c", &data), "a{b}c");
        assert_eq!(replace_placeholder("plain", &data), "plain");
    }

    #[test]
    fn model_table_parses_and_finds() {
        let table = CameraModelTable::from_json(TABLE).unwrap();
        let model = table.find("generic-cgi").expect("model present");
        assert_eq!(model.control.p.max, 24);
        assert!(table.find("nope").is_none());
    }

    #[test]
    fn control_change_clamps_and_deduplicates() {
        let f = LinearInt { k1: 2.0, k0: 0.0, max: 10 };
        let mut c = ControlChange::default();
        assert!(c.update(3.0, &f));
        assert_eq!(c.value, Some(6));
        assert!(!c.update(3.0, &f)); // unchanged
        assert!(c.update(100.0, &f));
        assert_eq!(c.value, Some(10)); // clamped
        assert!(c.update(-100.0, &f));
        assert_eq!(c.value, Some(-10));
    }

    #[test]
    fn unknown_model_degrades_to_inert_sink() {
        let table = CameraModelTable::from_json(TABLE).unwrap();
        let mut b = HttpBackend::new(
            HttpConfig { host: "cam.local".into(), camera_model: "missing".into() },
            &table,
        );
        // No thread, no panic; commands are swallowed.
        b.set_pantilt_speed(1, 2);
        b.set_zoom_speed(3);
        assert!(b.can_send());
    }
}
