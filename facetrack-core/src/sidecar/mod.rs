//! sidecar — append-only TSV debug streams
//!
//! Three independently enabled observational outputs: raw tracker signals,
//! the computed error vector, and the control output with its quantized
//! commands.  Never read back; a write failure drops the line.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::error;

/// One append-only TSV stream, re-opened when its path changes.
#[derive(Default)]
pub struct SidecarWriter {
    file: Option<BufWriter<File>>,
    path: Option<PathBuf>,
}

impl SidecarWriter {
    /// Point the stream at `path` (or disable it with `None`).  Unchanged
    /// paths keep the open file.
    pub fn set_path(&mut self, path: Option<&Path>) {
        if self.path.as_deref() == path {
            return;
        }
        self.flush();
        self.file = None;
        self.path = path.map(Path::to_path_buf);

        if let Some(p) = &self.path {
            match OpenOptions::new().create(true).append(true).open(p) {
                Ok(f) => self.file = Some(BufWriter::new(f)),
                Err(e) => {
                    error!(path = %p.display(), error = %e, "failed to open debug data file");
                    self.path = None;
                }
            }
        }
    }

    pub fn enabled(&self) -> bool {
        self.file.is_some()
    }

    /// Append one tab-separated line; `fields` follow the timestamp.
    pub fn write_line(&mut self, timestamp: f64, fields: std::fmt::Arguments<'_>) {
        if let Some(f) = &mut self.file {
            let _ = writeln!(f, "{timestamp:.6}\t{fields}");
        }
    }

    pub fn flush(&mut self) {
        if let Some(f) = &mut self.file {
            let _ = f.flush();
        }
    }
}

/// The three streams the engine feeds.
#[derive(Default)]
pub struct DebugSidecars {
    pub tracker: SidecarWriter,
    pub error: SidecarWriter,
    pub control: SidecarWriter,
}

impl DebugSidecars {
    pub fn flush(&mut self) {
        self.tracker.flush();
        self.error.flush();
        self.control.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("facetrack-sidecar-{}-{name}.tsv", std::process::id()))
    }

    #[test]
    fn writes_tab_separated_lines_and_appends() {
        let path = temp_path("basic");
        let _ = std::fs::remove_file(&path);

        let mut w = SidecarWriter::default();
        w.set_path(Some(&path));
        assert!(w.enabled());
        w.write_line(0.5, format_args!("{}\t{}", 1, 2));
        w.flush();
        w.write_line(1.0, format_args!("{}\t{}", 3, 4));
        w.flush();

        let body = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "0.500000\t1\t2");
        assert_eq!(lines[1], "1.000000\t3\t4");

        // Re-setting the same path keeps appending rather than truncating.
        w.set_path(Some(&path));
        w.write_line(2.0, format_args!("5"));
        w.flush();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 3);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn disabled_stream_swallows_writes() {
        let mut w = SidecarWriter::default();
        assert!(!w.enabled());
        w.write_line(0.0, format_args!("dropped"));
        w.set_path(None);
    }
}
