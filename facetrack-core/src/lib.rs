pub mod config;
pub mod control;
pub mod detect;
pub mod engine;
pub mod frame;
pub mod geometry;
pub mod manager;
pub mod ptz;
pub mod sidecar;
pub mod track;
pub mod worker;

// Re-export the error types so callers only need `facetrack_core::Error`
pub use anyhow::Error;
pub use anyhow::Result;
