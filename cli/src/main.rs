use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use facetrack_core::{
    config::Config,
    detect::{CropMargins, FaceDetector, OnnxFaceDetector},
    engine::FollowEngine,
    frame::{FrameBuffer, RgbFrame},
};

mod video;

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "facetrack",
    version,
    about = "Keep a subject framed by driving a PTZ camera from face tracking",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline over a video, driving the configured backend.
    Run {
        /// Input video path
        #[arg(short, long)]
        input: PathBuf,

        /// Engine configuration (JSON); defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Face detection ONNX model (overrides the config)
        #[arg(long)]
        model: Option<PathBuf>,
    },

    /// Debug: run only the detector and print boxes per frame as TSV.
    Detect {
        /// Input video path
        #[arg(short, long)]
        input: PathBuf,

        /// Face detection ONNX model path
        #[arg(long, default_value = "yolov8n-face.onnx")]
        model: PathBuf,

        /// Run the detector on every Nth frame
        #[arg(long, default_value_t = 15)]
        stride: u64,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { input, config, model } => cmd_run(input, config, model),
        Commands::Detect { input, model, stride } => cmd_detect(input, model, stride),
    }
}

// ── Full pipeline ─────────────────────────────────────────────────────────────

fn cmd_run(input: PathBuf, config_path: Option<PathBuf>, model: Option<PathBuf>) -> Result<()> {
    let mut config = match &config_path {
        Some(p) => Config::from_file(p)
            .with_context(|| format!("failed to load config: {}", p.display()))?,
        None => Config::default(),
    };
    if let Some(m) = model {
        config.detector_model = Some(m);
    }

    info!("facetrack pipeline");
    info!("  input  : {}", input.display());
    if let Some(p) = &config_path {
        info!("  config : {}", p.display());
    }

    let mut engine = FollowEngine::from_config(&config).context("failed to build engine")?;

    let total = video::total_frames(&input);
    let pb = spinner("Tracking…");
    let pb2 = pb.clone();

    let result = video::decode(&input, |frame: RgbFrame, dt: f32| {
        pb2.tick();
        engine.process_frame(&frame, dt)
    });

    engine.stop();
    let frames = result.context("video decode failed")?;
    pb.finish_with_message("Done.");
    info!(frames, total, "pipeline finished");
    Ok(())
}

// ── Detector debug dump ───────────────────────────────────────────────────────

fn cmd_detect(input: PathBuf, model: PathBuf, stride: u64) -> Result<()> {
    let mut detector = OnnxFaceDetector::load(&model)
        .with_context(|| format!("failed to load model: {}", model.display()))?;

    let pb = spinner("Detecting faces…");
    let pb2 = pb.clone();
    let stride = stride.max(1);
    let mut index = 0u64;

    video::decode(&input, |frame: RgbFrame, _dt: f32| {
        pb2.tick();
        index += 1;
        if (index - 1) % stride != 0 {
            return Ok(());
        }
        let buffer = FrameBuffer::from_rgb(&frame, 1, index)?;
        for r in detector.detect(&buffer, CropMargins::default())? {
            println!("{}\t{}\t{}\t{}\t{}\t{}", index - 1, r.x0, r.y0, r.x1, r.y1, r.score);
        }
        Ok(())
    })
    .context("detection pass failed")?;

    pb.finish_with_message("Done.");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed_precise}]")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}
