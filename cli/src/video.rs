//! video — FFmpeg decode bridge
//!
//! Opens a video, iterates decoded frames as packed RGB24 and hands each one
//! to a callback together with the frame interval.  Decode-only: the engine
//! consumes frames and drives a camera, nothing is written back.

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, format, frame, media, software::scaling};
use std::path::Path;
use tracing::info;

use facetrack_core::frame::RgbFrame;

/// Scaling flags for the decode → RGB conversion.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;

/// Decode `input_path`, calling `frame_fn(frame, dt)` for every video frame.
/// `dt` is the nominal frame interval derived from the stream's frame rate.
pub fn decode<P, F>(input_path: P, mut frame_fn: F) -> Result<u64>
where
    P: AsRef<Path>,
    F: FnMut(RgbFrame, f32) -> Result<()>,
{
    ffmpeg::init().context("failed to initialise FFmpeg")?;

    let mut ictx = format::input(&input_path).context("could not open input file")?;
    let video_stream_index = ictx
        .streams()
        .best(media::Type::Video)
        .context("no video stream found in input")?
        .index();

    let input_stream = ictx.stream(video_stream_index).context("video stream vanished")?;
    let frame_rate = input_stream.avg_frame_rate();
    let dt = if frame_rate.numerator() > 0 {
        frame_rate.denominator() as f32 / frame_rate.numerator() as f32
    } else {
        1.0 / 30.0
    };

    let decoder_ctx = codec::context::Context::from_parameters(input_stream.parameters())
        .context("failed to build decoder context")?;
    let mut decoder = decoder_ctx.decoder().video().context("failed to open video decoder")?;

    let src_width = decoder.width();
    let src_height = decoder.height();
    let src_pixel_fmt = decoder.format();
    info!(src_width, src_height, ?src_pixel_fmt, fps = 1.0 / dt, "opened input video stream");

    let mut to_rgb = scaling::Context::get(
        src_pixel_fmt,
        src_width,
        src_height,
        format::Pixel::RGB24,
        src_width,
        src_height,
        SCALE_FLAGS,
    )
    .context("failed to create to-RGB scaler")?;

    let mut decoded = frame::Video::empty();
    let mut rgb = frame::Video::empty();
    let mut frame_count = 0u64;

    for (stream, packet) in ictx.packets() {
        if stream.index() != video_stream_index {
            continue;
        }
        decoder.send_packet(&packet).context("decoder send_packet")?;
        while decoder.receive_frame(&mut decoded).is_ok() {
            to_rgb.run(&decoded, &mut rgb).context("to-RGB scaling failed")?;
            frame_fn(compact_rgb(&rgb, src_width, src_height, &decoded), dt)?;
            frame_count += 1;
        }
    }

    decoder.send_eof().ok();
    while decoder.receive_frame(&mut decoded).is_ok() {
        to_rgb.run(&decoded, &mut rgb).context("to-RGB scaling failed")?;
        frame_fn(compact_rgb(&rgb, src_width, src_height, &decoded), dt)?;
        frame_count += 1;
    }

    info!(frame_count, "decode complete");
    Ok(frame_count)
}

/// Strip the stride padding so downstream code sees a plain packed buffer.
fn compact_rgb(rgb: &frame::Video, width: u32, height: u32, decoded: &frame::Video) -> RgbFrame {
    let stride = rgb.stride(0);
    let raw = rgb.data(0);
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for row in 0..height as usize {
        let start = row * stride;
        data.extend_from_slice(&raw[start..start + width as usize * 3]);
    }
    RgbFrame { data, width, height, pts: decoded.pts().unwrap_or(0) }
}

/// Approximate total frame count for progress reporting; 0 when unknown.
pub fn total_frames<P: AsRef<Path>>(input_path: P) -> u64 {
    ffmpeg::init().ok();
    let Ok(ictx) = format::input(&input_path) else {
        return 0;
    };
    let Some(stream) = ictx.streams().best(media::Type::Video) else {
        return 0;
    };
    let nb = stream.frames();
    if nb > 0 {
        return nb as u64;
    }
    let dur = stream.duration();
    let tb = stream.time_base();
    let fps = stream.avg_frame_rate();
    if dur > 0 && tb.denominator() > 0 && fps.numerator() > 0 {
        let seconds = dur as f64 * tb.numerator() as f64 / tb.denominator() as f64;
        let fps_f = fps.numerator() as f64 / fps.denominator() as f64;
        return (seconds * fps_f).round() as u64;
    }
    0
}
