//! Capture frames and write the encoded stream to a file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use nvcap_capture_engine::{CaptureRequest, SessionParams};
use nvcap_common::clock::{frame_timestamp_ns, IntervalTracker};
use nvcap_common::config::NvcapConfig;

use crate::DeviceArgs;

pub struct CaptureArgs {
    pub output: PathBuf,
    pub frames: u64,
    pub fps_n: Option<u32>,
    pub fps_d: Option<u32>,
    pub bitrate: Option<u32>,
    pub keyframe_every: u64,
    pub show_pointer: bool,
}

pub fn run(config: &NvcapConfig, device: DeviceArgs, args: CaptureArgs) -> anyhow::Result<()> {
    let defaults = &config.session;
    let params = SessionParams::new(
        args.fps_n.unwrap_or(defaults.fps_n),
        args.fps_d.unwrap_or(defaults.fps_d),
        args.bitrate.unwrap_or(defaults.bitrate),
    )
    .with_pointer(args.show_pointer || defaults.show_pointer);
    params.validate()?;

    let file = File::create(&args.output)
        .with_context(|| format!("cannot create {}", args.output.display()))?;
    let mut out = BufWriter::new(file);

    let (devices, mut handle) = super::open_context(config, &device)?;
    println!(
        "Capturing {} frames at {}/{} fps, {} bps",
        args.frames, params.fps_n, params.fps_d, params.bitrate
    );

    let started = Instant::now();
    let mut intervals = IntervalTracker::default();
    let mut bytes = 0u64;
    let mut keyframes = 0u64;
    let mut late = 0u64;

    for index in 0..args.frames {
        // Pace to the requested rate.
        let offset = frame_timestamp_ns(index, params.frame_duration_ns());
        let deadline = started + Duration::from_nanos(offset);
        if let Some(wait) = deadline.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }

        let force = args.keyframe_every > 0 && index > 0 && index % args.keyframe_every == 0;
        let request = CaptureRequest::new(params, index).with_force_keyframe(force);
        let frame = handle
            .capture(request)
            .with_context(|| format!("capture of frame {index} failed"))?;

        if let Some(sample) = intervals.record(Instant::now(), params.frame_duration_ns()) {
            if sample.lag_us() > sample.expected_us as i64 {
                late += 1;
            }
        }

        out.write_all(frame.data())?;
        bytes += frame.size() as u64;
        if frame.keyframe {
            keyframes += 1;
        }
        tracing::debug!(
            frame = index,
            size = frame.size(),
            keyframe = frame.keyframe,
            "Frame written"
        );
        handle.release_frame(frame);
    }
    out.flush()?;

    let session = handle.session_info().clone();
    let stats = handle.stats();
    handle.close()?;

    let elapsed = started.elapsed();
    println!();
    println!("Output:      {}", args.output.display());
    println!("Frames:      {} ({} keyframes)", args.frames, keyframes);
    println!("Bytes:       {bytes}");
    println!("Geometry:    {} (screen {})", session.size, session.screen);
    println!("GOP length:  {}", session.gop_length);
    println!("Rebuilds:    {}", stats.session_builds.saturating_sub(1));
    println!("Elapsed:     {:.2}s", elapsed.as_secs_f64());
    if late > 0 {
        println!("Late frames: {late}");
    }

    let report = devices.report();
    if !report.is_clean() {
        tracing::warn!(live = ?report.live, "Device objects left alive after close");
    }

    Ok(())
}
