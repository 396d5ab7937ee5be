//! Open a context, print what it negotiated, and close it.

use nvcap_common::config::NvcapConfig;

use crate::DeviceArgs;

pub fn run(config: &NvcapConfig, device: DeviceArgs) -> anyhow::Result<()> {
    let (devices, mut handle) = super::open_context(config, &device)?;
    let session = handle.session_info().clone();
    handle.close()?;

    println!("nvcap Session");
    println!("{}", "=".repeat(50));
    println!(
        "Display:    {}",
        device
            .display
            .as_deref()
            .or(config.display.as_deref())
            .unwrap_or("(default)")
    );
    println!("Screen:     {}", session.screen);
    println!("Encoded:    {}", session.size);
    println!(
        "Frame rate: {}/{} fps",
        session.params.fps_n, session.params.fps_d
    );
    println!("Bitrate:    {} bps", session.params.bitrate);
    println!("GOP length: {}", session.gop_length);
    println!("Built at:   {}", session.built_at.to_rfc3339());

    let report = devices.report();
    println!();
    println!("Device calls: {}", report.log.len());
    println!("Device threads: {}", report.thread_count);
    if report.is_clean() {
        println!("[OK] All device objects released");
    } else {
        println!("[WARN] Objects still alive: {:?}", report.live);
    }

    println!();
    println!("{}", serde_json::to_string_pretty(&session)?);
    Ok(())
}
