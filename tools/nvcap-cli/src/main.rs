//! nvcap CLI: capture the screen to an H.264 elementary stream.
//!
//! Usage:
//!   nvcap capture [OPTIONS]    Capture and encode frames to a file
//!   nvcap info [OPTIONS]       Open a context and print the session it builds
//!   nvcap config [OPTIONS]     Show or initialize the configuration file
//!
//! Devices come from the simulated backend; its screen size is set with
//! `--sim-width`/`--sim-height`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "nvcap",
    about = "Low-latency screen capture and H.264 encoding",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command that opens a context.
#[derive(Args, Clone)]
struct DeviceArgs {
    /// Display to capture (defaults to the configured display)
    #[arg(long)]
    display: Option<String>,

    /// Width of the simulated screen
    #[arg(long, default_value = "1920")]
    sim_width: u32,

    /// Height of the simulated screen
    #[arg(long, default_value = "1080")]
    sim_height: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture and encode frames to an H.264 file
    Capture {
        #[command(flatten)]
        device: DeviceArgs,

        /// Output file (Annex-B H.264)
        #[arg(short, long, default_value = "capture.h264")]
        output: PathBuf,

        /// Number of frames to capture
        #[arg(short = 'n', long, default_value = "60")]
        frames: u64,

        /// Frame rate numerator (defaults to the configured rate)
        #[arg(long)]
        fps_n: Option<u32>,

        /// Frame rate denominator (defaults to the configured rate)
        #[arg(long)]
        fps_d: Option<u32>,

        /// Target bitrate in bits per second (defaults to the configured bitrate)
        #[arg(long)]
        bitrate: Option<u32>,

        /// Force a keyframe every N frames (0 disables forcing)
        #[arg(long, default_value = "0")]
        keyframe_every: u64,

        /// Request the pointer in captured frames
        #[arg(long)]
        show_pointer: bool,
    },

    /// Open a context and print the session it builds
    Info {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Show or initialize the configuration file
    Config {
        /// Write the default configuration to the config path
        #[arg(long)]
        write_default: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = nvcap_common::config::NvcapConfig::load();
    let mut logging = config.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    nvcap_common::logging::init_logging(&logging);

    match cli.command {
        Commands::Capture {
            device,
            output,
            frames,
            fps_n,
            fps_d,
            bitrate,
            keyframe_every,
            show_pointer,
        } => commands::capture::run(
            &config,
            device,
            commands::capture::CaptureArgs {
                output,
                frames,
                fps_n,
                fps_d,
                bitrate,
                keyframe_every,
                show_pointer,
            },
        ),
        Commands::Info { device } => commands::info::run(&config, device),
        Commands::Config { write_default } => commands::config::run(&config, write_default),
    }
}
