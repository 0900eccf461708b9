// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::time::Duration;

use canonical_error::CanonicalError;
use clap::Parser;
use image::{Rgba, RgbaImage};
use log::info;

use front_capture::image_device::ImageDevice;
use front_capture::orchestrator::CaptureOrchestrator;
use front_capture::photo_store;
use front_capture::pipeline::{PhotoPipeline, PipelineConfig};
use front_capture::session_manager::{CaptureSessionManager, SessionConfig};

/// Runs the capture flow against a simulated front camera that yields the
/// given JPEG, writing raw and processed photos to the output directory.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// JPEG the simulated camera returns. Without it a 1280x720 test pattern
    /// is used.
    #[arg(short, long)]
    input: Option<PathBuf>,

    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Bus label to stamp onto each photo together with the time.
    #[arg(short, long)]
    label: Option<String>,

    /// Number of capture button presses.
    #[arg(short, long, default_value_t = 1)]
    count: u32,

    #[arg(long, default_value_t = 500)]
    settle_ms: u64,

    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

// Horizontal gradient so rotation is visible in the output.
fn test_pattern() -> RgbaImage {
    RgbaImage::from_fn(1280, 720, |x, y| {
        Rgba([(x * 255 / 1279) as u8, (y * 255 / 719) as u8, 128, 255])
    })
}

#[tokio::main]
async fn main() -> Result<(), CanonicalError> {
    // If any thread panics, bail out.
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Thread panicked: {}", panic_info);
        std::process::exit(1);
    }));
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let device = match &args.input {
        Some(path) => ImageDevice::new(std::fs::read(path).map_err(
            |e| canonical_error::not_found_error(
                format!("{}: {}", path.display(), e).as_str()))?),
        None => ImageDevice::from_image(&test_pattern())?,
    };
    let config = SessionConfig {
        callback_timeout: Duration::from_millis(args.timeout_ms),
        settle_interval: Duration::from_millis(args.settle_ms),
        ..SessionConfig::default()
    };
    let mut pipeline_config = PipelineConfig::new(&args.output_dir);
    pipeline_config.overlay_label = args.label.clone();
    let manager = CaptureSessionManager::new(device, config,
                                             PhotoPipeline::new(pipeline_config));
    let mut orchestrator = CaptureOrchestrator::new(manager);

    let result = run(&mut orchestrator, args.count).await;
    orchestrator.shutdown().await;
    println!("{}", orchestrator.status().render());
    result
}

async fn run(orchestrator: &mut CaptureOrchestrator<ImageDevice>, count: u32)
             -> Result<(), CanonicalError> {
    orchestrator.start().await?;
    for _ in 0..count {
        let photo = orchestrator.on_capture_requested().await?;
        info!("Saved {} ({})", photo.path().display(),
              photo_store::file_size(photo.path())?);
    }
    Ok(())
}
