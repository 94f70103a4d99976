use anyhow::{Context, Result};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::accelerator::{DeviceInfo, Session, enumerate_devices};
use crate::args::Args;
use crate::camera;
use crate::capture_loop::{CaptureLoop, Clock, LocalClock, Schedule};
use crate::debug::DebugSink;
use crate::geometry::Pipeline;
use crate::mean::MeanVector;

/// Exit status when no inference device is available.
pub const NO_DEVICE_EXIT: u8 = 2;

/// First device matching `selector`; when there is none, reports it and
/// yields the exit status to leave with.
pub fn select_device(selector: Option<&str>) -> Result<DeviceInfo, ExitCode> {
    enumerate_devices(selector).into_iter().next().ok_or_else(|| {
        println!("No devices found");
        ExitCode::from(NO_DEVICE_EXIT)
    })
}

pub fn run() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    let args: Args = argh::from_env();
    let settings = args.settings()?;

    let mean = MeanVector::load(&settings.mean_path)?;
    tracing::info!("Channel mean ({}): {:?}", settings.channel_order, mean.0);

    let device = match select_device(settings.device.as_deref()) {
        Ok(device) => device,
        Err(code) => return Ok(code),
    };
    let session = Session::open(device, &settings.graph_path, settings.geometry.target_size)?;

    let camera = camera::open(&settings.camera)?;
    let (width, height) = camera.resolution();
    settings
        .geometry
        .validate(width, height)
        .with_context(|| format!("geometry does not match the {width}x{height} camera"))?;

    let debug = match &settings.debug_dir {
        Some(dir) => DebugSink::new(dir)?,
        None => DebugSink::disabled(),
    };
    let pipeline = Pipeline::new(settings.geometry.clone(), mean, settings.channel_order, debug);

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        handler_stop.store(true, Ordering::SeqCst);
    })
    .context("failed to install Ctrl-C handler")?;

    let clock = LocalClock;
    let started = clock.now();
    let schedule = Schedule::starting_at(started.wall, settings.interval, settings.cutoff, settings.poll);

    let mut capture = CaptureLoop::new(camera, pipeline, session, schedule, started.mono);
    capture.run(&clock, &stop);
    Ok(ExitCode::SUCCESS)
}
