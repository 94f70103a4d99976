use anyhow::{Context, Result};
use argh::FromArgs;
use chrono::NaiveTime;
use std::path::PathBuf;
use std::time::Duration;

use crate::camera::CameraConfig;
use crate::geometry::{ChannelOrder, Geometry, Window};

#[derive(FromArgs, Debug)]
/// Room occupancy classification from periodic camera captures.
pub struct Args {
    /// deployment directory holding `data/graph` and `data/image_mean.npy`
    #[argh(option, default = "String::from(\"/home/pi/occupancy_detection\")")]
    home: String,

    /// model graph path (default: <home>/data/graph)
    #[argh(option)]
    graph: Option<String>,

    /// per-channel mean array path (default: <home>/data/image_mean.npy)
    #[argh(option)]
    mean_file: Option<String>,

    /// inference device (cpu:0); default is the first enumerated device
    #[argh(option)]
    device: Option<String>,

    /// camera index (usually 0)
    #[argh(option, default = "0")]
    camera: usize,

    /// capture width (best-effort; may be overridden by the driver)
    #[argh(option, default = "3280")]
    width: u32,

    /// capture height (best-effort; may be overridden by the driver)
    #[argh(option, default = "2464")]
    height: u32,

    /// frames discarded at the start of each capture
    #[argh(option, default = "3")]
    warmup_frames: u32,

    /// seconds between captures
    #[argh(option, default = "15")]
    interval_secs: u64,

    /// local time of day after which the program exits (HH:MM or HH:MM:SS)
    #[argh(option, default = "String::from(\"22:00\")")]
    cutoff: String,

    /// sleep between schedule checks, in milliseconds
    #[argh(option, default = "200")]
    poll_ms: u64,

    /// side of the square model input
    #[argh(option, default = "227")]
    target_size: u32,

    /// skew correction in degrees, counter-clockwise positive
    #[argh(option, default = "-4.5")]
    rotation: f32,

    /// crop window left edge
    #[argh(option, default = "736")]
    crop_x: u32,

    /// crop window top edge
    #[argh(option, default = "592")]
    crop_y: u32,

    /// crop window width
    #[argh(option, default = "2354")]
    crop_width: u32,

    /// crop window height
    #[argh(option, default = "1243")]
    crop_height: u32,

    /// leftward shift of the center region, in pixels
    #[argh(option, default = "104")]
    center_offset: u32,

    /// model input channel order (bgr, rgb)
    #[argh(option, default = "ChannelOrder::Bgr")]
    channel_order: ChannelOrder,

    /// directory for intermediate PNG images (default: working directory)
    #[argh(option, default = "String::from(\".\")")]
    debug_dir: String,

    /// do not write intermediate PNG images
    #[argh(switch)]
    no_debug_images: bool,
}

/// Everything the program needs, resolved from [`Args`].
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub graph_path: PathBuf,
    pub mean_path: PathBuf,
    pub device: Option<String>,
    pub camera: CameraConfig,
    pub geometry: Geometry,
    pub channel_order: ChannelOrder,
    pub interval: Duration,
    pub cutoff: NaiveTime,
    pub poll: Duration,
    pub debug_dir: Option<PathBuf>,
}

pub fn parse_time_of_day(s: &str) -> Result<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .with_context(|| format!("invalid time of day `{s}` (expected HH:MM or HH:MM:SS)"))
}

impl Args {
    pub fn settings(&self) -> Result<Settings> {
        let home = PathBuf::from(&self.home);
        let data = home.join("data");
        if self.interval_secs == 0 {
            anyhow::bail!("--interval-secs must be positive");
        }

        Ok(Settings {
            graph_path: self
                .graph
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| data.join("graph")),
            mean_path: self
                .mean_file
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| data.join("image_mean.npy")),
            device: self.device.clone(),
            camera: CameraConfig {
                index: self.camera,
                width: self.width,
                height: self.height,
                warmup_frames: self.warmup_frames,
            },
            geometry: Geometry {
                rotation_degrees: self.rotation,
                crop: Window {
                    x: self.crop_x,
                    y: self.crop_y,
                    width: self.crop_width,
                    height: self.crop_height,
                },
                center_offset: self.center_offset,
                target_size: self.target_size,
            },
            channel_order: self.channel_order,
            interval: Duration::from_secs(self.interval_secs),
            cutoff: parse_time_of_day(&self.cutoff)?,
            poll: Duration::from_millis(self.poll_ms),
            debug_dir: (!self.no_debug_images).then(|| PathBuf::from(&self.debug_dir)),
        })
    }
}
