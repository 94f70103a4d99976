//! Frame geometry: skew correction, cropping, the five-region split and the
//! per-region preprocessing that produces model input tensors.

use anyhow::{Context, Result};
use image::{RgbImage, imageops, imageops::FilterType};
use imageproc::geometric_transformations::{Interpolation, rotate_about_center};
use std::fmt;
use std::str::FromStr;

use crate::debug::DebugSink;
use crate::mean::MeanVector;

/// Fixed region order; the room vector follows it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegionKind {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
    Center,
}

impl RegionKind {
    pub const ALL: [RegionKind; 5] = [
        RegionKind::TopLeft,
        RegionKind::TopRight,
        RegionKind::BottomLeft,
        RegionKind::BottomRight,
        RegionKind::Center,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RegionKind::TopLeft => "top_left",
            RegionKind::TopRight => "top_right",
            RegionKind::BottomLeft => "bottom_left",
            RegionKind::BottomRight => "bottom_right",
            RegionKind::Center => "center",
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Axis-aligned window in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Window {
    fn from_bounds(x0: i64, y0: i64, x1: i64, y1: i64) -> Option<Self> {
        if x0 < 0 || y0 < 0 || x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Self {
            x: u32::try_from(x0).ok()?,
            y: u32::try_from(y0).ok()?,
            width: u32::try_from(x1 - x0).ok()?,
            height: u32::try_from(y1 - y0).ok()?,
        })
    }

    fn fits(&self, width: u32, height: u32) -> bool {
        u64::from(self.x) + u64::from(self.width) <= u64::from(width)
            && u64::from(self.y) + u64::from(self.height) <= u64::from(height)
    }
}

/// Mounting-specific geometry, tuned to the camera's field of view.
#[derive(Clone, Debug, PartialEq)]
pub struct Geometry {
    /// Skew correction in degrees, counter-clockwise positive.
    pub rotation_degrees: f32,
    pub crop: Window,
    /// Leftward shift of the center region, in pixels.
    pub center_offset: u32,
    /// Side of the square model input.
    pub target_size: u32,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            rotation_degrees: -4.5,
            crop: Window {
                x: 736,
                y: 592,
                width: 2354,
                height: 1243,
            },
            center_offset: 104,
            target_size: 227,
        }
    }
}

impl Geometry {
    /// Checks the crop window and every derived region against the camera
    /// resolution. Runs once at startup.
    pub fn validate(&self, frame_width: u32, frame_height: u32) -> Result<()> {
        if self.target_size == 0 {
            anyhow::bail!("target size must be positive");
        }
        if !self.crop.fits(frame_width, frame_height) || self.crop.width == 0 || self.crop.height == 0 {
            anyhow::bail!(
                "crop window {:?} does not fit a {}x{} frame",
                self.crop,
                frame_width,
                frame_height
            );
        }
        self.region_windows(self.crop.width, self.crop.height)
            .context("crop window too small for the five-region split")?;
        Ok(())
    }

    /// Region windows for a cropped frame of `width` x `height`, in
    /// [`RegionKind::ALL`] order. Bottom and center rows stop one pixel short,
    /// matching the layout the deployed model was trained on.
    pub fn region_windows(&self, width: u32, height: u32) -> Result<[(RegionKind, Window); 5]> {
        let (w, h) = (i64::from(width), i64::from(height));
        let off = i64::from(self.center_offset);
        let bounds = [
            (0, 0, w / 2, h / 2),
            (w / 2, 0, w, h / 2),
            (0, h / 2, w / 2, h - 1),
            (w / 2, h / 2, w, h - 1),
            (w / 4 - off, h / 4, 3 * w / 4 - off, 3 * h / 4 - 1),
        ];

        let mut windows = [(RegionKind::TopLeft, Window { x: 0, y: 0, width: 0, height: 0 }); 5];
        for ((slot, kind), (x0, y0, x1, y1)) in windows.iter_mut().zip(RegionKind::ALL).zip(bounds) {
            let window = Window::from_bounds(x0, y0, x1, y1)
                .with_context(|| format!("{kind} region is empty or out of bounds for a {width}x{height} crop"))?;
            *slot = (kind, window);
        }
        Ok(windows)
    }
}

/// Channel order of the model input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChannelOrder {
    #[default]
    Bgr,
    Rgb,
}

impl ChannelOrder {
    /// Source RGB index for each output channel.
    fn source_indices(self) -> [usize; 3] {
        match self {
            ChannelOrder::Bgr => [2, 1, 0],
            ChannelOrder::Rgb => [0, 1, 2],
        }
    }
}

impl FromStr for ChannelOrder {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bgr" => Ok(ChannelOrder::Bgr),
            "rgb" => Ok(ChannelOrder::Rgb),
            other => Err(format!("unknown channel order `{other}` (expected bgr or rgb)")),
        }
    }
}

impl fmt::Display for ChannelOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelOrder::Bgr => f.write_str("bgr"),
            ChannelOrder::Rgb => f.write_str("rgb"),
        }
    }
}

/// Model input: `size` x `size` x 3, interleaved, in model channel order.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub size: u32,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn at(&self, x: u32, y: u32, channel: usize) -> f32 {
        self.data[(y as usize * self.size as usize + x as usize) * 3 + channel]
    }

    /// Saturating 8-bit view of the tensor, converted back to RGB.
    pub fn to_rgb8(&self, order: ChannelOrder) -> RgbImage {
        let src = order.source_indices();
        RgbImage::from_fn(self.size, self.size, |x, y| {
            let mut px = [0u8; 3];
            for (c, &rgb) in src.iter().enumerate() {
                px[rgb] = self.at(x, y, c).round().clamp(0.0, 255.0) as u8;
            }
            image::Rgb(px)
        })
    }
}

#[derive(Clone, Debug)]
pub struct Region {
    pub kind: RegionKind,
    pub image: RgbImage,
}

/// Classic histogram-equalization LUT for one channel. Halves round to even.
pub fn equalization_lut(hist: &[u32; 256]) -> [u8; 256] {
    let mut lut = [0u8; 256];
    let total: u64 = hist.iter().map(|&n| u64::from(n)).sum();
    let Some(first) = hist.iter().position(|&n| n > 0) else {
        return lut;
    };
    let first_count = u64::from(hist[first]);
    if first_count == total {
        return [first as u8; 256];
    }

    let scale = 255.0 / (total - first_count) as f64;
    let mut sum = 0u64;
    for j in first + 1..256 {
        sum += u64::from(hist[j]);
        lut[j] = (sum as f64 * scale).round_ties_even().clamp(0.0, 255.0) as u8;
    }
    lut
}

/// Equalizes each channel independently.
pub fn equalize_channels(img: &mut RgbImage) {
    if img.width() == 0 || img.height() == 0 {
        return;
    }
    let hist = imageproc::stats::histogram(img);
    let luts: Vec<[u8; 256]> = hist.channels.iter().map(equalization_lut).collect();
    for px in img.pixels_mut() {
        for (value, lut) in px.0.iter_mut().zip(&luts) {
            *value = lut[*value as usize];
        }
    }
}

/// Equalizes, resizes the longer side to `target` and pads with black to a
/// `target` x `target` square.
pub fn transform_img(region: &RgbImage, target: u32) -> RgbImage {
    let mut canvas = RgbImage::new(target, target);
    let (w, h) = region.dimensions();
    if w == 0 || h == 0 || target == 0 {
        return canvas;
    }

    let mut equalized = region.clone();
    equalize_channels(&mut equalized);

    let ratio = f64::from(target) / f64::from(w.max(h));
    let new_w = ((f64::from(w) * ratio) as u32).clamp(1, target);
    let new_h = ((f64::from(h) * ratio) as u32).clamp(1, target);
    let resized = imageops::resize(&equalized, new_w, new_h, FilterType::CatmullRom);

    let left = (target - new_w) / 2;
    let top = (target - new_h) / 2;
    imageops::replace(&mut canvas, &resized, i64::from(left), i64::from(top));
    canvas
}

/// Resizes to exactly `target` x `target` and subtracts the channel means.
pub fn normalize_img(region: &RgbImage, target: u32, mean: &MeanVector, order: ChannelOrder) -> Tensor {
    let resized = imageops::resize(region, target, target, FilterType::Triangle);
    let src = order.source_indices();
    let mut data = Vec::with_capacity(target as usize * target as usize * 3);
    for px in resized.pixels() {
        for (c, &rgb) in src.iter().enumerate() {
            data.push(f32::from(px.0[rgb]) - mean.0[c]);
        }
    }
    Tensor { size: target, data }
}

/// The full per-frame preprocessing chain.
pub struct Pipeline {
    geometry: Geometry,
    mean: MeanVector,
    order: ChannelOrder,
    debug: DebugSink,
}

impl Pipeline {
    pub fn new(geometry: Geometry, mean: MeanVector, order: ChannelOrder, debug: DebugSink) -> Self {
        Self {
            geometry,
            mean,
            order,
            debug,
        }
    }

    /// Corrects mounting skew and cuts out the room window.
    pub fn crop_image(&self, frame: &RgbImage) -> Result<RgbImage> {
        let crop = self.geometry.crop;
        if !crop.fits(frame.width(), frame.height()) {
            anyhow::bail!(
                "frame {}x{} is smaller than the crop window {:?}",
                frame.width(),
                frame.height(),
                crop
            );
        }
        let theta = -self.geometry.rotation_degrees.to_radians();
        let rotated = rotate_about_center(frame, theta, Interpolation::Bilinear, image::Rgb([0, 0, 0]));
        let cropped = imageops::crop_imm(&rotated, crop.x, crop.y, crop.width, crop.height).to_image();
        self.debug.save("cropped_img", &cropped);
        Ok(cropped)
    }

    /// Splits into the four quadrants plus the shifted center, each already
    /// passed through [`transform_img`].
    pub fn split_to_five(&self, frame: &RgbImage) -> Result<Vec<Region>> {
        let windows = self.geometry.region_windows(frame.width(), frame.height())?;
        let raw: Vec<Region> = windows
            .iter()
            .map(|(kind, w)| Region {
                kind: *kind,
                image: imageops::crop_imm(frame, w.x, w.y, w.width, w.height).to_image(),
            })
            .collect();
        for region in &raw {
            self.debug.save(region.kind.name(), &region.image);
        }

        Ok(raw
            .into_iter()
            .map(|region| Region {
                kind: region.kind,
                image: transform_img(&region.image, self.geometry.target_size),
            })
            .collect())
    }

    pub fn normalize_img(&self, region: &RgbImage) -> Tensor {
        let tensor = normalize_img(region, self.geometry.target_size, &self.mean, self.order);
        self.debug.save("normalized_img", &tensor.to_rgb8(self.order));
        tensor
    }

    /// Frame to five model inputs, in [`RegionKind::ALL`] order.
    pub fn run(&self, frame: &RgbImage) -> Result<Vec<(RegionKind, Tensor)>> {
        let cropped = self.crop_image(frame)?;
        let regions = self.split_to_five(&cropped)?;
        Ok(regions
            .iter()
            .map(|region| (region.kind, self.normalize_img(&region.image)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    fn pipeline() -> Pipeline {
        Pipeline::new(
            Geometry::default(),
            MeanVector([0.0; 3]),
            ChannelOrder::Bgr,
            DebugSink::disabled(),
        )
    }

    #[test]
    fn default_geometry_fits_camera_resolution() -> Result<()> {
        Geometry::default().validate(3280, 2464)
    }

    #[test]
    fn crop_outside_frame_is_rejected() {
        let err = Geometry::default().validate(1920, 1080).unwrap_err();
        assert!(err.to_string().contains("does not fit"));
    }

    #[test]
    fn oversized_center_offset_is_rejected() {
        let geometry = Geometry {
            center_offset: 1000,
            ..Geometry::default()
        };
        assert!(geometry.validate(3280, 2464).is_err());
    }

    #[test]
    fn region_windows_follow_fixed_layout() -> Result<()> {
        let windows = Geometry::default().region_windows(2354, 1243)?;
        let kinds: Vec<_> = windows.iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, RegionKind::ALL);

        assert_eq!(windows[0].1, Window { x: 0, y: 0, width: 1177, height: 621 });
        assert_eq!(windows[1].1, Window { x: 1177, y: 0, width: 1177, height: 621 });
        assert_eq!(windows[2].1, Window { x: 0, y: 621, width: 1177, height: 621 });
        assert_eq!(windows[3].1, Window { x: 1177, y: 621, width: 1177, height: 621 });
        // cols 588-104 .. 1765-104, rows 310 .. 931
        assert_eq!(windows[4].1, Window { x: 484, y: 310, width: 1177, height: 621 });
        Ok(())
    }

    #[test]
    fn split_yields_five_square_regions_in_order() -> Result<()> {
        let regions = pipeline().split_to_five(&gradient(2354, 1243))?;
        let kinds: Vec<_> = regions.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, RegionKind::ALL);
        for region in &regions {
            assert_eq!(region.image.dimensions(), (227, 227));
        }
        Ok(())
    }

    #[test]
    fn transform_output_is_square_for_any_aspect() {
        for (w, h) in [(300, 40), (40, 300), (227, 227), (5, 3), (1000, 999)] {
            let out = transform_img(&gradient(w, h), 227);
            assert_eq!(out.dimensions(), (227, 227), "input {w}x{h}");
        }
    }

    #[test]
    fn transform_pads_symmetrically_with_black() {
        // 454x200 scales to 227x100, leaving 127 rows: 63 above, 64 below.
        let out = transform_img(&RgbImage::from_pixel(454, 200, image::Rgb([9, 9, 9])), 227);
        assert_eq!(out.get_pixel(100, 62).0, [0, 0, 0]);
        assert_eq!(out.get_pixel(100, 63 + 100).0, [0, 0, 0]);
        // a constant channel equalizes to its own value
        assert_eq!(out.get_pixel(100, 113).0, [9, 9, 9]);
    }

    #[test]
    fn lut_of_constant_channel_keeps_value() {
        let mut hist = [0u32; 256];
        hist[42] = 100;
        let lut = equalization_lut(&hist);
        assert_eq!(lut[42], 42);
    }

    #[test]
    fn lut_stretches_two_levels_to_full_range() {
        let mut hist = [0u32; 256];
        hist[10] = 50;
        hist[20] = 50;
        let lut = equalization_lut(&hist);
        assert_eq!(lut[10], 0);
        assert_eq!(lut[20], 255);
    }

    #[test]
    fn lut_rounds_halves_to_even() {
        // 255 / 102 = 2.5 per pixel above the first level
        let mut hist = [0u32; 256];
        hist[0] = 1;
        hist[1] = 1;
        hist[2] = 2;
        hist[3] = 99;
        let lut = equalization_lut(&hist);
        assert_eq!(lut[1], 2); // 2.5
        assert_eq!(lut[2], 8); // 7.5
        assert_eq!(lut[3], 255);
    }

    #[test]
    fn lut_spreads_uniform_histogram() {
        let hist = [4u32; 256];
        let lut = equalization_lut(&hist);
        assert_eq!(lut[0], 0);
        assert_eq!(lut[255], 255);
        assert!(lut.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn normalize_subtracts_mean_per_channel() {
        let region = gradient(227, 227);
        let mean = MeanVector([104.0, 117.0, 123.0]);
        let tensor = normalize_img(&region, 227, &mean, ChannelOrder::Bgr);

        let resized = imageops::resize(&region, 227, 227, FilterType::Triangle);
        assert_eq!(tensor.data.len(), 227 * 227 * 3);
        for (x, y) in [(0, 0), (13, 200), (226, 226)] {
            let [r, g, b] = resized.get_pixel(x, y).0;
            assert_eq!(tensor.at(x, y, 0), f32::from(b) - 104.0);
            assert_eq!(tensor.at(x, y, 1), f32::from(g) - 117.0);
            assert_eq!(tensor.at(x, y, 2), f32::from(r) - 123.0);
        }
    }

    #[test]
    fn normalize_rgb_order_keeps_channels() {
        let region = RgbImage::from_pixel(10, 10, image::Rgb([30, 60, 90]));
        let tensor = normalize_img(&region, 4, &MeanVector([1.0, 2.0, 3.0]), ChannelOrder::Rgb);
        assert_eq!(&tensor.data[..3], &[29.0, 58.0, 87.0]);
    }

    #[test]
    fn tensor_debug_view_saturates() {
        let tensor = Tensor {
            size: 1,
            data: vec![-20.0, 300.0, 7.4],
        };
        assert_eq!(tensor.to_rgb8(ChannelOrder::Bgr).get_pixel(0, 0).0, [7, 255, 0]);
    }

    #[test]
    fn crop_rejects_small_frames() {
        assert!(pipeline().crop_image(&gradient(640, 480)).is_err());
    }

    #[test]
    fn channel_order_parses() {
        assert_eq!("BGR".parse::<ChannelOrder>(), Ok(ChannelOrder::Bgr));
        assert_eq!("rgb".parse::<ChannelOrder>(), Ok(ChannelOrder::Rgb));
        assert!("yuv".parse::<ChannelOrder>().is_err());
    }
}
