use anyhow::{Context, Result};
use image::RgbImage;

/// Still-capture camera. Every capture yields one JPEG-encoded frame.
pub trait Camera {
    fn capture_jpeg(&mut self) -> Result<Vec<u8>>;

    /// Active resolution as negotiated with the driver.
    fn resolution(&self) -> (u32, u32);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraConfig {
    /// V4L2 device index (`/dev/videoN`)
    pub index: usize,
    pub width: u32,
    pub height: u32,
    /// frames dropped after stream start while exposure settles
    pub warmup_frames: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            width: 3280,
            height: 2464,
            warmup_frames: 3,
        }
    }
}

pub fn decode_jpeg(bytes: &[u8]) -> Result<RgbImage> {
    let img = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)
        .context("failed to decode JPEG frame")?;
    Ok(img.to_rgb8())
}

pub fn encode_jpeg(img: &RgbImage) -> Result<Vec<u8>> {
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Jpeg)
        .context("failed to encode JPEG frame")?;
    Ok(out.into_inner())
}

fn clamp_u8(x: i32) -> u8 {
    x.clamp(0, 255) as u8
}

/// Packed YUYV 4:2:2 (BT.601, studio swing) to RGB.
pub fn yuyv_to_rgb8(width: u32, height: u32, yuyv: &[u8]) -> Result<RgbImage> {
    let expected_len = width
        .checked_mul(height)
        .and_then(|px| px.checked_mul(2))
        .context("width*height overflow")? as usize;
    if yuyv.len() < expected_len {
        anyhow::bail!(
            "YUYV buffer too small: got {}, expected {}",
            yuyv.len(),
            expected_len
        );
    }

    let mut rgb = vec![0u8; (width as usize) * (height as usize) * 3];
    let mut di = 0usize;

    for si in (0..expected_len).step_by(4) {
        let y0 = yuyv[si] as i32;
        let u = yuyv[si + 1] as i32;
        let y1 = yuyv[si + 2] as i32;
        let v = yuyv[si + 3] as i32;

        for y in [y0, y1] {
            let c = y - 16;
            let d = u - 128;
            let e = v - 128;

            rgb[di] = clamp_u8((298 * c + 409 * e + 128) >> 8);
            rgb[di + 1] = clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8);
            rgb[di + 2] = clamp_u8((298 * c + 516 * d + 128) >> 8);
            di += 3;
        }
    }

    RgbImage::from_raw(width, height, rgb).context("failed to construct RgbImage")
}

#[cfg(not(target_os = "linux"))]
pub fn open(_config: &CameraConfig) -> Result<Box<dyn Camera>> {
    anyhow::bail!("camera capture currently supports only Linux (V4L2).")
}

#[cfg(target_os = "linux")]
pub fn open(config: &CameraConfig) -> Result<Box<dyn Camera>> {
    Ok(Box::new(v4l_camera::V4lCamera::open(config)?))
}

#[cfg(target_os = "linux")]
mod v4l_camera {
    use super::{Camera, CameraConfig, encode_jpeg, yuyv_to_rgb8};
    use anyhow::{Context, Result};
    use v4l::io::traits::CaptureStream;
    use v4l::video::Capture;
    use v4l::{Device, FourCC, Format, buffer::Type, prelude::*};

    /// A V4L2 device opened once; each capture runs a short-lived stream so
    /// the returned frame is fresh rather than one queued seconds ago.
    pub struct V4lCamera {
        device: Device,
        format: Format,
        warmup_frames: u32,
    }

    impl V4lCamera {
        pub fn open(config: &CameraConfig) -> Result<Self> {
            let device = Device::new(config.index)
                .with_context(|| format!("failed to open camera device /dev/video{}", config.index))?;
            let mut fmt = device.format().context("failed to read camera format")?;
            fmt.width = config.width;
            fmt.height = config.height;
            fmt.fourcc = FourCC::new(b"MJPG");
            let format = device
                .set_format(&fmt)
                .context("failed to set camera format")?;
            tracing::info!(
                "Camera format: {}x{} {:?}",
                format.width,
                format.height,
                format.fourcc
            );
            if (format.width, format.height) != (config.width, config.height) {
                tracing::warn!(
                    "Camera negotiated {}x{} instead of {}x{}",
                    format.width,
                    format.height,
                    config.width,
                    config.height
                );
            }

            Ok(Self {
                device,
                format,
                warmup_frames: config.warmup_frames,
            })
        }
    }

    impl Camera for V4lCamera {
        fn capture_jpeg(&mut self) -> Result<Vec<u8>> {
            let mut stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, 4)
                .context("failed to start stream")?;
            for _ in 0..self.warmup_frames {
                stream.next().context("failed to capture warm-up frame")?;
            }

            let (data, meta) = stream.next().context("failed to capture frame")?;
            let bytes = &data[..(meta.bytesused as usize).min(data.len())];

            if self.format.fourcc == FourCC::new(b"MJPG") || self.format.fourcc == FourCC::new(b"JPEG") {
                return Ok(bytes.to_vec());
            }
            if self.format.fourcc == FourCC::new(b"YUYV") {
                let rgb = yuyv_to_rgb8(self.format.width, self.format.height, bytes)?;
                return encode_jpeg(&rgb);
            }

            anyhow::bail!(
                "Unsupported camera pixel format: {:?} (expected MJPG or YUYV)",
                self.format.fourcc
            );
        }

        fn resolution(&self) -> (u32, u32) {
            (self.format.width, self.format.height)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_gray_maps_to_gray() -> Result<()> {
        // Y=126 with neutral chroma: (298 * 110 + 128) >> 8 = 128
        let yuyv = [126u8, 128, 126, 128].repeat(2);
        let rgb = yuyv_to_rgb8(2, 2, &yuyv)?;
        assert!(rgb.pixels().all(|p| p.0 == [128, 128, 128]));
        Ok(())
    }

    #[test]
    fn yuyv_short_buffer_is_rejected() {
        let err = yuyv_to_rgb8(4, 4, &[0u8; 8]).unwrap_err();
        assert!(err.to_string().contains("too small"));
    }

    #[test]
    fn jpeg_round_trip_keeps_dimensions() -> Result<()> {
        let frame = RgbImage::from_pixel(64, 48, image::Rgb([200, 40, 40]));
        let decoded = decode_jpeg(&encode_jpeg(&frame)?)?;
        assert_eq!(decoded.dimensions(), (64, 48));
        Ok(())
    }

    #[test]
    fn decode_rejects_non_jpeg() {
        assert!(decode_jpeg(b"\x89PNG\r\n\x1a\n").is_err());
    }
}
