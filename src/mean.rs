//! Per-channel mean loaded from a NumPy reference array.

use anyhow::{Context, Result};
use std::path::Path;

/// Per-channel mean in the model's channel order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeanVector(pub [f32; 3]);

impl MeanVector {
    /// Reads a `.npy` file and reduces it to one mean per channel.
    ///
    /// Accepted shapes are `(3,)` and `(3, H, W)`; the channel axis is the
    /// first one, as in Caffe mean images.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read mean file: {}", path.display()))?;
        Self::from_npy_bytes(&bytes)
            .with_context(|| format!("failed to parse mean file: {}", path.display()))
    }

    pub fn from_npy_bytes(bytes: &[u8]) -> Result<Self> {
        let npy = npyz::NpyFile::new(bytes).context("not a .npy array")?;
        let shape = npy.shape().to_vec();
        let fortran = npy.order() == npyz::Order::Fortran;
        let values: Vec<f64> = match npy.into_vec::<f64>() {
            Ok(values) => values,
            Err(_) => npyz::NpyFile::new(bytes)?
                .into_vec::<f32>()
                .context("mean array must hold float64 or float32 values")?
                .into_iter()
                .map(f64::from)
                .collect(),
        };
        Self::reduce(&shape, &values, fortran)
    }

    /// In C order each channel is one contiguous block; in Fortran order the
    /// channel axis varies fastest.
    fn reduce(shape: &[u64], values: &[f64], fortran: bool) -> Result<Self> {
        match shape {
            [3] | [3, _, _] => {}
            _ => anyhow::bail!("unsupported mean array shape {shape:?} (expected (3,) or (3, H, W))"),
        }
        let per_channel = values.len() / 3;
        if per_channel == 0 || values.len() % 3 != 0 {
            anyhow::bail!("mean array has {} values for shape {shape:?}", values.len());
        }

        let mut sums = [0f64; 3];
        for (k, value) in values.iter().enumerate() {
            let c = if fortran { k % 3 } else { k / per_channel };
            sums[c] += value;
        }
        Ok(Self(sums.map(|sum| (sum / per_channel as f64) as f32)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn npy_bytes(descr: &str, shape: &str, payload: &[u8]) -> Vec<u8> {
        npy_bytes_ordered(descr, false, shape, payload)
    }

    fn npy_bytes_ordered(descr: &str, fortran: bool, shape: &str, payload: &[u8]) -> Vec<u8> {
        let order = if fortran { "True" } else { "False" };
        let mut header = format!("{{'descr': '{descr}', 'fortran_order': {order}, 'shape': {shape}, }}");
        let unpadded = 10 + header.len() + 1;
        header.push_str(&" ".repeat((64 - unpadded % 64) % 64));
        header.push('\n');

        let mut out = b"\x93NUMPY\x01\x00".to_vec();
        out.extend_from_slice(&(header.len() as u16).to_le_bytes());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn f64_payload(values: &[f64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn reduces_channel_images_to_means() -> Result<()> {
        // 3 x 2 x 2: channel k holds k*10 + {0, 1, 2, 3}
        let values: Vec<f64> = (0..3)
            .flat_map(|k| (0..4).map(move |i| (k * 10 + i) as f64))
            .collect();
        let bytes = npy_bytes("<f8", "(3, 2, 2)", &f64_payload(&values));

        let mean = MeanVector::from_npy_bytes(&bytes)?;
        assert_eq!(mean, MeanVector([1.5, 11.5, 21.5]));
        Ok(())
    }

    #[test]
    fn fortran_ordered_channel_images_reduce_per_channel() -> Result<()> {
        // a[c, i, j] = 10c + 2i + j, laid out with c varying fastest
        let mut values = Vec::new();
        for j in 0..2 {
            for i in 0..2 {
                for c in 0..3 {
                    values.push((10 * c + 2 * i + j) as f64);
                }
            }
        }
        let bytes = npy_bytes_ordered("<f8", true, "(3, 2, 2)", &f64_payload(&values));

        let mean = MeanVector::from_npy_bytes(&bytes)?;
        assert_eq!(mean, MeanVector([1.5, 11.5, 21.5]));
        Ok(())
    }

    #[test]
    fn accepts_flat_float32_vector() -> Result<()> {
        let payload: Vec<u8> = [104.0f32, 117.0, 123.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let bytes = npy_bytes("<f4", "(3,)", &payload);

        let mean = MeanVector::from_npy_bytes(&bytes)?;
        assert_eq!(mean, MeanVector([104.0, 117.0, 123.0]));
        Ok(())
    }

    #[test]
    fn rejects_wrong_channel_count() {
        let bytes = npy_bytes("<f8", "(4,)", &f64_payload(&[1.0, 2.0, 3.0, 4.0]));
        assert!(MeanVector::from_npy_bytes(&bytes).is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = MeanVector::load(Path::new("/nonexistent/image_mean.npy")).unwrap_err();
        assert!(err.to_string().contains("image_mean.npy"));
    }
}
