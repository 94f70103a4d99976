use anyhow::{Context, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};

/// Writes intermediate images as PNG files, overwriting them every capture.
#[derive(Clone, Debug, Default)]
pub struct DebugSink {
    dir: Option<PathBuf>,
}

impl DebugSink {
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create debug directory: {}", dir.display()))?;
        }
        Ok(Self { dir: Some(dir) })
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Saves `img` as `<stem>.png`. A failed write is logged, never fatal.
    pub fn save(&self, stem: &str, img: &RgbImage) {
        let Some(dir) = &self.dir else {
            return;
        };
        let path = dir.join(format!("{stem}.png"));
        match img.save(&path) {
            Ok(()) => tracing::trace!("Saved: {}", path.display()),
            Err(e) => tracing::warn!("Failed to write debug image {}: {e}", path.display()),
        }
    }
}
