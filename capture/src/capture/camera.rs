use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage};
use tracing::{debug, warn};

use crate::error::{RigError, RigResult};

/// A frame source. Physical cameras plug in here.
#[async_trait]
pub trait Camera: Send {
    /// `None` when the device did not deliver a frame.
    async fn read_frame(&mut self) -> Option<DynamicImage>;
    fn release(&mut self);
    fn describe(&self) -> String;
}

/// Replays the still images of a folder in name order, wrapping around at the end.
pub struct DirectoryCamera {
    directory: PathBuf,
    frames: Vec<PathBuf>,
    next: usize,
    released: bool,
}

fn is_image(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref(),
        Some("jpg" | "jpeg" | "png")
    )
}

impl DirectoryCamera {
    pub fn open(directory: impl Into<PathBuf>) -> RigResult<Self> {
        let directory = directory.into();
        let device = directory.display().to_string();
        let mut frames: Vec<PathBuf> = std::fs::read_dir(&directory)
            .map_err(|e| RigError::connection(&device, e))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file() && is_image(path))
            .collect();
        if frames.is_empty() {
            return Err(RigError::connection(device, "no images in directory"));
        }
        frames.sort();
        debug!("directory camera with {} frames", frames.len());
        Ok(DirectoryCamera { directory, frames, next: 0, released: false })
    }
}

#[async_trait]
impl Camera for DirectoryCamera {
    async fn read_frame(&mut self) -> Option<DynamicImage> {
        if self.released {
            return None;
        }
        let path = self.frames[self.next % self.frames.len()].clone();
        self.next += 1;
        let loaded = tokio::task::spawn_blocking({
            let path = path.clone();
            move || image::open(path)
        })
        .await;
        match loaded {
            Ok(Ok(frame)) => Some(frame),
            Ok(Err(e)) => {
                warn!("could not decode {}: {}", path.display(), e);
                None
            }
            Err(e) => {
                warn!("frame loader panicked: {}", e);
                None
            }
        }
    }
    fn release(&mut self) {
        self.released = true;
    }
    fn describe(&self) -> String {
        format!("directory camera ({})", self.directory.display())
    }
}

/// Generates a moving gradient; each frame differs from the previous one.
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    frame: u32,
    released: bool,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32) -> Self {
        SyntheticCamera { width: width.max(1), height: height.max(1), frame: 0, released: false }
    }
}

#[async_trait]
impl Camera for SyntheticCamera {
    async fn read_frame(&mut self) -> Option<DynamicImage> {
        if self.released {
            return None;
        }
        let shift = self.frame;
        self.frame = self.frame.wrapping_add(1);
        let (width, height) = (self.width, self.height);
        let image = RgbImage::from_fn(width, height, |x, y| {
            Rgb([
                ((x.wrapping_add(shift.wrapping_mul(8)) % width) * 255 / width) as u8,
                (y * 255 / height) as u8,
                (shift.wrapping_mul(37) & 0xFF) as u8,
            ])
        });
        Some(DynamicImage::ImageRgb8(image))
    }
    fn release(&mut self) {
        self.released = true;
    }
    fn describe(&self) -> String {
        format!("synthetic camera ({}x{})", self.width, self.height)
    }
}
