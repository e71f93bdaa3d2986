//! Frame sources.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("unsupported device: {0}")]
    Unsupported(String),
    #[error("failed to spawn capture thread: {0}")]
    Spawn(std::io::Error),
}

/// Anything that yields encoded frames.
pub trait FrameSource: Send {
    fn name(&self) -> &str;

    /// Next frame, or `Ok(None)` when the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError>;
}

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

/// Replays image files from a directory in file-name order.
pub struct DirectorySource {
    name: String,
    files: Vec<PathBuf>,
    position: usize,
    looping: bool,
}

impl DirectorySource {
    /// Open a directory of frames. Fails if it is missing or holds no images.
    pub fn open(dir: &Path, looping: bool) -> Result<Self, CaptureError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| CaptureError::DeviceNotFound(format!("{}: {e}", dir.display())))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(CaptureError::DeviceNotFound(format!(
                "{}: no image files",
                dir.display()
            )));
        }

        tracing::info!(dir = %dir.display(), frames = files.len(), looping, "opened frame directory");

        Ok(Self {
            name: dir.display().to_string(),
            files,
            position: 0,
            looping,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl FrameSource for DirectorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError> {
        if self.position >= self.files.len() {
            if !self.looping {
                return Ok(None);
            }
            self.position = 0;
        }
        let path = &self.files[self.position];
        self.position += 1;
        std::fs::read(path)
            .map(Some)
            .map_err(|e| CaptureError::CaptureFailed(format!("{}: {e}", path.display())))
    }
}
