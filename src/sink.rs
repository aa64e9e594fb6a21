//! Destinations for rebuilt hive images.

use crate::error::Result;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Receives the fully assembled hive image at commit time.
pub trait HiveSink {
    /// Persists the image. Called at most once per commit.
    fn write_hive(&mut self, image: &[u8]) -> Result<()>;
}

/// Writes the image to a file atomically: a sibling temp file is
/// written, synced, then renamed over the target.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    /// Creates a sink targeting `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileSink {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl HiveSink for FileSink {
    fn write_hive(&mut self, image: &[u8]) -> Result<()> {
        let mut tmp = self.path.clone();
        let file_name = tmp
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        tmp.set_file_name(format!("{}.tmp", file_name));

        let mut file = File::create(&tmp)?;
        file.write_all(image)?;
        file.sync_all()?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

/// Keeps the image in memory, for tests and in-process pipelines.
#[derive(Default)]
pub struct MemorySink {
    image: Vec<u8>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the last committed image.
    pub fn bytes(&self) -> &[u8] {
        &self.image
    }

    /// Consumes the sink, yielding the image.
    pub fn into_bytes(self) -> Vec<u8> {
        self.image
    }
}

impl HiveSink for MemorySink {
    fn write_hive(&mut self, image: &[u8]) -> Result<()> {
        self.image = image.to_vec();
        Ok(())
    }
}
