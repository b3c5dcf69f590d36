//! `RawVideoWriter` — appends tightly packed BGRA8 frames to a file and
//! describes them in a JSON sidecar.
//!
//! The sidecar carries the `EncodingProfile` a transcoder needs to turn the
//! raw stream into H.264/MP4, e.g.
//! `ffmpeg -f rawvideo -pix_fmt bgra -s 1920x1080 -r 30 -i capture.bgra out.mp4`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use framelink_core::EncodingProfile;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Contents of the `.json` file written next to the raw frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sidecar {
    pub profile: EncodingProfile,
    pub frame_count: u64,
    /// Presentation time of the last frame, relative to the stream start.
    pub duration_ms: u64,
    /// Capture sessions that contributed frames (more than one after a device loss).
    pub sessions: u32,
}

pub struct RawVideoWriter {
    path: PathBuf,
    sidecar_path: PathBuf,
    out: BufWriter<File>,
    profile: EncodingProfile,
    frame_bytes: usize,
    frame_count: u64,
    last_timestamp: Duration,
    sessions: u32,
}

impl RawVideoWriter {
    pub fn create(path: &Path, sidecar_path: &Path, profile: EncodingProfile) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        let frame_bytes = profile.size().pixel_count() as usize * profile.input_format.bytes_per_pixel();
        info!("Writing {} frames to {}", profile.size(), path.display());

        Ok(Self {
            path: path.to_owned(),
            sidecar_path: sidecar_path.to_owned(),
            out: BufWriter::new(file),
            profile,
            frame_bytes,
            frame_count: 0,
            last_timestamp: Duration::ZERO,
            sessions: 1,
        })
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// A fresh capture session will append to this file.
    pub fn begin_session(&mut self, profile: &EncodingProfile) -> Result<()> {
        if profile.size() != self.profile.size() {
            bail!(
                "capture size changed from {} to {}; cannot append to {}",
                self.profile.size(),
                profile.size(),
                self.path.display()
            );
        }
        self.sessions += 1;
        Ok(())
    }

    pub fn write_frame(&mut self, pixels: &[u8], timestamp: Duration) -> Result<()> {
        if pixels.len() != self.frame_bytes {
            bail!("frame is {} bytes, expected {}", pixels.len(), self.frame_bytes);
        }
        self.out.write_all(pixels).with_context(|| format!("write {}", self.path.display()))?;
        self.frame_count += 1;
        self.last_timestamp = self.last_timestamp.max(timestamp);
        Ok(())
    }

    /// Flush the raw stream and write the sidecar.
    pub fn finish(mut self) -> Result<Sidecar> {
        self.out.flush().with_context(|| format!("flush {}", self.path.display()))?;
        let sidecar = Sidecar {
            profile: self.profile,
            frame_count: self.frame_count,
            duration_ms: self.last_timestamp.as_millis() as u64,
            sessions: self.sessions,
        };
        let json = serde_json::to_string_pretty(&sidecar)?;
        std::fs::write(&self.sidecar_path, json)
            .with_context(|| format!("write {}", self.sidecar_path.display()))?;
        info!("{} frames written, sidecar {}", sidecar.frame_count, self.sidecar_path.display());
        Ok(sidecar)
    }
}
