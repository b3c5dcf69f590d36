use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::FrameLinkError;
use crate::types::{Color, PixelFormat, Size};

/// Bitrate of the stock 1080p MP4 profile.
pub const DEFAULT_BITRATE_BPS: u32 = 15_000_000;

// MARK: - SourceConfig

/// Which capture target the recorder opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SourceConfig {
    /// Generated frames; runs on every platform.
    TestPattern {
        size: Size,
        fps: u32,
        /// Shrink the reported content size on every other frame, as a window
        /// being resized does.
        #[serde(default, alias = "jitterContent")]
        jitter_content: bool,
    },
    /// A physical monitor through Windows.Graphics.Capture. `None` when the
    /// picker closed without a selection.
    Display {
        #[serde(default, alias = "displayIndex")]
        index: Option<u8>,
    },
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::TestPattern { size: Size::new(1280, 720), fps: 30, jitter_content: false }
    }
}

// MARK: - RecorderConfig

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub source: SourceConfig,
    #[serde(alias = "frameRate")]
    pub frame_rate: u32,
    #[serde(alias = "bitrateBps")]
    pub bitrate_bps: u32,
    pub background: Color,
    #[serde(alias = "outputPath")]
    pub output_path: PathBuf,
    /// Stop after this many encoded samples.
    #[serde(alias = "maxFrames")]
    pub max_frames: Option<u64>,
    /// Fresh sessions to build after a device loss before giving up.
    #[serde(alias = "deviceLostRetries")]
    pub device_lost_retries: u32,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            frame_rate: 30,
            bitrate_bps: DEFAULT_BITRATE_BPS,
            background: Color::BLACK,
            output_path: PathBuf::from("capture.bgra"),
            max_frames: None,
            device_lost_retries: 1,
        }
    }
}

impl RecorderConfig {
    /// Reads a JSON config file. Missing fields fall back to defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FrameLinkError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), FrameLinkError> {
        let invalid = |reason: &str| {
            Err(FrameLinkError::ConfigurationInvalid { reason: reason.to_owned() })
        };
        if self.frame_rate == 0 {
            return invalid("frame_rate must be > 0");
        }
        if self.bitrate_bps == 0 {
            return invalid("bitrate_bps must be > 0");
        }
        if let SourceConfig::TestPattern { size, fps, .. } = &self.source {
            if size.is_empty() {
                return invalid("test pattern size must be non-zero");
            }
            if *fps == 0 {
                return invalid("test pattern fps must be > 0");
            }
        }
        Ok(())
    }

    /// Path of the JSON sidecar written next to the raw output.
    pub fn sidecar_path(&self) -> PathBuf {
        self.output_path.with_extension("json")
    }
}

// MARK: - EncodingProfile

/// Parameters handed to the transcoder that consumes the bridged samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodingProfile {
    pub container: String,
    pub video_subtype: String,
    pub input_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub bitrate_bps: u32,
    pub frame_rate: (u32, u32),
    pub pixel_aspect_ratio: (u32, u32),
}

impl EncodingProfile {
    /// H.264 in MPEG-4 at the target's size, rounded to even dimensions.
    pub fn for_target(target: Size, cfg: &RecorderConfig) -> Self {
        let size = target.even_rounded();
        Self {
            container: "MPEG4".to_owned(),
            video_subtype: "H264".to_owned(),
            input_format: PixelFormat::Bgra8,
            width: size.width,
            height: size.height,
            bitrate_bps: cfg.bitrate_bps,
            frame_rate: (cfg.frame_rate, 1),
            pixel_aspect_ratio: (1, 1),
        }
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_camel_case_fields() {
        let json = r#"{
            "source": {"kind": "display", "displayIndex": 1},
            "frameRate": 60,
            "bitrateBps": 8000000,
            "outputPath": "out/session.bgra",
            "maxFrames": 120,
            "deviceLostRetries": 3
        }"#;

        let cfg: RecorderConfig = serde_json::from_str(json).expect("valid camelCase config");
        assert_eq!(cfg.source, SourceConfig::Display { index: Some(1) });
        assert_eq!(cfg.frame_rate, 60);
        assert_eq!(cfg.bitrate_bps, 8_000_000);
        assert_eq!(cfg.max_frames, Some(120));
        assert_eq!(cfg.device_lost_retries, 3);
        assert_eq!(cfg.sidecar_path(), PathBuf::from("out/session.json"));
    }

    #[test]
    fn deserializes_snake_case_fields_with_defaults() {
        let json = r#"{
            "source": {"kind": "testPattern", "size": {"width": 641, "height": 479}, "fps": 24},
            "frame_rate": 24
        }"#;

        let cfg: RecorderConfig = serde_json::from_str(json).expect("valid snake_case config");
        assert_eq!(
            cfg.source,
            SourceConfig::TestPattern { size: Size::new(641, 479), fps: 24, jitter_content: false }
        );
        assert_eq!(cfg.frame_rate, 24);
        assert_eq!(cfg.bitrate_bps, DEFAULT_BITRATE_BPS);
        assert_eq!(cfg.background, Color::BLACK);
        assert!(cfg.max_frames.is_none());
    }

    #[test]
    fn display_without_index_means_nothing_selected() {
        let cfg: RecorderConfig = serde_json::from_str(r#"{"source": {"kind": "display"}}"#).unwrap();
        assert_eq!(cfg.source, SourceConfig::Display { index: None });
    }

    #[test]
    fn rejects_zero_frame_rate() {
        let cfg = RecorderConfig { frame_rate: 0, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(FrameLinkError::ConfigurationInvalid { .. })));
    }

    #[test]
    fn profile_uses_even_target_size() {
        let cfg = RecorderConfig::default();
        let profile = EncodingProfile::for_target(Size::new(1919, 1079), &cfg);
        assert_eq!(profile.size(), Size::FHD);
        assert_eq!(profile.container, "MPEG4");
        assert_eq!(profile.video_subtype, "H264");
        assert_eq!(profile.frame_rate, (30, 1));
        assert_eq!(profile.pixel_aspect_ratio, (1, 1));
    }
}
