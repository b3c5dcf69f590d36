use serde::{Deserialize, Serialize};

/// Frames the native pool buffers at once. The pump relies on latest-frame-wins.
pub const FRAME_POOL_DEPTH: u32 = 1;

// MARK: - Size

/// Width/height of a surface, texture, or valid content region, in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const FHD: Self = Self { width: 1920, height: 1080 };

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Rounds both axes up to the next even number. Encoders reject odd dimensions.
    pub fn even_rounded(self) -> Self {
        Self {
            width: self.width + (self.width & 1),
            height: self.height + (self.height & 1),
        }
    }

    /// Per-axis minimum of `self` and `bounds`.
    pub fn clamp_to(self, bounds: Size) -> Self {
        Self {
            width: self.width.min(bounds.width),
            height: self.height.min(bounds.height),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}×{}", self.width, self.height)
    }
}

// MARK: - PixelFormat

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 32-bit B8G8R8A8 unorm, the only format the capture pool produces.
    #[default]
    Bgra8,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Bgra8 => 4,
        }
    }
}

// MARK: - Color

/// Linear RGBA clear colour, components in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const BLACK: Self = Self { r: 0.0, g: 0.0, b: 0.0, a: 1.0 };

    pub fn to_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// Packs the colour as one BGRA8 pixel.
    pub fn to_bgra8(self) -> [u8; 4] {
        let q = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        [q(self.b), q(self.g), q(self.r), q(self.a)]
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::BLACK
    }
}

// MARK: - PumpState

/// Lifecycle of one capture session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Idle,
    Capturing,
    Stopping,
    Closed,
}

impl PumpState {
    pub fn is_capturing(&self) -> bool {
        matches!(self, Self::Capturing)
    }
}

impl std::fmt::Display for PumpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Capturing => write!(f, "capturing"),
            Self::Stopping => write!(f, "stopping"),
            Self::Closed => write!(f, "closed"),
        }
    }
}
