use std::time::Duration;

use framelink_core::Size;

/// One frame from the capture pool.
///
/// Exactly one owner at a time: the delivery callback, then the pump slot,
/// then the compose stage, which drops it once copied. Dropping the surface
/// returns it to the native pool.
#[derive(Debug)]
pub struct CapturedFrame<S> {
    pub surface: S,
    /// Valid pixel region, anchored at the origin. May exceed `surface` during
    /// a resize.
    pub content_size: Size,
    /// System-relative capture time.
    pub timestamp: Duration,
}

impl<S> CapturedFrame<S> {
    pub fn new(surface: S, content_size: Size, timestamp: Duration) -> Self {
        Self { surface, content_size, timestamp }
    }
}

/// A normalized frame ready for the encoder.
#[derive(Debug)]
pub struct ComposedSurface<S> {
    pub surface: S,
    pub timestamp: Duration,
    /// Region actually copied from the source frame.
    pub region: Size,
}
