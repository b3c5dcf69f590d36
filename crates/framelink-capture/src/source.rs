//! Capture side of the bridge: the native session and the sink it reports into.

use std::sync::Arc;

use framelink_core::{FrameLinkError, PixelFormat, Size, FRAME_POOL_DEPTH};
use tracing::{debug, info};

use crate::device::FrameSurface;
use crate::frame::CapturedFrame;
use crate::lifecycle::StateCell;
use crate::pump::{FramePump, Publish};

/// Where the native capture session reports frames and closure.
///
/// Cheap to clone; every clone feeds the same pump. Safe to call from any
/// thread, including the native delivery thread.
pub struct CaptureSink<S> {
    pump: Arc<FramePump<CapturedFrame<S>>>,
    state: StateCell,
}

impl<S> Clone for CaptureSink<S> {
    fn clone(&self) -> Self {
        Self { pump: Arc::clone(&self.pump), state: self.state.clone() }
    }
}

impl<S> CaptureSink<S> {
    pub(crate) fn new(pump: Arc<FramePump<CapturedFrame<S>>>, state: StateCell) -> Self {
        Self { pump, state }
    }

    /// The pool produced a frame. It replaces any frame not yet consumed.
    pub fn frame_arrived(&self, frame: CapturedFrame<S>) -> Publish {
        let timestamp = frame.timestamp;
        let outcome = self.pump.publish(frame);
        debug!("Frame t={:?} {:?}", timestamp, outcome);
        outcome
    }

    /// The capture target went away (window closed, user stopped sharing).
    pub fn target_closed(&self) {
        self.state.begin_stopping();
        if self.pump.signal_closed() {
            info!("Capture target closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.pump.is_closed()
    }
}

/// Frame pool parameters every session is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub format: PixelFormat,
    pub depth: u32,
    pub size: Size,
}

impl PoolConfig {
    pub fn for_target(size: Size) -> Self {
        Self { format: PixelFormat::Bgra8, depth: FRAME_POOL_DEPTH, size }
    }
}

/// Something that can be captured: a monitor, a window, a synthetic feed.
pub trait CaptureTarget: Send + Sync {
    type Surface: FrameSurface;

    /// Native size of the target when capture starts.
    fn size(&self) -> Size;

    fn describe(&self) -> String;

    /// Create the frame pool and session, wired to `sink`. Delivery begins
    /// only after `CaptureSession::start`.
    fn open(
        &self,
        pool: PoolConfig,
        sink: CaptureSink<Self::Surface>,
    ) -> Result<Box<dyn CaptureSession>, FrameLinkError>;
}

/// A live native capture session.
pub trait CaptureSession: Send {
    fn start(&mut self) -> Result<(), FrameLinkError>;

    /// Stop delivery, unregister handlers, dispose pool and session.
    /// Must tolerate repeated calls.
    fn close(&mut self);
}

/// Owns the native session for the lifetime of one capture.
pub struct CaptureSource {
    session: Box<dyn CaptureSession>,
    description: String,
    closed: bool,
}

impl CaptureSource {
    /// Open a depth-1 BGRA8 pool on `target` and begin delivery into `sink`.
    pub fn start<T: CaptureTarget>(
        target: &T,
        sink: CaptureSink<T::Surface>,
    ) -> Result<Self, FrameLinkError> {
        let description = target.describe();
        let pool = PoolConfig::for_target(target.size());
        let session = target.open(pool, sink)?;
        let mut source = Self { session, description, closed: false };
        source.session.start()?;
        info!("Capture started on {} ({} pool, depth {})", source.description, pool.size, pool.depth);
        Ok(source)
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.session.close();
        info!("Capture session on {} closed", self.description);
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.close();
    }
}
