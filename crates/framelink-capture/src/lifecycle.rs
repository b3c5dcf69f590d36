//! `LifecycleController` — start / stop / cleanup for one capture session.
//!
//! ```text
//! Idle ──start──▶ Capturing ──stop / target closed / end of stream──▶ Stopping
//!   │                                                                    │
//!   └────────────────stop / cleanup──────────────▶ Closed ◀──cleanup─────┘
//! ```
//!
//! `Closed` is terminal; a new capture needs a new controller.

use std::sync::Arc;
use std::time::Duration;

use framelink_core::{Color, ComposeError, FrameLinkError, PumpState};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::bridge::EncoderBridge;
use crate::compose::ComposeStage;
use crate::device::GpuDevice;
use crate::frame::CapturedFrame;
use crate::pump::{FramePump, PumpStats};
use crate::source::{CaptureSink, CaptureSource, CaptureTarget};

// ── StateCell ─────────────────────────────────────────────────────────────────

/// Shared `PumpState`, readable from every thread in the session.
#[derive(Clone)]
pub(crate) struct StateCell(Arc<Mutex<PumpState>>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(PumpState::Idle)))
    }

    pub(crate) fn get(&self) -> PumpState {
        *self.0.lock()
    }

    /// `Capturing → Stopping`; any other state is left alone.
    pub(crate) fn begin_stopping(&self) -> bool {
        let mut state = self.0.lock();
        if *state == PumpState::Capturing {
            *state = PumpState::Stopping;
            info!("Session {} → {}", PumpState::Capturing, PumpState::Stopping);
            true
        } else {
            false
        }
    }

    /// `Idle → Capturing`, or the state that prevented it.
    fn begin_capturing(&self) -> Result<(), PumpState> {
        let mut state = self.0.lock();
        if *state != PumpState::Idle {
            return Err(*state);
        }
        *state = PumpState::Capturing;
        Ok(())
    }

    /// Move to `Closed`; returns the previous state.
    fn close(&self) -> PumpState {
        std::mem::replace(&mut *self.0.lock(), PumpState::Closed)
    }
}

// ── Session internals ─────────────────────────────────────────────────────────

/// Native resources created by `start`, dropped together by `cleanup`.
struct SessionResources {
    source: CaptureSource,
}

pub(crate) struct Shared<D: GpuDevice> {
    pub(crate) state: StateCell,
    pub(crate) pump: Arc<FramePump<CapturedFrame<D::Surface>>>,
    pub(crate) stage: ComposeStage<D>,
    resources: Mutex<Option<SessionResources>>,
    pub(crate) start_position: Mutex<Option<Duration>>,
}

impl<D: GpuDevice> Shared<D> {
    pub(crate) fn stop(&self) -> PumpState {
        let mut state = self.state.0.lock();
        match *state {
            PumpState::Capturing => {
                *state = PumpState::Stopping;
                drop(state);
                self.pump.signal_closed();
                info!("Session {} → {}", PumpState::Capturing, PumpState::Stopping);
                PumpState::Stopping
            }
            PumpState::Idle => {
                *state = PumpState::Closed;
                drop(state);
                self.pump.signal_closed();
                PumpState::Closed
            }
            other => other,
        }
    }

    pub(crate) fn cleanup(&self) {
        let previous = self.state.close();
        // Wakes an encoder thread still parked in wait_for_next.
        self.pump.signal_closed();

        let resources = self.resources.lock().take();
        if let Some(mut resources) = resources {
            resources.source.close();
        }
        let released_buffer = self.stage.release();
        let held_frame = self.pump.take_pending();
        drop(held_frame);

        if previous != PumpState::Closed {
            let PumpStats { published, replaced, delivered, rejected } = self.pump.stats();
            info!(
                "Session {} → {} (buffer released: {}, frames published={} replaced={} delivered={} rejected={})",
                previous, PumpState::Closed, released_buffer, published, replaced, delivered, rejected
            );
        }
    }

    /// Stop then clean up. Used when the encoder side ends the stream.
    pub(crate) fn finish(&self) {
        self.stop();
        self.cleanup();
    }
}

// ── LifecycleController ───────────────────────────────────────────────────────

/// Owns one capture session: the pump, the compose stage, and the native
/// capture source, plus the order they are torn down in.
pub struct LifecycleController<D, T>
where
    D: GpuDevice,
    T: CaptureTarget<Surface = D::Surface>,
{
    shared: Arc<Shared<D>>,
    target: T,
}

impl<D, T> LifecycleController<D, T>
where
    D: GpuDevice,
    T: CaptureTarget<Surface = D::Surface>,
{
    pub fn new(device: Arc<D>, target: T, background: Color) -> Self {
        let shared = Arc::new(Shared {
            state: StateCell::new(),
            pump: Arc::new(FramePump::new()),
            stage: ComposeStage::new(device, background),
            resources: Mutex::new(None),
            start_position: Mutex::new(None),
        });
        Self { shared, target }
    }

    pub fn state(&self) -> PumpState {
        self.shared.state.get()
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    /// Pull-side handle for the encoder. May be taken before `start`.
    pub fn encoder_bridge(&self) -> EncoderBridge<D> {
        EncoderBridge::new(Arc::clone(&self.shared))
    }

    /// Sink that feeds this session's pump, for native code wired up elsewhere.
    pub fn capture_sink(&self) -> CaptureSink<D::Surface> {
        CaptureSink::new(Arc::clone(&self.shared.pump), self.shared.state.clone())
    }

    pub fn pump_stats(&self) -> PumpStats {
        self.shared.pump.stats()
    }

    /// `Idle → Capturing`: allocate the compose buffer, open the frame pool and
    /// session on the target, begin delivery.
    ///
    /// Fails with `InvalidTransition` outside `Idle`. Any other failure tears
    /// the session down and leaves the controller `Closed`.
    pub fn start(&self) -> Result<(), FrameLinkError> {
        self.shared
            .state
            .begin_capturing()
            .map_err(|from| FrameLinkError::InvalidTransition { from, op: "start" })?;

        match self.open_session() {
            Ok(()) => {
                info!("Session {} → {} on {}", PumpState::Idle, PumpState::Capturing, self.target.describe());
                Ok(())
            }
            Err(e) => {
                warn!("Session start failed: {e}");
                self.shared.cleanup();
                Err(e)
            }
        }
    }

    fn open_session(&self) -> Result<(), FrameLinkError> {
        self.shared.stage.allocate(self.target.size()).map_err(ComposeError::from)?;
        let source = CaptureSource::start(&self.target, self.capture_sink())?;

        let mut resources = self.shared.resources.lock();
        if self.shared.state.get() == PumpState::Closed {
            // Cleaned up while we were opening; don't resurrect the session.
            drop(resources);
            drop(source);
            return Err(FrameLinkError::InvalidTransition { from: PumpState::Closed, op: "start" });
        }
        *resources = Some(SessionResources { source });
        Ok(())
    }

    /// Request the end of capture. Latches the pump's closed signal; the
    /// encoder sees end-of-stream on its next pull.
    pub fn stop(&self) -> PumpState {
        self.shared.stop()
    }

    /// Release the session, frame pool, compose buffer, and any held frame.
    /// Safe to call any number of times.
    pub fn cleanup(&self) {
        self.shared.cleanup();
    }

    /// Timestamp fixed by `EncoderBridge::on_stream_starting`.
    pub fn start_position(&self) -> Option<Duration> {
        *self.shared.start_position.lock()
    }
}

impl<D, T> Drop for LifecycleController<D, T>
where
    D: GpuDevice,
    T: CaptureTarget<Surface = D::Surface>,
{
    fn drop(&mut self) {
        self.shared.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use framelink_core::Size;

    use super::*;
    use crate::software::{ManualTarget, SoftwareDevice, TestPatternTarget};

    fn controller(size: Size) -> LifecycleController<SoftwareDevice, ManualTarget> {
        LifecycleController::new(Arc::new(SoftwareDevice::new()), ManualTarget::new(size), Color::BLACK)
    }

    #[test]
    fn start_moves_idle_to_capturing() {
        let ctl = controller(Size::new(99, 51));
        assert_eq!(ctl.state(), PumpState::Idle);
        ctl.start().unwrap();
        assert_eq!(ctl.state(), PumpState::Capturing);
        assert!(ctl.target().is_delivering());
        assert_eq!(ctl.shared.stage.buffer_size(), Some(Size::new(100, 52)));
    }

    #[test]
    fn second_start_is_rejected() {
        let ctl = controller(Size::new(8, 8));
        ctl.start().unwrap();
        let err = ctl.start().unwrap_err();
        assert!(matches!(
            err,
            FrameLinkError::InvalidTransition { from: PumpState::Capturing, op: "start" }
        ));
        assert_eq!(ctl.state(), PumpState::Capturing);
    }

    #[test]
    fn stop_then_cleanup_reaches_closed() {
        let ctl = controller(Size::new(8, 8));
        ctl.start().unwrap();
        assert_eq!(ctl.stop(), PumpState::Stopping);
        assert_eq!(ctl.stop(), PumpState::Stopping);
        ctl.cleanup();
        assert_eq!(ctl.state(), PumpState::Closed);
        assert_eq!(ctl.target().session_closes(), 1);
        assert!(ctl.shared.stage.buffer_size().is_none());

        ctl.cleanup();
        assert_eq!(ctl.target().session_closes(), 1);
        assert!(ctl.start().is_err(), "no transition out of Closed");
    }

    #[test]
    fn stop_before_start_closes() {
        let ctl = controller(Size::new(8, 8));
        assert_eq!(ctl.stop(), PumpState::Closed);
        assert!(ctl.start().is_err());
    }

    #[test]
    fn target_closed_moves_to_stopping() {
        let ctl = controller(Size::new(8, 8));
        ctl.start().unwrap();
        ctl.target().close_target();
        assert_eq!(ctl.state(), PumpState::Stopping);
        assert!(ctl.shared.pump.is_closed());
    }

    #[test]
    fn cleanup_releases_held_frame_and_unregisters() {
        let ctl = controller(Size::new(8, 8));
        ctl.start().unwrap();
        ctl.target().emit_solid(Size::new(8, 8), [1, 1, 1, 1], Duration::ZERO);
        ctl.cleanup();
        assert!(ctl.shared.pump.take_pending().is_none());
        assert!(!ctl.target().is_delivering());
        assert_eq!(ctl.target().emit_solid(Size::new(8, 8), [1, 1, 1, 1], Duration::ZERO), None);
    }

    #[test]
    fn failed_start_leaves_controller_closed() {
        let ctl = controller(Size::new(0, 0));
        assert!(ctl.start().is_err());
        assert_eq!(ctl.state(), PumpState::Closed);
    }

    #[test]
    fn drop_joins_test_pattern_worker() {
        let ctl = LifecycleController::new(
            Arc::new(SoftwareDevice::new()),
            TestPatternTarget::new(Size::new(32, 16), 240),
            Color::BLACK,
        );
        ctl.start().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        drop(ctl);
    }
}
