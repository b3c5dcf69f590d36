//! `EncoderBridge` — the encoder's pull callbacks, answered from the pump.
//!
//! The encoder calls `on_stream_starting` once, then `on_sample_requested`
//! from its own thread whenever it wants another sample. Both block until the
//! capture side produces a frame or closes. Nothing below this boundary
//! escapes as a panic or an `Err` from `on_sample_requested`: every failure
//! becomes a `SampleReply` and the session is torn down.

use std::sync::Arc;
use std::time::Duration;

use framelink_core::{FrameLinkError, PumpState};
use tracing::{debug, info, warn};

use crate::device::GpuDevice;
use crate::frame::ComposedSurface;
use crate::lifecycle::Shared;
use crate::pump::Next;

/// Answer to one sample request.
#[derive(Debug)]
pub enum SampleReply<S> {
    Sample(ComposedSurface<S>),
    /// Capture ended normally (stop, target closed, or already torn down).
    EndOfStream,
    /// Producing the sample failed; the stream is over.
    Error(FrameLinkError),
}

impl<S> SampleReply<S> {
    /// What the encoder protocol sees: a sample, or `None` for end-of-stream.
    pub fn into_sample(self) -> Option<ComposedSurface<S>> {
        match self {
            Self::Sample(sample) => Some(sample),
            Self::EndOfStream | Self::Error(_) => None,
        }
    }

    pub fn is_end(&self) -> bool {
        !matches!(self, Self::Sample(_))
    }

    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::Error(e) if e.is_device_lost())
    }
}

pub struct EncoderBridge<D: GpuDevice> {
    shared: Arc<Shared<D>>,
}

impl<D: GpuDevice> Clone for EncoderBridge<D> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<D: GpuDevice> EncoderBridge<D> {
    pub(crate) fn new(shared: Arc<Shared<D>>) -> Self {
        Self { shared }
    }

    /// Block for one frame and use its timestamp as the stream start.
    ///
    /// The frame itself is dropped, never encoded. If capture closed before or
    /// during the wait the session is torn down and `ClosedBeforeStart` is
    /// returned. Calling it before `start` is an `InvalidTransition`.
    pub fn on_stream_starting(&self) -> Result<Duration, FrameLinkError> {
        match self.shared.state.get() {
            PumpState::Capturing => {}
            PumpState::Idle => {
                return Err(FrameLinkError::InvalidTransition { from: PumpState::Idle, op: "start the stream" });
            }
            PumpState::Stopping | PumpState::Closed => {
                warn!("Capture closed before the first frame");
                self.shared.finish();
                return Err(FrameLinkError::ClosedBeforeStart);
            }
        }

        match self.shared.pump.wait_for_next() {
            Next::Frame(frame) => {
                let start = frame.timestamp;
                drop(frame);
                *self.shared.start_position.lock() = Some(start);
                info!("Stream starting at t={:?}", start);
                Ok(start)
            }
            Next::Closed => {
                warn!("Capture closed before the first frame");
                self.shared.finish();
                Err(FrameLinkError::ClosedBeforeStart)
            }
        }
    }

    /// Block for the next frame, normalize it, and hand it back.
    pub fn on_sample_requested(&self) -> SampleReply<D::Snapshot> {
        match self.shared.state.get() {
            PumpState::Capturing => {}
            PumpState::Stopping => {
                debug!("Session stopping; ending stream");
                self.shared.finish();
                return SampleReply::EndOfStream;
            }
            PumpState::Idle | PumpState::Closed => return SampleReply::EndOfStream,
        }

        let frame = match self.shared.pump.wait_for_next() {
            Next::Frame(frame) => frame,
            Next::Closed => {
                debug!("Pump closed; ending stream");
                self.shared.finish();
                return SampleReply::EndOfStream;
            }
        };

        match self.shared.stage.normalize(frame) {
            Ok(sample) => SampleReply::Sample(sample),
            Err(e) => {
                let e = FrameLinkError::from(e);
                warn!("Sample production failed, ending stream: {e}");
                self.shared.finish();
                SampleReply::Error(e)
            }
        }
    }

    pub fn state(&self) -> PumpState {
        self.shared.state.get()
    }

    /// The stream start timestamp, once `on_stream_starting` has returned it.
    pub fn start_position(&self) -> Option<Duration> {
        *self.shared.start_position.lock()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use framelink_core::{Color, Size};

    use super::*;
    use crate::lifecycle::LifecycleController;
    use crate::software::{ManualTarget, SoftwareDevice};

    const BLUE: [u8; 4] = [255, 0, 0, 255];

    fn started(size: Size) -> LifecycleController<SoftwareDevice, ManualTarget> {
        let ctl = LifecycleController::new(Arc::new(SoftwareDevice::new()), ManualTarget::new(size), Color::BLACK);
        ctl.start().unwrap();
        ctl
    }

    #[test]
    fn stream_start_consumes_first_frame() {
        let ctl = started(Size::new(8, 8));
        let bridge = ctl.encoder_bridge();
        ctl.target().emit_solid(Size::new(8, 8), BLUE, Duration::from_millis(100));

        assert_eq!(bridge.on_stream_starting().unwrap(), Duration::from_millis(100));
        assert_eq!(ctl.start_position(), Some(Duration::from_millis(100)));

        ctl.target().emit_solid(Size::new(8, 8), BLUE, Duration::from_millis(133));
        let sample = bridge.on_sample_requested().into_sample().unwrap();
        assert_eq!(sample.timestamp, Duration::from_millis(133));
    }

    #[test]
    fn stream_start_after_target_closed_is_closed_before_start() {
        let ctl = started(Size::new(8, 8));
        ctl.target().close_target();
        let bridge = ctl.encoder_bridge();
        assert!(matches!(bridge.on_stream_starting(), Err(FrameLinkError::ClosedBeforeStart)));
        assert_eq!(ctl.state(), PumpState::Closed);
        assert_eq!(ctl.target().session_closes(), 1);
    }

    #[test]
    fn stream_start_after_stop_is_closed_before_start() {
        let ctl = started(Size::new(8, 8));
        ctl.stop();
        assert!(matches!(ctl.encoder_bridge().on_stream_starting(), Err(FrameLinkError::ClosedBeforeStart)));
        assert_eq!(ctl.state(), PumpState::Closed);
    }

    #[test]
    fn stream_start_before_start_is_rejected() {
        let ctl = LifecycleController::new(
            Arc::new(SoftwareDevice::new()),
            ManualTarget::new(Size::new(8, 8)),
            Color::BLACK,
        );
        assert!(matches!(
            ctl.encoder_bridge().on_stream_starting(),
            Err(FrameLinkError::InvalidTransition { from: PumpState::Idle, .. })
        ));
        assert_eq!(ctl.state(), PumpState::Idle);
    }

    #[test]
    fn request_after_target_closed_tears_down() {
        let ctl = started(Size::new(8, 8));
        let bridge = ctl.encoder_bridge();
        ctl.target().emit_solid(Size::new(8, 8), BLUE, Duration::ZERO);
        bridge.on_stream_starting().unwrap();

        ctl.target().close_target();
        assert_eq!(ctl.state(), PumpState::Stopping);
        assert!(matches!(bridge.on_sample_requested(), SampleReply::EndOfStream));
        assert_eq!(ctl.state(), PumpState::Closed);
        assert_eq!(ctl.target().session_closes(), 1);
        assert!(!ctl.target().is_delivering());
    }

    #[test]
    fn stream_start_reports_close_while_waiting() {
        let ctl = started(Size::new(8, 8));
        let bridge = ctl.encoder_bridge();
        let waiter = thread::spawn(move || bridge.on_stream_starting());
        thread::sleep(Duration::from_millis(50));
        ctl.target().close_target();

        assert!(matches!(waiter.join().unwrap(), Err(FrameLinkError::ClosedBeforeStart)));
        assert_eq!(ctl.state(), PumpState::Closed);
    }

    #[test]
    fn not_capturing_returns_end_without_waiting() {
        let ctl = LifecycleController::new(
            Arc::new(SoftwareDevice::new()),
            ManualTarget::new(Size::new(8, 8)),
            Color::BLACK,
        );
        let bridge = ctl.encoder_bridge();
        assert!(matches!(bridge.on_sample_requested(), SampleReply::EndOfStream));
    }

    #[test]
    fn stop_unblocks_a_waiting_request() {
        let ctl = started(Size::new(8, 8));
        let bridge = ctl.encoder_bridge();
        let waiter = thread::spawn(move || bridge.on_sample_requested());
        thread::sleep(Duration::from_millis(50));
        ctl.stop();

        assert!(matches!(waiter.join().unwrap(), SampleReply::EndOfStream));
        ctl.cleanup();
        assert_eq!(ctl.state(), PumpState::Closed);
        assert_eq!(ctl.target().session_closes(), 1);
    }

    #[test]
    fn device_loss_becomes_error_reply_and_tears_down() {
        let device = Arc::new(SoftwareDevice::new());
        let ctl = LifecycleController::new(Arc::clone(&device), ManualTarget::new(Size::new(8, 8)), Color::BLACK);
        ctl.start().unwrap();
        let bridge = ctl.encoder_bridge();

        device.lose_device("driver reset");
        ctl.target().emit_solid(Size::new(8, 8), BLUE, Duration::ZERO);
        let reply = bridge.on_sample_requested();

        assert!(reply.is_device_lost());
        assert!(reply.is_end());
        assert_eq!(ctl.state(), PumpState::Closed);
        assert!(matches!(bridge.on_sample_requested(), SampleReply::EndOfStream));
    }
}
