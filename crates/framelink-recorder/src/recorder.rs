//! `Recorder` — drives one recording: capture session(s) → encoder pull loop
//! → `RawVideoWriter`.
//!
//! The pull loop plays the encoder's part: `on_stream_starting` once per
//! session, then `on_sample_requested` until end-of-stream. A device loss
//! ends the session; the recorder then builds a fresh device and target and
//! keeps appending, up to `device_lost_retries` times.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use framelink_capture::{
    CaptureTarget, EncoderBridge, GpuDevice, LifecycleController, SampleReply, SoftwareDevice, TestPatternTarget,
};
use framelink_core::{ComposeError, DeviceError, EncodingProfile, FrameLinkError, RecorderConfig, SourceConfig};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::output::{RawVideoWriter, Sidecar};

// ── Public types ──────────────────────────────────────────────────────────────

/// Lifecycle state of a recording.
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderState {
    Starting,
    Recording,
    /// Device lost; building a new session.
    Recovering { attempt: u32 },
    Stopped,
    Failed(String),
}

/// Periodic status update pushed to `main` via mpsc channel.
#[derive(Debug, Clone)]
pub struct RecorderStatus {
    pub state: RecorderState,
    pub fps: f32,
    pub frames_written: u64,
}

/// Shared stop request. `request` reaches whichever session is live, and a
/// session attached after the request is refused.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<Mutex<StopInner>>,
}

#[derive(Default)]
struct StopInner {
    requested: bool,
    active: Option<Box<dyn Fn() + Send>>,
}

impl StopSignal {
    pub fn request(&self) {
        let mut inner = self.inner.lock();
        inner.requested = true;
        if let Some(stop) = inner.active.as_ref() {
            stop();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.inner.lock().requested
    }

    /// Register the live session's stop hook. `false` if stop was already requested.
    fn attach(&self, stop: Box<dyn Fn() + Send>) -> bool {
        let mut inner = self.inner.lock();
        if inner.requested {
            return false;
        }
        inner.active = Some(stop);
        true
    }

    fn detach(&self) {
        self.inner.lock().active = None;
    }
}

/// How one capture session ended.
#[derive(Debug)]
enum SessionEnd {
    /// End of stream: stop requested, target closed, or `max_frames` reached.
    Finished,
    DeviceLost(FrameLinkError),
}

// ── Recorder ──────────────────────────────────────────────────────────────────

pub struct Recorder {
    config: RecorderConfig,
    status_tx: mpsc::Sender<RecorderStatus>,
    fps: FpsCounter,
    writer: Option<RawVideoWriter>,
    last_report: Instant,
}

impl Recorder {
    pub fn new(config: RecorderConfig, status_tx: mpsc::Sender<RecorderStatus>) -> Self {
        Self { config, status_tx, fps: FpsCounter::new(), writer: None, last_report: Instant::now() }
    }

    /// Record until stopped, the target closes, or `max_frames` is reached.
    /// Blocking; run it on `spawn_blocking`.
    ///
    /// `Ok(None)` when no capture target was selected: nothing is opened or
    /// written.
    pub fn run(mut self, stop: &StopSignal) -> Result<Option<Sidecar>> {
        self.report(RecorderState::Starting);
        let outcome = match self.config.source.clone() {
            SourceConfig::TestPattern { size, fps, jitter_content } => self.run_with_retries(stop, || {
                let target = TestPatternTarget::new(size, fps).with_jitter(jitter_content);
                Ok((Arc::new(SoftwareDevice::new()), target))
            }),
            SourceConfig::Display { index: Some(index) } => self.run_display(index, stop),
            SourceConfig::Display { index: None } => {
                info!("No capture target selected; nothing to record");
                self.report(RecorderState::Stopped);
                return Ok(None);
            }
        };

        match self.finalize(outcome) {
            Ok(sidecar) => {
                self.report(RecorderState::Stopped);
                Ok(Some(sidecar))
            }
            Err(e) => {
                error!("Recording failed: {e:#}");
                self.report(RecorderState::Failed(format!("{e:#}")));
                Err(e)
            }
        }
    }

    /// Close the output whatever the sessions' outcome, so frames already
    /// written always get their sidecar. The recording error wins over a
    /// finalize error.
    fn finalize(&mut self, outcome: Result<()>) -> Result<Sidecar> {
        let finished = self.writer.take().map(RawVideoWriter::finish);
        match (outcome, finished) {
            (Ok(()), Some(finished)) => finished,
            (Ok(()), None) => Err(anyhow!("no capture session was opened")),
            (Err(e), Some(Ok(sidecar))) => {
                warn!("Output finalized with {} frames after failure", sidecar.frame_count);
                Err(e)
            }
            (Err(e), Some(Err(finish_err))) => {
                warn!("Finalizing output after failure: {finish_err:#}");
                Err(e)
            }
            (Err(e), None) => Err(e),
        }
    }

    #[cfg(target_os = "windows")]
    fn run_display(&mut self, index: u8, stop: &StopSignal) -> Result<()> {
        use framelink_capture::wgc::{D3d11Device, WgcTarget};

        self.run_with_retries(stop, || {
            let device = Arc::new(D3d11Device::create()?);
            let target = WgcTarget::for_display(index, Arc::clone(&device))?;
            Ok((device, target))
        })
    }

    #[cfg(not(target_os = "windows"))]
    fn run_display(&mut self, index: u8, _stop: &StopSignal) -> Result<()> {
        Err(FrameLinkError::Unsupported {
            reason: format!("Display[{index}] capture needs Windows.Graphics.Capture"),
        }
        .into())
    }

    fn run_with_retries<D, T, F>(&mut self, stop: &StopSignal, mut build: F) -> Result<()>
    where
        D: GpuDevice,
        T: CaptureTarget<Surface = D::Surface> + 'static,
        F: FnMut() -> Result<(Arc<D>, T), FrameLinkError>,
    {
        let mut attempt = 0;
        loop {
            let (device, target) = build().context("open capture session")?;
            match self.record_session(device, target, stop)? {
                SessionEnd::Finished => return Ok(()),
                SessionEnd::DeviceLost(e) if attempt < self.config.device_lost_retries && !stop.is_requested() => {
                    attempt += 1;
                    warn!("{e}; building a new session (attempt {}/{})", attempt, self.config.device_lost_retries);
                    self.report(RecorderState::Recovering { attempt });
                }
                SessionEnd::DeviceLost(e) => return Err(e).context("device lost, retries exhausted"),
            }
        }
    }

    fn record_session<D, T>(&mut self, device: Arc<D>, target: T, stop: &StopSignal) -> Result<SessionEnd>
    where
        D: GpuDevice,
        T: CaptureTarget<Surface = D::Surface> + 'static,
    {
        let profile = EncodingProfile::for_target(target.size(), &self.config);
        match self.writer.as_mut() {
            Some(writer) => writer.begin_session(&profile)?,
            None => {
                self.writer = Some(RawVideoWriter::create(
                    &self.config.output_path,
                    &self.config.sidecar_path(),
                    profile,
                )?)
            }
        }

        let controller = Arc::new(LifecycleController::new(Arc::clone(&device), target, self.config.background));
        let bridge = controller.encoder_bridge();
        let hook = Arc::clone(&controller);
        if !stop.attach(Box::new(move || {
            hook.stop();
        })) {
            return Ok(SessionEnd::Finished);
        }

        let end = self.pull_samples(&*device, &controller, &bridge, stop);
        stop.detach();
        controller.cleanup();
        end
    }

    fn pull_samples<D, T>(
        &mut self,
        device: &D,
        controller: &LifecycleController<D, T>,
        bridge: &EncoderBridge<D>,
        stop: &StopSignal,
    ) -> Result<SessionEnd>
    where
        D: GpuDevice,
        T: CaptureTarget<Surface = D::Surface>,
    {
        if let Err(e) = controller.start() {
            if e.is_device_lost() {
                return Ok(SessionEnd::DeviceLost(e));
            }
            if stop.is_requested() {
                return Ok(SessionEnd::Finished);
            }
            return Err(e).context("start capture");
        }

        let start = match bridge.on_stream_starting() {
            Ok(start) => start,
            Err(FrameLinkError::ClosedBeforeStart) => {
                info!("Capture ended before the first frame");
                return Ok(SessionEnd::Finished);
            }
            Err(e) => return Err(e).context("stream start"),
        };
        self.report(RecorderState::Recording);
        info!("Recording from {} (start t={:?})", controller.target().describe(), start);

        loop {
            match bridge.on_sample_requested() {
                SampleReply::Sample(sample) => {
                    let pixels = match device.read_pixels(&sample.surface) {
                        Ok(pixels) => pixels,
                        Err(e @ DeviceError::Lost { .. }) => {
                            return Ok(SessionEnd::DeviceLost(ComposeError::from(e).into()));
                        }
                        Err(e) => return Err(e).context("read back sample"),
                    };
                    let writer = self.writer.as_mut().context("output writer not open")?;
                    writer.write_frame(&pixels, sample.timestamp.saturating_sub(start))?;
                    let written = writer.frame_count();
                    self.fps.tick();
                    debug!("Sample t={:?} region {}", sample.timestamp, sample.region);

                    if self.last_report.elapsed() >= Duration::from_secs(1) {
                        self.last_report = Instant::now();
                        self.report(RecorderState::Recording);
                    }
                    if self.config.max_frames.is_some_and(|max| written >= max) {
                        info!("Reached max_frames ({written}); stopping");
                        controller.stop();
                    }
                }
                SampleReply::EndOfStream => return Ok(SessionEnd::Finished),
                SampleReply::Error(e) if e.is_device_lost() => return Ok(SessionEnd::DeviceLost(e)),
                SampleReply::Error(e) => return Err(e).context("sample production"),
            }
        }
    }

    fn report(&self, state: RecorderState) {
        let _ = self.status_tx.try_send(RecorderStatus {
            state,
            fps: self.fps.fps(),
            frames_written: self.writer.as_ref().map_or(0, RawVideoWriter::frame_count),
        });
    }
}

// ── FpsCounter ────────────────────────────────────────────────────────────────

struct FpsCounter {
    timestamps: VecDeque<Instant>,
}

impl FpsCounter {
    fn new() -> Self {
        Self { timestamps: VecDeque::with_capacity(128) }
    }

    fn tick(&mut self) {
        let now = Instant::now();
        self.timestamps.push_back(now);
        while self.timestamps.front().is_some_and(|t| now - *t > Duration::from_secs(1)) {
            self.timestamps.pop_front();
        }
    }

    fn fps(&self) -> f32 {
        self.timestamps.len() as f32
    }
}
