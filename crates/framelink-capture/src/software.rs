//! CPU implementations of the device and capture seams.
//!
//! `SoftwareDevice` backs the compose stage with plain BGRA8 buffers and
//! `ManualTarget` / `TestPatternTarget` stand in for a native capture pool.
//! They run on every platform: tests use them, and the recorder falls back to
//! them where Windows.Graphics.Capture is unavailable.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use framelink_core::{Color, DeviceError, FrameLinkError, PixelFormat, Size};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::device::{FrameSurface, GpuDevice};
use crate::frame::CapturedFrame;
use crate::pump::Publish;
use crate::source::{CaptureSession, CaptureSink, CaptureTarget, PoolConfig};

const BPP: usize = PixelFormat::Bgra8.bytes_per_pixel();

// ── SoftwareTexture ───────────────────────────────────────────────────────────

/// A BGRA8 pixel buffer. Clones share storage, like COM references do.
#[derive(Clone)]
pub struct SoftwareTexture {
    size: Size,
    pixels: Arc<Mutex<Vec<u8>>>,
}

impl std::fmt::Debug for SoftwareTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareTexture").field("size", &self.size).finish_non_exhaustive()
    }
}

impl SoftwareTexture {
    pub fn new(size: Size) -> Self {
        Self::from_pixels(size, vec![0; size.pixel_count() as usize * BPP])
    }

    pub fn filled(size: Size, bgra: [u8; 4]) -> Self {
        let texture = Self::new(size);
        texture.fill(bgra);
        texture
    }

    fn from_pixels(size: Size, pixels: Vec<u8>) -> Self {
        Self { size, pixels: Arc::new(Mutex::new(pixels)) }
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.size.width as usize + x as usize) * BPP
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let at = self.offset(x, y);
        let pixels = self.pixels.lock();
        [pixels[at], pixels[at + 1], pixels[at + 2], pixels[at + 3]]
    }

    pub fn set_pixel(&self, x: u32, y: u32, bgra: [u8; 4]) {
        let at = self.offset(x, y);
        self.pixels.lock()[at..at + BPP].copy_from_slice(&bgra);
    }

    pub fn fill(&self, bgra: [u8; 4]) {
        for px in self.pixels.lock().chunks_exact_mut(BPP) {
            px.copy_from_slice(&bgra);
        }
    }

    /// Paint the columns `[x0, x1)` on every row.
    pub fn fill_columns(&self, x0: u32, x1: u32, bgra: [u8; 4]) {
        let x1 = x1.min(self.size.width);
        if x0 >= x1 {
            return;
        }
        let stride = self.size.width as usize * BPP;
        let mut pixels = self.pixels.lock();
        for row in pixels.chunks_exact_mut(stride) {
            for px in row[x0 as usize * BPP..x1 as usize * BPP].chunks_exact_mut(BPP) {
                px.copy_from_slice(&bgra);
            }
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.pixels.lock().clone()
    }

    pub fn shares_storage_with(&self, other: &SoftwareTexture) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }
}

impl FrameSurface for SoftwareTexture {
    fn size(&self) -> Size {
        self.size
    }
}

/// Render target view over a `SoftwareTexture`.
pub struct SoftwareRenderTarget(SoftwareTexture);

// ── SoftwareDevice ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct SoftwareDevice {
    lost: Mutex<Option<String>>,
    in_scope: AtomicBool,
    overlaps: AtomicU64,
    textures: AtomicU64,
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate device removal; every later operation fails with `DeviceError::Lost`.
    pub fn lose_device(&self, reason: &str) {
        *self.lost.lock() = Some(reason.to_owned());
    }

    /// Times `enter` was called while another caller was inside the scope.
    pub fn overlapping_access(&self) -> u64 {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn textures_created(&self) -> u64 {
        self.textures.load(Ordering::Relaxed)
    }

    fn allocate(&self, size: Size) -> Result<SoftwareTexture, DeviceError> {
        self.check_status()?;
        self.textures.fetch_add(1, Ordering::Relaxed);
        Ok(SoftwareTexture::new(size))
    }
}

impl GpuDevice for SoftwareDevice {
    type Surface = SoftwareTexture;
    type Texture = SoftwareTexture;
    type RenderTarget = SoftwareRenderTarget;
    type Snapshot = SoftwareTexture;

    fn enter(&self) {
        if self.in_scope.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn leave(&self) {
        self.in_scope.store(false, Ordering::SeqCst);
    }

    fn check_status(&self) -> Result<(), DeviceError> {
        match self.lost.lock().as_ref() {
            Some(reason) => Err(DeviceError::Lost { reason: reason.clone() }),
            None => Ok(()),
        }
    }

    fn create_texture(&self, size: Size, format: PixelFormat) -> Result<SoftwareTexture, DeviceError> {
        match format {
            PixelFormat::Bgra8 => self.allocate(size),
        }
    }

    fn create_render_target(&self, texture: &SoftwareTexture) -> Result<SoftwareRenderTarget, DeviceError> {
        self.check_status()?;
        Ok(SoftwareRenderTarget(texture.clone()))
    }

    fn clear(&self, target: &SoftwareRenderTarget, color: Color) {
        target.0.fill(color.to_bgra8());
    }

    fn copy_region(
        &self,
        src: &SoftwareTexture,
        region: Size,
        dst: &SoftwareTexture,
    ) -> Result<(), DeviceError> {
        if region.clamp_to(src.size).clamp_to(dst.size) != region {
            return Err(DeviceError::Api(format!(
                "copy region {region} exceeds source {} or destination {}",
                src.size, dst.size
            )));
        }
        if src.shares_storage_with(dst) {
            return Err(DeviceError::Api("source and destination alias".into()));
        }

        let src_pixels = src.pixels.lock();
        let mut dst_pixels = dst.pixels.lock();
        let row_bytes = region.width as usize * BPP;
        for y in 0..region.height {
            let s = src.offset(0, y);
            let d = dst.offset(0, y);
            dst_pixels[d..d + row_bytes].copy_from_slice(&src_pixels[s..s + row_bytes]);
        }
        Ok(())
    }

    fn snapshot(&self, src: &SoftwareTexture) -> Result<SoftwareTexture, DeviceError> {
        self.check_status()?;
        self.textures.fetch_add(1, Ordering::Relaxed);
        Ok(SoftwareTexture::from_pixels(src.size, src.to_vec()))
    }

    fn read_pixels(&self, snapshot: &SoftwareTexture) -> Result<Vec<u8>, DeviceError> {
        self.check_status()?;
        Ok(snapshot.to_vec())
    }
}

// ── ManualTarget ──────────────────────────────────────────────────────────────

/// A capture target driven by hand: the caller decides when frames arrive and
/// when the target closes.
pub struct ManualTarget {
    size: Size,
    sink: Arc<Mutex<Option<CaptureSink<SoftwareTexture>>>>,
    started: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
}

impl ManualTarget {
    pub fn new(size: Size) -> Self {
        Self {
            size,
            sink: Arc::new(Mutex::new(None)),
            started: Arc::new(AtomicBool::new(false)),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Deliver a frame, as a native FrameArrived would. `None` when no session
    /// is delivering.
    pub fn emit(&self, frame: CapturedFrame<SoftwareTexture>) -> Option<Publish> {
        if !self.started.load(Ordering::SeqCst) {
            return None;
        }
        let sink = self.sink.lock().clone()?;
        Some(sink.frame_arrived(frame))
    }

    /// Deliver a frame of the target's size filled with `bgra`.
    pub fn emit_solid(&self, content: Size, bgra: [u8; 4], timestamp: Duration) -> Option<Publish> {
        self.emit(CapturedFrame::new(SoftwareTexture::filled(self.size, bgra), content, timestamp))
    }

    /// Fire the target-closed notification.
    pub fn close_target(&self) {
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink.target_closed();
        }
    }

    /// How many times a session on this target was closed.
    pub fn session_closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_delivering(&self) -> bool {
        self.started.load(Ordering::SeqCst) && self.sink.lock().is_some()
    }
}

impl CaptureTarget for ManualTarget {
    type Surface = SoftwareTexture;

    fn size(&self) -> Size {
        self.size
    }

    fn describe(&self) -> String {
        format!("manual target {}", self.size)
    }

    fn open(
        &self,
        _pool: PoolConfig,
        sink: CaptureSink<SoftwareTexture>,
    ) -> Result<Box<dyn CaptureSession>, FrameLinkError> {
        *self.sink.lock() = Some(sink);
        Ok(Box::new(ManualSession {
            sink: Arc::clone(&self.sink),
            started: Arc::clone(&self.started),
            closes: Arc::clone(&self.closes),
            closed: false,
        }))
    }
}

struct ManualSession {
    sink: Arc<Mutex<Option<CaptureSink<SoftwareTexture>>>>,
    started: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
    closed: bool,
}

impl CaptureSession for ManualSession {
    fn start(&mut self) -> Result<(), FrameLinkError> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.started.store(false, Ordering::SeqCst);
        self.sink.lock().take();
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

// ── TestPatternTarget ─────────────────────────────────────────────────────────

const PATTERN_BACKGROUND: [u8; 4] = [48, 48, 48, 255];
const PATTERN_BAR: [u8; 4] = [255, 255, 255, 255];
const PATTERN_BAR_WIDTH: u32 = 16;

/// Generates frames with a moving vertical bar on a background thread.
#[derive(Debug, Clone)]
pub struct TestPatternTarget {
    size: Size,
    fps: u32,
    jitter_content: bool,
    frame_limit: Option<u64>,
}

impl TestPatternTarget {
    pub fn new(size: Size, fps: u32) -> Self {
        Self { size, fps: fps.max(1), jitter_content: false, frame_limit: None }
    }

    /// Report a content size of 3/4 the surface on every odd frame.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter_content = jitter;
        self
    }

    /// Close the target after `limit` frames, like a user ending the share.
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }
}

impl CaptureTarget for TestPatternTarget {
    type Surface = SoftwareTexture;

    fn size(&self) -> Size {
        self.size
    }

    fn describe(&self) -> String {
        format!("test pattern {} @{}fps", self.size, self.fps)
    }

    fn open(
        &self,
        pool: PoolConfig,
        sink: CaptureSink<SoftwareTexture>,
    ) -> Result<Box<dyn CaptureSession>, FrameLinkError> {
        if pool.size.is_empty() {
            return Err(FrameLinkError::Capture { reason: format!("empty pool size {}", pool.size) });
        }
        Ok(Box::new(TestPatternSession {
            pattern: self.clone(),
            sink: Some(sink),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }))
    }
}

struct TestPatternSession {
    pattern: TestPatternTarget,
    sink: Option<CaptureSink<SoftwareTexture>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CaptureSession for TestPatternSession {
    fn start(&mut self) -> Result<(), FrameLinkError> {
        let sink = self.sink.take().ok_or_else(|| FrameLinkError::Capture {
            reason: "test pattern session already started".into(),
        })?;
        let pattern = self.pattern.clone();
        let stop = Arc::clone(&self.stop);

        let worker = thread::Builder::new()
            .name("framelink-test-pattern".into())
            .spawn(move || run_pattern(pattern, sink, stop))?;
        self.worker = Some(worker);
        Ok(())
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.sink = None;
        if let Some(worker) = self.worker.take() {
            // Closing from inside a frame callback must not join itself.
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!("Test pattern worker panicked");
            }
        }
    }
}

fn run_pattern(pattern: TestPatternTarget, sink: CaptureSink<SoftwareTexture>, stop: Arc<AtomicBool>) {
    let interval = Duration::from_secs(1) / pattern.fps;
    let clock = Instant::now();
    let size = pattern.size;
    let mut n: u64 = 0;

    while !stop.load(Ordering::SeqCst) {
        if pattern.frame_limit.is_some_and(|limit| n >= limit) {
            sink.target_closed();
            break;
        }

        let surface = SoftwareTexture::filled(size, PATTERN_BACKGROUND);
        let x0 = ((n * 8) % size.width.max(1) as u64) as u32;
        surface.fill_columns(x0, x0 + PATTERN_BAR_WIDTH, PATTERN_BAR);
        let content = if pattern.jitter_content && n % 2 == 1 {
            Size::new(size.width * 3 / 4, size.height * 3 / 4)
        } else {
            size
        };
        sink.frame_arrived(CapturedFrame::new(surface, content, clock.elapsed()));
        n += 1;

        thread::sleep(interval);
    }
    if n > 0 {
        debug!("Test pattern produced {} frames", n);
    }
    info!("Test pattern worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_region_rejects_out_of_bounds() {
        let device = SoftwareDevice::new();
        let src = SoftwareTexture::new(Size::new(4, 4));
        let dst = SoftwareTexture::new(Size::new(8, 8));
        assert!(device.copy_region(&src, Size::new(5, 4), &dst).is_err());
        assert!(device.copy_region(&src, Size::new(4, 4), &dst).is_ok());
    }

    #[test]
    fn copy_region_copies_rows_at_origin() {
        let device = SoftwareDevice::new();
        let src = SoftwareTexture::filled(Size::new(4, 4), [1, 2, 3, 4]);
        let dst = SoftwareTexture::new(Size::new(6, 6));
        device.copy_region(&src, Size::new(2, 3), &dst).unwrap();
        assert_eq!(dst.pixel(1, 2), [1, 2, 3, 4]);
        assert_eq!(dst.pixel(2, 2), [0, 0, 0, 0]);
        assert_eq!(dst.pixel(1, 3), [0, 0, 0, 0]);
    }

    #[test]
    fn snapshot_is_a_separate_allocation() {
        let device = SoftwareDevice::new();
        let tex = device.create_texture(Size::new(2, 2), PixelFormat::Bgra8).unwrap();
        let snap = device.snapshot(&tex).unwrap();
        assert!(!snap.shares_storage_with(&tex));
        assert_eq!(device.textures_created(), 2);
    }

    #[test]
    fn fill_columns_is_clamped_to_width() {
        let tex = SoftwareTexture::new(Size::new(4, 2));
        tex.fill_columns(2, 10, [7, 7, 7, 7]);
        assert_eq!(tex.pixel(3, 1), [7, 7, 7, 7]);
        assert_eq!(tex.pixel(1, 1), [0, 0, 0, 0]);
    }

    #[test]
    fn lost_device_fails_readback() {
        let device = SoftwareDevice::new();
        let snap = device.snapshot(&SoftwareTexture::new(Size::new(2, 2))).unwrap();
        device.lose_device("unplugged");
        assert!(matches!(device.read_pixels(&snap), Err(DeviceError::Lost { .. })));
    }

    #[test]
    fn close_survives_a_panicked_worker() {
        let mut session = TestPatternSession {
            pattern: TestPatternTarget::new(Size::new(4, 4), 30),
            sink: None,
            stop: Arc::new(AtomicBool::new(false)),
            worker: Some(thread::spawn(|| panic!("pattern worker failed"))),
        };
        session.close();
        assert!(session.worker.is_none());
        assert!(session.stop.load(Ordering::SeqCst));
    }

    #[test]
    fn lost_device_fails_allocation() {
        let device = SoftwareDevice::new();
        device.lose_device("unplugged");
        assert!(matches!(
            device.create_texture(Size::new(2, 2), PixelFormat::Bgra8),
            Err(DeviceError::Lost { .. })
        ));
    }
}
