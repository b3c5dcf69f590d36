//! Normalizes variable-region frames into one fixed-size compose buffer.

use std::sync::Arc;

use framelink_core::{Color, ComposeError, DeviceError, PixelFormat, Size};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::device::{DeviceAccess, FrameSurface, GpuDevice};
use crate::frame::{CapturedFrame, ComposedSurface};

/// Region to copy out of a frame: the smallest of the reported content size,
/// the surface the content lives in, and the destination buffer, per axis.
pub fn copy_region(content: Size, surface: Size, buffer: Size) -> Size {
    content.clamp_to(surface).clamp_to(buffer)
}

/// Working texture plus its render target view, one per capture session.
pub struct ComposeBuffer<D: GpuDevice> {
    texture: D::Texture,
    target: D::RenderTarget,
    size: Size,
}

impl<D: GpuDevice> ComposeBuffer<D> {
    /// Allocate a BGRA8 buffer for a capture target of `target_size`,
    /// rounded up to even dimensions.
    pub fn new(device: &D, target_size: Size) -> Result<Self, DeviceError> {
        let size = target_size.even_rounded();
        if size.is_empty() {
            return Err(DeviceError::CreateFailed {
                resource: "compose texture",
                reason: format!("empty size {size}"),
            });
        }
        let texture = device.create_texture(size, PixelFormat::Bgra8)?;
        let target = device.create_render_target(&texture)?;
        Ok(Self { texture, target, size })
    }

    pub fn size(&self) -> Size {
        self.size
    }
}

pub struct ComposeStage<D: GpuDevice> {
    device: Arc<D>,
    background: Color,
    /// Held for the whole of `normalize`; this is the exclusive-access scope.
    buffer: Mutex<Option<ComposeBuffer<D>>>,
}

impl<D: GpuDevice> ComposeStage<D> {
    pub fn new(device: Arc<D>, background: Color) -> Self {
        Self { device, background, buffer: Mutex::new(None) }
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Create the session's compose buffer. Returns its (even) size.
    pub fn allocate(&self, target_size: Size) -> Result<Size, DeviceError> {
        let mut slot = self.buffer.lock();
        let _access = DeviceAccess::enter(&*self.device);
        let buffer = ComposeBuffer::new(&*self.device, target_size)?;
        let size = buffer.size();
        *slot = Some(buffer);
        info!("Compose buffer {} allocated for target {}", size, target_size);
        Ok(size)
    }

    pub fn buffer_size(&self) -> Option<Size> {
        self.buffer.lock().as_ref().map(ComposeBuffer::size)
    }

    /// Copy `frame` into the compose buffer and return a snapshot of it.
    ///
    /// Clear, copy and snapshot all happen under one exclusive scope, and the
    /// returned surface is a separate allocation, so a later call cannot
    /// modify a sample already handed out. The source frame is released
    /// before returning.
    pub fn normalize(
        &self,
        frame: CapturedFrame<D::Surface>,
    ) -> Result<ComposedSurface<D::Snapshot>, ComposeError> {
        let CapturedFrame { surface, content_size, timestamp } = frame;

        let (snapshot, region) = {
            let slot = self.buffer.lock();
            let buffer = slot.as_ref().ok_or(ComposeError::Released)?;
            let _access = DeviceAccess::enter(&*self.device);
            self.device.check_status()?;

            let surface_size = surface.size();
            if surface_size.is_empty() {
                return Err(ComposeError::EmptySurface { size: surface_size });
            }

            self.device.clear(&buffer.target, self.background);
            let region = copy_region(content_size, surface_size, buffer.size);
            if !region.is_empty() {
                self.device.copy_region(&surface, region, &buffer.texture)?;
            }
            (self.device.snapshot(&buffer.texture)?, region)
        };
        drop(surface);

        debug!("Composed frame t={:?} region {}", timestamp, region);
        Ok(ComposedSurface { surface: snapshot, timestamp, region })
    }

    /// Drop the compose buffer and render target. Returns `false` if already released.
    pub fn release(&self) -> bool {
        let mut slot = self.buffer.lock();
        let _access = DeviceAccess::enter(&*self.device);
        slot.take().is_some()
    }
}
