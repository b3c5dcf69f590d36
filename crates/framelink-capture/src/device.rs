//! The graphics device seam.
//!
//! `ComposeStage` only talks to the GPU through `GpuDevice`, so the same
//! normalize path runs on D3D11 (Windows) and on the CPU `SoftwareDevice`.

use framelink_core::{Color, DeviceError, PixelFormat, Size};

/// A captured surface: whatever the native pool hands out per frame.
pub trait FrameSurface: Send + 'static {
    /// Allocated size of the surface. Valid content may be smaller.
    fn size(&self) -> Size;
}

pub trait GpuDevice: Send + Sync + 'static {
    /// Surface type produced by the capture pool on this device.
    type Surface: FrameSurface;
    /// Persistent working texture.
    type Texture: Send + 'static;
    type RenderTarget: Send + 'static;
    /// Immutable copy handed to the encoder.
    type Snapshot: Send + 'static;

    /// Enter the device's exclusive-access scope.
    fn enter(&self) {}

    /// Leave the scope entered by `enter`.
    fn leave(&self) {}

    /// Reports `DeviceError::Lost` once the device has been removed or reset.
    fn check_status(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn create_texture(&self, size: Size, format: PixelFormat) -> Result<Self::Texture, DeviceError>;

    fn create_render_target(&self, texture: &Self::Texture) -> Result<Self::RenderTarget, DeviceError>;

    fn clear(&self, target: &Self::RenderTarget, color: Color);

    /// Copy `region` from the surface origin into the texture origin.
    fn copy_region(
        &self,
        src: &Self::Surface,
        region: Size,
        dst: &Self::Texture,
    ) -> Result<(), DeviceError>;

    /// Copy the whole texture into a freshly allocated snapshot.
    fn snapshot(&self, src: &Self::Texture) -> Result<Self::Snapshot, DeviceError>;

    /// Tightly packed BGRA8 rows of a snapshot.
    fn read_pixels(&self, snapshot: &Self::Snapshot) -> Result<Vec<u8>, DeviceError>;
}

/// RAII guard for `GpuDevice::enter` / `GpuDevice::leave`.
pub struct DeviceAccess<'a, D: GpuDevice> {
    device: &'a D,
}

impl<'a, D: GpuDevice> DeviceAccess<'a, D> {
    pub fn enter(device: &'a D) -> Self {
        device.enter();
        Self { device }
    }
}

impl<D: GpuDevice> Drop for DeviceAccess<'_, D> {
    fn drop(&mut self) {
        self.device.leave();
    }
}
