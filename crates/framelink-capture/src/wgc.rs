//! Windows.Graphics.Capture (WGC) + Direct3D 11 backend.
//!
//! Requires Windows 10 1803+ (build 17134).
//!
//! # Threading model
//!
//! The frame pool is created free-threaded, so `FrameArrived` fires on a
//! thread-pool thread and hands each frame straight to the `CaptureSink`.
//! The D3D11 device is switched to multithread-protected mode and every
//! compose step runs between `ID3D11Multithread::Enter` / `Leave`.

use std::sync::Arc;
use std::time::Duration;

use framelink_core::{Color, DeviceError, FrameLinkError, PixelFormat, Size};
use tracing::{debug, info, warn};
use windows::{
    core::{IInspectable, Interface},
    Foundation::{EventRegistrationToken, TypedEventHandler},
    Graphics::{
        Capture::{
            Direct3D11CaptureFramePool, GraphicsCaptureItem, GraphicsCaptureSession,
        },
        DirectX::{
            Direct3D11::{IDirect3DDevice, IDirect3DSurface},
            DirectXPixelFormat,
        },
        SizeInt32,
    },
    Win32::{
        Foundation::{BOOL, HMODULE, LPARAM, RECT},
        Graphics::{
            Direct3D::D3D_DRIVER_TYPE_HARDWARE,
            Direct3D11::{
                D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Multithread,
                ID3D11RenderTargetView, ID3D11Texture2D, D3D11_BIND_RENDER_TARGET,
                D3D11_BIND_SHADER_RESOURCE, D3D11_BOX, D3D11_CPU_ACCESS_READ,
                D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_MAPPED_SUBRESOURCE, D3D11_MAP_READ,
                D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC, D3D11_USAGE_DEFAULT, D3D11_USAGE_STAGING,
            },
            Dxgi::{
                Common::{DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_SAMPLE_DESC},
                IDXGIDevice, IDXGISurface, DXGI_ERROR_DEVICE_REMOVED, DXGI_ERROR_DEVICE_RESET,
            },
            Gdi::{EnumDisplayMonitors, HDC, HMONITOR},
        },
        System::WinRT::{
            Direct3D11::{
                CreateDirect3D11DeviceFromDXGIDevice, CreateDirect3D11SurfaceFromDXGISurface,
                IDirect3DDxgiInterfaceAccess,
            },
            Graphics::Capture::IGraphicsCaptureItemInterop,
            RoInitialize, RO_INIT_MULTITHREADED,
        },
    },
};

use crate::device::{DeviceAccess, FrameSurface, GpuDevice};
use crate::frame::CapturedFrame;
use crate::source::{CaptureSession, CaptureSink, CaptureTarget, PoolConfig};

// ── Error mapping ─────────────────────────────────────────────────────────────

fn device_error(what: &str, e: windows::core::Error) -> DeviceError {
    let code = e.code();
    if code == DXGI_ERROR_DEVICE_REMOVED || code == DXGI_ERROR_DEVICE_RESET {
        DeviceError::Lost { reason: format!("{what}: {e}") }
    } else {
        DeviceError::Api(format!("{what}: {e}"))
    }
}

fn capture_error(what: &str, e: windows::core::Error) -> FrameLinkError {
    FrameLinkError::Capture { reason: format!("{what}: {e}") }
}

// ── D3d11Device ───────────────────────────────────────────────────────────────

/// Hardware D3D11 device shared by the frame pool and the compose stage.
pub struct D3d11Device {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    multithread: ID3D11Multithread,
    winrt_device: IDirect3DDevice,
}

// SAFETY: the device is free-threaded and multithread protection is on;
// context use is bracketed by Enter/Leave.
unsafe impl Send for D3d11Device {}
unsafe impl Sync for D3d11Device {}

impl D3d11Device {
    pub fn create() -> Result<Self, FrameLinkError> {
        // Initialise WinRT on this thread (no-op if already done)
        unsafe {
            let _ = RoInitialize(RO_INIT_MULTITHREADED);
        }

        let mut device: Option<ID3D11Device> = None;
        let mut context: Option<ID3D11DeviceContext> = None;
        unsafe {
            D3D11CreateDevice(
                None,
                D3D_DRIVER_TYPE_HARDWARE,
                HMODULE::default(),
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                None,
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
        }
        .map_err(|e| capture_error("D3D11CreateDevice", e))?;
        let device = device.ok_or_else(|| FrameLinkError::Capture {
            reason: "D3D11CreateDevice returned no device".into(),
        })?;
        let context = context.ok_or_else(|| FrameLinkError::Capture {
            reason: "D3D11CreateDevice returned no context".into(),
        })?;

        let multithread: ID3D11Multithread =
            context.cast().map_err(|e| capture_error("cast ID3D11Multithread", e))?;
        unsafe {
            let _ = multithread.SetMultithreadProtected(BOOL::from(true));
        }

        let dxgi_device: IDXGIDevice =
            device.cast().map_err(|e| capture_error("cast IDXGIDevice", e))?;
        let winrt_device: IDirect3DDevice = unsafe { CreateDirect3D11DeviceFromDXGIDevice(&dxgi_device) }
            .and_then(|inspectable: IInspectable| inspectable.cast())
            .map_err(|e| capture_error("CreateDirect3D11DeviceFromDXGIDevice", e))?;

        info!("D3D11 device created (multithread protected)");
        Ok(Self { device, context, multithread, winrt_device })
    }

    pub fn winrt_device(&self) -> &IDirect3DDevice {
        &self.winrt_device
    }

    fn create_texture_desc(&self, desc: &D3D11_TEXTURE2D_DESC, what: &'static str) -> Result<ID3D11Texture2D, DeviceError> {
        let mut texture: Option<ID3D11Texture2D> = None;
        unsafe { self.device.CreateTexture2D(desc, None, Some(&mut texture)) }
            .map_err(|e| device_error(what, e))?;
        texture.ok_or(DeviceError::CreateFailed { resource: what, reason: "no texture returned".into() })
    }
}

fn bgra_desc(size: Size) -> D3D11_TEXTURE2D_DESC {
    D3D11_TEXTURE2D_DESC {
        Width: size.width,
        Height: size.height,
        MipLevels: 1,
        ArraySize: 1,
        Format: DXGI_FORMAT_B8G8R8A8_UNORM,
        SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
        Usage: D3D11_USAGE_DEFAULT,
        BindFlags: (D3D11_BIND_RENDER_TARGET.0 | D3D11_BIND_SHADER_RESOURCE.0) as u32,
        CPUAccessFlags: 0,
        MiscFlags: 0,
    }
}

fn texture_size(texture: &ID3D11Texture2D) -> Size {
    let mut desc = D3D11_TEXTURE2D_DESC::default();
    unsafe { texture.GetDesc(&mut desc) };
    Size::new(desc.Width, desc.Height)
}

// ── Resources ─────────────────────────────────────────────────────────────────

/// One frame from the WGC pool. Dropping it returns the buffer to the pool.
pub struct WgcSurface {
    frame: windows::Graphics::Capture::Direct3D11CaptureFrame,
    texture: ID3D11Texture2D,
    size: Size,
}

// SAFETY: WGC frames from a free-threaded pool are agile.
unsafe impl Send for WgcSurface {}

impl FrameSurface for WgcSurface {
    fn size(&self) -> Size {
        self.size
    }
}

impl Drop for WgcSurface {
    fn drop(&mut self) {
        let _ = self.frame.Close();
    }
}

pub struct D3d11Texture(ID3D11Texture2D);
pub struct D3d11RenderTarget(ID3D11RenderTargetView);

/// Encoder-readable copy of the compose buffer.
pub struct D3d11Snapshot {
    texture: ID3D11Texture2D,
    surface: IDirect3DSurface,
}

impl D3d11Snapshot {
    /// WinRT surface for `MediaStreamSample::CreateFromDirect3D11Surface`.
    pub fn surface(&self) -> &IDirect3DSurface {
        &self.surface
    }
}

// SAFETY: D3D11 resources are free-threaded; all context access is serialized.
unsafe impl Send for D3d11Texture {}
unsafe impl Send for D3d11RenderTarget {}
unsafe impl Send for D3d11Snapshot {}

impl GpuDevice for D3d11Device {
    type Surface = WgcSurface;
    type Texture = D3d11Texture;
    type RenderTarget = D3d11RenderTarget;
    type Snapshot = D3d11Snapshot;

    fn enter(&self) {
        unsafe { self.multithread.Enter() };
    }

    fn leave(&self) {
        unsafe { self.multithread.Leave() };
    }

    fn check_status(&self) -> Result<(), DeviceError> {
        unsafe { self.device.GetDeviceRemovedReason() }
            .map_err(|e| DeviceError::Lost { reason: e.to_string() })
    }

    fn create_texture(&self, size: Size, format: PixelFormat) -> Result<D3d11Texture, DeviceError> {
        match format {
            PixelFormat::Bgra8 => self.create_texture_desc(&bgra_desc(size), "compose texture").map(D3d11Texture),
        }
    }

    fn create_render_target(&self, texture: &D3d11Texture) -> Result<D3d11RenderTarget, DeviceError> {
        let mut view: Option<ID3D11RenderTargetView> = None;
        unsafe { self.device.CreateRenderTargetView(&texture.0, None, Some(&mut view)) }
            .map_err(|e| device_error("CreateRenderTargetView", e))?;
        view.map(D3d11RenderTarget).ok_or(DeviceError::CreateFailed {
            resource: "render target view",
            reason: "no view returned".into(),
        })
    }

    fn clear(&self, target: &D3d11RenderTarget, color: Color) {
        unsafe { self.context.ClearRenderTargetView(&target.0, &color.to_array()) };
    }

    fn copy_region(&self, src: &WgcSurface, region: Size, dst: &D3d11Texture) -> Result<(), DeviceError> {
        let region_box = D3D11_BOX {
            left: 0,
            top: 0,
            front: 0,
            right: region.width,
            bottom: region.height,
            back: 1,
        };
        unsafe {
            self.context
                .CopySubresourceRegion(&dst.0, 0, 0, 0, 0, &src.texture, 0, Some(&region_box));
        }
        Ok(())
    }

    fn snapshot(&self, src: &D3d11Texture) -> Result<D3d11Snapshot, DeviceError> {
        let texture = self.create_texture_desc(&bgra_desc(texture_size(&src.0)), "snapshot texture")?;
        unsafe { self.context.CopyResource(&texture, &src.0) };

        let dxgi: IDXGISurface = texture.cast().map_err(|e| device_error("cast IDXGISurface", e))?;
        let surface: IDirect3DSurface = unsafe { CreateDirect3D11SurfaceFromDXGISurface(&dxgi) }
            .and_then(|inspectable: IInspectable| inspectable.cast())
            .map_err(|e| device_error("CreateDirect3D11SurfaceFromDXGISurface", e))?;
        Ok(D3d11Snapshot { texture, surface })
    }

    /// Copy through a CPU-readable staging texture and strip row padding.
    fn read_pixels(&self, snapshot: &D3d11Snapshot) -> Result<Vec<u8>, DeviceError> {
        let size = texture_size(&snapshot.texture);
        let desc = D3D11_TEXTURE2D_DESC {
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            ..bgra_desc(size)
        };
        let staging = self.create_texture_desc(&desc, "staging texture")?;

        let _access = DeviceAccess::enter(self);
        unsafe { self.context.CopyResource(&staging, &snapshot.texture) };

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe { self.context.Map(&staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped)) }
            .map_err(|e| device_error("Map staging texture", e))?;

        let row_bytes = size.width as usize * PixelFormat::Bgra8.bytes_per_pixel();
        let row_pitch = mapped.RowPitch as usize;
        let mut data = Vec::with_capacity(row_bytes * size.height as usize);
        for row in 0..size.height as usize {
            let src = unsafe {
                std::slice::from_raw_parts((mapped.pData as *const u8).add(row * row_pitch), row_bytes)
            };
            data.extend_from_slice(src);
        }
        unsafe { self.context.Unmap(&staging, 0) };
        Ok(data)
    }
}

// ── WgcTarget ─────────────────────────────────────────────────────────────────

/// A monitor captured through a `GraphicsCaptureItem`.
pub struct WgcTarget {
    item: GraphicsCaptureItem,
    device: Arc<D3d11Device>,
    size: Size,
    description: String,
}

// SAFETY: GraphicsCaptureItem is an agile WinRT object.
unsafe impl Send for WgcTarget {}
unsafe impl Sync for WgcTarget {}

impl WgcTarget {
    /// `false` when the host has no Windows.Graphics.Capture support.
    pub fn is_supported() -> bool {
        GraphicsCaptureSession::IsSupported().unwrap_or(false)
    }

    /// Capture target for monitor `display_index`, in the order Windows
    /// enumerates them.
    pub fn for_display(display_index: u8, device: Arc<D3d11Device>) -> Result<Self, FrameLinkError> {
        if !Self::is_supported() {
            return Err(FrameLinkError::Unsupported {
                reason: "Windows.Graphics.Capture is not available".into(),
            });
        }

        let monitors = enumerate_monitors();
        let hmonitor = *monitors.get(display_index as usize).ok_or_else(|| FrameLinkError::Capture {
            reason: format!("Display[{}] not found ({} monitors detected)", display_index, monitors.len()),
        })?;

        let interop: IGraphicsCaptureItemInterop =
            windows::core::factory::<GraphicsCaptureItem, IGraphicsCaptureItemInterop>()
                .map_err(|e| capture_error("IGraphicsCaptureItemInterop factory", e))?;
        let item: GraphicsCaptureItem = unsafe { interop.CreateForMonitor(hmonitor) }
            .map_err(|e| capture_error("CreateForMonitor", e))?;
        let native = item.Size().map_err(|e| capture_error("GraphicsCaptureItem::Size", e))?;
        let size = Size::new(native.Width.max(0) as u32, native.Height.max(0) as u32);

        info!("Display[{}] WGC item size {}", display_index, size);
        Ok(Self { item, device, size, description: format!("Display[{display_index}]") })
    }
}

impl CaptureTarget for WgcTarget {
    type Surface = WgcSurface;

    fn size(&self) -> Size {
        self.size
    }

    fn describe(&self) -> String {
        self.description.clone()
    }

    fn open(
        &self,
        pool_config: PoolConfig,
        sink: CaptureSink<WgcSurface>,
    ) -> Result<Box<dyn CaptureSession>, FrameLinkError> {
        let pixel_format = match pool_config.format {
            PixelFormat::Bgra8 => DirectXPixelFormat::B8G8R8A8UIntNormalized,
        };
        let pool = Direct3D11CaptureFramePool::CreateFreeThreaded(
            self.device.winrt_device(),
            pixel_format,
            pool_config.depth as i32,
            SizeInt32 { Width: pool_config.size.width as i32, Height: pool_config.size.height as i32 },
        )
        .map_err(|e| capture_error("CreateFreeThreaded frame pool", e))?;
        let session = pool
            .CreateCaptureSession(&self.item)
            .map_err(|e| capture_error("CreateCaptureSession", e))?;
        // Yellow capture border is optional on Windows 11 22H2+; OK to ignore error
        let _ = session.SetIsBorderRequired(false);

        let frame_sink = sink.clone();
        let frame_token = pool
            .FrameArrived(&TypedEventHandler::<Direct3D11CaptureFramePool, IInspectable>::new(
                move |pool_ref, _| {
                    let Some(pool_ref) = pool_ref.as_ref() else {
                        return Ok(());
                    };
                    let Ok(frame) = pool_ref.TryGetNextFrame() else {
                        return Ok(());
                    };
                    let access: IDirect3DDxgiInterfaceAccess = frame.Surface()?.cast()?;
                    let texture: ID3D11Texture2D = unsafe { access.GetInterface()? };
                    let content = frame.ContentSize()?;
                    let ticks = frame.SystemRelativeTime()?.Duration.max(0) as u64;

                    let size = texture_size(&texture);
                    let captured = CapturedFrame::new(
                        WgcSurface { frame, texture, size },
                        Size::new(content.Width.max(0) as u32, content.Height.max(0) as u32),
                        Duration::from_nanos(ticks * 100),
                    );
                    frame_sink.frame_arrived(captured);
                    Ok(())
                },
            ))
            .map_err(|e| capture_error("FrameArrived handler", e))?;

        let closed_sink = sink;
        let closed_token = self
            .item
            .Closed(&TypedEventHandler::<GraphicsCaptureItem, IInspectable>::new(move |_, _| {
                closed_sink.target_closed();
                Ok(())
            }))
            .map_err(|e| capture_error("Closed handler", e))?;

        debug!("{} frame pool created ({}, depth {})", self.description, pool_config.size, pool_config.depth);
        Ok(Box::new(WgcSession {
            item: self.item.clone(),
            pool,
            session,
            frame_token,
            closed_token,
            closed: false,
        }))
    }
}

struct WgcSession {
    item: GraphicsCaptureItem,
    pool: Direct3D11CaptureFramePool,
    session: GraphicsCaptureSession,
    frame_token: EventRegistrationToken,
    closed_token: EventRegistrationToken,
    closed: bool,
}

// SAFETY: all members are agile WinRT objects.
unsafe impl Send for WgcSession {}

impl CaptureSession for WgcSession {
    fn start(&mut self) -> Result<(), FrameLinkError> {
        self.session.StartCapture().map_err(|e| capture_error("StartCapture", e))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.pool.RemoveFrameArrived(self.frame_token) {
            warn!("RemoveFrameArrived: {e}");
        }
        if let Err(e) = self.item.RemoveClosed(self.closed_token) {
            warn!("RemoveClosed: {e}");
        }
        let _ = self.session.Close();
        let _ = self.pool.Close();
    }
}

impl Drop for WgcSession {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Enumerate connected monitors, in the order Windows reports them.
fn enumerate_monitors() -> Vec<HMONITOR> {
    let mut list: Vec<HMONITOR> = Vec::new();

    unsafe extern "system" fn cb(hmon: HMONITOR, _: HDC, _: *mut RECT, data: LPARAM) -> BOOL {
        let list = data.0 as *mut Vec<HMONITOR>;
        unsafe { (*list).push(hmon) };
        BOOL(1)
    }

    unsafe {
        let _ = EnumDisplayMonitors(HDC::default(), None, Some(cb), LPARAM(&mut list as *mut _ as isize));
    }
    list
}
