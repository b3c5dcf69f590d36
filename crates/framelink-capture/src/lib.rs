//! framelink-capture — bridges a push-style screen capture source to a
//! pull-style video encoder.
//!
//! # Pipeline
//!
//! ```text
//! native capture thread                         encoder thread
//! ─────────────────────                         ──────────────
//! FrameArrived (pool depth 1)                   on_sample_requested()
//!   │  CaptureSink::frame_arrived                 │
//!   ▼                                             ▼
//! FramePump slot  ◀───── wait_for_next() ─────  EncoderBridge
//!   (newest frame wins, sticky `closed`)          │
//!                                                 ▼
//!                                   ComposeStage::normalize
//!                                     clear → clipped copy → snapshot
//!                                                 │
//!                                                 ▼
//!                                   SampleReply::Sample(surface, timestamp)
//! ```
//!
//! `LifecycleController` owns the pieces and tears them down exactly once.
//!
//! # Platform split
//!
//! The Windows.Graphics.Capture + Direct3D 11 backend (`wgc`) is compiled on
//! Windows only. `software` provides a CPU device and synthetic targets on
//! every platform.

pub mod bridge;
pub mod compose;
pub mod device;
pub mod frame;
pub mod lifecycle;
pub mod pump;
pub mod software;
pub mod source;

#[cfg(target_os = "windows")]
pub mod wgc;

pub use bridge::{EncoderBridge, SampleReply};
pub use compose::{copy_region, ComposeBuffer, ComposeStage};
pub use device::{DeviceAccess, FrameSurface, GpuDevice};
pub use frame::{CapturedFrame, ComposedSurface};
pub use lifecycle::LifecycleController;
pub use pump::{FramePump, Next, Publish, PumpStats};
pub use software::{ManualTarget, SoftwareDevice, SoftwareTexture, TestPatternTarget};
pub use source::{CaptureSession, CaptureSink, CaptureSource, CaptureTarget, PoolConfig};
