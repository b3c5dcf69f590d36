use thiserror::Error;

use crate::types::{PumpState, Size};

#[derive(Error, Debug)]
pub enum FrameLinkError {
    #[error("Screen capture unsupported on this host: {reason}")]
    Unsupported { reason: String },

    #[error("Configuration invalid: {reason}")]
    ConfigurationInvalid { reason: String },

    #[error("Capture session error: {reason}")]
    Capture { reason: String },

    #[error("Cannot {op} while {from}")]
    InvalidTransition { from: PumpState, op: &'static str },

    #[error("Capture closed before the stream start time was known")]
    ClosedBeforeStart,

    #[error("Compose error: {0}")]
    Compose(#[from] ComposeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FrameLinkError {
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::Compose(ComposeError::Device(DeviceError::Lost { .. })))
    }
}

/// Failures while normalizing one frame into the compose buffer.
#[derive(Error, Debug)]
pub enum ComposeError {
    #[error("Compose buffer already released")]
    Released,

    #[error("Frame surface is empty ({size})")]
    EmptySurface { size: Size },

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

#[derive(Error, Debug)]
pub enum DeviceError {
    /// The GPU was removed or reset. Every resource created on it is invalid.
    #[error("Graphics device lost: {reason}")]
    Lost { reason: String },

    #[error("Failed to create {resource}: {reason}")]
    CreateFailed { resource: &'static str, reason: String },

    #[error("Graphics API call failed: {0}")]
    Api(String),
}
