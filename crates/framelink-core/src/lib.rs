pub mod config;
pub mod errors;
pub mod types;

pub use config::{EncodingProfile, RecorderConfig, SourceConfig};
pub use errors::{ComposeError, DeviceError, FrameLinkError};
pub use types::*;
