// src/io/mod.rs
//
// Driver-facing side of the receive pipeline: the adapter trait the worker
// reads through, the types it exchanges, and the concrete adapters
// (scripted playback, Linux SocketCAN).

// Core modules
mod bitrate;
mod driver;
mod error;
mod types;

// Drivers
mod scripted;
pub mod socketcan;

pub use bitrate::{BitrateConfig, FdTiming};
pub use driver::{DriverAdapter, RcvEventCallback};
pub use error::IoError;
pub use scripted::ScriptedDriver;
pub use types::{
    dlc_to_len, len_to_dlc, message_type, ChannelId, HwTimestamp, RawFrame, ReadOutcome, Status,
    MAX_EXTENDED_ID, MAX_STANDARD_ID,
};
