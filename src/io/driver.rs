// src/io/driver.rs
//
// Driver adapter seam between the receive pipeline and the native hardware API.
//
// The receive worker only ever needs a non-blocking single-frame read and,
// optionally, a way to be told that frames are waiting. Channel open/close
// belong to the code that owns the channel; they live here so one adapter
// value covers the whole hardware API.

use std::sync::Arc;

use crate::io::bitrate::BitrateConfig;
use crate::io::error::IoError;
use crate::io::types::{ChannelId, ReadOutcome};

/// Callback invoked by a driver when a receive event fires for a channel.
/// May be called from any thread.
pub type RcvEventCallback = Arc<dyn Fn(ChannelId) + Send + Sync>;

/// Native hardware API as seen by the receive pipeline.
pub trait DriverAdapter: Send + Sync {
    /// Short device name used in log lines and errors (e.g. "socketcan")
    fn name(&self) -> &str;

    /// Initialise a channel. The bitrate string is passed through unmodified;
    /// an invalid string is reported here.
    fn open(&self, channel: ChannelId, bitrate: &BitrateConfig) -> Result<(), IoError>;

    /// Release a channel. Reads on a closed channel report a fault status.
    fn close(&self, channel: ChannelId) -> Result<(), IoError>;

    /// Read one frame without blocking. The timestamp is only filled when
    /// `with_timestamp` is set.
    fn read(&self, channel: ChannelId, with_timestamp: bool) -> ReadOutcome;

    /// Whether `set_receive_event` can be used
    fn supports_events(&self) -> bool {
        false
    }

    /// Register (`Some`) or remove (`None`) the receive-event callback for a channel.
    fn set_receive_event(
        &self,
        channel: ChannelId,
        callback: Option<RcvEventCallback>,
    ) -> Result<(), IoError> {
        let _ = (channel, callback);
        Err(IoError::unsupported(self.name(), "receive events"))
    }
}
