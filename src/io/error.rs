// src/io/error.rs
//
// Typed errors for channel drivers and the receive pipeline.
// Every variant carries the device it came from so log lines and consumer
// messages can say which channel failed.

use std::fmt;

/// Error raised by a driver adapter or the receive worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IoError {
    /// Could not open or reach the device
    Connection { device: String, message: String },
    /// The device sent something we could not interpret
    Protocol { device: String, message: String },
    /// A read failed at the OS / driver level
    Read { device: String, message: String },
    /// Invalid configuration (bitrate string, interface name, ...)
    Configuration { device: String, message: String },
    /// The driver does not support the requested feature
    Unsupported { device: String, feature: String },
    /// Receive-path corruption: a frame could not be turned into a record
    Fatal { device: String, message: String },
}

impl IoError {
    pub fn connection(device: &str, message: impl Into<String>) -> Self {
        Self::Connection {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn protocol(device: &str, message: impl Into<String>) -> Self {
        Self::Protocol {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn read(device: &str, message: impl Into<String>) -> Self {
        Self::Read {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn configuration(device: &str, message: impl Into<String>) -> Self {
        Self::Configuration {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn unsupported(device: &str, feature: impl Into<String>) -> Self {
        Self::Unsupported {
            device: device.to_string(),
            feature: feature.into(),
        }
    }

    pub fn fatal(device: &str, message: impl Into<String>) -> Self {
        Self::Fatal {
            device: device.to_string(),
            message: message.into(),
        }
    }

    /// Device the error originated from
    pub fn device(&self) -> &str {
        match self {
            Self::Connection { device, .. }
            | Self::Protocol { device, .. }
            | Self::Read { device, .. }
            | Self::Configuration { device, .. }
            | Self::Unsupported { device, .. }
            | Self::Fatal { device, .. } => device,
        }
    }

    /// True for receive-path corruption that the fault policy must handle
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection { device, message } => {
                write!(f, "{}: connection failed: {}", device, message)
            }
            Self::Protocol { device, message } => {
                write!(f, "{}: protocol error: {}", device, message)
            }
            Self::Read { device, message } => write!(f, "{}: read error: {}", device, message),
            Self::Configuration { device, message } => {
                write!(f, "{}: invalid configuration: {}", device, message)
            }
            Self::Unsupported { device, feature } => {
                write!(f, "{}: {} is not supported", device, feature)
            }
            Self::Fatal { device, message } => {
                write!(f, "{}: fatal receive error: {}", device, message)
            }
        }
    }
}

impl std::error::Error for IoError {}

impl From<IoError> for String {
    fn from(err: IoError) -> Self {
        err.to_string()
    }
}
