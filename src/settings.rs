// src/settings.rs
//
// Receiver settings, read from a TOML file. Settings are only ever read;
// nothing here writes them back.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::io::{BitrateConfig, ChannelId};
use crate::receive::{DeliveryMode, FaultPolicy, KeyPolicy, ReceiveOptions};
use crate::tlog;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ReceiverSettings {
    /// Hardware channel handle (e.g. 0x51)
    #[serde(default = "default_channel")]
    pub channel: u16,
    /// SocketCAN interface backing the channel (Linux), e.g. "can0"
    #[serde(default)]
    pub interface: Option<String>,
    /// CAN FD bitrate string passed to the driver at open time
    #[serde(default)]
    pub bitrate: Option<BitrateConfig>,
    /// Reconfigure the interface (pkexec ip link) from `bitrate` before opening
    #[serde(default)]
    pub configure_interface: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub read_timestamp: bool,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    #[serde(default)]
    pub key_policy: KeyPolicy,
    #[serde(default)]
    pub fault_policy: FaultPolicy,
    #[serde(default = "default_message_capacity")]
    pub message_capacity: usize,
    /// Directory for log files (None = stderr only)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_channel() -> u16 {
    0x51 // first USB channel
}
fn default_poll_interval_ms() -> u64 {
    10
}
fn default_message_capacity() -> usize {
    256
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            interface: None,
            bitrate: None,
            configure_interface: false,
            poll_interval_ms: default_poll_interval_ms(),
            read_timestamp: false,
            delivery_mode: DeliveryMode::default(),
            key_policy: KeyPolicy::default(),
            fault_policy: FaultPolicy::default(),
            message_capacity: default_message_capacity(),
            log_dir: None,
        }
    }
}

impl ReceiverSettings {
    pub fn from_toml(content: &str) -> Result<Self, String> {
        let settings: ReceiverSettings =
            toml::from_str(content).map_err(|e| format!("Failed to parse settings: {}", e))?;
        if settings.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be at least 1".to_string());
        }
        Ok(settings)
    }

    pub fn channel_id(&self) -> ChannelId {
        ChannelId(self.channel)
    }

    /// Bitrate to open with; empty string when none is configured
    pub fn bitrate_or_default(&self) -> BitrateConfig {
        self.bitrate.clone().unwrap_or_else(|| BitrateConfig::new(""))
    }

    pub fn receive_options(&self) -> ReceiveOptions {
        ReceiveOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            read_timestamp: self.read_timestamp,
            delivery_mode: self.delivery_mode,
            fault_policy: self.fault_policy,
            message_capacity: self.message_capacity,
        }
    }
}

/// `<config dir>/wiretap/receiver.toml`
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("wiretap").join("receiver.toml"))
}

/// Load settings from `path`. A missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<ReceiverSettings, String> {
    if !path.exists() {
        tlog!("[settings] {} not found, using defaults", path.display());
        return Ok(ReceiverSettings::default());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    let settings = ReceiverSettings::from_toml(&content)?;
    tlog!("[settings] Loaded {}", path.display());
    Ok(settings)
}
