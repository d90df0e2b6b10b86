// src/io/socketcan/reader.rs
//
// SocketCAN driver adapter for Linux native CAN interfaces.
// Used with CANable Pro (Candlelight firmware), PEAK adapters under the
// kernel peak_usb driver, or any other netdev CAN hardware.
//
// Each channel handle is mapped to an interface name up front. Opening a
// channel parses the FD bitrate string, optionally reconfigures the interface
// through pkexec, and opens a non-blocking CAN FD socket. Reads never block:
// an empty socket reports QRCVEMPTY.
//
// This module is only fully functional on Linux.

use serde::{Deserialize, Serialize};

use crate::io::bitrate::FdTiming;

/// Interface backing one channel handle
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SocketCanConfig {
    /// CAN interface name (e.g., "can0", "vcan0")
    pub interface: String,
    /// Reconfigure the interface from the bitrate string when the channel opens.
    /// If false, the interface is used as already configured by the system.
    #[serde(default)]
    pub configure: bool,
}

/// Shell script that brings `interface` down, applies the FD timing and brings it back up.
pub fn ip_link_script(interface: &str, timing: &FdTiming) -> String {
    format!(
        "ip link set {iface} down && ip link set {iface} type can bitrate {bitrate} sjw {sjw} dbitrate {dbitrate} dsjw {dsjw} fd on && ip link set {iface} up",
        iface = interface,
        bitrate = timing.nominal_bitrate(),
        sjw = timing.nom_sjw,
        dbitrate = timing.data_bitrate(),
        dsjw = timing.data_sjw,
    )
}

#[cfg(target_os = "linux")]
mod linux_impl {
    use socketcan::{CanAnyFrame, CanFdSocket, EmbeddedFrame, Frame, Socket};
    use std::collections::HashMap;
    use std::sync::{Mutex, PoisonError};
    use std::time::Instant;

    use super::{ip_link_script, SocketCanConfig};
    use crate::io::bitrate::{BitrateConfig, FdTiming};
    use crate::io::driver::DriverAdapter;
    use crate::io::error::IoError;
    use crate::io::types::{
        len_to_dlc, message_type, ChannelId, HwTimestamp, RawFrame, ReadOutcome, Status,
    };
    use crate::tlog;

    // ============================================================================
    // Interface Configuration
    // ============================================================================

    /// Configure a SocketCAN interface using pkexec for privilege escalation.
    pub fn configure_interface(interface: &str, timing: &FdTiming) -> Result<(), IoError> {
        use std::process::Command;

        let device = format!("socketcan({})", interface);
        tlog!(
            "[socketcan] Configuring {} for {} / {} bit/s using pkexec",
            interface,
            timing.nominal_bitrate(),
            timing.data_bitrate()
        );

        let script = ip_link_script(interface, timing);
        let output = Command::new("pkexec")
            .args(["sh", "-c", &script])
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    IoError::configuration(
                        &device,
                        "pkexec not found. Install polkit or configure the interface manually.",
                    )
                } else {
                    IoError::configuration(&device, format!("Failed to run pkexec: {}", e))
                }
            })?;

        if output.status.success() {
            tlog!("[socketcan] Interface {} configured successfully", interface);
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.contains("dismissed") || stderr.contains("cancelled") {
            "Authentication cancelled by user".to_string()
        } else if stderr.contains("Not authorized") {
            "Not authorised to configure network interfaces".to_string()
        } else if !stderr.is_empty() {
            stderr.trim().to_string()
        } else if !stdout.is_empty() {
            stdout.trim().to_string()
        } else {
            format!("Exit code: {:?}", output.status.code())
        };
        Err(IoError::configuration(&device, detail))
    }

    // ============================================================================
    // Frame Conversion
    // ============================================================================

    /// Convert a socket frame to a driver frame. Error frames are skipped.
    fn convert_any_frame(frame: CanAnyFrame) -> Option<RawFrame> {
        match frame {
            CanAnyFrame::Normal(f) => Some(RawFrame {
                id: f.raw_id() & 0x1FFF_FFFF,
                dlc: f.len() as u8,
                msg_type: if f.is_extended() {
                    message_type::EXTENDED
                } else {
                    message_type::STANDARD
                },
                data: f.data().to_vec(),
            }),
            CanAnyFrame::Remote(f) => {
                let mut msg_type = message_type::RTR;
                if f.is_extended() {
                    msg_type |= message_type::EXTENDED;
                }
                Some(RawFrame {
                    id: f.raw_id() & 0x1FFF_FFFF,
                    dlc: f.dlc() as u8,
                    msg_type,
                    data: Vec::new(),
                })
            }
            CanAnyFrame::Fd(f) => {
                let mut msg_type = message_type::FD;
                if f.is_extended() {
                    msg_type |= message_type::EXTENDED;
                }
                if f.is_brs() {
                    msg_type |= message_type::BRS;
                }
                if f.is_esi() {
                    msg_type |= message_type::ESI;
                }
                Some(RawFrame {
                    id: f.raw_id() & 0x1FFF_FFFF,
                    dlc: len_to_dlc(f.data().len()),
                    msg_type,
                    data: f.data().to_vec(),
                })
            }
            CanAnyFrame::Error(_) => None,
        }
    }

    /// Map an OS read error to the driver status the drain sees, plus the
    /// error that gets logged for it.
    fn read_failure(device: &str, e: &std::io::Error) -> (Status, IoError) {
        let status = match e.raw_os_error() {
            Some(100) => Status::BUSOFF,   // ENETDOWN: interface went down
            Some(19) => Status::NODRIVER, // ENODEV: interface removed
            Some(105) => Status::QOVERRUN, // ENOBUFS
            _ => Status::ILLOPERATION,
        };
        (status, IoError::read(device, e.to_string()))
    }

    // ============================================================================
    // Driver Adapter
    // ============================================================================

    struct OpenSocket {
        socket: CanFdSocket,
        opened_at: Instant,
    }

    /// SocketCAN-backed driver adapter. Polling only; receive events are not supported.
    pub struct SocketCanDriver {
        interfaces: HashMap<ChannelId, SocketCanConfig>,
        sockets: Mutex<HashMap<ChannelId, OpenSocket>>,
    }

    impl SocketCanDriver {
        pub fn new(interfaces: HashMap<ChannelId, SocketCanConfig>) -> Self {
            Self {
                interfaces,
                sockets: Mutex::new(HashMap::new()),
            }
        }

        /// Driver with a single channel mapped to `interface`
        pub fn single(channel: ChannelId, interface: &str, configure: bool) -> Self {
            let mut interfaces = HashMap::new();
            interfaces.insert(
                channel,
                SocketCanConfig {
                    interface: interface.to_string(),
                    configure,
                },
            );
            Self::new(interfaces)
        }
    }

    impl DriverAdapter for SocketCanDriver {
        fn name(&self) -> &str {
            "socketcan"
        }

        fn open(&self, channel: ChannelId, bitrate: &BitrateConfig) -> Result<(), IoError> {
            let config = self.interfaces.get(&channel).ok_or_else(|| {
                IoError::configuration(
                    &format!("socketcan({})", channel),
                    "no interface mapped to this channel",
                )
            })?;
            let device = format!("socketcan({})", config.interface);

            let mut sockets = self.sockets.lock().unwrap_or_else(PoisonError::into_inner);
            if sockets.contains_key(&channel) {
                return Err(IoError::connection(&device, "channel is already initialized"));
            }

            if config.configure {
                let timing = FdTiming::parse(bitrate)
                    .map_err(|e| IoError::configuration(&device, e.to_string()))?;
                configure_interface(&config.interface, &timing)?;
            }

            let socket = CanFdSocket::open(&config.interface)
                .map_err(|e| IoError::connection(&device, e.to_string()))?;
            socket
                .set_nonblocking(true)
                .map_err(|e| IoError::protocol(&device, format!("set non-blocking: {}", e)))?;

            tlog!("[socketcan] Channel {} opened on {} (FD capable)", channel, config.interface);
            sockets.insert(
                channel,
                OpenSocket {
                    socket,
                    opened_at: Instant::now(),
                },
            );
            Ok(())
        }

        fn close(&self, channel: ChannelId) -> Result<(), IoError> {
            let mut sockets = self.sockets.lock().unwrap_or_else(PoisonError::into_inner);
            match sockets.remove(&channel) {
                Some(_) => {
                    tlog!("[socketcan] Channel {} closed", channel);
                    Ok(())
                }
                None => Err(IoError::connection(
                    &format!("socketcan({})", channel),
                    "channel is not initialized",
                )),
            }
        }

        fn read(&self, channel: ChannelId, with_timestamp: bool) -> ReadOutcome {
            let sockets = self.sockets.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(open) = sockets.get(&channel) else {
                return ReadOutcome::status(Status::INITIALIZE);
            };

            loop {
                match open.socket.read_frame() {
                    Ok(frame) => {
                        let Some(raw) = convert_any_frame(frame) else {
                            continue; // error frame
                        };
                        let timestamp = with_timestamp.then(|| {
                            HwTimestamp::from_micros(open.opened_at.elapsed().as_micros() as u64)
                        });
                        return ReadOutcome::frame(raw, timestamp);
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        return ReadOutcome::empty();
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let (status, error) =
                            read_failure(&format!("socketcan({})", channel), &e);
                        tlog!("[socketcan] {} ({})", error, status);
                        return ReadOutcome::status(status);
                    }
                }
            }
        }
    }

}

#[cfg(target_os = "linux")]
pub use linux_impl::{configure_interface, SocketCanDriver};

// ============================================================================
// Non-Linux Stub
// ============================================================================

#[cfg(not(target_os = "linux"))]
mod stub {
    use std::collections::HashMap;

    use super::SocketCanConfig;
    use crate::io::bitrate::{BitrateConfig, FdTiming};
    use crate::io::driver::DriverAdapter;
    use crate::io::error::IoError;
    use crate::io::types::{ChannelId, ReadOutcome, Status};

    pub fn configure_interface(interface: &str, _timing: &FdTiming) -> Result<(), IoError> {
        Err(IoError::unsupported(
            &format!("socketcan({})", interface),
            "SocketCAN on this platform",
        ))
    }

    /// SocketCAN driver (stub for non-Linux)
    pub struct SocketCanDriver {
        #[allow(dead_code)]
        interfaces: HashMap<ChannelId, SocketCanConfig>,
    }

    impl SocketCanDriver {
        pub fn new(interfaces: HashMap<ChannelId, SocketCanConfig>) -> Self {
            Self { interfaces }
        }

        pub fn single(channel: ChannelId, interface: &str, configure: bool) -> Self {
            let mut interfaces = HashMap::new();
            interfaces.insert(
                channel,
                SocketCanConfig {
                    interface: interface.to_string(),
                    configure,
                },
            );
            Self::new(interfaces)
        }
    }

    impl DriverAdapter for SocketCanDriver {
        fn name(&self) -> &str {
            "socketcan"
        }

        fn open(&self, channel: ChannelId, _bitrate: &BitrateConfig) -> Result<(), IoError> {
            Err(IoError::unsupported(
                &format!("socketcan({})", channel),
                "SocketCAN on this platform",
            ))
        }

        fn close(&self, channel: ChannelId) -> Result<(), IoError> {
            Err(IoError::connection(
                &format!("socketcan({})", channel),
                "channel is not initialized",
            ))
        }

        fn read(&self, _channel: ChannelId, _with_timestamp: bool) -> ReadOutcome {
            ReadOutcome::status(Status::NODRIVER)
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use stub::{configure_interface, SocketCanDriver};
