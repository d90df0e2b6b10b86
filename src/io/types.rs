// src/io/types.rs
//
// Shared driver-level types: channel identifiers, read status codes,
// raw frames as delivered by hardware, and receive timestamps.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Channel Identifiers
// ============================================================================

/// Opaque hardware channel handle (PCAN-style 16-bit handle, e.g. 0x51 = USB 1).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u16);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

// ============================================================================
// Status Codes
// ============================================================================

/// Driver status returned by every read. Bit set; several conditions can be
/// reported at once (e.g. a frame delivered together with `QRCVEMPTY`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Status(pub u32);

impl Status {
    pub const OK: Status = Status(0x0000_0000);
    pub const XMTFULL: Status = Status(0x0000_0001);
    pub const OVERRUN: Status = Status(0x0000_0002);
    pub const BUSLIGHT: Status = Status(0x0000_0004);
    pub const BUSHEAVY: Status = Status(0x0000_0008);
    pub const BUSWARNING: Status = Status::BUSHEAVY;
    pub const BUSOFF: Status = Status(0x0000_0010);
    pub const QRCVEMPTY: Status = Status(0x0000_0020);
    pub const QOVERRUN: Status = Status(0x0000_0040);
    pub const QXMTFULL: Status = Status(0x0000_0080);
    pub const REGTEST: Status = Status(0x0000_0100);
    pub const NODRIVER: Status = Status(0x0000_0200);
    pub const ILLHW: Status = Status(0x0000_1400);
    pub const ILLNET: Status = Status(0x0000_1800);
    pub const ILLPARAMVAL: Status = Status(0x0000_8000);
    pub const UNKNOWN: Status = Status(0x0001_0000);
    pub const BUSPASSIVE: Status = Status(0x0004_0000);
    pub const INITIALIZE: Status = Status(0x0400_0000);
    pub const ILLOPERATION: Status = Status(0x0800_0000);

    const NAMES: &'static [(Status, &'static str)] = &[
        (Status::XMTFULL, "XMTFULL"),
        (Status::OVERRUN, "OVERRUN"),
        (Status::BUSLIGHT, "BUSLIGHT"),
        (Status::BUSHEAVY, "BUSHEAVY"),
        (Status::BUSOFF, "BUSOFF"),
        (Status::QRCVEMPTY, "QRCVEMPTY"),
        (Status::QOVERRUN, "QOVERRUN"),
        (Status::QXMTFULL, "QXMTFULL"),
        (Status::REGTEST, "REGTEST"),
        (Status::NODRIVER, "NODRIVER"),
        (Status::ILLHW, "ILLHW"),
        (Status::ILLNET, "ILLNET"),
        (Status::ILLPARAMVAL, "ILLPARAMVAL"),
        (Status::UNKNOWN, "UNKNOWN"),
        (Status::BUSPASSIVE, "BUSPASSIVE"),
        (Status::INITIALIZE, "INITIALIZE"),
        (Status::ILLOPERATION, "ILLOPERATION"),
    ];

    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Queue-empty bit is set (possibly together with a delivered frame)
    pub fn is_queue_empty(self) -> bool {
        self.contains(Status::QRCVEMPTY)
    }

    pub fn contains(self, other: Status) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// Status with the queue-empty bit removed
    pub fn without_queue_empty(self) -> Status {
        Status(self.0 & !Status::QRCVEMPTY.0)
    }

    pub fn union(self, other: Status) -> Status {
        Status(self.0 | other.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return write!(f, "OK");
        }
        if let Some((_, name)) = Status::NAMES.iter().find(|(s, _)| s == self) {
            return write!(f, "{}", name);
        }
        // ILLHW and ILLNET share bits, so only exact matches get a name
        let names: Vec<&str> = Status::NAMES
            .iter()
            .filter(|(s, _)| s.0.count_ones() == 1 && self.contains(*s))
            .map(|(_, n)| *n)
            .collect();
        let known: u32 = Status::NAMES
            .iter()
            .filter(|(s, _)| s.0.count_ones() == 1)
            .fold(0, |acc, (s, _)| acc | s.0);
        if names.is_empty() || self.0 & !known != 0 {
            write!(f, "0x{:08X}", self.0)
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

// ============================================================================
// Raw Frames
// ============================================================================

/// Message type bits as delivered with each frame
pub mod message_type {
    pub const STANDARD: u8 = 0x00;
    pub const RTR: u8 = 0x01;
    pub const EXTENDED: u8 = 0x02;
    pub const FD: u8 = 0x04;
    pub const BRS: u8 = 0x08;
    pub const ESI: u8 = 0x10;
    pub const ERRFRAME: u8 = 0x40;
    pub const STATUS: u8 = 0x80;
}

/// Maximum standard (11-bit) identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;
/// Maximum extended (29-bit) identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// One CAN / CAN FD frame exactly as the driver delivered it.
/// Not validated; `FrameRecord::from_raw` checks it before storage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFrame {
    pub id: u32,
    /// Data length code (0-8 classic, 0-15 FD)
    pub dlc: u8,
    /// Message type bits (see `message_type`)
    pub msg_type: u8,
    pub data: Vec<u8>,
}

impl RawFrame {
    /// Classic standard-id data frame
    pub fn standard(id: u32, data: &[u8]) -> Self {
        Self {
            id,
            dlc: data.len() as u8,
            msg_type: message_type::STANDARD,
            data: data.to_vec(),
        }
    }

    /// Classic extended-id data frame
    pub fn extended(id: u32, data: &[u8]) -> Self {
        Self {
            id,
            dlc: data.len() as u8,
            msg_type: message_type::EXTENDED,
            data: data.to_vec(),
        }
    }

    /// CAN FD frame; `dlc` is derived from the payload length
    pub fn fd(id: u32, extended: bool, brs: bool, data: &[u8]) -> Self {
        let mut msg_type = message_type::FD;
        if extended {
            msg_type |= message_type::EXTENDED;
        }
        if brs {
            msg_type |= message_type::BRS;
        }
        Self {
            id,
            dlc: len_to_dlc(data.len()),
            msg_type,
            data: data.to_vec(),
        }
    }

    pub fn is_extended(&self) -> bool {
        self.msg_type & message_type::EXTENDED != 0
    }

    pub fn is_fd(&self) -> bool {
        self.msg_type & message_type::FD != 0
    }

    pub fn is_rtr(&self) -> bool {
        self.msg_type & message_type::RTR != 0
    }
}

/// Payload length for a DLC. Classic frames cap at 8; FD maps 9-15 to 12-64.
pub fn dlc_to_len(dlc: u8, fd: bool) -> Option<usize> {
    match dlc {
        0..=8 => Some(dlc as usize),
        9..=15 if !fd => None,
        9 => Some(12),
        10 => Some(16),
        11 => Some(20),
        12 => Some(24),
        13 => Some(32),
        14 => Some(48),
        15 => Some(64),
        _ => None,
    }
}

/// Smallest DLC able to carry `len` bytes
pub fn len_to_dlc(len: usize) -> u8 {
    match len {
        0..=8 => len as u8,
        9..=12 => 9,
        13..=16 => 10,
        17..=20 => 11,
        21..=24 => 12,
        25..=32 => 13,
        33..=48 => 14,
        _ => 15,
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// Hardware receive timestamp (milliseconds with overflow counter plus
/// microsecond remainder).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwTimestamp {
    pub millis: u32,
    pub millis_overflow: u16,
    pub micros: u16,
}

impl HwTimestamp {
    pub fn from_micros(total: u64) -> Self {
        let total_ms = total / 1000;
        Self {
            millis: (total_ms & 0xFFFF_FFFF) as u32,
            millis_overflow: ((total_ms >> 32) & 0xFFFF) as u16,
            micros: (total % 1000) as u16,
        }
    }

    /// Monotonic microseconds since the driver's epoch
    pub fn total_micros(&self) -> u64 {
        let ms = ((self.millis_overflow as u64) << 32) | self.millis as u64;
        ms * 1000 + self.micros as u64
    }
}

// ============================================================================
// Read Outcome
// ============================================================================

/// Result of one non-blocking driver read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadOutcome {
    pub status: Status,
    /// Present when the driver delivered a frame on this read
    pub frame: Option<RawFrame>,
    /// Present only when a timestamp was requested and the driver has one
    pub timestamp: Option<HwTimestamp>,
}

impl ReadOutcome {
    pub fn frame(frame: RawFrame, timestamp: Option<HwTimestamp>) -> Self {
        Self {
            status: Status::OK,
            frame: Some(frame),
            timestamp,
        }
    }

    /// Frame delivered together with the queue-empty bit (last buffered frame)
    pub fn last_frame(frame: RawFrame, timestamp: Option<HwTimestamp>) -> Self {
        Self {
            status: Status::QRCVEMPTY,
            frame: Some(frame),
            timestamp,
        }
    }

    pub fn empty() -> Self {
        Self::status(Status::QRCVEMPTY)
    }

    pub fn status(status: Status) -> Self {
        Self {
            status,
            frame: None,
            timestamp: None,
        }
    }
}
