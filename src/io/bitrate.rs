// src/io/bitrate.rs
//
// CAN FD bitrate configuration.
//
// `BitrateConfig` is an opaque pass-through string handed to the driver at
// channel-open time, e.g.
//   "f_clock_mhz=20, nom_brp=5, nom_tseg1=2, nom_tseg2=1, nom_sjw=1,
//    data_brp=2, data_tseg1=3, data_tseg2=1, data_sjw=1"
//
// Drivers that need the numbers (SocketCAN) parse it with `FdTiming::parse`,
// so a bad string surfaces as an open error and never here.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::io::error::IoError;

/// Opaque CAN FD bitrate string.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BitrateConfig {
    value: String,
}

impl BitrateConfig {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Replace the whole string (last write wins)
    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = value.into();
    }
}

impl fmt::Display for BitrateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl From<&str> for BitrateConfig {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// ============================================================================
// Parsed Timing
// ============================================================================

/// Nominal and data phase timing parsed from a bitrate string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FdTiming {
    pub f_clock_mhz: u32,
    pub nom_brp: u32,
    pub nom_tseg1: u32,
    pub nom_tseg2: u32,
    pub nom_sjw: u32,
    pub data_brp: u32,
    pub data_tseg1: u32,
    pub data_tseg2: u32,
    pub data_sjw: u32,
}

const FD_TIMING_KEYS: [&str; 9] = [
    "f_clock_mhz",
    "nom_brp",
    "nom_tseg1",
    "nom_tseg2",
    "nom_sjw",
    "data_brp",
    "data_tseg1",
    "data_tseg2",
    "data_sjw",
];

impl FdTiming {
    /// Parse a bitrate string. Every key is required exactly once and must be
    /// a positive integer. `f_clock` (Hz) is accepted in place of `f_clock_mhz`.
    pub fn parse(config: &BitrateConfig) -> Result<Self, IoError> {
        let device = "bitrate";
        let mut values: [Option<u32>; 9] = [None; 9];

        for field in config.value().split(',') {
            let field = field.trim();
            if field.is_empty() {
                continue;
            }
            let (key, raw) = field
                .split_once('=')
                .ok_or_else(|| IoError::configuration(device, format!("expected key=value, got '{}'", field)))?;
            let key = key.trim();
            let mut value: u32 = raw.trim().parse().map_err(|_| {
                IoError::configuration(device, format!("{} is not a number: '{}'", key, raw.trim()))
            })?;

            let slot = if key == "f_clock" {
                if value % 1_000_000 != 0 {
                    return Err(IoError::configuration(
                        device,
                        format!("f_clock {} is not a whole number of MHz", value),
                    ));
                }
                value /= 1_000_000;
                0
            } else {
                FD_TIMING_KEYS
                    .iter()
                    .position(|k| *k == key)
                    .ok_or_else(|| IoError::configuration(device, format!("unknown key '{}'", key)))?
            };

            if value == 0 {
                return Err(IoError::configuration(device, format!("{} must be non-zero", key)));
            }
            if values[slot].replace(value).is_some() {
                return Err(IoError::configuration(device, format!("duplicate key '{}'", FD_TIMING_KEYS[slot])));
            }
        }

        let mut parsed = [0u32; 9];
        for (i, v) in values.iter().enumerate() {
            parsed[i] = v.ok_or_else(|| {
                IoError::configuration(device, format!("missing key '{}'", FD_TIMING_KEYS[i]))
            })?;
        }

        let timing = Self {
            f_clock_mhz: parsed[0],
            nom_brp: parsed[1],
            nom_tseg1: parsed[2],
            nom_tseg2: parsed[3],
            nom_sjw: parsed[4],
            data_brp: parsed[5],
            data_tseg1: parsed[6],
            data_tseg2: parsed[7],
            data_sjw: parsed[8],
        };
        for (phase, rate) in [
            ("nominal", timing.checked_nominal()),
            ("data", timing.checked_data()),
        ] {
            match rate {
                Some(r) if r > 0 => {}
                _ => {
                    return Err(IoError::configuration(
                        device,
                        format!("{} bitrate out of range for '{}'", phase, config),
                    ))
                }
            }
        }
        Ok(timing)
    }

    fn checked_nominal(&self) -> Option<u32> {
        bitrate(self.f_clock_mhz, self.nom_brp, self.nom_tseg1, self.nom_tseg2)
    }

    fn checked_data(&self) -> Option<u32> {
        bitrate(self.f_clock_mhz, self.data_brp, self.data_tseg1, self.data_tseg2)
    }

    /// Nominal (arbitration) phase bitrate in bits/second.
    /// 0 if the fields were set by hand to values `parse` would reject.
    pub fn nominal_bitrate(&self) -> u32 {
        self.checked_nominal().unwrap_or(0)
    }

    /// Data phase bitrate in bits/second
    pub fn data_bitrate(&self) -> u32 {
        self.checked_data().unwrap_or(0)
    }
}

/// `f_clock / (brp * (1 + tseg1 + tseg2))`, `None` if it does not fit a u32
fn bitrate(f_clock_mhz: u32, brp: u32, tseg1: u32, tseg2: u32) -> Option<u32> {
    let clock_hz = f_clock_mhz as u64 * 1_000_000;
    let quanta = (brp as u64).checked_mul(1 + tseg1 as u64 + tseg2 as u64)?;
    if quanta == 0 {
        return None;
    }
    u32::try_from(clock_hz / quanta).ok()
}
