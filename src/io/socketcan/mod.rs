// src/io/socketcan/mod.rs
//
// SocketCAN driver adapter for Linux native CAN interfaces.
//
// The interface can be configured by the adapter itself (pkexec) or set up
// beforehand, e.g.:
//   sudo ip link set can0 up type can bitrate 500000 dbitrate 2000000 fd on
//
// This module is only fully functional on Linux.

mod reader;

pub use reader::{configure_interface, ip_link_script, SocketCanConfig, SocketCanDriver};
