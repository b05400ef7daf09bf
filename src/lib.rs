//! Wand Controller
//!
//! Drives a battery-powered BLE wand: connection supervision with keepalive,
//! macro encoding with MTU-aware chunked writes, telemetry decoding, opcode
//! discovery and a raw sniffer over every notifiable characteristic.

pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod presentation;

pub use error::{WandError, WandResult};
