//! Wand Protocol
//!
//! Wire constants plus the frame codec: macro commands are encoded into
//! opcode byte sequences, inbound notifications are classified into
//! telemetry frames.

use crate::domain::models::{MacroCommand, MAX_DURATION_MS};
use crate::domain::opcodes::OpcodeTable;
use crate::domain::telemetry::TelemetryFrame;
use crate::error::WandError;
use tracing::trace;
use uuid::Uuid;

/// Advertised name prefix of every wand
pub const DEVICE_NAME_PREFIX: &str = "MCW";

/// Vendor base service, a discovery hint for the sniffer
pub const VENDOR_SERVICE_UUID: Uuid = Uuid::from_u128(0x57420000_587e_4365_b68b_c0f8bbdd8c2c);

/// Primary service holding both wand characteristics
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x57420001_587e_4365_b68b_c0f8bbdd8c2c);

/// Characteristic commands are written to (write without response)
pub const WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x57420002_587e_4365_b68b_c0f8bbdd8c2c);

/// Characteristic telemetry is notified on
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x57420003_587e_4365_b68b_c0f8bbdd8c2c);

/// Heartbeat written while connected
pub const HEARTBEAT: u8 = 0x01;

/// Heartbeat period in milliseconds
pub const KEEPALIVE_INTERVAL_MS: u64 = 5000;

/// Largest payload deliverable in one write
pub const CHUNK_SIZE: usize = 20;

/// Pause after each chunk so the wand's receive buffer can drain
pub const CHUNK_DELAY_MS: u64 = 20;

/// Delay before an errored session falls back to disconnected
pub const ERROR_REVERT_MS: u64 = 3000;

/// Upper bound for one scan + connect + discovery attempt
pub const CONNECT_TIMEOUT_MS: u64 = 15_000;

/// Bytes preceding the spell name in a notification
pub const FRAME_HEADER_LEN: usize = 4;

/// Shortest notification that may carry a spell name
pub const MIN_SPELL_FRAME_LEN: usize = FRAME_HEADER_LEN + 3;

/// Encode a macro for the write characteristic.
///
/// Per command, in macro order:
///
/// ```text
/// ClearLeds : [op]
/// Buzz      : [op, dur_lo, dur_hi]
/// ChangeLed : [op, group, r, g, b, dur_lo, dur_hi]
/// ```
///
/// Durations are little-endian and capped at 32767 ms.
pub fn encode_macro(commands: &[MacroCommand], opcodes: &OpcodeTable) -> Vec<u8> {
    let capacity = commands.iter().map(MacroCommand::encoded_len).sum();
    let mut bytes = Vec::with_capacity(capacity);

    for command in commands {
        bytes.push(opcodes.get(command.kind()));
        match *command {
            MacroCommand::ClearLeds => {}
            MacroCommand::Buzz { duration_ms } => {
                bytes.extend_from_slice(&duration_le(duration_ms));
            }
            MacroCommand::ChangeLed {
                group_id,
                color,
                duration_ms,
            } => {
                bytes.extend_from_slice(&[group_id, color.r, color.g, color.b]);
                bytes.extend_from_slice(&duration_le(duration_ms));
            }
        }
    }

    trace!("Encoded {} commands into {} bytes", commands.len(), bytes.len());
    bytes
}

fn duration_le(duration_ms: u16) -> [u8; 2] {
    duration_ms.min(MAX_DURATION_MS).to_le_bytes()
}

/// Classify a notification from the wand's notify characteristic.
///
/// # Frame Structure
///
/// ```text
/// [0-3] : Header
/// [4..] : Spell name, ASCII, NUL padded
/// ```
///
/// Anything shorter than [`MIN_SPELL_FRAME_LEN`], not valid UTF-8, or blank
/// after trimming becomes a raw frame. Never fails.
pub fn decode_notification(payload: &[u8]) -> TelemetryFrame {
    match spell_name(payload) {
        Some(name) => TelemetryFrame::Spell {
            name,
            hex: hex_compact(payload),
        },
        None => TelemetryFrame::Raw {
            hex: hex_compact(payload),
            characteristic: None,
        },
    }
}

fn spell_name(payload: &[u8]) -> Option<String> {
    if payload.len() < MIN_SPELL_FRAME_LEN {
        return None;
    }

    let text = std::str::from_utf8(&payload[FRAME_HEADER_LEN..]).ok()?;
    let name = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if name.is_empty() {
        return None;
    }
    Some(name.to_uppercase())
}

/// Classify a notification captured by the sniffer: always raw, tagged
/// with the characteristic it arrived on.
pub fn decode_sniffed(characteristic: Uuid, payload: &[u8]) -> TelemetryFrame {
    TelemetryFrame::Raw {
        hex: hex_spaced(payload),
        characteristic: Some(characteristic),
    }
}

/// Lowercase hex, no separator (`0102ff`)
pub fn hex_compact(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Lowercase hex, space separated (`01 02 ff`)
pub fn hex_spaced(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a UUID string from settings
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid, WandError> {
    Uuid::parse_str(uuid_str.trim()).map_err(|_| WandError::InvalidUuid(uuid_str.to_string()))
}
