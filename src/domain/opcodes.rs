//! Opcode table and opcode discovery probe
//!
//! The table maps each [`CommandKind`] to the one-byte opcode the wand
//! expects. It is read at encode time, so edits apply to the next cast.

use crate::domain::models::CommandKind;
use crate::error::WandError;
use serde::{Deserialize, Serialize};

/// First value sent by the discovery probe
pub const PROBE_START: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpcodeTable {
    pub clear_leds: u8,
    pub buzz: u8,
    pub change_led: u8,
}

impl Default for OpcodeTable {
    fn default() -> Self {
        Self {
            clear_leds: 0xAA,
            buzz: 0xBB,
            change_led: 0xCC,
        }
    }
}

impl OpcodeTable {
    pub fn get(&self, kind: CommandKind) -> u8 {
        match kind {
            CommandKind::ClearLeds => self.clear_leds,
            CommandKind::Buzz => self.buzz,
            CommandKind::ChangeLed => self.change_led,
        }
    }

    pub fn set(&mut self, kind: CommandKind, opcode: u8) {
        match kind {
            CommandKind::ClearLeds => self.clear_leds = opcode,
            CommandKind::Buzz => self.buzz = opcode,
            CommandKind::ChangeLed => self.change_led = opcode,
        }
    }

    /// Set from user input: `0x`-prefixed hex or decimal, within 0..=255.
    /// Invalid input leaves the table untouched.
    pub fn set_from_str(&mut self, kind: CommandKind, input: &str) -> Result<u8, WandError> {
        let opcode = parse_opcode(input)?;
        self.set(kind, opcode);
        Ok(opcode)
    }

    /// Resolve which command kind an opcode belongs to.
    /// When two kinds share an opcode the first in [`CommandKind::ALL`] wins.
    pub fn lookup(&self, opcode: u8) -> Option<CommandKind> {
        CommandKind::ALL
            .into_iter()
            .find(|kind| self.get(*kind) == opcode)
    }
}

fn parse_opcode(input: &str) -> Result<u8, WandError> {
    let trimmed = input.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => trimmed.parse::<u8>(),
    };
    parsed.map_err(|_| WandError::InvalidOpcode(input.to_string()))
}

/// Exhaustive one-byte scan used to find opcodes empirically.
///
/// Each step yields the current probe value and advances; once 0xFF has
/// been handed out the probe deactivates itself and rewinds to 0x01.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSequence {
    active: bool,
    next: u16,
}

impl Default for ProbeSequence {
    fn default() -> Self {
        Self {
            active: false,
            next: PROBE_START as u16,
        }
    }
}

impl ProbeSequence {
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Value the next step will send
    pub fn current(&self) -> u8 {
        self.next as u8
    }

    pub fn activate(&mut self) {
        self.active = true;
        self.next = PROBE_START as u16;
    }

    pub fn deactivate(&mut self) {
        self.active = false;
        self.next = PROBE_START as u16;
    }

    /// Value to send for this step, or `None` while inactive.
    /// Does not advance; call [`ProbeSequence::advance`] once the byte is out.
    pub fn peek(&self) -> Option<u8> {
        self.active.then(|| self.current())
    }

    /// Move past the value just sent. Returns `true` when the scan is done.
    pub fn advance(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.next += 1;
        if self.next > u8::MAX as u16 {
            self.deactivate();
            return true;
        }
        false
    }
}
