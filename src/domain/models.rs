use crate::domain::telemetry::LogEntry;
use crate::error::WandError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Longest duration the wand firmware accepts for a timed effect
pub const MAX_DURATION_MS: u16 = 32767;

/// Link state of a session, observed read-only by the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    /// Whether a new connect attempt may start from this state
    pub fn accepts_connect(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// Events emitted to whoever renders the engine's state
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// Controller link changed state
    ConnectionState(ConnectionState),
    /// Sniffer link changed state
    SnifferState(ConnectionState),
    /// A new entry was appended to the telemetry log
    Telemetry(LogEntry),
}

/// LED color, one byte per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse `RRGGBB`, with or without a leading `#`
    pub fn from_hex(input: &str) -> Result<Self, WandError> {
        let digits = input.trim().trim_start_matches('#');
        if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(WandError::InvalidColor(input.to_string()));
        }

        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&digits[range], 16)
                .map_err(|_| WandError::InvalidColor(input.to_string()))
        };

        Ok(Self {
            r: channel(0..2)?,
            g: channel(2..4)?,
            b: channel(4..6)?,
        })
    }
}

/// The three command kinds the wand understands, keyed into the opcode table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    ClearLeds,
    Buzz,
    ChangeLed,
}

impl CommandKind {
    pub const ALL: [CommandKind; 3] = [Self::ClearLeds, Self::Buzz, Self::ChangeLed];

    /// Fixed wire size of one command of this kind, opcode included
    pub const fn encoded_len(self) -> usize {
        match self {
            Self::ClearLeds => 1,
            Self::Buzz => 3,
            Self::ChangeLed => 7,
        }
    }
}

impl FromStr for CommandKind {
    type Err = WandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "clear" | "clearleds" | "clear_leds" => Ok(Self::ClearLeds),
            "buzz" => Ok(Self::Buzz),
            "led" | "changeled" | "change_led" => Ok(Self::ChangeLed),
            _ => Err(WandError::InvalidCommand(s.to_string())),
        }
    }
}

/// One effect in a macro
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacroCommand {
    ClearLeds,
    Buzz {
        duration_ms: u16,
    },
    ChangeLed {
        group_id: u8,
        color: Rgb,
        duration_ms: u16,
    },
}

impl MacroCommand {
    /// Buzz for `duration_ms`, capped at [`MAX_DURATION_MS`]
    pub fn buzz(duration_ms: u32) -> Self {
        Self::Buzz {
            duration_ms: clamp_duration(duration_ms),
        }
    }

    /// Light an LED group for `duration_ms`, capped at [`MAX_DURATION_MS`]
    pub fn change_led(group_id: u8, color: Rgb, duration_ms: u32) -> Self {
        Self::ChangeLed {
            group_id,
            color,
            duration_ms: clamp_duration(duration_ms),
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Self::ClearLeds => CommandKind::ClearLeds,
            Self::Buzz { .. } => CommandKind::Buzz,
            Self::ChangeLed { .. } => CommandKind::ChangeLed,
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.kind().encoded_len()
    }
}

fn clamp_duration(duration_ms: u32) -> u16 {
    duration_ms.min(MAX_DURATION_MS as u32) as u16
}

/// Text form: `clear`, `buzz <ms>`, `led <group> <RRGGBB> <ms>`
impl FromStr for MacroCommand {
    type Err = WandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || WandError::InvalidCommand(s.trim().to_string());
        let mut parts = s.split_whitespace();
        let kind: CommandKind = parts.next().ok_or_else(invalid)?.parse()?;

        let duration = |token: Option<&str>| -> Result<u32, WandError> {
            token.ok_or_else(invalid)?.parse().map_err(|_| invalid())
        };

        let command = match kind {
            CommandKind::ClearLeds => Self::ClearLeds,
            CommandKind::Buzz => Self::buzz(duration(parts.next())?),
            CommandKind::ChangeLed => {
                let group_id = parts
                    .next()
                    .ok_or_else(invalid)?
                    .parse()
                    .map_err(|_| invalid())?;
                let color = Rgb::from_hex(parts.next().ok_or_else(invalid)?)?;
                Self::change_led(group_id, color, duration(parts.next())?)
            }
        };

        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(command)
    }
}

/// Ordered list of commands cast in one transmission
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Macro {
    commands: Vec<MacroCommand>,
}

impl Macro {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: MacroCommand) {
        self.commands.push(command);
    }

    pub fn commands(&self) -> &[MacroCommand] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Total bytes this macro occupies on the wire
    pub fn encoded_len(&self) -> usize {
        self.commands.iter().map(MacroCommand::encoded_len).sum()
    }
}

impl From<Vec<MacroCommand>> for Macro {
    fn from(commands: Vec<MacroCommand>) -> Self {
        Self { commands }
    }
}

/// `;`-separated command list, e.g. `clear; buzz 300; led 0 FF00FF 500`
impl FromStr for Macro {
    type Err = WandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(';')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()
            .map(Self::from)
    }
}
