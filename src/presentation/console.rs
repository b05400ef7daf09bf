//! Console front end
//!
//! Maps text lines onto session intents and prints everything the engine
//! publishes. Stands in for a UI: it never touches the transport directly.

use crate::domain::models::{AppEvent, CommandKind, Macro};
use crate::domain::settings::SettingsService;
use crate::domain::telemetry::{EventSink, LogEntry, TelemetryFrame};
use crate::error::WandError;
use crate::infrastructure::bluetooth::service::ProbeOutcome;
use crate::infrastructure::bluetooth::{SessionHandle, SnifferHandle};
use std::str::FromStr;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub const HELP: &str = "\
commands:
  connect | disconnect
  cast <macro>            e.g. cast clear; buzz 300; led 0 FF00FF 500
  opcode                  show the opcode table
  opcode <kind> <value>   kind: clear | buzz | led, value: 0xAA or 170
  probe start | step | stop
  sniff start | stop
  log                     dump the telemetry log
  help | quit";

/// One parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Connect,
    Disconnect,
    Cast(Macro),
    ShowOpcodes,
    SetOpcode(CommandKind, String),
    ProbeStart,
    ProbeStep,
    ProbeStop,
    SniffStart,
    SniffStop,
    ShowLog,
    Help,
    Quit,
}

impl FromStr for Intent {
    type Err = WandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        let invalid = || WandError::InvalidCommand(line.to_string());

        match (verb.to_ascii_lowercase().as_str(), rest) {
            ("connect", "") => Ok(Self::Connect),
            ("disconnect", "") => Ok(Self::Disconnect),
            ("cast", text) => Ok(Self::Cast(text.parse()?)),
            ("opcode", "") => Ok(Self::ShowOpcodes),
            ("opcode", args) => {
                let (kind, value) = args.split_once(char::is_whitespace).ok_or_else(invalid)?;
                Ok(Self::SetOpcode(kind.parse()?, value.trim().to_string()))
            }
            ("probe", "start") => Ok(Self::ProbeStart),
            ("probe", "step") => Ok(Self::ProbeStep),
            ("probe", "stop") => Ok(Self::ProbeStop),
            ("sniff", "start") => Ok(Self::SniffStart),
            ("sniff", "stop") => Ok(Self::SniffStop),
            ("log", "") => Ok(Self::ShowLog),
            ("help", "") | ("?", "") => Ok(Self::Help),
            ("quit", "") | ("exit", "") => Ok(Self::Quit),
            _ => Err(invalid()),
        }
    }
}

pub fn format_entry(entry: &LogEntry) -> String {
    let body = match &entry.frame {
        TelemetryFrame::Spell { name, hex } => format!("SPELL {} [{}]", name, hex),
        TelemetryFrame::Raw {
            hex,
            characteristic: Some(uuid),
        } => format!("RAW {} [{}]", uuid, hex),
        TelemetryFrame::Raw {
            hex,
            characteristic: None,
        } => format!("RAW [{}]", hex),
        TelemetryFrame::Info(message) => format!("INFO {}", message),
        TelemetryFrame::Error(message) => format!("ERROR {}", message),
        TelemetryFrame::CommandEcho { description, hex } => {
            format!("SENT {} [{}]", description, hex)
        }
    };
    format!("#{:<4} {}", entry.id, body)
}

pub fn format_event(event: &AppEvent) -> String {
    match event {
        AppEvent::ConnectionState(state) => format!("wand: {}", state),
        AppEvent::SnifferState(state) => format!("sniffer: {}", state),
        AppEvent::Telemetry(entry) => format_entry(entry),
    }
}

/// Stdin on its own thread; interactive reads would otherwise hold up
/// runtime shutdown
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

/// Drives the sessions from stdin until `quit` or end of input
pub struct Console {
    session: SessionHandle,
    sniffer: SnifferHandle,
    sink: EventSink,
    settings: SettingsService,
}

impl Console {
    pub fn new(
        session: SessionHandle,
        sniffer: SnifferHandle,
        sink: EventSink,
        settings: SettingsService,
    ) -> Self {
        Self {
            session,
            sniffer,
            sink,
            settings,
        }
    }

    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<AppEvent>) -> anyhow::Result<()> {
        let mut lines = stdin_lines();
        println!("{}", HELP);

        loop {
            tokio::select! {
                line = lines.recv() => {
                    let Some(line) = line else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match line.parse::<Intent>() {
                        Ok(Intent::Quit) => break,
                        Ok(intent) => {
                            if let Err(e) = self.apply(intent).await {
                                println!("! {}", e);
                            }
                        }
                        Err(e) => println!("! {} (try `help`)", e),
                    }
                }
                Some(event) = events.recv() => println!("{}", format_event(&event)),
            }
        }

        info!("Console closed");
        let _ = self.session.disconnect().await;
        let _ = self.sniffer.stop().await;
        Ok(())
    }

    async fn apply(&mut self, intent: Intent) -> anyhow::Result<()> {
        match intent {
            Intent::Connect => self.session.connect().await?,
            Intent::Disconnect => self.session.disconnect().await?,
            Intent::Cast(commands) => {
                let written = self.session.cast(commands).await?;
                println!("cast {} bytes", written);
            }
            Intent::ShowOpcodes => {
                let table = self.session.opcodes().await?;
                for kind in CommandKind::ALL {
                    println!("{:?}: {:#04X}", kind, table.get(kind));
                }
            }
            Intent::SetOpcode(kind, value) => {
                let mut table = self.session.opcodes().await?;
                let opcode = table.set_from_str(kind, &value)?;
                self.session.set_opcode(kind, opcode).await?;
                if let Err(e) = self.settings.update_opcodes(table) {
                    warn!("Failed to persist opcodes: {}", e);
                }
                println!("{:?} -> {:#04X}", kind, opcode);
            }
            Intent::ProbeStart => self.session.start_discovery().await?,
            Intent::ProbeStep => match self.session.probe_step().await? {
                ProbeOutcome::Sent { opcode, finished } => {
                    println!("probe {:#04X}{}", opcode, if finished { " (done)" } else { "" });
                }
                ProbeOutcome::Inactive => println!("probe is not running"),
            },
            Intent::ProbeStop => self.session.stop_discovery().await?,
            Intent::SniffStart => {
                let count = self.sniffer.start().await?;
                println!("sniffing {} characteristics", count);
            }
            Intent::SniffStop => self.sniffer.stop().await?,
            Intent::ShowLog => {
                for entry in self.sink.snapshot() {
                    println!("{}", format_entry(&entry));
                }
            }
            Intent::Help => println!("{}", HELP),
            Intent::Quit => {}
        }
        Ok(())
    }
}
