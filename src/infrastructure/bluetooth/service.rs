//! Protocol Session
//!
//! Main coordinator exposed to the application: composes the opcode table,
//! the frame codec and the connection supervisor, and runs them on one task.
//! Callers talk to it through a cloneable [`SessionHandle`].

use crate::domain::models::{CommandKind, ConnectionState, Macro};
use crate::domain::opcodes::{OpcodeTable, ProbeSequence};
use crate::domain::telemetry::{EventSink, TelemetryFrame};
use crate::error::{WandError, WandResult};
use crate::infrastructure::bluetooth::connection::{ConnectionSupervisor, SupervisorConfig};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::BleTransport;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Result of one opcode discovery step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// `opcode` went out; `finished` when it was the last of the scan
    Sent { opcode: u8, finished: bool },
    /// Discovery mode is off
    Inactive,
}

enum SessionCommand {
    Connect(oneshot::Sender<WandResult<()>>),
    Disconnect(oneshot::Sender<()>),
    Cast(Macro, oneshot::Sender<WandResult<usize>>),
    SetOpcode(CommandKind, u8, oneshot::Sender<()>),
    Opcodes(oneshot::Sender<OpcodeTable>),
    StartDiscovery(oneshot::Sender<()>),
    StopDiscovery(oneshot::Sender<()>),
    ProbeStep(oneshot::Sender<WandResult<ProbeOutcome>>),
    Discovery(oneshot::Sender<ProbeSequence>),
}

pub struct ProtocolSession {
    supervisor: ConnectionSupervisor,
    opcodes: OpcodeTable,
    probe: ProbeSequence,
    sink: EventSink,
}

impl ProtocolSession {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        config: SupervisorConfig,
        opcodes: OpcodeTable,
        sink: EventSink,
    ) -> Self {
        Self {
            supervisor: ConnectionSupervisor::new(transport, config, sink.clone()),
            opcodes,
            probe: ProbeSequence::default(),
            sink,
        }
    }

    /// Move the session onto its own task
    pub fn spawn(self) -> (SessionHandle, JoinHandle<()>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let state = self.supervisor.subscribe_state();
        let task = tokio::spawn(self.run(rx));
        (SessionHandle { commands, state }, task)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        info!("Protocol session started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = self.supervisor.next_event() => {
                    self.supervisor.handle_event(event).await;
                }
            }
        }
        self.supervisor.shutdown().await;
        info!("Protocol session stopped");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect(reply) => {
                let _ = reply.send(self.supervisor.connect().await);
            }
            SessionCommand::Disconnect(reply) => {
                self.supervisor.disconnect().await;
                let _ = reply.send(());
            }
            SessionCommand::Cast(commands, reply) => {
                let _ = reply.send(self.cast(&commands).await);
            }
            SessionCommand::SetOpcode(kind, opcode, reply) => {
                self.opcodes.set(kind, opcode);
                info!("Opcode for {:?} set to {:#04X}", kind, opcode);
                let _ = reply.send(());
            }
            SessionCommand::Opcodes(reply) => {
                let _ = reply.send(self.opcodes);
            }
            SessionCommand::StartDiscovery(reply) => {
                self.probe.activate();
                self.sink.info("Opcode discovery started at 0x01");
                let _ = reply.send(());
            }
            SessionCommand::StopDiscovery(reply) => {
                if self.probe.is_active() {
                    self.probe.deactivate();
                    self.sink.info("Opcode discovery stopped");
                }
                let _ = reply.send(());
            }
            SessionCommand::ProbeStep(reply) => {
                let _ = reply.send(self.probe_step().await);
            }
            SessionCommand::Discovery(reply) => {
                let _ = reply.send(self.probe);
            }
        }
    }

    /// Encode `commands` with the current opcodes and write them
    pub async fn cast(&mut self, commands: &Macro) -> WandResult<usize> {
        if commands.is_empty() {
            return Err(WandError::EmptyMacro);
        }
        if !self.supervisor.is_connected() {
            return Err(WandError::NotConnected);
        }

        let bytes = protocol::encode_macro(commands.commands(), &self.opcodes);
        self.sink.record(TelemetryFrame::CommandEcho {
            description: format!("Cast macro ({} commands)", commands.len()),
            hex: protocol::hex_compact(&bytes),
        });
        self.supervisor.send(&bytes).await?;
        debug!("Cast {} bytes", bytes.len());
        Ok(bytes.len())
    }

    /// Send the current probe byte and advance the scan
    pub async fn probe_step(&mut self) -> WandResult<ProbeOutcome> {
        let Some(opcode) = self.probe.peek() else {
            return Ok(ProbeOutcome::Inactive);
        };
        if !self.supervisor.is_connected() {
            return Err(WandError::NotConnected);
        }

        self.supervisor.send(&[opcode]).await?;
        self.sink.record(TelemetryFrame::CommandEcho {
            description: format!("Probe {:#04X}", opcode),
            hex: protocol::hex_compact(&[opcode]),
        });

        let finished = self.probe.advance();
        if finished {
            self.sink.info("Opcode discovery finished");
        }
        Ok(ProbeOutcome::Sent { opcode, finished })
    }
}

/// Cloneable front door to a running [`ProtocolSession`]
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> WandResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| WandError::SessionClosed)?;
        rx.await.map_err(|_| WandError::SessionClosed)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch channel of connection state changes
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub async fn connect(&self) -> WandResult<()> {
        self.request(SessionCommand::Connect).await?
    }

    pub async fn disconnect(&self) -> WandResult<()> {
        self.request(SessionCommand::Disconnect).await
    }

    /// Cast a macro; returns the number of bytes written
    pub async fn cast(&self, commands: Macro) -> WandResult<usize> {
        self.request(|reply| SessionCommand::Cast(commands, reply))
            .await?
    }

    pub async fn set_opcode(&self, kind: CommandKind, opcode: u8) -> WandResult<()> {
        self.request(|reply| SessionCommand::SetOpcode(kind, opcode, reply))
            .await
    }

    pub async fn opcodes(&self) -> WandResult<OpcodeTable> {
        self.request(SessionCommand::Opcodes).await
    }

    pub async fn start_discovery(&self) -> WandResult<()> {
        self.request(SessionCommand::StartDiscovery).await
    }

    pub async fn stop_discovery(&self) -> WandResult<()> {
        self.request(SessionCommand::StopDiscovery).await
    }

    pub async fn probe_step(&self) -> WandResult<ProbeOutcome> {
        self.request(SessionCommand::ProbeStep).await?
    }

    pub async fn discovery(&self) -> WandResult<ProbeSequence> {
        self.request(SessionCommand::Discovery).await
    }
}
