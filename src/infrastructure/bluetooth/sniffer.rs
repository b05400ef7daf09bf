//! Sniffer Session
//!
//! Diagnostic link that subscribes to every notifiable or indicatable
//! characteristic on the wand and logs whatever arrives as raw hex. It has
//! its own connection state and never writes to the device.

use crate::domain::models::ConnectionState;
use crate::domain::settings::SnifferSettings;
use crate::domain::telemetry::EventSink;
use crate::error::{WandError, WandResult};
use crate::infrastructure::bluetooth::protocol::{self, parse_uuid};
use crate::infrastructure::bluetooth::transport::{
    BleTransport, CharacteristicHandle, DisconnectReceiver, GattSession, NotificationReceiver,
};
use std::future::{pending, poll_fn};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SnifferConfig {
    pub name_prefix: String,
    /// Services the platform should expose for enumeration
    pub optional_services: Vec<Uuid>,
    /// Characteristics never subscribed to
    pub denylist: Vec<Uuid>,
    pub error_revert: Duration,
    pub connect_timeout: Duration,
}

impl Default for SnifferConfig {
    fn default() -> Self {
        let settings = SnifferSettings::default();
        Self {
            name_prefix: protocol::DEVICE_NAME_PREFIX.to_string(),
            optional_services: settings
                .optional_services
                .iter()
                .filter_map(|s| Uuid::parse_str(s).ok())
                .collect(),
            denylist: settings
                .denylist
                .iter()
                .filter_map(|s| Uuid::parse_str(s).ok())
                .collect(),
            error_revert: Duration::from_millis(protocol::ERROR_REVERT_MS),
            connect_timeout: Duration::from_millis(protocol::CONNECT_TIMEOUT_MS),
        }
    }
}

impl SnifferConfig {
    pub fn from_settings(
        settings: &SnifferSettings,
        name_prefix: &str,
        error_revert: Duration,
        connect_timeout: Duration,
    ) -> WandResult<Self> {
        Ok(Self {
            name_prefix: name_prefix.to_string(),
            optional_services: settings
                .optional_services
                .iter()
                .map(|s| parse_uuid(s))
                .collect::<WandResult<_>>()?,
            denylist: settings
                .denylist
                .iter()
                .map(|s| parse_uuid(s))
                .collect::<WandResult<_>>()?,
            error_revert,
            connect_timeout,
        })
    }
}

/// One live subscription and its notification channel
struct SnifferSubscription {
    characteristic: CharacteristicHandle,
    notifications: NotificationReceiver,
    closed: bool,
}

/// Next notification across all subscriptions. Pends while none is ready.
///
/// Polling starts at `cursor` and the cursor moves past whichever
/// subscription delivered, so a chatty characteristic cannot starve the rest.
async fn next_notification(
    subscriptions: &mut [SnifferSubscription],
    cursor: &mut usize,
) -> (Uuid, Vec<u8>) {
    poll_fn(|cx| {
        let len = subscriptions.len();
        for offset in 0..len {
            let index = (*cursor + offset) % len;
            let subscription = &mut subscriptions[index];
            if subscription.closed {
                continue;
            }
            match subscription.notifications.poll_recv(cx) {
                Poll::Ready(Some(payload)) => {
                    *cursor = (index + 1) % len;
                    return Poll::Ready((subscription.characteristic.uuid, payload));
                }
                Poll::Ready(None) => {
                    debug!("Notifications ended on {}", subscription.characteristic.uuid);
                    subscription.closed = true;
                }
                Poll::Pending => {}
            }
        }
        Poll::Pending
    })
    .await
}

enum SnifferCommand {
    Start(oneshot::Sender<WandResult<usize>>),
    Stop(oneshot::Sender<()>),
    Subscriptions(oneshot::Sender<Vec<Uuid>>),
}

pub struct SnifferSession {
    transport: Arc<dyn BleTransport>,
    config: SnifferConfig,
    sink: EventSink,
    state: watch::Sender<ConnectionState>,
    session: Option<GattSession>,
    disconnected: Option<DisconnectReceiver>,
    subscriptions: Vec<SnifferSubscription>,
    poll_cursor: usize,
    error_deadline: Option<Instant>,
    transport_unavailable: bool,
}

impl SnifferSession {
    pub fn new(transport: Arc<dyn BleTransport>, config: SnifferConfig, sink: EventSink) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            config,
            sink,
            state,
            session: None,
            disconnected: None,
            subscriptions: Vec::new(),
            poll_cursor: 0,
            error_deadline: None,
            transport_unavailable: false,
        }
    }

    pub fn spawn(self) -> (SnifferHandle, JoinHandle<()>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let state = self.state.subscribe();
        let task = tokio::spawn(self.run(rx));
        (SnifferHandle { commands, state }, task)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&mut self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!("Sniffer state: {} -> {}", previous, state);
            self.sink.sniffer_state(state);
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SnifferCommand>) {
        loop {
            let disconnected = self.disconnected.as_mut();
            let subscriptions = self.subscriptions.as_mut_slice();
            let cursor = &mut self.poll_cursor;
            let error_deadline = self.error_deadline;

            tokio::select! {
                command = commands.recv() => match command {
                    Some(SnifferCommand::Start(reply)) => {
                        let _ = reply.send(self.start().await);
                    }
                    Some(SnifferCommand::Stop(reply)) => {
                        self.stop().await;
                        let _ = reply.send(());
                    }
                    Some(SnifferCommand::Subscriptions(reply)) => {
                        let _ = reply.send(self.subscribed());
                    }
                    None => break,
                },
                (characteristic, payload) = next_notification(subscriptions, cursor) => {
                    self.record(characteristic, &payload);
                }
                _ = async {
                    match disconnected {
                        Some(rx) => {
                            let _ = rx.await;
                        }
                        None => pending::<()>().await,
                    }
                } => {
                    warn!("Sniffer link lost");
                    self.sink.error("Sniffer link lost");
                    self.teardown().await;
                }
                _ = async {
                    match error_deadline {
                        Some(deadline) => sleep_until(deadline).await,
                        None => pending::<()>().await,
                    }
                } => {
                    self.error_deadline = None;
                    self.set_state(ConnectionState::Disconnected);
                }
            }
        }
        self.teardown().await;
    }

    fn record(&self, characteristic: Uuid, payload: &[u8]) {
        debug!("{} -> {:02X?}", characteristic, payload);
        self.sink
            .record(protocol::decode_sniffed(characteristic, payload));
    }

    pub fn subscribed(&self) -> Vec<Uuid> {
        self.subscriptions
            .iter()
            .map(|s| s.characteristic.uuid)
            .collect()
    }

    /// Connect and subscribe to every eligible characteristic.
    /// Returns how many subscriptions are live.
    pub async fn start(&mut self) -> WandResult<usize> {
        if self.transport_unavailable {
            return Err(WandError::TransportUnavailable);
        }
        if !self.state().accepts_connect() {
            debug!("Sniffer start ignored while {}", self.state());
            return Ok(self.subscriptions.len());
        }

        self.error_deadline = None;
        self.set_state(ConnectionState::Scanning);

        let timeout = self.config.connect_timeout;
        let result = match tokio::time::timeout(timeout, self.establish()).await {
            Ok(result) => result,
            Err(_) => Err(WandError::ConnectFailure(format!(
                "timed out after {} ms",
                timeout.as_millis()
            ))),
        };

        match result {
            Ok(count) => {
                self.set_state(ConnectionState::Connected);
                self.sink
                    .info(format!("Sniffing {} characteristics", count));
                Ok(count)
            }
            Err(WandError::DeviceNotFound) => {
                self.sink.info("No wand found");
                self.teardown().await;
                Err(WandError::DeviceNotFound)
            }
            Err(WandError::TransportUnavailable) => {
                error!("Bluetooth LE is not available on this host");
                self.transport_unavailable = true;
                self.sink.error(WandError::TransportUnavailable.to_string());
                self.teardown().await;
                Err(WandError::TransportUnavailable)
            }
            Err(WandError::NoSubscriptions) => {
                error!("Sniffer could not subscribe to any characteristic");
                self.sink.error(WandError::NoSubscriptions.to_string());
                self.teardown().await;
                Err(WandError::NoSubscriptions)
            }
            Err(e) => {
                error!("Sniffer connection failed: {}", e);
                self.sink.error(e.to_string());
                self.release().await;
                self.set_state(ConnectionState::Error);
                self.error_deadline = Some(Instant::now() + self.config.error_revert);
                Err(e)
            }
        }
    }

    async fn establish(&mut self) -> WandResult<usize> {
        let transport = self.transport.clone();

        let device = transport
            .scan(&self.config.name_prefix, &self.config.optional_services)
            .await
            .map_err(WandError::connect)?
            .ok_or(WandError::DeviceNotFound)?;
        info!("Sniffing {} ({:#X})", device.name, device.address);

        let session = transport
            .connect_gatt(&device)
            .await
            .map_err(WandError::connect)?;
        self.session = Some(session.clone());
        self.set_state(ConnectionState::Connecting);

        self.disconnected = Some(
            transport
                .on_disconnected(&session)
                .map_err(WandError::connect)?,
        );

        let services = transport
            .primary_services(&session)
            .await
            .map_err(WandError::connect)?;
        info!("Found {} primary services", services.len());

        for service in &services {
            let characteristics = match transport.characteristics(&session, service).await {
                Ok(characteristics) => characteristics,
                Err(e) => {
                    warn!("Skipping service {}: {}", service.uuid, e);
                    self.sink
                        .error(format!("Skipped service {}: {}", service.uuid, e));
                    continue;
                }
            };

            for characteristic in characteristics {
                if !characteristic.properties.can_subscribe() {
                    continue;
                }
                if self.config.denylist.contains(&characteristic.uuid) {
                    debug!("Skipping denylisted characteristic {}", characteristic.uuid);
                    continue;
                }
                self.subscribe(&session, characteristic).await;
            }
        }

        if self.subscriptions.is_empty() {
            return Err(WandError::NoSubscriptions);
        }
        Ok(self.subscriptions.len())
    }

    async fn subscribe(&mut self, session: &GattSession, characteristic: CharacteristicHandle) {
        match self.transport.subscribe(session, &characteristic).await {
            Ok(notifications) => {
                info!("Subscribed to {}", characteristic.uuid);
                self.subscriptions.push(SnifferSubscription {
                    characteristic,
                    notifications,
                    closed: false,
                });
            }
            Err(e) => {
                let err = WandError::SubscribeFailure {
                    characteristic: characteristic.uuid,
                    reason: e.to_string(),
                };
                warn!("{}", err);
                self.sink.error(err.to_string());
            }
        }
    }

    /// Stop sniffing. Safe to call in any state.
    pub async fn stop(&mut self) {
        if self.state() == ConnectionState::Error {
            self.error_deadline = None;
            self.set_state(ConnectionState::Disconnected);
            return;
        }
        if self.session.is_some() {
            self.teardown().await;
            self.sink.info("Sniffer stopped");
        }
    }

    async fn teardown(&mut self) {
        self.release().await;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Unsubscribe everything, then drop the link and the device handle
    async fn release(&mut self) {
        let session = match self.session.clone() {
            Some(session) => session,
            None => return,
        };

        let mut subscriptions = std::mem::take(&mut self.subscriptions);
        for subscription in subscriptions.iter_mut() {
            // Keep what arrived before we stopped listening
            while let Ok(payload) = subscription.notifications.try_recv() {
                self.record(subscription.characteristic.uuid, &payload);
            }
            if let Err(e) = self
                .transport
                .unsubscribe(&session, &subscription.characteristic)
                .await
            {
                warn!(
                    "Failed to unsubscribe {}: {}",
                    subscription.characteristic.uuid, e
                );
                self.sink.error(format!(
                    "Unsubscribe {} failed: {}",
                    subscription.characteristic.uuid, e
                ));
            }
        }
        drop(subscriptions);

        if let Err(e) = self.transport.disconnect(&session).await {
            warn!("Failed to disconnect sniffer link: {}", e);
            self.sink.error(format!("Sniffer disconnect failed: {}", e));
        }
        self.disconnected = None;
        self.session = None;
    }
}

/// Cloneable front door to a running [`SnifferSession`]
#[derive(Clone)]
pub struct SnifferHandle {
    commands: mpsc::UnboundedSender<SnifferCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl SnifferHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SnifferCommand,
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

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub async fn start(&self) -> WandResult<usize> {
        self.request(SnifferCommand::Start).await?
    }

    pub async fn stop(&self) -> WandResult<()> {
        self.request(SnifferCommand::Stop).await
    }

    /// Characteristics currently subscribed
    pub async fn subscriptions(&self) -> WandResult<Vec<Uuid>> {
        self.request(SnifferCommand::Subscriptions).await
    }
}
