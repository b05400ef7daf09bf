//! Connection Supervisor
//!
//! Owns the wand link: the connection state machine, the bound write and
//! notify characteristics, the keepalive timer and the chunked write path.
//!
//! ```text
//! Disconnected --connect--> Scanning --gatt ok--> Connecting --discovery ok--> Connected
//!      ^                        |                     |                           |
//!      +------ not found -------+                     +--> Error --(3 s)--+       |
//!      +--------------------------------------------------------------- +       |
//!      +------------- disconnect / link lost / write failure -------------------+
//! ```

use crate::domain::models::ConnectionState;
use crate::domain::settings::WandSettings;
use crate::domain::telemetry::EventSink;
use crate::error::{WandError, WandResult};
use crate::infrastructure::bluetooth::protocol::{self, parse_uuid};
use crate::infrastructure::bluetooth::transport::{
    BleTransport, CharacteristicHandle, DisconnectReceiver, GattSession, NotificationReceiver,
};
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Advertised name prefix to scan for
    pub name_prefix: String,
    /// Primary service holding both characteristics
    pub service_uuid: Uuid,
    pub write_char_uuid: Uuid,
    pub notify_char_uuid: Uuid,
    pub keepalive_interval: Duration,
    pub heartbeat: u8,
    /// Largest single write
    pub chunk_size: usize,
    /// Pause after each chunk
    pub chunk_delay: Duration,
    /// How long the Error state lasts before reverting
    pub error_revert: Duration,
    /// Upper bound for scan + connect + discovery
    pub connect_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            name_prefix: protocol::DEVICE_NAME_PREFIX.to_string(),
            service_uuid: protocol::SERVICE_UUID,
            write_char_uuid: protocol::WRITE_CHAR_UUID,
            notify_char_uuid: protocol::NOTIFY_CHAR_UUID,
            keepalive_interval: Duration::from_millis(protocol::KEEPALIVE_INTERVAL_MS),
            heartbeat: protocol::HEARTBEAT,
            chunk_size: protocol::CHUNK_SIZE,
            chunk_delay: Duration::from_millis(protocol::CHUNK_DELAY_MS),
            error_revert: Duration::from_millis(protocol::ERROR_REVERT_MS),
            connect_timeout: Duration::from_millis(protocol::CONNECT_TIMEOUT_MS),
        }
    }
}

impl SupervisorConfig {
    pub fn from_settings(settings: &WandSettings) -> WandResult<Self> {
        Ok(Self {
            name_prefix: settings.name_prefix.clone(),
            service_uuid: parse_uuid(&settings.service_uuid)?,
            write_char_uuid: parse_uuid(&settings.write_char_uuid)?,
            notify_char_uuid: parse_uuid(&settings.notify_char_uuid)?,
            keepalive_interval: Duration::from_millis(settings.keepalive_interval_ms.max(1)),
            heartbeat: settings.heartbeat_byte,
            chunk_size: settings.chunk_size.max(1),
            chunk_delay: Duration::from_millis(settings.chunk_delay_ms),
            error_revert: Duration::from_millis(settings.error_revert_ms),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms.max(1)),
        })
    }
}

/// Periodic heartbeat trigger. Dropping it cancels any pending tick.
pub struct KeepaliveTimer {
    interval: Interval,
}

impl KeepaliveTimer {
    /// First tick fires one full period from now
    pub fn start(period: Duration) -> Self {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

/// Characteristics bound while Connected
struct BoundLink {
    session: GattSession,
    write_char: CharacteristicHandle,
    notify_char: CharacteristicHandle,
    notifications: NotificationReceiver,
    disconnected: DisconnectReceiver,
}

/// Something the supervisor must react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Heartbeat,
    Notification(Vec<u8>),
    /// Notification stream ended without a disconnect event
    NotificationsClosed,
    LinkLost,
    ErrorExpired,
}

pub struct ConnectionSupervisor {
    transport: Arc<dyn BleTransport>,
    config: SupervisorConfig,
    sink: EventSink,
    state: watch::Sender<ConnectionState>,
    link: Option<BoundLink>,
    keepalive: Option<KeepaliveTimer>,
    /// GATT session opened by an attempt that has not finished yet
    pending_session: Option<GattSession>,
    error_deadline: Option<Instant>,
    transport_unavailable: bool,
}

impl ConnectionSupervisor {
    pub fn new(transport: Arc<dyn BleTransport>, config: SupervisorConfig, sink: EventSink) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            config,
            sink,
            state,
            link: None,
            keepalive: None,
            pending_session: None,
            error_deadline: None,
            transport_unavailable: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn keepalive_active(&self) -> bool {
        self.keepalive.is_some()
    }

    fn set_state(&mut self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!("Connection state: {} -> {}", previous, state);
            self.sink.connection_state(state);
        }
    }

    /// Scan, connect and bind the wand characteristics.
    ///
    /// A no-op while an attempt is running or a link is up.
    pub async fn connect(&mut self) -> WandResult<()> {
        if self.transport_unavailable {
            return Err(WandError::TransportUnavailable);
        }
        if !self.state().accepts_connect() {
            debug!("Connect ignored while {}", self.state());
            return Ok(());
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
            Ok(link) => {
                let name = link.session.device.name.clone();
                self.pending_session = None;
                self.link = Some(link);
                self.keepalive = Some(KeepaliveTimer::start(self.config.keepalive_interval));
                self.set_state(ConnectionState::Connected);
                self.sink.info(format!("Connected to {}", name));
                Ok(())
            }
            Err(WandError::DeviceNotFound) => {
                self.abandon_pending().await;
                info!("No wand found");
                self.sink.info("No wand found");
                self.set_state(ConnectionState::Disconnected);
                Err(WandError::DeviceNotFound)
            }
            Err(WandError::TransportUnavailable) => {
                self.abandon_pending().await;
                error!("Bluetooth LE is not available on this host");
                self.transport_unavailable = true;
                self.sink.error(WandError::TransportUnavailable.to_string());
                self.set_state(ConnectionState::Disconnected);
                Err(WandError::TransportUnavailable)
            }
            Err(e) => {
                self.abandon_pending().await;
                error!("Connection failed: {}", e);
                self.sink.error(e.to_string());
                self.set_state(ConnectionState::Error);
                self.error_deadline = Some(Instant::now() + self.config.error_revert);
                Err(e)
            }
        }
    }

    async fn establish(&mut self) -> WandResult<BoundLink> {
        let transport = self.transport.clone();
        let config = self.config.clone();

        // Step 1: Find the wand
        info!("Scanning for devices named {}*", config.name_prefix);
        let device = transport
            .scan(&config.name_prefix, &[config.service_uuid])
            .await
            .map_err(WandError::connect)?
            .ok_or(WandError::DeviceNotFound)?;
        info!("Found {} ({:#X})", device.name, device.address);

        // Step 2: Open GATT
        let session = transport
            .connect_gatt(&device)
            .await
            .map_err(WandError::connect)?;
        self.pending_session = Some(session.clone());
        self.set_state(ConnectionState::Connecting);

        // Step 3: Resolve service and characteristics
        let service = transport
            .primary_service(&session, config.service_uuid)
            .await
            .map_err(WandError::connect)?;
        let write_char = transport
            .characteristic(&session, &service, config.write_char_uuid)
            .await
            .map_err(WandError::connect)?;
        let notify_char = transport
            .characteristic(&session, &service, config.notify_char_uuid)
            .await
            .map_err(WandError::connect)?;

        // Step 4: Watch for drops, then enable notifications
        let disconnected = transport
            .on_disconnected(&session)
            .map_err(WandError::connect)?;
        let notifications = transport
            .subscribe(&session, &notify_char)
            .await
            .map_err(WandError::connect)?;

        Ok(BoundLink {
            session,
            write_char,
            notify_char,
            notifications,
            disconnected,
        })
    }

    /// Close a GATT session left behind by a failed attempt
    async fn abandon_pending(&mut self) {
        if let Some(session) = self.pending_session.take() {
            if let Err(e) = self.transport.disconnect(&session).await {
                warn!("Failed to close abandoned GATT session: {}", e);
                self.sink.error(format!("Closing abandoned session failed: {}", e));
            }
        }
    }

    /// User-initiated disconnect. Safe to call in any state.
    pub async fn disconnect(&mut self) {
        match self.state() {
            ConnectionState::Error => {
                self.error_deadline = None;
                self.set_state(ConnectionState::Disconnected);
            }
            ConnectionState::Connected => {
                self.teardown("disconnect requested").await;
                self.sink.info("Disconnected");
            }
            _ => {}
        }
    }

    /// Leave Connected: timer, notifications, link, bindings, in that order.
    async fn teardown(&mut self, reason: &str) {
        if self.link.is_none() {
            self.keepalive = None;
            return;
        }
        info!("Tearing down link: {}", reason);

        // Stop the heartbeat before anything else touches the link
        self.keepalive = None;

        if let Some(link) = self.link.as_ref() {
            if let Err(e) = self
                .transport
                .unsubscribe(&link.session, &link.notify_char)
                .await
            {
                warn!("Failed to unsubscribe notifications: {}", e);
                self.sink.error(format!("Unsubscribe failed: {}", e));
            }
            if let Err(e) = self.transport.disconnect(&link.session).await {
                warn!("Failed to disconnect: {}", e);
                self.sink.error(format!("Disconnect failed: {}", e));
            }
        }

        self.link = None;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Write `bytes` to the wand, split into paced chunks.
    ///
    /// The first failed chunk aborts the rest and tears the link down, so the
    /// wand never sees a partial command stream followed by more data.
    pub async fn send(&mut self, bytes: &[u8]) -> WandResult<()> {
        let (session, write_char) = match self.link.as_ref() {
            Some(link) => (link.session.clone(), link.write_char),
            None => return Err(WandError::NotConnected),
        };

        let chunk_size = self.config.chunk_size.max(1);
        let total = bytes.len().div_ceil(chunk_size);

        for (index, chunk) in bytes.chunks(chunk_size).enumerate() {
            trace!("Writing chunk {}/{}: {:02X?}", index + 1, total, chunk);
            if let Err(e) = self
                .transport
                .write_without_response(&session, &write_char, chunk)
                .await
            {
                error!("Write failed on chunk {}/{}: {}", index + 1, total, e);
                let err = WandError::WriteFailure(e.to_string());
                self.sink
                    .error(format!("Write failed on chunk {}/{}: {}", index + 1, total, e));
                self.teardown("write failure").await;
                return Err(err);
            }
            sleep(self.config.chunk_delay).await;
        }

        debug!("Sent {} bytes in {} chunks", bytes.len(), total);
        Ok(())
    }

    async fn heartbeat(&mut self) {
        let (session, write_char) = match self.link.as_ref() {
            Some(link) => (link.session.clone(), link.write_char),
            None => return,
        };

        match self
            .transport
            .write_without_response(&session, &write_char, &[self.config.heartbeat])
            .await
        {
            Ok(()) => trace!("Heartbeat sent"),
            Err(e) => {
                error!("Keepalive write failed: {}", e);
                self.sink.error(format!("Keepalive failed: {}", e));
                self.teardown("keepalive failure").await;
            }
        }
    }

    /// Wait for the next timer tick, notification or link event.
    /// Pends forever while there is nothing to wait on.
    pub async fn next_event(&mut self) -> LinkEvent {
        let keepalive = self.keepalive.as_mut();
        let (notifications, disconnected) = match self.link.as_mut() {
            Some(link) => (Some(&mut link.notifications), Some(&mut link.disconnected)),
            None => (None, None),
        };
        let error_deadline = self.error_deadline;

        tokio::select! {
            _ = async {
                match keepalive {
                    Some(timer) => timer.tick().await,
                    None => pending::<()>().await,
                }
            } => LinkEvent::Heartbeat,
            payload = async {
                match notifications {
                    Some(rx) => rx.recv().await,
                    None => pending().await,
                }
            } => match payload {
                Some(payload) => LinkEvent::Notification(payload),
                None => LinkEvent::NotificationsClosed,
            },
            _ = async {
                match disconnected {
                    Some(rx) => {
                        let _ = rx.await;
                    }
                    None => pending::<()>().await,
                }
            } => LinkEvent::LinkLost,
            _ = async {
                match error_deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => pending::<()>().await,
                }
            } => LinkEvent::ErrorExpired,
        }
    }

    pub async fn handle_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Heartbeat => self.heartbeat().await,
            LinkEvent::Notification(payload) => {
                let frame = protocol::decode_notification(&payload);
                debug!("Notification: {:?}", frame);
                self.sink.record(frame);
            }
            LinkEvent::NotificationsClosed => {
                warn!("Notification stream closed");
                self.sink.error("Notification stream closed");
                self.teardown("notification stream closed").await;
            }
            LinkEvent::LinkLost => {
                warn!("Wand disconnected");
                self.sink.error("Wand disconnected");
                self.teardown("transport disconnect").await;
            }
            LinkEvent::ErrorExpired => {
                self.error_deadline = None;
                if self.state() == ConnectionState::Error {
                    self.set_state(ConnectionState::Disconnected);
                }
            }
        }
    }

    /// Final cleanup when the owning session stops
    pub async fn shutdown(&mut self) {
        self.error_deadline = None;
        self.teardown("session closed").await;
        if self.state() != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::telemetry::{TelemetryFrame, DEFAULT_LOG_CAPACITY};
    use crate::infrastructure::bluetooth::mock::MockTransport;
    use crate::infrastructure::bluetooth::sniffer::{SnifferConfig, SnifferSession};
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    fn supervisor(transport: &Arc<MockTransport>) -> (ConnectionSupervisor, EventSink) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx, DEFAULT_LOG_CAPACITY);
        let supervisor = ConnectionSupervisor::new(
            transport.clone(),
            SupervisorConfig::default(),
            sink.clone(),
        );
        (supervisor, sink)
    }

    async fn connected(transport: &Arc<MockTransport>) -> (ConnectionSupervisor, EventSink) {
        let (mut supervisor, sink) = supervisor(transport);
        supervisor.connect().await.unwrap();
        (supervisor, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_binds_link_and_starts_keepalive() {
        let transport = Arc::new(MockTransport::wand());
        let (supervisor, sink) = connected(&transport).await;

        assert_eq!(supervisor.state(), ConnectionState::Connected);
        assert!(supervisor.keepalive_active());
        assert!(transport
            .calls()
            .contains(&format!("subscribe {}", MockTransport::notify_uuid())));
        assert!(matches!(
            sink.snapshot().last().map(|e| &e.frame),
            Some(TelemetryFrame::Info(msg)) if msg.starts_with("Connected")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_noop_while_connected() {
        let transport = Arc::new(MockTransport::wand());
        let (mut supervisor, _sink) = connected(&transport).await;

        supervisor.connect().await.unwrap();
        let scans = transport.calls().iter().filter(|c| *c == "scan").count();
        assert_eq!(scans, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_not_found_reverts_silently() {
        let transport = Arc::new(MockTransport::wand());
        transport.with(|state| state.device = None);
        let (mut supervisor, _sink) = supervisor(&transport);

        assert_eq!(supervisor.connect().await, Err(WandError::DeviceNotFound));
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert!(!supervisor.keepalive_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_enters_error_then_reverts() {
        let transport = Arc::new(MockTransport::wand());
        transport.with(|state| state.fail_connect = true);
        let (mut supervisor, sink) = supervisor(&transport);

        let started = Instant::now();
        assert!(matches!(
            supervisor.connect().await,
            Err(WandError::ConnectFailure(_))
        ));
        assert_eq!(supervisor.state(), ConnectionState::Error);
        assert!(matches!(
            sink.snapshot().last().map(|e| &e.frame),
            Some(TelemetryFrame::Error(_))
        ));

        let event = supervisor.next_event().await;
        assert_eq!(event, LinkEvent::ErrorExpired);
        assert!(started.elapsed() >= Duration::from_secs(3));
        supervisor.handle_event(event).await;
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_failure_closes_gatt_session() {
        let transport = Arc::new(MockTransport::wand());
        transport.with(|state| state.fail_subscribe.insert(MockTransport::notify_uuid()));
        let (mut supervisor, _sink) = supervisor(&transport);

        assert!(supervisor.connect().await.is_err());
        assert_eq!(supervisor.state(), ConnectionState::Error);
        assert_eq!(transport.calls().last().map(String::as_str), Some("disconnect"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_abandon_is_logged() {
        let transport = Arc::new(MockTransport::wand());
        transport.with(|state| {
            state.fail_subscribe.insert(MockTransport::notify_uuid());
            state.fail_disconnect = true;
        });
        let (mut supervisor, sink) = supervisor(&transport);

        assert!(supervisor.connect().await.is_err());
        assert_eq!(supervisor.state(), ConnectionState::Error);
        assert!(sink.snapshot().iter().any(|e| matches!(
            &e.frame,
            TelemetryFrame::Error(msg) if msg.contains("abandoned")
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sniffer_on_same_device_leaves_link_alone() {
        let transport = Arc::new(MockTransport::wand());
        let (mut supervisor, sink) = connected(&transport).await;

        let mut sniffer = SnifferSession::new(transport.clone(), SnifferConfig::default(), sink.clone());
        assert_eq!(sniffer.start().await.unwrap(), 2);
        // One GATT session each
        assert_eq!(transport.subscribed_by(1), HashSet::from([MockTransport::notify_uuid()]));
        assert_eq!(transport.subscribed_by(2).len(), 2);

        sniffer.stop().await;
        assert!(transport.subscribed_by(2).is_empty());
        assert_eq!(transport.subscribed_by(1), HashSet::from([MockTransport::notify_uuid()]));
        assert_eq!(supervisor.state(), ConnectionState::Connected);

        assert!(transport.notify(MockTransport::notify_uuid(), b"\0\0\0\0FIRE"));
        let event = supervisor.next_event().await;
        supervisor.handle_event(event).await;
        assert_eq!(supervisor.state(), ConnectionState::Connected);
        assert!(sink
            .snapshot()
            .iter()
            .any(|e| matches!(&e.frame, TelemetryFrame::Spell { name, .. } if name == "FIRE")));
    }

    #[test]
    fn test_settings_defaults_match_protocol() {
        let from_settings = SupervisorConfig::from_settings(&WandSettings::default()).unwrap();
        let default = SupervisorConfig::default();

        assert_eq!(from_settings.name_prefix, default.name_prefix);
        assert_eq!(from_settings.service_uuid, default.service_uuid);
        assert_eq!(from_settings.write_char_uuid, default.write_char_uuid);
        assert_eq!(from_settings.notify_char_uuid, default.notify_char_uuid);
        assert_eq!(from_settings.keepalive_interval, default.keepalive_interval);
        assert_eq!(from_settings.heartbeat, default.heartbeat);
        assert_eq!(from_settings.chunk_size, default.chunk_size);
        assert_eq!(from_settings.chunk_delay, default.chunk_delay);
        assert_eq!(from_settings.error_revert, default.error_revert);
        assert_eq!(from_settings.connect_timeout, default.connect_timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_unavailable_is_fatal() {
        let transport = Arc::new(MockTransport::wand());
        transport.with(|state| state.unavailable = true);
        let (mut supervisor, sink) = supervisor(&transport);

        assert_eq!(
            supervisor.connect().await,
            Err(WandError::TransportUnavailable)
        );
        assert_eq!(
            supervisor.connect().await,
            Err(WandError::TransportUnavailable)
        );
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        // Surfaced once, never retried
        assert_eq!(transport.calls(), vec!["scan".to_string()]);
        assert_eq!(sink.snapshot().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let transport = Arc::new(MockTransport::wand());
        transport.with(|state| state.connect_delay = Some(Duration::from_secs(60)));
        let (mut supervisor, _sink) = supervisor(&transport);

        assert!(matches!(
            supervisor.connect().await,
            Err(WandError::ConnectFailure(_))
        ));
        assert_eq!(supervisor.state(), ConnectionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunked_send_preserves_order_and_pacing() {
        let transport = Arc::new(MockTransport::wand());
        let (mut supervisor, _sink) = connected(&transport).await;

        let bytes: Vec<u8> = (0..45).collect();
        supervisor.send(&bytes).await.unwrap();

        let writes = transport.writes();
        let sizes: Vec<usize> = writes.iter().map(|w| w.bytes.len()).collect();
        assert_eq!(sizes, vec![20, 20, 5]);

        let joined: Vec<u8> = writes.iter().flat_map(|w| w.bytes.clone()).collect();
        assert_eq!(joined, bytes);

        for pair in writes.windows(2) {
            assert!(pair[1].at - pair[0].at >= Duration::from_millis(20));
        }
        assert!(writes
            .iter()
            .all(|w| w.characteristic == MockTransport::write_uuid()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_connection() {
        let transport = Arc::new(MockTransport::wand());
        let (mut supervisor, _sink) = supervisor(&transport);
        assert_eq!(supervisor.send(&[1, 2, 3]).await, Err(WandError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_chunk_halts_and_tears_down() {
        let transport = Arc::new(MockTransport::wand());
        let (mut supervisor, _sink) = connected(&transport).await;
        transport.with(|state| state.fail_write_at = Some(1));

        let result = supervisor.send(&[0u8; 45]).await;
        assert!(matches!(result, Err(WandError::WriteFailure(_))));
        assert_eq!(transport.writes().len(), 1);
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert!(!supervisor.keepalive_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_writes_heartbeat() {
        let transport = Arc::new(MockTransport::wand());
        let (mut supervisor, _sink) = connected(&transport).await;
        let started = Instant::now();

        let event = supervisor.next_event().await;
        assert_eq!(event, LinkEvent::Heartbeat);
        assert!(started.elapsed() >= Duration::from_millis(5000));
        supervisor.handle_event(event).await;

        let writes = transport.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].bytes, vec![0x01]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_failure_tears_down() {
        let transport = Arc::new(MockTransport::wand());
        let (mut supervisor, _sink) = connected(&transport).await;
        transport.with(|state| state.fail_write_at = Some(0));

        let event = supervisor.next_event().await;
        supervisor.handle_event(event).await;
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert!(!supervisor.keepalive_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_order() {
        let transport = Arc::new(MockTransport::wand());
        let (mut supervisor, _sink) = connected(&transport).await;

        supervisor.disconnect().await;
        let calls = transport.calls();
        let tail = &calls[calls.len() - 2..];
        assert_eq!(
            tail,
            &[
                format!("unsubscribe {}", MockTransport::notify_uuid()),
                "disconnect".to_string(),
            ]
        );
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert!(!supervisor.keepalive_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_is_best_effort() {
        let transport = Arc::new(MockTransport::wand());
        let (mut supervisor, sink) = connected(&transport).await;
        transport.with(|state| {
            state.fail_unsubscribe = true;
            state.fail_disconnect = true;
        });

        supervisor.disconnect().await;
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        let errors = sink
            .snapshot()
            .iter()
            .filter(|e| matches!(e.frame, TelemetryFrame::Error(_)))
            .count();
        assert_eq!(errors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_twice_is_noop() {
        let transport = Arc::new(MockTransport::wand());
        let (mut supervisor, _sink) = supervisor(&transport);

        supervisor.disconnect().await;
        supervisor.disconnect().await;
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert!(transport.calls().is_empty());

        supervisor.connect().await.unwrap();
        supervisor.disconnect().await;
        let calls = transport.calls().len();
        supervisor.disconnect().await;
        assert_eq!(transport.calls().len(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_lost_event() {
        let transport = Arc::new(MockTransport::wand());
        let (mut supervisor, _sink) = connected(&transport).await;

        transport.drop_link();
        let event = supervisor.next_event().await;
        assert_eq!(event, LinkEvent::LinkLost);
        supervisor.handle_event(event).await;
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert!(!supervisor.keepalive_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_are_decoded() {
        let transport = Arc::new(MockTransport::wand());
        let (mut supervisor, sink) = connected(&transport).await;

        assert!(transport.notify(MockTransport::notify_uuid(), b"\0\0\0\0FIRE"));
        let event = supervisor.next_event().await;
        supervisor.handle_event(event).await;

        assert!(transport.notify(MockTransport::notify_uuid(), &[0x01, 0x02]));
        let event = supervisor.next_event().await;
        supervisor.handle_event(event).await;

        let frames: Vec<TelemetryFrame> = sink.snapshot().into_iter().map(|e| e.frame).collect();
        assert!(frames.contains(&TelemetryFrame::Spell {
            name: "FIRE".to_string(),
            hex: "0000000046495245".to_string(),
        }));
        assert!(frames.contains(&TelemetryFrame::Raw {
            hex: "0102".to_string(),
            characteristic: None,
        }));
    }
}
