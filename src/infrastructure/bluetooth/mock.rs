//! In-memory transport for tests
//!
//! Records every call and write (with its instant) and lets tests inject
//! notifications, failures and link drops.

use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    BleTransport, CharacteristicHandle, CharacteristicProperties, DeviceHandle,
    DisconnectReceiver, GattSession, NotificationReceiver, ServiceHandle, TransportError,
    TransportResult,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct MockWrite {
    pub characteristic: Uuid,
    pub bytes: Vec<u8>,
    pub at: Instant,
}

#[derive(Default)]
pub struct MockState {
    pub device: Option<DeviceHandle>,
    pub services: Vec<(Uuid, Vec<CharacteristicHandle>)>,
    pub unavailable: bool,
    pub fail_connect: bool,
    pub connect_delay: Option<Duration>,
    pub fail_services: bool,
    /// Services whose characteristic discovery fails
    pub fail_characteristics: HashSet<Uuid>,
    pub fail_subscribe: HashSet<Uuid>,
    pub fail_unsubscribe: bool,
    pub fail_disconnect: bool,
    /// Index of the write (counting successful ones) that fails
    pub fail_write_at: Option<usize>,
    pub writes: Vec<MockWrite>,
    pub calls: Vec<String>,
    next_session: u64,
    subscribers: HashMap<(u64, Uuid), mpsc::UnboundedSender<Vec<u8>>>,
    disconnect_tx: HashMap<u64, oneshot::Sender<()>>,
}

pub struct MockTransport {
    state: Mutex<MockState>,
}

fn sig(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb | ((short as u128) << 96))
}

fn characteristic(
    service: Uuid,
    uuid: Uuid,
    properties: CharacteristicProperties,
) -> CharacteristicHandle {
    CharacteristicHandle {
        service,
        uuid,
        properties,
    }
}

impl MockTransport {
    pub fn service_uuid() -> Uuid {
        protocol::SERVICE_UUID
    }

    pub fn write_uuid() -> Uuid {
        protocol::WRITE_CHAR_UUID
    }

    pub fn notify_uuid() -> Uuid {
        protocol::NOTIFY_CHAR_UUID
    }

    pub fn battery_service_uuid() -> Uuid {
        sig(0x180F)
    }

    pub fn battery_level_uuid() -> Uuid {
        sig(0x2A19)
    }

    pub fn service_changed_uuid() -> Uuid {
        sig(0x2A05)
    }

    /// A wand advertising as `MCW-1234` with the vendor service plus a few
    /// standard ones
    pub fn wand() -> Self {
        let wand_service = Self::service_uuid();
        let services = vec![
            (
                sig(0x1800),
                vec![characteristic(
                    sig(0x1800),
                    sig(0x2A00),
                    CharacteristicProperties {
                        read: true,
                        ..Default::default()
                    },
                )],
            ),
            (
                sig(0x1801),
                vec![characteristic(
                    sig(0x1801),
                    Self::service_changed_uuid(),
                    CharacteristicProperties {
                        indicate: true,
                        ..Default::default()
                    },
                )],
            ),
            (
                wand_service,
                vec![
                    characteristic(
                        wand_service,
                        Self::write_uuid(),
                        CharacteristicProperties {
                            write_without_response: true,
                            ..Default::default()
                        },
                    ),
                    characteristic(
                        wand_service,
                        Self::notify_uuid(),
                        CharacteristicProperties {
                            notify: true,
                            ..Default::default()
                        },
                    ),
                ],
            ),
            (
                Self::battery_service_uuid(),
                vec![characteristic(
                    Self::battery_service_uuid(),
                    Self::battery_level_uuid(),
                    CharacteristicProperties {
                        read: true,
                        notify: true,
                        ..Default::default()
                    },
                )],
            ),
        ];

        Self {
            state: Mutex::new(MockState {
                device: Some(DeviceHandle {
                    address: 0xC0FFEE001234,
                    name: "MCW-1234".to_string(),
                }),
                services,
                ..Default::default()
            }),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|state| state.calls.clone())
    }

    pub fn writes(&self) -> Vec<MockWrite> {
        self.with(|state| state.writes.clone())
    }

    /// Push a value-changed event to every session subscribed to
    /// `characteristic`; `false` when nobody is
    pub fn notify(&self, characteristic: Uuid, payload: &[u8]) -> bool {
        self.with(|state| {
            let mut delivered = false;
            for ((_, uuid), tx) in &state.subscribers {
                if *uuid == characteristic && tx.send(payload.to_vec()).is_ok() {
                    delivered = true;
                }
            }
            delivered
        })
    }

    /// Simulate the peripheral dropping the link of every open session
    pub fn drop_link(&self) {
        let senders: Vec<_> = self.with(|state| state.disconnect_tx.drain().map(|(_, tx)| tx).collect());
        for tx in senders {
            let _ = tx.send(());
        }
    }

    pub fn subscribed(&self) -> HashSet<Uuid> {
        self.with(|state| state.subscribers.keys().map(|(_, uuid)| *uuid).collect())
    }

    /// Characteristics subscribed through one session
    pub fn subscribed_by(&self, session: u64) -> HashSet<Uuid> {
        self.with(|state| {
            state
                .subscribers
                .keys()
                .filter(|(id, _)| *id == session)
                .map(|(_, uuid)| *uuid)
                .collect()
        })
    }

    fn find(&self, service: Uuid) -> TransportResult<Vec<CharacteristicHandle>> {
        self.with(|state| {
            state
                .services
                .iter()
                .find(|(uuid, _)| *uuid == service)
                .map(|(_, chars)| chars.clone())
                .ok_or_else(|| TransportError::Gatt(format!("service {} not found", service)))
        })
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn scan(
        &self,
        _name_prefix: &str,
        _optional_services: &[Uuid],
    ) -> TransportResult<Option<DeviceHandle>> {
        self.with(|state| {
            state.calls.push("scan".to_string());
            if state.unavailable {
                return Err(TransportError::Unavailable);
            }
            Ok(state.device.clone())
        })
    }

    async fn connect_gatt(&self, device: &DeviceHandle) -> TransportResult<GattSession> {
        if let Some(delay) = self.with(|state| state.connect_delay) {
            tokio::time::sleep(delay).await;
        }
        self.with(|state| {
            if state.fail_connect {
                return Err(TransportError::Gatt("connection refused".to_string()));
            }
            state.calls.push("connect".to_string());
            state.next_session += 1;
            Ok(GattSession {
                id: state.next_session,
                device: device.clone(),
            })
        })
    }

    async fn primary_service(
        &self,
        _session: &GattSession,
        service: Uuid,
    ) -> TransportResult<ServiceHandle> {
        self.find(service)?;
        Ok(ServiceHandle { uuid: service })
    }

    async fn characteristic(
        &self,
        _session: &GattSession,
        service: &ServiceHandle,
        characteristic: Uuid,
    ) -> TransportResult<CharacteristicHandle> {
        self.find(service.uuid)?
            .into_iter()
            .find(|c| c.uuid == characteristic)
            .ok_or_else(|| {
                TransportError::Gatt(format!("characteristic {} not found", characteristic))
            })
    }

    async fn primary_services(&self, _session: &GattSession) -> TransportResult<Vec<ServiceHandle>> {
        self.with(|state| {
            if state.fail_services {
                return Err(TransportError::Gatt("service discovery failed".to_string()));
            }
            Ok(state
                .services
                .iter()
                .map(|(uuid, _)| ServiceHandle { uuid: *uuid })
                .collect())
        })
    }

    async fn characteristics(
        &self,
        _session: &GattSession,
        service: &ServiceHandle,
    ) -> TransportResult<Vec<CharacteristicHandle>> {
        if self.with(|state| state.fail_characteristics.contains(&service.uuid)) {
            return Err(TransportError::Gatt("characteristic discovery failed".to_string()));
        }
        self.find(service.uuid)
    }

    async fn write_without_response(
        &self,
        _session: &GattSession,
        characteristic: &CharacteristicHandle,
        bytes: &[u8],
    ) -> TransportResult<()> {
        self.with(|state| {
            if state.fail_write_at == Some(state.writes.len()) {
                return Err(TransportError::Gatt("write rejected".to_string()));
            }
            state.writes.push(MockWrite {
                characteristic: characteristic.uuid,
                bytes: bytes.to_vec(),
                at: Instant::now(),
            });
            Ok(())
        })
    }

    async fn subscribe(
        &self,
        session: &GattSession,
        characteristic: &CharacteristicHandle,
    ) -> TransportResult<NotificationReceiver> {
        self.with(|state| {
            if state.fail_subscribe.contains(&characteristic.uuid) {
                return Err(TransportError::Gatt("subscribe rejected".to_string()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            state.subscribers.insert((session.id, characteristic.uuid), tx);
            state.calls.push(format!("subscribe {}", characteristic.uuid));
            Ok(rx)
        })
    }

    async fn unsubscribe(
        &self,
        session: &GattSession,
        characteristic: &CharacteristicHandle,
    ) -> TransportResult<()> {
        self.with(|state| {
            state.calls.push(format!("unsubscribe {}", characteristic.uuid));
            state.subscribers.remove(&(session.id, characteristic.uuid));
            if state.fail_unsubscribe {
                return Err(TransportError::Gatt("unsubscribe rejected".to_string()));
            }
            Ok(())
        })
    }

    async fn disconnect(&self, session: &GattSession) -> TransportResult<()> {
        self.with(|state| {
            state.calls.push("disconnect".to_string());
            state.subscribers.retain(|(id, _), _| *id != session.id);
            state.disconnect_tx.remove(&session.id);
            if state.fail_disconnect {
                return Err(TransportError::Gatt("disconnect rejected".to_string()));
            }
            Ok(())
        })
    }

    fn on_disconnected(&self, session: &GattSession) -> TransportResult<DisconnectReceiver> {
        let (tx, rx) = oneshot::channel();
        self.with(|state| state.disconnect_tx.insert(session.id, tx));
        Ok(rx)
    }
}
