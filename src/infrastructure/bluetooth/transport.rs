//! BLE transport capability
//!
//! Central-role operations the engine needs from the host's Bluetooth stack.
//! Platform adapters implement [`BleTransport`]; the sessions only ever see
//! the trait object.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("BLE adapter not available")]
    Unavailable,

    #[error("GATT operation failed: {0}")]
    Gatt(String),

    #[error("Link closed")]
    Closed,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// A peripheral found by a scan
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub address: u64,
    pub name: String,
}

/// An open GATT connection to one device.
///
/// `id` is unique per `connect_gatt` call, so two sessions on the same
/// device never act on each other's link.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GattSession {
    pub id: u64,
    pub device: DeviceHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
    pub uuid: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    /// Whether the characteristic can push values to us
    pub fn can_subscribe(&self) -> bool {
        self.notify || self.indicate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    pub service: Uuid,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

/// Value-changed notifications of one subscribed characteristic
pub type NotificationReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

/// Resolves once the link drops on the transport side
pub type DisconnectReceiver = oneshot::Receiver<()>;

#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Find the first device whose advertised name starts with `name_prefix`.
    /// `Ok(None)` means nothing matched or the user cancelled.
    async fn scan(
        &self,
        name_prefix: &str,
        optional_services: &[Uuid],
    ) -> TransportResult<Option<DeviceHandle>>;

    /// Open a new connection. Each call yields a distinct session; closing
    /// one leaves any other session to the same device untouched.
    async fn connect_gatt(&self, device: &DeviceHandle) -> TransportResult<GattSession>;

    async fn primary_service(
        &self,
        session: &GattSession,
        service: Uuid,
    ) -> TransportResult<ServiceHandle>;

    async fn characteristic(
        &self,
        session: &GattSession,
        service: &ServiceHandle,
        characteristic: Uuid,
    ) -> TransportResult<CharacteristicHandle>;

    async fn primary_services(&self, session: &GattSession) -> TransportResult<Vec<ServiceHandle>>;

    async fn characteristics(
        &self,
        session: &GattSession,
        service: &ServiceHandle,
    ) -> TransportResult<Vec<CharacteristicHandle>>;

    async fn write_without_response(
        &self,
        session: &GattSession,
        characteristic: &CharacteristicHandle,
        bytes: &[u8],
    ) -> TransportResult<()>;

    async fn subscribe(
        &self,
        session: &GattSession,
        characteristic: &CharacteristicHandle,
    ) -> TransportResult<NotificationReceiver>;

    async fn unsubscribe(
        &self,
        session: &GattSession,
        characteristic: &CharacteristicHandle,
    ) -> TransportResult<()>;

    /// Close `session` and drop everything subscribed through it
    async fn disconnect(&self, session: &GattSession) -> TransportResult<()>;

    /// Register for the transport-side disconnect event of `session`
    fn on_disconnected(&self, session: &GattSession) -> TransportResult<DisconnectReceiver>;
}
