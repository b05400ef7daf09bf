//! Bluetooth Module
//!
//! Talks to the wand over BLE and, separately, sniffs every notifying
//! characteristic it exposes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐        ┌──────────────────────┐
//! │    SessionHandle     │        │    SnifferHandle     │
//! └──────────┬───────────┘        └──────────┬───────────┘
//!            │ commands                      │ commands
//!            ▼                               ▼
//! ┌──────────────────────┐        ┌──────────────────────┐
//! │   ProtocolSession    │        │    SnifferSession    │
//! │ - macros, probe      │        │ - discover all       │
//! │ ┌──────────────────┐ │        │ - subscribe all      │
//! │ │ConnectionSupervis│ │        │ - tag raw frames     │
//! │ │ - link, keepalive│ │        └──────────┬───────────┘
//! │ │ - chunked writes │ │                   │
//! │ └────────┬─────────┘ │                   │
//! └──────────┼───────────┘                   │
//!            └─────────────┬─────────────────┘
//!                          ▼
//!                 ┌──────────────────┐
//!                 │   BleTransport   │  (WinRT on Windows)
//!                 └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Wire constants, macro encoding and notification decoding
//! - [`transport`] - The BLE capability the sessions are written against
//! - [`connection`] - Link lifecycle, keepalive and chunked writes
//! - [`service`] - Controller session: macros, opcodes and the probe
//! - [`sniffer`] - Discovery session logging every characteristic

pub mod connection;
pub mod protocol;
#[cfg(windows)]
pub mod scanner;
pub mod service;
pub mod sniffer;
pub mod transport;
#[cfg(windows)]
pub mod winrt;

#[cfg(test)]
mod mock;

pub use service::{ProtocolSession, SessionHandle};
pub use sniffer::{SnifferHandle, SnifferSession};

use crate::domain::settings::WandSettings;
use async_trait::async_trait;
use std::sync::Arc;
use transport::{
    BleTransport, CharacteristicHandle, DeviceHandle, DisconnectReceiver, GattSession,
    NotificationReceiver, ServiceHandle, TransportError, TransportResult,
};
use uuid::Uuid;

/// Stand-in for hosts without a BLE stack; every operation reports the
/// adapter as unavailable.
pub struct NoTransport;

#[async_trait]
impl BleTransport for NoTransport {
    async fn scan(&self, _: &str, _: &[Uuid]) -> TransportResult<Option<DeviceHandle>> {
        Err(TransportError::Unavailable)
    }

    async fn connect_gatt(&self, _: &DeviceHandle) -> TransportResult<GattSession> {
        Err(TransportError::Unavailable)
    }

    async fn primary_service(&self, _: &GattSession, _: Uuid) -> TransportResult<ServiceHandle> {
        Err(TransportError::Unavailable)
    }

    async fn characteristic(
        &self,
        _: &GattSession,
        _: &ServiceHandle,
        _: Uuid,
    ) -> TransportResult<CharacteristicHandle> {
        Err(TransportError::Unavailable)
    }

    async fn primary_services(&self, _: &GattSession) -> TransportResult<Vec<ServiceHandle>> {
        Err(TransportError::Unavailable)
    }

    async fn characteristics(
        &self,
        _: &GattSession,
        _: &ServiceHandle,
    ) -> TransportResult<Vec<CharacteristicHandle>> {
        Err(TransportError::Unavailable)
    }

    async fn write_without_response(
        &self,
        _: &GattSession,
        _: &CharacteristicHandle,
        _: &[u8],
    ) -> TransportResult<()> {
        Err(TransportError::Unavailable)
    }

    async fn subscribe(
        &self,
        _: &GattSession,
        _: &CharacteristicHandle,
    ) -> TransportResult<NotificationReceiver> {
        Err(TransportError::Unavailable)
    }

    async fn unsubscribe(&self, _: &GattSession, _: &CharacteristicHandle) -> TransportResult<()> {
        Err(TransportError::Unavailable)
    }

    async fn disconnect(&self, _: &GattSession) -> TransportResult<()> {
        Err(TransportError::Unavailable)
    }

    fn on_disconnected(&self, _: &GattSession) -> TransportResult<DisconnectReceiver> {
        Err(TransportError::Unavailable)
    }
}

/// The host's BLE transport
#[cfg(windows)]
pub fn platform_transport(settings: &WandSettings) -> Arc<dyn BleTransport> {
    Arc::new(winrt::WinRtTransport::new(std::time::Duration::from_millis(
        settings.scan_timeout_ms,
    )))
}

/// The host's BLE transport
#[cfg(not(windows))]
pub fn platform_transport(_settings: &WandSettings) -> Arc<dyn BleTransport> {
    tracing::warn!("No BLE transport for this platform");
    Arc::new(NoTransport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ConnectionState;
    use crate::domain::opcodes::OpcodeTable;
    use crate::domain::telemetry::{EventSink, TelemetryFrame};
    use crate::error::WandError;
    use connection::SupervisorConfig;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_no_transport_reports_unavailable_once() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx, 16);
        let (handle, _task) = ProtocolSession::new(
            Arc::new(NoTransport),
            SupervisorConfig::default(),
            OpcodeTable::default(),
            sink.clone(),
        )
        .spawn();

        assert_eq!(handle.connect().await, Err(WandError::TransportUnavailable));
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        let _ = handle.connect().await;

        let errors = sink
            .snapshot()
            .into_iter()
            .filter(|entry| matches!(entry.frame, TelemetryFrame::Error(_)))
            .count();
        assert_eq!(errors, 1);
    }
}
