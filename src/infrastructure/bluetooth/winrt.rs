//! WinRT BLE transport
//!
//! Implements [`BleTransport`] on top of `Windows.Devices.Bluetooth`. WinRT
//! objects stay inside this module, keyed by session id; the sessions only
//! see the plain handles from [`transport`](super::transport). Every
//! `connect_gatt` opens its own `BluetoothLEDevice`, so the controller and
//! the sniffer can hold the same wand without closing each other's link.

use crate::infrastructure::bluetooth::scanner;
use crate::infrastructure::bluetooth::transport::{
    BleTransport, CharacteristicHandle, CharacteristicProperties, DeviceHandle,
    DisconnectReceiver, GattSession, NotificationReceiver, ServiceHandle, TransportError,
    TransportResult,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::GUID;
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCharacteristicProperties,
    GattClientCharacteristicConfigurationDescriptorValue, GattCommunicationStatus,
    GattDeviceService, GattSession as WinGattSession, GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

fn guid(uuid: Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

fn uuid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

fn gatt_err(e: windows::core::Error) -> TransportError {
    TransportError::Gatt(e.message().to_string())
}

fn check(status: GattCommunicationStatus, what: &str) -> TransportResult<()> {
    if status == GattCommunicationStatus::Success {
        Ok(())
    } else {
        Err(TransportError::Gatt(format!("{} returned {:?}", what, status)))
    }
}

fn properties(flags: GattCharacteristicProperties) -> CharacteristicProperties {
    CharacteristicProperties {
        read: flags.contains(GattCharacteristicProperties::Read),
        write: flags.contains(GattCharacteristicProperties::Write),
        write_without_response: flags.contains(GattCharacteristicProperties::WriteWithoutResponse),
        notify: flags.contains(GattCharacteristicProperties::Notify),
        indicate: flags.contains(GattCharacteristicProperties::Indicate),
    }
}

fn read_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

/// Everything WinRT hands us for one GATT session
struct Link {
    address: u64,
    device: BluetoothLEDevice,
    session: Option<WinGattSession>,
    services: HashMap<Uuid, GattDeviceService>,
    characteristics: HashMap<(Uuid, Uuid), GattCharacteristic>,
    value_tokens: HashMap<(Uuid, Uuid), i64>,
    status_token: Option<i64>,
}

impl Link {
    fn close(self) {
        if let Some(token) = self.status_token {
            let _ = self.device.RemoveConnectionStatusChanged(token);
        }
        for (key, token) in self.value_tokens {
            if let Some(characteristic) = self.characteristics.get(&key) {
                let _ = characteristic.RemoveValueChanged(token);
            }
        }
        for service in self.services.values() {
            let _ = service.Close();
        }
        if let Some(session) = self.session {
            let _ = session.Close();
        }
        let _ = self.device.Close();
    }
}

pub struct WinRtTransport {
    scan_timeout: Duration,
    next_session: AtomicU64,
    links: Mutex<HashMap<u64, Link>>,
}

impl WinRtTransport {
    pub fn new(scan_timeout: Duration) -> Self {
        Self {
            scan_timeout,
            next_session: AtomicU64::new(1),
            links: Mutex::new(HashMap::new()),
        }
    }

    fn with_link<R>(
        &self,
        session: &GattSession,
        f: impl FnOnce(&mut Link) -> TransportResult<R>,
    ) -> TransportResult<R> {
        let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        let link = links.get_mut(&session.id).ok_or(TransportError::Closed)?;
        f(link)
    }

    async fn service(&self, session: &GattSession, service: Uuid) -> TransportResult<GattDeviceService> {
        if let Some(found) = self.with_link(session, |link| Ok(link.services.get(&service).cloned()))? {
            return Ok(found);
        }

        let device = self.with_link(session, |link| Ok(link.device.clone()))?;
        let result = device
            .GetGattServicesForUuidAsync(guid(service))
            .map_err(gatt_err)?
            .await
            .map_err(gatt_err)?;
        check(result.Status().map_err(gatt_err)?, "service lookup")?;

        let services = result.Services().map_err(gatt_err)?;
        if services.Size().map_err(gatt_err)? == 0 {
            return Err(TransportError::Gatt(format!("service {} not found", service)));
        }
        let found = services.GetAt(0).map_err(gatt_err)?;
        self.with_link(session, |link| {
            link.services.insert(service, found.clone());
            Ok(found)
        })
    }

    fn gatt_characteristic(
        &self,
        session: &GattSession,
        characteristic: &CharacteristicHandle,
    ) -> TransportResult<GattCharacteristic> {
        self.with_link(session, |link| {
            link.characteristics
                .get(&(characteristic.service, characteristic.uuid))
                .cloned()
                .ok_or_else(|| {
                    TransportError::Gatt(format!("characteristic {} not resolved", characteristic.uuid))
                })
        })
    }

    fn remember(
        &self,
        session: &GattSession,
        service: Uuid,
        found: GattCharacteristic,
    ) -> TransportResult<CharacteristicHandle> {
        let handle = CharacteristicHandle {
            service,
            uuid: uuid(found.Uuid().map_err(gatt_err)?),
            properties: properties(found.CharacteristicProperties().map_err(gatt_err)?),
        };
        self.with_link(session, |link| {
            link.characteristics.insert((service, handle.uuid), found);
            Ok(handle)
        })
    }
}

#[async_trait]
impl BleTransport for WinRtTransport {
    async fn scan(
        &self,
        name_prefix: &str,
        optional_services: &[Uuid],
    ) -> TransportResult<Option<DeviceHandle>> {
        // WinRT grants GATT access without an up-front service allowlist
        debug!("Optional services: {:?}", optional_services);
        scanner::find_device(name_prefix, self.scan_timeout).await
    }

    async fn connect_gatt(&self, device: &DeviceHandle) -> TransportResult<GattSession> {
        info!("Connecting to Bluetooth device: {:#X}", device.address);
        let ble_device = BluetoothLEDevice::FromBluetoothAddressAsync(device.address)
            .map_err(gatt_err)?
            .await
            .map_err(gatt_err)?;

        // Keeps Windows from dropping the link between our writes
        let session = match WinGattSession::FromDeviceIdAsync(&ble_device.BluetoothDeviceId().map_err(gatt_err)?)
            .map_err(gatt_err)?
            .await
        {
            Ok(session) => {
                session.SetMaintainConnection(true).map_err(gatt_err)?;
                Some(session)
            }
            Err(e) => {
                warn!("Failed to create GattSession, continuing anyway: {}", e);
                None
            }
        };

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let link = Link {
            address: device.address,
            device: ble_device,
            session,
            services: HashMap::new(),
            characteristics: HashMap::new(),
            value_tokens: HashMap::new(),
            status_token: None,
        };
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, link);
        debug!("GATT session {} open to {:#X}", id, device.address);

        Ok(GattSession {
            id,
            device: device.clone(),
        })
    }

    async fn primary_service(
        &self,
        session: &GattSession,
        service: Uuid,
    ) -> TransportResult<ServiceHandle> {
        self.service(session, service).await?;
        Ok(ServiceHandle { uuid: service })
    }

    async fn characteristic(
        &self,
        session: &GattSession,
        service: &ServiceHandle,
        characteristic: Uuid,
    ) -> TransportResult<CharacteristicHandle> {
        let gatt_service = self.service(session, service.uuid).await?;
        let result = gatt_service
            .GetCharacteristicsForUuidAsync(guid(characteristic))
            .map_err(gatt_err)?
            .await
            .map_err(gatt_err)?;
        check(result.Status().map_err(gatt_err)?, "characteristic lookup")?;

        let found = result.Characteristics().map_err(gatt_err)?;
        if found.Size().map_err(gatt_err)? == 0 {
            return Err(TransportError::Gatt(format!(
                "characteristic {} not found",
                characteristic
            )));
        }
        self.remember(session, service.uuid, found.GetAt(0).map_err(gatt_err)?)
    }

    async fn primary_services(&self, session: &GattSession) -> TransportResult<Vec<ServiceHandle>> {
        let device = self.with_link(session, |link| Ok(link.device.clone()))?;
        let result = device
            .GetGattServicesAsync()
            .map_err(gatt_err)?
            .await
            .map_err(gatt_err)?;
        check(result.Status().map_err(gatt_err)?, "service discovery")?;

        let services = result.Services().map_err(gatt_err)?;
        let mut handles = Vec::new();
        for i in 0..services.Size().map_err(gatt_err)? {
            let service = services.GetAt(i).map_err(gatt_err)?;
            let service_uuid = uuid(service.Uuid().map_err(gatt_err)?);
            self.with_link(session, |link| {
                link.services.insert(service_uuid, service);
                Ok(())
            })?;
            handles.push(ServiceHandle { uuid: service_uuid });
        }
        Ok(handles)
    }

    async fn characteristics(
        &self,
        session: &GattSession,
        service: &ServiceHandle,
    ) -> TransportResult<Vec<CharacteristicHandle>> {
        let gatt_service = self.service(session, service.uuid).await?;
        let result = gatt_service
            .GetCharacteristicsAsync()
            .map_err(gatt_err)?
            .await
            .map_err(gatt_err)?;
        check(result.Status().map_err(gatt_err)?, "characteristic discovery")?;

        let found = result.Characteristics().map_err(gatt_err)?;
        let mut handles = Vec::new();
        for i in 0..found.Size().map_err(gatt_err)? {
            handles.push(self.remember(session, service.uuid, found.GetAt(i).map_err(gatt_err)?)?);
        }
        Ok(handles)
    }

    async fn write_without_response(
        &self,
        session: &GattSession,
        characteristic: &CharacteristicHandle,
        bytes: &[u8],
    ) -> TransportResult<()> {
        let gatt = self.gatt_characteristic(session, characteristic)?;

        let writer = DataWriter::new().map_err(gatt_err)?;
        writer.WriteBytes(bytes).map_err(gatt_err)?;
        let buffer = writer.DetachBuffer().map_err(gatt_err)?;

        let status = gatt
            .WriteValueWithOptionAsync(&buffer, GattWriteOption::WriteWithoutResponse)
            .map_err(gatt_err)?
            .await
            .map_err(gatt_err)?;
        check(status, "write")
    }

    async fn subscribe(
        &self,
        session: &GattSession,
        characteristic: &CharacteristicHandle,
    ) -> TransportResult<NotificationReceiver> {
        let gatt = self.gatt_characteristic(session, characteristic)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let bytes = read_buffer(&args.CharacteristicValue()?)?;
                    let _ = tx.send(bytes);
                }
                Ok(())
            },
        );
        let token = gatt.ValueChanged(&handler).map_err(gatt_err)?;

        let descriptor = if characteristic.properties.notify {
            GattClientCharacteristicConfigurationDescriptorValue::Notify
        } else {
            GattClientCharacteristicConfigurationDescriptorValue::Indicate
        };
        let written = match gatt.WriteClientCharacteristicConfigurationDescriptorAsync(descriptor) {
            Ok(op) => op.await.map_err(gatt_err),
            Err(e) => Err(gatt_err(e)),
        }
        .and_then(|status| check(status, "notification subscription"));

        if let Err(e) = written {
            let _ = gatt.RemoveValueChanged(token);
            return Err(e);
        }

        self.with_link(session, |link| {
            link.value_tokens
                .insert((characteristic.service, characteristic.uuid), token);
            Ok(())
        })?;
        Ok(rx)
    }

    async fn unsubscribe(
        &self,
        session: &GattSession,
        characteristic: &CharacteristicHandle,
    ) -> TransportResult<()> {
        let gatt = self.gatt_characteristic(session, characteristic)?;
        let key = (characteristic.service, characteristic.uuid);
        let token = self.with_link(session, |link| Ok(link.value_tokens.remove(&key)))?;
        if let Some(token) = token {
            gatt.RemoveValueChanged(token).map_err(gatt_err)?;
        }

        // The descriptor is per device; leave it on while another session listens
        let shared = self
            .links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|(id, link)| {
                *id != session.id
                    && link.address == session.device.address
                    && link.value_tokens.contains_key(&key)
            });
        if shared {
            debug!("Keeping notifications on {} for another session", characteristic.uuid);
            return Ok(());
        }

        let status = gatt
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::None,
            )
            .map_err(gatt_err)?
            .await
            .map_err(gatt_err)?;
        check(status, "notification unsubscribe")
    }

    async fn disconnect(&self, session: &GattSession) -> TransportResult<()> {
        let link = self
            .links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session.id);
        match link {
            Some(link) => {
                link.close();
                info!(
                    "Closed GATT session {} to {:#X}",
                    session.id, session.device.address
                );
                Ok(())
            }
            None => Err(TransportError::Closed),
        }
    }

    fn on_disconnected(&self, session: &GattSession) -> TransportResult<DisconnectReceiver> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));

        let handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        if let Some(tx) = tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                            let _ = tx.send(());
                        }
                    }
                }
                Ok(())
            });

        self.with_link(session, |link| {
            if let Some(old) = link.status_token.take() {
                let _ = link.device.RemoveConnectionStatusChanged(old);
            }
            link.status_token = Some(
                link.device
                    .ConnectionStatusChanged(&handler)
                    .map_err(gatt_err)?,
            );
            Ok(())
        })?;
        Ok(rx)
    }
}
