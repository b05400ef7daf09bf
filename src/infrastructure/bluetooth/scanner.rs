//! BLE Scanner Module
//!
//! Finds the first advertising wand by its local name prefix.

use crate::infrastructure::bluetooth::transport::{DeviceHandle, TransportError, TransportResult};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Foundation::TypedEventHandler;

/// Advertisement watcher that is stopped when dropped
struct BleScanner {
    watcher: BluetoothLEAdvertisementWatcher,
}

impl BleScanner {
    fn start(name_prefix: &str, found: mpsc::UnboundedSender<DeviceHandle>) -> windows::core::Result<Self> {
        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        // Active scanning so scan responses carrying the local name are seen
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let prefix = name_prefix.to_string();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let name = args.Advertisement()?.LocalName()?.to_string();
                    if name.starts_with(&prefix) {
                        let address = args.BluetoothAddress()?;
                        debug!(
                            "Advertisement from {} ({:#X}, {} dBm)",
                            name,
                            address,
                            args.RawSignalStrengthInDBm()?
                        );
                        let _ = found.send(DeviceHandle { address, name });
                    }
                }
                Ok(())
            },
        );

        watcher.Received(&handler)?;
        watcher.Start()?;
        Ok(Self { watcher })
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        if let Err(e) = self.watcher.Stop() {
            warn!("Failed to stop BLE scan: {}", e);
        }
    }
}

/// Scan until a device named `name_prefix*` advertises or `timeout` passes.
///
/// Failing to start the watcher means there is no usable adapter.
pub async fn find_device(name_prefix: &str, timeout: Duration) -> TransportResult<Option<DeviceHandle>> {
    info!("Scanning for devices named {}*", name_prefix);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let scanner = BleScanner::start(name_prefix, tx).map_err(|e| {
        warn!("Could not start BLE scan: {}", e);
        TransportError::Unavailable
    })?;

    let found = tokio::time::timeout(timeout, rx.recv()).await.ok().flatten();
    drop(scanner);

    match &found {
        Some(device) => info!("Found {} ({:#X})", device.name, device.address),
        None => info!("Scan timed out after {} ms", timeout.as_millis()),
    }
    Ok(found)
}
