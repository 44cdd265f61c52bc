//! WinRT Link Provider
//!
//! Talks to the joystick firmware through the Windows Bluetooth LE APIs:
//! device by 48-bit address, GATT service lookup, CCCD notify
//! subscription, and `ConnectionStatusChanged` for loss events.
//! Discovery listens for advertisements carrying the joystick service UUID.

use crate::infrastructure::bluetooth::link::{
    format_mac_address, parse_mac_address, DiscoveredDevice, DisconnectHandler, FrameHandler,
    LinkError, LinkProvider, PeripheralLink,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattDeviceService, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::DataReader;

pub struct WinRtProvider {
    service_uuid: String,
}

impl WinRtProvider {
    pub fn new(service_uuid: impl Into<String>) -> Self {
        Self {
            service_uuid: service_uuid.into(),
        }
    }
}

impl LinkProvider for WinRtProvider {
    type Link = WinRtLink;

    async fn connect(&self, address: &str) -> Result<WinRtLink, LinkError> {
        let fail = |e: windows::core::Error| LinkError::connect_failed(address, e);

        let raw_address = parse_mac_address(address)
            .ok_or_else(|| LinkError::connect_failed(address, "not a 48-bit Bluetooth address"))?;
        let service_uuid = parse_uuid(&self.service_uuid).ok_or_else(|| {
            LinkError::connect_failed(address, format!("invalid service UUID {}", self.service_uuid))
        })?;

        let device = BluetoothLEDevice::FromBluetoothAddressAsync(raw_address)
            .map_err(fail)?
            .await
            .map_err(fail)?;
        debug!(address, "Device handle acquired");

        match open_service(&device, service_uuid).await {
            Ok(service) => {
                info!(address, "Found joystick service");
                Ok(WinRtLink {
                    device,
                    service,
                    data_characteristic: None,
                    value_token: None,
                    status_token: None,
                    closed: false,
                })
            }
            Err(reason) => {
                let _ = device.Close();
                Err(LinkError::connect_failed(address, reason))
            }
        }
    }

    async fn scan(&self, window: Duration) -> Result<Vec<DiscoveredDevice>, LinkError> {
        let fail = |e: windows::core::Error| LinkError::ScanFailed(e.to_string());

        let service_uuid = parse_uuid(&self.service_uuid).ok_or_else(|| {
            LinkError::ScanFailed(format!("invalid service UUID {}", self.service_uuid))
        })?;

        let watcher = BluetoothLEAdvertisementWatcher::new().map_err(fail)?;
        watcher
            .SetScanningMode(BluetoothLEScanningMode::Active)
            .map_err(fail)?;

        let found: Arc<Mutex<HashMap<u64, DiscoveredDevice>>> = Arc::default();
        let sink = found.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let adv = args.Advertisement()?;
                    let service_uuids = adv.ServiceUuids()?;

                    let mut matches = false;
                    for i in 0..service_uuids.Size()? {
                        if service_uuids.GetAt(i)? == service_uuid {
                            matches = true;
                            break;
                        }
                    }

                    if matches {
                        let raw = args.BluetoothAddress()?;
                        let name = adv.LocalName()?.to_string();
                        let device = DiscoveredDevice {
                            address: format_mac_address(raw),
                            name: (!name.is_empty()).then_some(name),
                            signal_strength: Some(args.RawSignalStrengthInDBm()?),
                        };
                        sink.lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(raw, device);
                    }
                }
                Ok(())
            },
        );

        let token = watcher.Received(&handler).map_err(fail)?;
        watcher.Start().map_err(fail)?;
        info!("Scanning for joysticks for {:?}", window);

        tokio::time::sleep(window).await;

        let _ = watcher.Stop();
        let _ = watcher.RemoveReceived(token);

        let mut devices: Vec<DiscoveredDevice> = found
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, device)| device)
            .collect();
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        info!("Scan finished, {} joystick(s) found", devices.len());
        Ok(devices)
    }
}

async fn open_service(device: &BluetoothLEDevice, uuid: GUID) -> Result<GattDeviceService, String> {
    let result = device
        .GetGattServicesForUuidAsync(uuid)
        .map_err(|e| e.to_string())?
        .await
        .map_err(|e| e.to_string())?;

    let status = result.Status().map_err(|e| e.to_string())?;
    if status != GattCommunicationStatus::Success {
        return Err(format!("GATT service query returned {:?}", status));
    }

    let services = result.Services().map_err(|e| e.to_string())?;
    if services.Size().map_err(|e| e.to_string())? == 0 {
        return Err("joystick service not found".to_string());
    }
    services.GetAt(0).map_err(|e| e.to_string())
}

pub struct WinRtLink {
    device: BluetoothLEDevice,
    service: GattDeviceService,
    data_characteristic: Option<GattCharacteristic>,
    value_token: Option<i64>,
    status_token: Option<i64>,
    closed: bool,
}

impl WinRtLink {
    async fn find_characteristic(&self, uuid: GUID) -> windows::core::Result<Option<GattCharacteristic>> {
        let result = self.service.GetCharacteristicsAsync()?.await?;
        if result.Status()? != GattCommunicationStatus::Success {
            return Ok(None);
        }

        let characteristics = result.Characteristics()?;
        for i in 0..characteristics.Size()? {
            let characteristic = characteristics.GetAt(i)?;
            if characteristic.Uuid()? == uuid {
                return Ok(Some(characteristic));
            }
        }
        Ok(None)
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(characteristic) = self.data_characteristic.take() {
            if let Some(token) = self.value_token.take() {
                let _ = characteristic.RemoveValueChanged(token);
            }
        }
        if let Some(token) = self.status_token.take() {
            let _ = self.device.RemoveConnectionStatusChanged(token);
        }
        let _ = self.service.Close();
        let _ = self.device.Close();
    }
}

impl PeripheralLink for WinRtLink {
    async fn subscribe(&mut self, characteristic: &str, handler: FrameHandler) -> Result<(), LinkError> {
        let fail = |e: windows::core::Error| LinkError::subscribe_failed(characteristic, e);

        let uuid = parse_uuid(characteristic)
            .ok_or_else(|| LinkError::subscribe_failed(characteristic, "invalid UUID"))?;
        let data = self
            .find_characteristic(uuid)
            .await
            .map_err(fail)?
            .ok_or_else(|| LinkError::subscribe_failed(characteristic, "characteristic not found"))?;

        let value_handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let buffer = args.CharacteristicValue()?;
                    let reader = DataReader::FromBuffer(&buffer)?;
                    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
                    reader.ReadBytes(&mut bytes)?;
                    handler(&bytes);
                }
                Ok(())
            },
        );
        self.value_token = Some(data.ValueChanged(&value_handler).map_err(fail)?);
        self.data_characteristic = Some(data.clone());

        let status = data
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )
            .map_err(fail)?
            .await
            .map_err(fail)?;
        if status != GattCommunicationStatus::Success {
            return Err(LinkError::subscribe_failed(
                characteristic,
                format!("notify subscription returned {:?}", status),
            ));
        }

        info!("Notifications enabled");
        Ok(())
    }

    fn on_disconnect(&mut self, handler: DisconnectHandler) -> bool {
        let pending = Mutex::new(Some(handler));
        let status_handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        let notify = pending
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .take();
                        if let Some(notify) = notify {
                            notify();
                        }
                    }
                }
                Ok(())
            });

        match self.device.ConnectionStatusChanged(&status_handler) {
            Ok(token) => {
                self.status_token = Some(token);
                true
            }
            Err(e) => {
                warn!("Could not watch connection status: {}", e);
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.device
            .ConnectionStatus()
            .map(|s| s == BluetoothConnectionStatus::Connected)
            .unwrap_or(false)
    }

    async fn close(&mut self) {
        self.release();
    }
}

impl Drop for WinRtLink {
    fn drop(&mut self) {
        self.release();
    }
}

/// Parse a dashed UUID string into a Windows GUID
fn parse_uuid(uuid: &str) -> Option<GUID> {
    let hex = uuid.replace('-', "");
    if hex.len() != 32 {
        return None;
    }
    u128::from_str_radix(&hex, 16).ok().map(GUID::from_u128)
}
