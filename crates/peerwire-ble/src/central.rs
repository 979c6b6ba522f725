//! btleplug-backed BLE central
//!
//! Scans for peerwire peripherals, connects to them and turns each connection
//! into a [`BtleplugLink`]. Notifications on the rx characteristic are pushed
//! to the manager as chunks; adapter disconnect events become link
//! disconnects.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use peerwire_core::{PeerwireError, Result};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BleConfig;
use crate::error::BleError;
use crate::link::{BleLink, LinkEvent, LinkEventSender};
use crate::protocol::logical_name_from_device;

// ----------------------------------------------------------------------------
// Discovery
// ----------------------------------------------------------------------------

/// A peerwire peripheral seen during a scan
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub address: String,
    pub device_name: String,
    /// Name carried after the configured prefix
    pub logical_name: Option<String>,
    peripheral: Peripheral,
}

impl DiscoveredDevice {
    pub fn id(&self) -> PeripheralId {
        self.peripheral.id()
    }
}

// ----------------------------------------------------------------------------
// Central
// ----------------------------------------------------------------------------

/// Scans and connects on the first available adapter
pub struct BleCentral {
    config: BleConfig,
    adapter: Adapter,
    links: LinkEventSender,
    /// Addresses of connected peripherals, for mapping adapter events
    connected: Arc<RwLock<HashMap<PeripheralId, String>>>,
    watcher: Option<JoinHandle<()>>,
}

impl BleCentral {
    /// Open the first adapter; link events go to `links`
    pub async fn new(config: BleConfig, links: LinkEventSender) -> Result<Self> {
        config.validate()?;
        let manager = Manager::new().await.map_err(BleError::from)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(BleError::from)?
            .into_iter()
            .next()
            .ok_or(BleError::AdapterNotAvailable)?;
        info!("BLE adapter initialized");

        Ok(Self {
            config,
            adapter,
            links,
            connected: Arc::new(RwLock::new(HashMap::new())),
            watcher: None,
        })
    }

    /// Scan for `scan_timeout` and return the devices carrying our prefix
    pub async fn scan(&self) -> Result<Vec<DiscoveredDevice>> {
        let filter = ScanFilter {
            services: vec![self.config.service_uuid],
        };
        self.adapter
            .start_scan(filter)
            .await
            .map_err(BleError::from)?;
        debug!("Scanning for {:?}", self.config.scan_timeout);
        tokio::time::sleep(self.config.scan_timeout).await;
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop BLE scan: {}", e);
        }

        let mut devices = Vec::new();
        for peripheral in self.adapter.peripherals().await.map_err(BleError::from)? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            let Some(device_name) = properties.local_name else {
                continue;
            };
            if !device_name.starts_with(&self.config.device_name_prefix) {
                continue;
            }
            let logical_name = logical_name_from_device(&device_name, &self.config.device_name_prefix);
            debug!("Discovered {} ({})", device_name, properties.address);
            devices.push(DiscoveredDevice {
                address: properties.address.to_string(),
                device_name,
                logical_name,
                peripheral,
            });
        }
        info!("Scan found {} peerwire devices", devices.len());
        Ok(devices)
    }

    /// Connect, discover the characteristics and start forwarding notifications
    pub async fn connect(&self, device: &DiscoveredDevice) -> Result<Arc<BtleplugLink>> {
        let peripheral = device.peripheral.clone();
        match timeout(self.config.connection_timeout, peripheral.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(BleError::from(e).into()),
            Err(_) => return Err(BleError::ConnectionTimeout.into()),
        }
        peripheral
            .discover_services()
            .await
            .map_err(BleError::from)?;

        let tx = find_characteristic(&peripheral, self.config.tx_characteristic_uuid)?;
        let rx = find_characteristic(&peripheral, self.config.rx_characteristic_uuid)?;
        peripheral.subscribe(&rx).await.map_err(BleError::from)?;
        let mut notifications = peripheral.notifications().await.map_err(BleError::from)?;

        let address = device.address.clone();
        self.connected
            .write()
            .await
            .insert(peripheral.id(), address.clone());

        let links = self.links.clone();
        let rx_uuid = rx.uuid;
        let from = address.clone();
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != rx_uuid {
                    continue;
                }
                let chunk = LinkEvent::Chunk {
                    from: from.clone(),
                    data: notification.value,
                };
                if links.send(chunk).is_err() {
                    break;
                }
            }
            debug!("Notification stream for {} ended", from);
        });

        info!("Connected to {} ({})", device.device_name, address);
        Ok(Arc::new(BtleplugLink {
            peripheral,
            tx,
            address,
            max_write_len: self.config.default_chunk_size,
        }))
    }

    /// Forward adapter disconnect events for connected peripherals
    pub async fn watch_disconnects(&mut self) -> Result<()> {
        if self.watcher.is_some() {
            return Ok(());
        }
        let mut events = self.adapter.events().await.map_err(BleError::from)?;
        let connected = self.connected.clone();
        let links = self.links.clone();
        self.watcher = Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    let address = connected.write().await.remove(&id);
                    if let Some(address) = address {
                        debug!("Adapter reports {} disconnected", address);
                        let lost = LinkEvent::Disconnected {
                            from: address,
                            reason: Some("device disconnected".to_string()),
                        };
                        if links.send(lost).is_err() {
                            break;
                        }
                    }
                }
            }
        }));
        Ok(())
    }

    /// Stop watching adapter events
    pub fn shutdown(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

impl Drop for BleCentral {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| {
            BleError::CharacteristicNotFound {
                characteristic: uuid.to_string(),
            }
            .into()
        })
}

// ----------------------------------------------------------------------------
// btleplug Link
// ----------------------------------------------------------------------------

/// A connected peripheral written through its tx characteristic
#[derive(Debug)]
pub struct BtleplugLink {
    peripheral: Peripheral,
    tx: Characteristic,
    address: String,
    max_write_len: usize,
}

#[async_trait]
impl BleLink for BtleplugLink {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn max_write_len(&self) -> usize {
        self.max_write_len
    }

    async fn ready_for_write(&self) -> Result<()> {
        // Writes go out with response, so the previous write has already been
        // acknowledged by the time the worker asks again.
        match self.peripheral.is_connected().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(BleError::Disconnected.into()),
            Err(e) => Err(BleError::from(e).into()),
        }
    }

    async fn write(&self, chunk: &[u8]) -> Result<()> {
        self.peripheral
            .write(&self.tx, chunk, WriteType::WithResponse)
            .await
            .map_err(|e| PeerwireError::write_failed(e.to_string()))
    }

    async fn disconnect(&self) -> Result<()> {
        if let Err(e) = self.peripheral.disconnect().await {
            error!("Failed to disconnect from {}: {}", self.address, e);
            return Err(BleError::from(e).into());
        }
        info!("Disconnected from {}", self.address);
        Ok(())
    }
}
