use async_trait::async_trait;
use btleplug::{
    api::{
        BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use futures::stream::StreamExt;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{CommandError, Result, TymewearError},
    transport::{AdvertisementHandler, BleTransport, DisconnectHandler, NotificationHandler},
    types::{Advertisement, DeviceAddress},
    SERVICE_UUID,
};

type HandlerMap = Arc<RwLock<HashMap<Uuid, NotificationHandler>>>;

/// [`BleTransport`] backed by the platform Bluetooth stack through btleplug
pub struct BtleplugTransport {
    adapter: Adapter,
    peripheral: Mutex<Option<Peripheral>>,
    characteristics: Mutex<HashMap<Uuid, Characteristic>>,
    handlers: HandlerMap,
    disconnect_handler: Arc<Mutex<Option<DisconnectHandler>>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    link_tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn to_bdaddr(address: DeviceAddress) -> BDAddr {
    BDAddr::from(address.to_bytes())
}

fn from_bdaddr(address: BDAddr) -> DeviceAddress {
    DeviceAddress::from_bytes(address.into_inner())
}

impl BtleplugTransport {
    /// Create a transport on the first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`TymewearError::DeviceNotFound`] if no Bluetooth adapters are available,
    /// or [`TymewearError::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TymewearError::DeviceNotFound)?;
        info!("Using Bluetooth adapter: {}", adapter.adapter_info().await?);

        Ok(Self {
            adapter,
            peripheral: Mutex::new(None),
            characteristics: Mutex::new(HashMap::new()),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            disconnect_handler: Arc::new(Mutex::new(None)),
            scan_task: Mutex::new(None),
            link_tasks: Mutex::new(Vec::new()),
        })
    }

    fn peripheral(&self) -> Result<Peripheral> {
        lock(&self.peripheral)
            .clone()
            .ok_or_else(|| CommandError::NotConnected.into())
    }

    fn characteristic(&self, peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
        if let Some(characteristic) = lock(&self.characteristics).get(&uuid) {
            return Ok(characteristic.clone());
        }
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| TymewearError::Transport(format!("Characteristic {uuid} not found")))?;
        lock(&self.characteristics).insert(uuid, characteristic.clone());
        Ok(characteristic)
    }

    async fn spawn_link_tasks(&self, peripheral: &Peripheral) -> Result<()> {
        let mut notifications = peripheral.notifications().await?;
        let handlers = self.handlers.clone();
        let pump = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let handler = handlers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&notification.uuid)
                    .cloned();
                match handler {
                    Some(handler) => handler(&notification.value),
                    None => debug!("Unrouted notification from {}", notification.uuid),
                }
            }
            debug!("Notification stream ended");
        });

        let mut events = self.adapter.events().await?;
        let id = peripheral.id();
        let disconnect_handler = self.disconnect_handler.clone();
        let watcher = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        let handler = lock(&disconnect_handler).clone();
                        if let Some(handler) = handler {
                            handler();
                        }
                        break;
                    }
                }
            }
        });

        lock(&self.link_tasks).extend([pump, watcher]);
        Ok(())
    }

    fn stop_link_tasks(&self) {
        for task in lock(&self.link_tasks).drain(..) {
            task.abort();
        }
    }
}

async fn report_advertisement(
    adapter: &Adapter,
    id: &PeripheralId,
    handler: &AdvertisementHandler,
) {
    let Ok(peripheral) = adapter.peripheral(id).await else {
        return;
    };
    if let Ok(Some(properties)) = peripheral.properties().await {
        handler(Advertisement {
            address: from_bdaddr(properties.address),
            local_name: properties.local_name,
            rssi: properties.rssi.unwrap_or(0),
            services: properties.services,
        });
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn start_scan(&self, handler: AdvertisementHandler) -> Result<()> {
        let mut events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![SERVICE_UUID],
            })
            .await?;

        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        report_advertisement(&adapter, &id, &handler).await;
                    }
                    _ => {}
                }
            }
        });
        if let Some(previous) = lock(&self.scan_task).replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        if let Some(task) = lock(&self.scan_task).take() {
            task.abort();
        }
        if let Err(e) = self.adapter.stop_scan().await {
            debug!("Stopping scan: {}", e);
        }
        Ok(())
    }

    async fn connect(&self, address: DeviceAddress) -> Result<()> {
        let target = to_bdaddr(address);
        let peripheral = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.address() == target)
            .ok_or(TymewearError::DeviceNotFound)?;

        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        lock(&self.characteristics).clear();
        *lock(&self.peripheral) = Some(peripheral.clone());

        if let Err(e) = self.spawn_link_tasks(&peripheral).await {
            warn!("Failed to attach to {}: {}", target, e);
            return Err(e);
        }
        Ok(())
    }

    async fn discover_service(&self, service: Uuid) -> Result<bool> {
        let peripheral = self.peripheral()?;
        peripheral.discover_services().await?;
        Ok(peripheral.services().iter().any(|s| s.uuid == service))
    }

    async fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<bool> {
        let peripheral = self.peripheral()?;
        let found = peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == service)
            .flat_map(|s| s.characteristics)
            .find(|c| c.uuid == characteristic);

        Ok(found.map_or(false, |c| {
            lock(&self.characteristics).insert(characteristic, c);
            true
        }))
    }

    fn set_notification_handler(&self, characteristic: Uuid, handler: NotificationHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(characteristic, handler);
    }

    fn clear_notification_handler(&self, characteristic: Uuid) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&characteristic);
    }

    fn set_disconnect_handler(&self, handler: Option<DisconnectHandler>) {
        *lock(&self.disconnect_handler) = handler;
    }

    async fn enable_notify(&self, characteristic: Uuid) -> Result<bool> {
        let peripheral = self.peripheral()?;
        let target = self.characteristic(&peripheral, characteristic)?;
        match peripheral.subscribe(&target).await {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!("Subscribe to {} failed: {}", characteristic, e);
                Ok(false)
            }
        }
    }

    async fn disable_notify(&self, characteristic: Uuid) -> Result<()> {
        let peripheral = self.peripheral()?;
        let target = self.characteristic(&peripheral, characteristic)?;
        peripheral.unsubscribe(&target).await?;
        Ok(())
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let peripheral = self.peripheral()?;
        let target = self.characteristic(&peripheral, characteristic)?;
        debug!("Writing {:02X?} to {}", data, characteristic);
        peripheral
            .write(&target, data, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        let peripheral = self.peripheral()?;
        let target = self.characteristic(&peripheral, characteristic)?;
        Ok(peripheral.read(&target).await?)
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop_link_tasks();
        lock(&self.characteristics).clear();
        let Some(peripheral) = lock(&self.peripheral).take() else {
            return Ok(());
        };
        if peripheral.is_connected().await.unwrap_or(false) {
            peripheral.disconnect().await?;
        }
        info!("Released {}", peripheral.address());
        Ok(())
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.stop_link_tasks();
        if let Some(task) = lock(&self.scan_task).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_conversion() {
        let address = DeviceAddress(0xC4_7F_51_0A_1B_2C);
        let bdaddr = to_bdaddr(address);
        assert_eq!(bdaddr.into_inner(), [0xC4, 0x7F, 0x51, 0x0A, 0x1B, 0x2C]);
        assert_eq!(from_bdaddr(bdaddr), address);
    }

    #[test]
    fn test_address_display_matches_bdaddr() {
        let bdaddr = BDAddr::from([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let address = from_bdaddr(bdaddr);
        assert_eq!(address.to_string(), "001122334455");
        assert_eq!(address.display_name(), "TYME-4455");
    }
}
