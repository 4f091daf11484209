use async_trait::async_trait;
use btleplug::{
    api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter, WriteType},
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    client::CradleLedClient,
    error::{CradleError, Result},
    scanner::PeripheralScanner,
    transport::{
        AlwaysGranted, GattTransport, LinkId, RadioEvent, RadioEvents, ScanRadio, TransportEvent,
        TransportEvents,
    },
    types::{AdvertisementData, ClientConfig, DiscoveredPeripheral, ScanConfig},
};

/// Client driving a real radio through btleplug
pub type BleClient = CradleLedClient<BtleplugTransport>;

/// Scanner driving a real radio through btleplug
pub type BleScanner = PeripheralScanner<BtleplugScanRadio>;

/// First Bluetooth adapter of the host
///
/// # Errors
///
/// Returns [`CradleError::Ble`] if the Bluetooth manager cannot be initialized,
/// or [`CradleError::Transport`] if the host has no adapter.
pub async fn first_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| CradleError::Transport("no Bluetooth adapter available".to_string()))
}

/// Create a client on `adapter`
///
/// Desktop stacks have no runtime permission model, so the gate always grants.
///
/// # Errors
///
/// Returns [`CradleError::Ble`] if the adapter event stream cannot be opened.
pub async fn client(adapter: Adapter, config: ClientConfig) -> Result<BleClient> {
    let (transport, events) = BtleplugTransport::new(adapter).await?;
    Ok(CradleLedClient::new(
        transport,
        events,
        Arc::new(AlwaysGranted),
        config,
    ))
}

/// Create a scanner on `adapter`
#[must_use]
pub fn scanner(adapter: Adapter, config: ScanConfig) -> BleScanner {
    let (radio, events) = BtleplugScanRadio::new(adapter);
    PeripheralScanner::new(radio, events, Arc::new(AlwaysGranted), config)
}

struct LinkEntry {
    peripheral: Peripheral,
    /// Set once `connect` succeeded; remote disconnects before that belong to an older link
    up: bool,
}

struct TransportInner {
    adapter: Adapter,
    links: Mutex<HashMap<LinkId, LinkEntry>>,
    /// Disconnects still running, by peripheral
    teardowns: Mutex<HashMap<PeripheralId, JoinHandle<()>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportInner {
    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("Transport event dropped: client is gone");
        }
    }

    async fn peripheral(&self, link: LinkId) -> Result<Peripheral> {
        self.links
            .lock()
            .await
            .get(&link)
            .map(|entry| entry.peripheral.clone())
            .ok_or_else(|| CradleError::Transport(format!("{link} is not open")))
    }

    async fn characteristic(
        &self,
        link: LinkId,
        service: Uuid,
        uuid: Uuid,
    ) -> Result<(Peripheral, btleplug::api::Characteristic)> {
        let peripheral = self.peripheral(link).await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid && c.service_uuid == service)
            .ok_or(CradleError::UnknownCharacteristic(uuid))?;
        Ok((peripheral, characteristic))
    }

    /// Forget `link` and report it down, unless that already happened
    async fn release(&self, link: LinkId, reason: Option<String>) {
        if self.links.lock().await.remove(&link).is_some() {
            self.emit(TransportEvent::Disconnected { link, reason });
        }
    }
}

/// [`GattTransport`] backed by a btleplug adapter
#[derive(Clone)]
pub struct BtleplugTransport {
    inner: Arc<TransportInner>,
}

impl BtleplugTransport {
    /// Create a transport and the receiving end of its events
    ///
    /// # Errors
    ///
    /// Returns [`CradleError::Ble`] if the adapter event stream cannot be opened.
    pub async fn new(adapter: Adapter) -> Result<(Self, TransportEvents)> {
        let (events, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(TransportInner {
            adapter,
            links: Mutex::new(HashMap::new()),
            teardowns: Mutex::new(HashMap::new()),
            events,
        });

        let mut central_events = inner.adapter.events().await?;
        let watcher = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                let CentralEvent::DeviceDisconnected(id) = event else {
                    continue;
                };
                let Some(inner) = watcher.upgrade() else {
                    break;
                };
                let link = inner
                    .links
                    .lock()
                    .await
                    .iter()
                    .find(|(_, entry)| entry.up && entry.peripheral.id() == id)
                    .map(|(link, _)| *link);
                if let Some(link) = link {
                    info!("Peripheral on {} disconnected", link);
                    inner
                        .release(link, Some("peripheral disconnected".to_string()))
                        .await;
                }
            }
        });

        Ok((Self { inner }, receiver))
    }

    async fn resolve(&self, address: &str) -> Result<Peripheral> {
        self.inner
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.address().to_string().eq_ignore_ascii_case(address))
            .ok_or_else(|| CradleError::PeripheralUnresolvable {
                address: address.to_string(),
            })
    }
}

#[async_trait]
impl GattTransport for BtleplugTransport {
    async fn connect(&self, link: LinkId, address: &str) -> Result<()> {
        let peripheral = self.resolve(address).await?;
        self.inner.links.lock().await.insert(
            link,
            LinkEntry {
                peripheral: peripheral.clone(),
                up: false,
            },
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            // The old link's disconnect would otherwise drop this connection
            let teardown = inner.teardowns.lock().await.remove(&peripheral.id());
            if let Some(teardown) = teardown {
                debug!("{} waits for the previous link to close", link);
                if let Err(e) = teardown.await {
                    warn!("Previous teardown before {} failed: {}", link, e);
                }
            }

            match peripheral.connect().await {
                Ok(()) => {
                    if let Some(entry) = inner.links.lock().await.get_mut(&link) {
                        entry.up = true;
                    }
                    inner.emit(TransportEvent::Connected { link });
                }
                Err(e) => {
                    warn!("Connect on {} failed: {}", link, e);
                    inner.release(link, Some(e.to_string())).await;
                }
            }
        });

        Ok(())
    }

    async fn disconnect(&self, link: LinkId) -> Result<()> {
        let Ok(peripheral) = self.inner.peripheral(link).await else {
            debug!("{} already released", link);
            return Ok(());
        };

        let id = peripheral.id();
        let inner = Arc::clone(&self.inner);
        let teardown = tokio::spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Disconnect on {} failed: {}", link, e);
            }
            inner.release(link, None).await;
        });
        self.inner.teardowns.lock().await.insert(id, teardown);

        Ok(())
    }

    async fn discover_services(&self, link: LinkId) -> Result<()> {
        let peripheral = self.inner.peripheral(link).await?;

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = peripheral.discover_services().await.map_err(|e| e.to_string());
            inner.emit(TransportEvent::ServicesDiscovered { link, result });
        });

        Ok(())
    }

    async fn read(&self, link: LinkId, service: Uuid, characteristic: Uuid) -> Result<()> {
        let (peripheral, target) = self.inner.characteristic(link, service, characteristic).await?;

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = peripheral.read(&target).await.map_err(|e| e.to_string());
            inner.emit(TransportEvent::ReadComplete {
                link,
                uuid: characteristic,
                result,
            });
        });

        Ok(())
    }

    async fn write(
        &self,
        link: LinkId,
        service: Uuid,
        characteristic: Uuid,
        payload: Bytes,
    ) -> Result<()> {
        let (peripheral, target) = self.inner.characteristic(link, service, characteristic).await?;

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = peripheral
                .write(&target, &payload, WriteType::WithResponse)
                .await
                .map_err(|e| e.to_string());
            inner.emit(TransportEvent::WriteComplete {
                link,
                uuid: characteristic,
                result,
            });
        });

        Ok(())
    }
}

/// [`ScanRadio`] backed by a btleplug adapter
pub struct BtleplugScanRadio {
    adapter: Adapter,
    listener: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<RadioEvent>,
}

impl BtleplugScanRadio {
    /// Create a radio and the receiving end of its scan results
    #[must_use]
    pub fn new(adapter: Adapter) -> (Self, RadioEvents) {
        let (events, receiver) = mpsc::unbounded_channel();
        let radio = Self {
            adapter,
            listener: Mutex::new(None),
            events,
        };
        (radio, receiver)
    }
}

impl Drop for BtleplugScanRadio {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}

#[async_trait]
impl ScanRadio for BtleplugScanRadio {
    async fn start_scan(&self, service: Uuid) -> Result<()> {
        let mut listener = self.listener.lock().await;
        if listener.is_none() {
            let stream = self.adapter.events().await?;
            *listener = Some(tokio::spawn(forward_advertisements(
                self.adapter.clone(),
                stream,
                service,
                self.events.clone(),
            )));
        }

        self.adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }
}

async fn forward_advertisements(
    adapter: Adapter,
    mut stream: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    service: Uuid,
    events: mpsc::UnboundedSender<RadioEvent>,
) {
    while let Some(event) = stream.next().await {
        let id = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
            _ => continue,
        };

        let Ok(peripheral) = adapter.peripheral(&id).await else {
            continue;
        };
        let Ok(Some(properties)) = peripheral.properties().await else {
            continue;
        };
        if !properties.services.contains(&service) {
            continue;
        }

        let discovered = DiscoveredPeripheral {
            address: properties.address.to_string(),
            rssi: properties.rssi,
            advertisement: AdvertisementData {
                local_name: properties.local_name,
                services: properties.services,
                manufacturer_data: properties.manufacturer_data,
                service_data: properties.service_data,
                tx_power_level: properties.tx_power_level,
            },
        };

        if events.send(RadioEvent::Advertisement(discovered)).is_err() {
            break;
        }
    }
    debug!("Advertisement listener stopped");
}
