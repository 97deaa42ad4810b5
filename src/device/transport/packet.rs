use std::collections::{HashMap, HashSet};
use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::future::ready;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Duration};

use crate::device::constants::{AFTERBURNER_SERVICE, POLL_DELAY, WRITE_DEADLINE};
use crate::device::transport::{FrameStream, Transport};
use crate::device::types::{Channel, DeviceHandle, Frame, TransportKind};
use crate::error::DeviceError;

struct Link {
    peripheral: Peripheral,
    characteristics: HashMap<Channel, Characteristic>,
    subscribed: HashSet<Channel>,
}

impl Link {
    fn characteristic(&self, channel: Channel) -> Result<(Peripheral, Characteristic), DeviceError> {
        match self.characteristics.get(&channel) {
            Some(characteristic) => Ok((self.peripheral.clone(), characteristic.clone())),
            None => Err(DeviceError::MissingCharacteristic(channel)),
        }
    }
}

#[derive(Default)]
struct PacketInner {
    manager: Option<Manager>,
    adapters: Option<Vec<Adapter>>,
    discovered: Option<Peripheral>,
    // connected but not yet linked; released by `disconnect` if `connect` never finishes
    connecting: Option<Peripheral>,
    link: Option<Link>,
}

/// BLE GATT link: one characteristic per setting, notifications for status and calibration.
pub struct PacketTransport {
    device_name: String,
    inner: Mutex<PacketInner>,
}

impl PacketTransport {
    pub fn new(device_name: impl Into<String>) -> Self {
        PacketTransport { device_name: device_name.into(), inner: Mutex::new(PacketInner::default()) }
    }

    async fn start_scanning(&self) -> Result<Vec<Adapter>, DeviceError> {
        let mut inner = self.inner.lock().await;

        let adapters = match inner.adapters.take() {
            Some(adapters) => adapters,
            None => {
                let manager = match inner.manager.take() {
                    Some(manager) => manager,
                    None => Manager::new().await?,
                };
                let adapters = manager.adapters().await?;
                inner.manager = Some(manager);
                adapters
            },
        };

        let filter = ScanFilter {
            services: vec![AFTERBURNER_SERVICE],
        };

        for adapter in &adapters {
            info!("Scanning using adapter {}...", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
            adapter.start_scan(filter.clone()).await?;
        }

        inner.adapters = Some(adapters.clone());
        Ok(adapters)
    }

    async fn find_peripheral(&self, adapters: &[Adapter]) -> Option<(Peripheral, DeviceHandle)> {
        for adapter in adapters {
            let peripherals = match adapter.peripherals().await {
                Ok(v) => v,
                Err(err) => {
                    warn!("Failed to query BLE adapter for peripherals: {}", err);
                    continue;
                },
            };

            for peripheral in peripherals {
                match peripheral.properties().await {
                    Err(err) => {
                        warn!("Could not query peripheral for properties: {:?}", err);
                    },
                    Ok(None) => {
                        debug!("Peripheral has no properties");
                    },
                    Ok(Some(properties)) => {
                        // Some environments ignore the filter, so match the service or the advertised name again
                        let name_matches = properties.local_name.as_deref() == Some(self.device_name.as_str());
                        if properties.services.contains(&AFTERBURNER_SERVICE) || name_matches {
                            let handle = DeviceHandle {
                                id: format!("{:?}", peripheral.id()),
                                name: properties.local_name.unwrap_or(String::from("NONE")),
                                address: properties.address.to_string(),
                            };
                            info!("Using peripheral {} {:?} {}", handle.address, properties.address_type, handle.name);
                            return Some((peripheral, handle));
                        }
                    },
                }
            }
        }

        None
    }

    async fn stop_scanning(adapters: &[Adapter]) {
        for adapter in adapters {
            if let Err(err) = adapter.stop_scan().await {
                debug!("Failed to stop scanning: {:?}", err);
            }
        }
    }

    async fn link_characteristic(&self, channel: Channel) -> Result<(Peripheral, Characteristic), DeviceError> {
        let inner = self.inner.lock().await;
        match &inner.link {
            Some(link) => link.characteristic(channel),
            None => Err(DeviceError::NotConnected),
        }
    }
}

#[async_trait]
impl Transport for PacketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Packet
    }

    async fn discover(&self) -> Result<DeviceHandle, DeviceError> {
        let adapters = self.start_scanning().await?;

        loop {
            if let Some((peripheral, handle)) = self.find_peripheral(&adapters).await {
                Self::stop_scanning(&adapters).await;
                self.inner.lock().await.discovered = Some(peripheral);
                return Ok(handle);
            }

            debug!("No peripherals matched");
            sleep(Duration::from_millis(POLL_DELAY)).await;
        }
    }

    async fn connect(&self, device: &DeviceHandle) -> Result<FrameStream, DeviceError> {
        let peripheral = {
            let mut inner = self.inner.lock().await;
            match inner.discovered.take() {
                Some(peripheral) if format!("{:?}", peripheral.id()) == device.id => peripheral,
                _ => return Err(DeviceError::NotFound),
            }
        };

        info!("Connecting to peripheral {}...", device.address);
        peripheral.connect().await?;
        self.inner.lock().await.connecting = Some(peripheral.clone());

        info!("Connected; Discovering services...");
        peripheral.discover_services().await?;

        let mut characteristics = HashMap::new();
        for service in peripheral.services() {
            if service.uuid != AFTERBURNER_SERVICE {
                continue;
            }
            for characteristic in &service.characteristics {
                if let Some(channel) = Channel::from_uuid(&characteristic.uuid) {
                    characteristics.insert(channel, characteristic.clone());
                }
            }
        }

        for required in [Channel::Mode, Channel::Status] {
            if !characteristics.contains_key(&required) {
                return Err(DeviceError::MissingCharacteristic(required));
            }
        }
        debug!("Found {} characteristics", characteristics.len());

        let frames = peripheral
            .notifications()
            .await?
            .filter_map(|notification| {
                ready(Channel::from_uuid(&notification.uuid).map(|channel| Frame::Packet {
                    channel,
                    payload: notification.value,
                }))
            })
            .boxed();

        let mut inner = self.inner.lock().await;
        inner.connecting = None;
        inner.link = Some(Link {
            peripheral,
            characteristics,
            subscribed: HashSet::new(),
        });

        Ok(frames)
    }

    async fn subscribe(&self, channel: Channel) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().await;
        let link = match inner.link.as_mut() {
            Some(link) => link,
            None => return Err(DeviceError::NotConnected),
        };

        if link.subscribed.contains(&channel) {
            return Ok(());
        }

        let (peripheral, characteristic) = link.characteristic(channel)?;
        info!("Subscribing to characteristic {:?} {:?}", channel, characteristic.uuid);
        peripheral.subscribe(&characteristic).await?;
        link.subscribed.insert(channel);
        Ok(())
    }

    async fn send(&self, frame: Frame) -> Result<(), DeviceError> {
        let (channel, payload) = match frame {
            Frame::Packet { channel, payload } => (channel, payload),
            Frame::Text(_) => return Err(DeviceError::Unsupported("Text frames")),
        };
        let (peripheral, characteristic) = self.link_characteristic(channel).await?;
        let fut = peripheral.write(&characteristic, &payload, WriteType::WithResponse);

        tokio::select! {
            _ = sleep(Duration::from_millis(WRITE_DEADLINE)) => {
                warn!("Writing to {:?} took too long", channel);
                Err(DeviceError::Timeout { operation: "Characteristic write" })
            }
            result = fut => {
                debug!("Wrote {:?} to {:?}", payload, channel);
                Ok(result?)
            }
        }
    }

    async fn read(&self, channel: Channel) -> Result<Vec<u8>, DeviceError> {
        let (peripheral, characteristic) = self.link_characteristic(channel).await?;

        match timeout(Duration::from_millis(WRITE_DEADLINE), peripheral.read(&characteristic)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DeviceError::Timeout { operation: "Characteristic read" }),
        }
    }

    async fn health_check(&self) -> Result<(), DeviceError> {
        let peripheral = match &self.inner.lock().await.link {
            Some(link) => link.peripheral.clone(),
            None => return Err(DeviceError::NotConnected),
        };

        match peripheral.is_connected().await? {
            true => Ok(()),
            false => {
                warn!("Connection lost");
                Err(DeviceError::ConnectionLost)
            },
        }
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        let (link, connecting, adapters) = {
            let mut inner = self.inner.lock().await;
            inner.discovered = None;
            (inner.link.take(), inner.connecting.take(), inner.adapters.clone())
        };

        if let Some(adapters) = adapters {
            Self::stop_scanning(&adapters).await;
        }

        if let Some(peripheral) = connecting {
            info!("Releasing half-connected peripheral");
            if let Err(err) = peripheral.disconnect().await {
                debug!("Failed to release incomplete peripheral: {:?}", err);
            }
        }

        if let Some(link) = link {
            info!("Disconnecting from peripheral");
            link.peripheral.disconnect().await?;
        }
        Ok(())
    }
}
