use crate::model::{DeviceId, LocationId, Reading};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Real-time fan-out consumed by the ingestion workers and device services.
///
/// Delivery is best-effort: notifying a device or location nobody watches is
/// not an error.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_spike(&self, device_id: DeviceId, power_watts: f64);

    async fn broadcast_reading(&self, device_id: DeviceId, reading: &Reading);

    /// Tells clients watching `location_id` to refetch its device list.
    async fn notify_devices_changed(&self, location_id: LocationId);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpikeAlert {
    pub device_id: DeviceId,
    pub power_watts: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// What subscribers of a device channel receive.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum DeviceEvent {
    Alert(SpikeAlert),
    RealtimeReading(Reading),
}

/// What subscribers of a location channel receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum LocationEvent {
    InvalidateDevices {
        #[serde(rename = "locationId")]
        location_id: LocationId,
    },
}

/// Broadcast senders keyed by device or location id.
struct Channels<E> {
    senders: RwLock<HashMap<i64, broadcast::Sender<E>>>,
    capacity: usize,
}

impl<E: Clone> Channels<E> {
    fn new(capacity: usize) -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    async fn subscribe(&self, key: i64) -> broadcast::Receiver<E> {
        let mut senders = self.senders.write().await;
        senders
            .entry(key)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    async fn receiver_count(&self, key: i64) -> usize {
        self.senders
            .read()
            .await
            .get(&key)
            .map_or(0, |tx| tx.receiver_count())
    }

    async fn publish(&self, key: i64, event: E) {
        let delivered = {
            let senders = self.senders.read().await;
            match senders.get(&key) {
                Some(tx) => tx.send(event).is_ok(),
                None => return,
            }
        };

        // Every receiver is gone; drop the channel.
        if !delivered {
            let mut senders = self.senders.write().await;
            if senders.get(&key).is_some_and(|tx| tx.receiver_count() == 0) {
                senders.remove(&key);
                debug!("Closed idle channel {}", key);
            }
        }
    }

    #[cfg(test)]
    async fn is_open(&self, key: i64) -> bool {
        self.senders.read().await.contains_key(&key)
    }
}

/// Per-device and per-location broadcast channels, created when the first
/// subscriber arrives.
#[derive(Clone)]
pub struct ChannelHub {
    devices: Arc<Channels<DeviceEvent>>,
    locations: Arc<Channels<LocationEvent>>,
}

impl ChannelHub {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            devices: Arc::new(Channels::new(capacity)),
            locations: Arc::new(Channels::new(capacity)),
        }
    }

    pub async fn subscribe(&self, device_id: DeviceId) -> broadcast::Receiver<DeviceEvent> {
        self.devices.subscribe(device_id).await
    }

    pub async fn subscribe_location(
        &self,
        location_id: LocationId,
    ) -> broadcast::Receiver<LocationEvent> {
        self.locations.subscribe(location_id).await
    }

    pub async fn subscriber_count(&self, device_id: DeviceId) -> usize {
        self.devices.receiver_count(device_id).await
    }

    pub async fn location_subscriber_count(&self, location_id: LocationId) -> usize {
        self.locations.receiver_count(location_id).await
    }
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl Notifier for ChannelHub {
    async fn notify_spike(&self, device_id: DeviceId, power_watts: f64) {
        let alert = SpikeAlert {
            device_id,
            power_watts,
            message: format!("Spike detected: {}W", power_watts),
            timestamp: Utc::now(),
        };
        self.devices.publish(device_id, DeviceEvent::Alert(alert)).await;
    }

    async fn broadcast_reading(&self, device_id: DeviceId, reading: &Reading) {
        self.devices
            .publish(device_id, DeviceEvent::RealtimeReading(reading.clone()))
            .await;
    }

    async fn notify_devices_changed(&self, location_id: LocationId) {
        self.locations
            .publish(location_id, LocationEvent::InvalidateDevices { location_id })
            .await;
    }
}
