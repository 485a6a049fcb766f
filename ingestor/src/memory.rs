use crate::errors::{Error, Result};
use crate::model::{Device, DeviceId, LocationId, NewDevice, PowerState, Reading, UserId};
use crate::store::{DeviceRegistry, ReadingStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory device registry and reading store.
///
/// Each operation runs under a single write lock, which gives the same
/// all-or-nothing behaviour as the conditional statements of the Postgres
/// store. Deleting a device drops its readings, like the cascade.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<State>>,
}

#[derive(Default)]
struct State {
    next_id: DeviceId,
    devices: BTreeMap<DeviceId, Device>,
    readings: Vec<Reading>,
    /// Every pairing code handed out, including those already activated or expired.
    issued_codes: HashSet<String>,
    /// location -> owning user; locations absent here have no owner.
    location_owners: HashMap<LocationId, UserId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records which user owns a location, for owner-scoped listing.
    pub async fn assign_location(&self, location_id: LocationId, owner: UserId) {
        self.inner
            .write()
            .await
            .location_owners
            .insert(location_id, owner);
    }

    /// Overrides a device's creation time.
    pub async fn backdate(&self, id: DeviceId, created_at: DateTime<Utc>) -> bool {
        match self.inner.write().await.devices.get_mut(&id) {
            Some(device) => {
                device.created_at = created_at;
                true
            }
            None => false,
        }
    }

    pub async fn reading_count(&self) -> usize {
        self.inner.read().await.readings.len()
    }
}

fn same_mac(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

fn selected(device_ids: Option<&[DeviceId]>, device_id: DeviceId) -> bool {
    device_ids.map_or(true, |ids| ids.contains(&device_id))
}

#[async_trait]
impl DeviceRegistry for MemoryStore {
    async fn insert_pending(&self, device: &NewDevice, pairing_code: &str) -> Result<Device> {
        let mut state = self.inner.write().await;

        if state.issued_codes.contains(pairing_code) {
            return Err(Error::PairingCodeTaken(pairing_code.to_string()));
        }
        state.issued_codes.insert(pairing_code.to_string());

        state.next_id += 1;
        let created = Device {
            id: state.next_id,
            location_id: device.location_id,
            name: device.name.clone(),
            device_type: device.device_type.clone(),
            max_watts_threshold: device.max_watts_threshold,
            mac_address: None,
            pairing_code: Some(pairing_code.to_string()),
            is_active: false,
            current_state: PowerState::Off,
            created_at: Utc::now(),
        };
        state.devices.insert(created.id, created.clone());

        Ok(created)
    }

    async fn find_by_id(&self, id: DeviceId) -> Result<Option<Device>> {
        Ok(self.inner.read().await.devices.get(&id).cloned())
    }

    async fn find_by_mac(&self, mac_address: &str) -> Result<Option<Device>> {
        Ok(self
            .inner
            .read()
            .await
            .devices
            .values()
            .find(|d| d.mac_address.as_deref().is_some_and(|m| same_mac(m, mac_address)))
            .cloned())
    }

    async fn find_by_pairing_code(&self, pairing_code: &str) -> Result<Option<Device>> {
        Ok(self
            .inner
            .read()
            .await
            .devices
            .values()
            .find(|d| d.pairing_code.as_deref() == Some(pairing_code))
            .cloned())
    }

    async fn list(&self, owner: Option<UserId>) -> Result<Vec<Device>> {
        let state = self.inner.read().await;
        Ok(state
            .devices
            .values()
            .filter(|d| match owner {
                Some(user_id) => state.location_owners.get(&d.location_id) == Some(&user_id),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn rename(&self, id: DeviceId, name: &str) -> Result<Option<Device>> {
        let mut state = self.inner.write().await;
        Ok(state.devices.get_mut(&id).map(|device| {
            device.name = name.to_string();
            device.clone()
        }))
    }

    async fn move_to_location(
        &self,
        id: DeviceId,
        location_id: LocationId,
    ) -> Result<Option<Device>> {
        let mut state = self.inner.write().await;
        Ok(state.devices.get_mut(&id).map(|device| {
            device.location_id = location_id;
            device.clone()
        }))
    }

    async fn delete(&self, id: DeviceId) -> Result<bool> {
        let mut state = self.inner.write().await;
        let removed = state.devices.remove(&id).is_some();
        if removed {
            state.readings.retain(|r| r.device_id != id);
        }
        Ok(removed)
    }

    async fn activate_pending(
        &self,
        pairing_code: &str,
        mac_address: &str,
    ) -> Result<Option<DeviceId>> {
        let mut state = self.inner.write().await;

        let Some(id) = state
            .devices
            .values()
            .find(|d| !d.is_active && d.pairing_code.as_deref() == Some(pairing_code))
            .map(|d| d.id)
        else {
            return Ok(None);
        };

        let mac_taken = state.devices.values().any(|d| {
            d.id != id && d.mac_address.as_deref().is_some_and(|m| same_mac(m, mac_address))
        });
        if mac_taken {
            return Err(Error::Conflict(format!(
                "MAC address {} is bound to another device",
                mac_address
            )));
        }

        if let Some(device) = state.devices.get_mut(&id) {
            device.mac_address = Some(mac_address.to_string());
            device.is_active = true;
            device.pairing_code = None;
        }

        Ok(Some(id))
    }

    async fn delete_stale_pending(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.inner.write().await;

        let stale: Vec<DeviceId> = state
            .devices
            .values()
            .filter(|d| !d.is_active && d.pairing_code.is_some() && d.created_at < cutoff)
            .map(|d| d.id)
            .collect();

        for id in &stale {
            state.devices.remove(id);
        }
        state.readings.retain(|r| !stale.contains(&r.device_id));

        Ok(stale.len() as u64)
    }

    async fn update_cached_metrics(
        &self,
        id: DeviceId,
        max_watts_threshold: f64,
        current_state: PowerState,
    ) -> Result<()> {
        if let Some(device) = self.inner.write().await.devices.get_mut(&id) {
            device.max_watts_threshold = max_watts_threshold;
            device.current_state = current_state;
        }
        Ok(())
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn insert(&self, reading: &Reading) -> Result<()> {
        let mut state = self.inner.write().await;
        if !state.devices.contains_key(&reading.device_id) {
            return Err(Error::NotFound(format!("device {}", reading.device_id)));
        }
        state.readings.push(reading.clone());
        Ok(())
    }

    async fn recent(&self, device_id: DeviceId, limit: usize) -> Result<Vec<Reading>> {
        let state = self.inner.read().await;
        let mut readings: Vec<Reading> = state
            .readings
            .iter()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect();
        readings.sort_by(|a, b| b.time.cmp(&a.time));
        readings.truncate(limit);
        Ok(readings)
    }

    async fn since(
        &self,
        since: DateTime<Utc>,
        device_ids: Option<&[DeviceId]>,
    ) -> Result<Vec<Reading>> {
        Ok(self
            .inner
            .read()
            .await
            .readings
            .iter()
            .filter(|r| r.time >= since && selected(device_ids, r.device_id))
            .cloned()
            .collect())
    }

    async fn latest_per_device(&self, device_ids: Option<&[DeviceId]>) -> Result<Vec<Reading>> {
        let state = self.inner.read().await;
        let mut latest: HashMap<DeviceId, &Reading> = HashMap::new();
        for reading in state
            .readings
            .iter()
            .filter(|r| selected(device_ids, r.device_id))
        {
            latest
                .entry(reading.device_id)
                .and_modify(|current| {
                    if reading.time > current.time {
                        *current = reading;
                    }
                })
                .or_insert(reading);
        }
        Ok(latest.into_values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_device(location_id: LocationId) -> NewDevice {
        NewDevice {
            location_id,
            name: "Kettle".to_string(),
            device_type: "appliance".to_string(),
            max_watts_threshold: 2000.0,
        }
    }

    fn reading(device_id: DeviceId, power_watts: f64, time: DateTime<Utc>) -> Reading {
        Reading {
            device_id,
            power_watts,
            voltage: 0.0,
            current_amps: 0.0,
            energy_kwh: 0.0,
            frequency: 0.0,
            power_factor: 0.0,
            time,
        }
    }

    #[tokio::test]
    async fn test_pending_code_must_be_unique() {
        let store = MemoryStore::new();
        store.insert_pending(&new_device(1), "111111").await.unwrap();

        let err = store.insert_pending(&new_device(1), "111111").await.unwrap_err();
        assert!(matches!(err, Error::PairingCodeTaken(_)));
    }

    #[tokio::test]
    async fn test_activate_is_conditional() {
        let store = MemoryStore::new();
        let device = store.insert_pending(&new_device(1), "222222").await.unwrap();

        let first = store.activate_pending("222222", "AA:BB:CC:00:11:22").await.unwrap();
        let second = store.activate_pending("222222", "AA:BB:CC:00:11:22").await.unwrap();
        assert_eq!(first, Some(device.id));
        assert_eq!(second, None);

        let stored = store.find_by_id(device.id).await.unwrap().unwrap();
        assert!(stored.is_active);
        assert_eq!(stored.pairing_code, None);
    }

    #[tokio::test]
    async fn test_mac_lookup_ignores_case() {
        let store = MemoryStore::new();
        store.insert_pending(&new_device(1), "333333").await.unwrap();
        store.activate_pending("333333", "AA:BB:CC:DD:EE:FF").await.unwrap();

        assert!(store.find_by_mac("aa:bb:cc:dd:ee:ff").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mac_bound_elsewhere_conflicts() {
        let store = MemoryStore::new();
        store.insert_pending(&new_device(1), "444444").await.unwrap();
        store.insert_pending(&new_device(1), "555555").await.unwrap();
        store.activate_pending("444444", "AA:BB:CC:DD:EE:FF").await.unwrap();

        let err = store
            .activate_pending("555555", "aa:bb:cc:dd:ee:ff")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(store.find_by_pairing_code("555555").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_cascades_to_readings() {
        let store = MemoryStore::new();
        let device = store.insert_pending(&new_device(1), "666666").await.unwrap();
        store.insert(&reading(device.id, 10.0, Utc::now())).await.unwrap();

        assert!(store.delete(device.id).await.unwrap());
        assert_eq!(store.reading_count().await, 0);
        assert!(!store.delete(device.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_insert_for_unknown_device_fails() {
        let store = MemoryStore::new();
        let err = store.insert(&reading(42, 10.0, Utc::now())).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_recent_is_newest_first() {
        let store = MemoryStore::new();
        let device = store.insert_pending(&new_device(1), "777777").await.unwrap();
        let now = Utc::now();
        for minutes in [5, 1, 3] {
            store
                .insert(&reading(device.id, minutes as f64, now - Duration::minutes(minutes)))
                .await
                .unwrap();
        }

        let recent = store.recent(device.id, 2).await.unwrap();
        let powers: Vec<f64> = recent.iter().map(|r| r.power_watts).collect();
        assert_eq!(powers, vec![1.0, 3.0]);

        let latest = store.latest_per_device(None).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].power_watts, 1.0);
    }

    #[tokio::test]
    async fn test_reads_can_be_scoped_to_devices() {
        let store = MemoryStore::new();
        let kettle = store.insert_pending(&new_device(1), "888001").await.unwrap();
        let heater = store.insert_pending(&new_device(1), "888002").await.unwrap();
        let now = Utc::now();
        store.insert(&reading(kettle.id, 1500.0, now)).await.unwrap();
        store.insert(&reading(heater.id, 900.0, now)).await.unwrap();

        let history = store
            .since(now - Duration::hours(1), Some(&[kettle.id]))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].device_id, kettle.id);

        let latest = store.latest_per_device(Some(&[heater.id])).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].device_id, heater.id);

        assert!(store.since(now, Some(&[])).await.unwrap().is_empty());
        assert_eq!(store.since(now, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_codes_are_never_issued_twice() {
        let store = MemoryStore::new();
        let paired = store.insert_pending(&new_device(1), "121212").await.unwrap();
        store.activate_pending("121212", "AA:BB:CC:00:00:01").await.unwrap();
        let expired = store.insert_pending(&new_device(1), "343434").await.unwrap();
        store.backdate(expired.id, Utc::now() - Duration::days(1)).await;
        store.delete_stale_pending(Utc::now()).await.unwrap();

        for code in ["121212", "343434"] {
            let err = store.insert_pending(&new_device(1), code).await.unwrap_err();
            assert!(matches!(err, Error::PairingCodeTaken(_)));
        }
        assert!(store.find_by_id(paired.id).await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_list_scoped_by_owner() {
        let store = MemoryStore::new();
        store.assign_location(1, 100).await;
        store.assign_location(2, 200).await;
        store.insert_pending(&new_device(1), "000001").await.unwrap();
        store.insert_pending(&new_device(2), "000002").await.unwrap();

        assert_eq!(store.list(None).await.unwrap().len(), 2);
        let mine = store.list(Some(100)).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].location_id, 1);
        assert!(store.list(Some(300)).await.unwrap().is_empty());
    }
}
