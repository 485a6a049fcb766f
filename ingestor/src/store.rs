use crate::errors::Result;
use crate::model::{Device, DeviceId, LocationId, NewDevice, PowerState, Reading, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable store of device records and their pairing state.
///
/// Every mutation of `is_active` / `pairing_code` is a conditional write that
/// only applies while the row is still in the expected state.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Inserts a pending device holding `pairing_code`.
    ///
    /// Fails with `Error::PairingCodeTaken` when the code was ever issued
    /// before, even if the device holding it has since paired or expired.
    async fn insert_pending(&self, device: &NewDevice, pairing_code: &str) -> Result<Device>;

    async fn find_by_id(&self, id: DeviceId) -> Result<Option<Device>>;

    /// Case-insensitive lookup.
    async fn find_by_mac(&self, mac_address: &str) -> Result<Option<Device>>;

    async fn find_by_pairing_code(&self, pairing_code: &str) -> Result<Option<Device>>;

    /// All devices, or only those in locations owned by `owner`.
    async fn list(&self, owner: Option<UserId>) -> Result<Vec<Device>>;

    async fn rename(&self, id: DeviceId, name: &str) -> Result<Option<Device>>;

    async fn move_to_location(&self, id: DeviceId, location_id: LocationId)
        -> Result<Option<Device>>;

    /// Deletes a device and, by cascade, its readings.
    async fn delete(&self, id: DeviceId) -> Result<bool>;

    /// Binds `mac_address`, activates the device and clears its code, but only
    /// if a pending device still holds `pairing_code`.
    ///
    /// Returns the activated device id, or `None` when no pending row matched.
    /// Fails with `Error::Conflict` when the MAC belongs to another device.
    async fn activate_pending(
        &self,
        pairing_code: &str,
        mac_address: &str,
    ) -> Result<Option<DeviceId>>;

    /// Deletes pending devices created before `cutoff` in one statement.
    async fn delete_stale_pending(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Refreshes the derived threshold and on/off state cached on a device.
    async fn update_cached_metrics(
        &self,
        id: DeviceId,
        max_watts_threshold: f64,
        current_state: PowerState,
    ) -> Result<()>;
}

/// Append-only store of power samples.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Fails with `Error::NotFound` when the device no longer exists.
    async fn insert(&self, reading: &Reading) -> Result<()>;

    /// Up to `limit` readings of one device, most recent first.
    async fn recent(&self, device_id: DeviceId, limit: usize) -> Result<Vec<Reading>>;

    /// Readings taken at or after `since`, in no particular order.
    ///
    /// `device_ids` restricts the result to those devices; `None` reads the
    /// whole fleet.
    async fn since(
        &self,
        since: DateTime<Utc>,
        device_ids: Option<&[DeviceId]>,
    ) -> Result<Vec<Reading>>;

    /// The newest reading of each device that has any, optionally restricted
    /// to `device_ids`.
    async fn latest_per_device(&self, device_ids: Option<&[DeviceId]>) -> Result<Vec<Reading>>;
}
