//! Read-through view of device usage.
//!
//! Figures are computed from the reading store on every request and the
//! derived fields cached on device rows (threshold, on/off state) are
//! refreshed in the background. The reading store stays authoritative; a
//! failed refresh is logged and never fails the request that triggered it.

use crate::aggregate::{metrics_by_device, DeviceMetrics, Window};
use crate::errors::Result;
use crate::metrics::WRITE_BACK_FAILURES_TOTAL;
use crate::model::{Device, DeviceId, DeviceView, LocationId, PowerState, UserId};
use crate::notify::Notifier;
use crate::store::{DeviceRegistry, ReadingStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyUsage {
    pub device_id: DeviceId,
    pub kwh_24h: f64,
}

/// New values for the derived fields of one device row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedFields {
    pub device_id: DeviceId,
    pub max_watts_threshold: f64,
    pub current_state: PowerState,
}

#[derive(Clone)]
pub struct UsageService {
    devices: Arc<dyn DeviceRegistry>,
    readings: Arc<dyn ReadingStore>,
    notifier: Arc<dyn Notifier>,
}

impl UsageService {
    pub fn new(
        devices: Arc<dyn DeviceRegistry>,
        readings: Arc<dyn ReadingStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            devices,
            readings,
            notifier,
        }
    }

    /// Metrics for every registered device.
    pub async fn windowed_metrics(&self) -> Result<HashMap<DeviceId, DeviceMetrics>> {
        let ids: Vec<DeviceId> = self.devices.list(None).await?.iter().map(|d| d.id).collect();
        self.compute(&ids, None, Utc::now()).await
    }

    pub async fn daily_usage(&self) -> Result<Vec<DailyUsage>> {
        let mut usage: Vec<DailyUsage> = self
            .windowed_metrics()
            .await?
            .into_iter()
            .map(|(device_id, m)| DailyUsage {
                device_id,
                kwh_24h: m.kwh_24h,
            })
            .collect();
        usage.sort_by_key(|u| u.device_id);
        Ok(usage)
    }

    /// Devices visible to `owner` (all when `None`), enriched with usage.
    pub async fn list_devices(&self, owner: Option<UserId>) -> Result<Vec<DeviceView>> {
        let devices = self.devices.list(owner).await?;
        Ok(self.enrich(devices).await)
    }

    pub async fn rename_device(&self, id: DeviceId, name: &str) -> Result<Option<DeviceView>> {
        let Some(device) = self.devices.rename(id, name).await? else {
            return Ok(None);
        };
        self.notifier.notify_devices_changed(device.location_id).await;
        Ok(self.enrich(vec![device]).await.pop())
    }

    /// Moves a device; both the old and the new location are told their
    /// device lists changed.
    pub async fn move_device(
        &self,
        id: DeviceId,
        location_id: LocationId,
    ) -> Result<Option<Device>> {
        let Some(previous) = self.devices.find_by_id(id).await? else {
            return Ok(None);
        };
        let Some(moved) = self.devices.move_to_location(id, location_id).await? else {
            return Ok(None);
        };

        if previous.location_id != moved.location_id {
            self.notifier
                .notify_devices_changed(previous.location_id)
                .await;
        }
        self.notifier.notify_devices_changed(moved.location_id).await;
        Ok(Some(moved))
    }

    pub async fn delete_device(&self, id: DeviceId) -> Result<bool> {
        let Some(device) = self.devices.find_by_id(id).await? else {
            return Ok(false);
        };
        let removed = self.devices.delete(id).await?;
        if removed {
            self.notifier.notify_devices_changed(device.location_id).await;
        }
        Ok(removed)
    }

    /// Metrics for `ids`. Reads are limited to `scope` when given.
    async fn compute(
        &self,
        ids: &[DeviceId],
        scope: Option<&[DeviceId]>,
        now: DateTime<Utc>,
    ) -> Result<HashMap<DeviceId, DeviceMetrics>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let history = self
            .readings
            .since(now - Window::Month.duration(), scope)
            .await?;
        let latest = self.readings.latest_per_device(scope).await?;
        Ok(metrics_by_device(ids, &history, &latest, now))
    }

    async fn enrich(&self, devices: Vec<Device>) -> Vec<DeviceView> {
        let ids: Vec<DeviceId> = devices.iter().map(|d| d.id).collect();
        let metrics = match self.compute(&ids, Some(&ids), Utc::now()).await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!("Failed to enrich devices with metrics: {}", e);
                return devices.into_iter().map(plain_view).collect();
            }
        };

        let mut stale = Vec::new();
        let views = devices
            .into_iter()
            .map(|device| {
                let m = metrics.get(&device.id).copied().unwrap_or_default();
                let (view, fields) = apply_metrics(device, &m);
                if let Some(fields) = fields {
                    stale.push(fields);
                }
                view
            })
            .collect();

        if !stale.is_empty() {
            self.spawn_refresh(stale);
        }

        views
    }

    fn spawn_refresh(&self, fields: Vec<CachedFields>) {
        let service = self.clone();
        tokio::spawn(async move {
            service.refresh_cached_fields(&fields).await;
        });
    }

    /// Writes derived fields back onto device rows and returns how many
    /// writes failed.
    pub async fn refresh_cached_fields(&self, fields: &[CachedFields]) -> usize {
        let mut failures = 0;
        for f in fields {
            if let Err(e) = self
                .devices
                .update_cached_metrics(f.device_id, f.max_watts_threshold, f.current_state)
                .await
            {
                failures += 1;
                WRITE_BACK_FAILURES_TOTAL.inc();
                warn!("Failed to refresh cached metrics for device {}: {}", f.device_id, e);
            }
        }
        debug!(
            "Refreshed cached metrics for {} device(s), {} failed",
            fields.len(),
            failures
        );
        failures
    }
}

fn plain_view(device: Device) -> DeviceView {
    DeviceView {
        device,
        monthly_kwh: 0.0,
        usage_hours_per_day: 0.0,
    }
}

/// Applies fresh metrics to a device and reports the row update it needs,
/// if any.
///
/// The threshold follows the 30-day peak only when that peak is positive. A
/// device with no positive reading in the window keeps its configured
/// threshold instead of having 0 written back, which would make every later
/// reading a spike.
fn apply_metrics(mut device: Device, m: &DeviceMetrics) -> (DeviceView, Option<CachedFields>) {
    let threshold = if m.peak_watts > 0.0 {
        m.peak_watts
    } else {
        device.max_watts_threshold
    };

    let changed =
        threshold != device.max_watts_threshold || m.current_state != device.current_state;
    device.max_watts_threshold = threshold;
    device.current_state = m.current_state;

    let fields = changed.then_some(CachedFields {
        device_id: device.id,
        max_watts_threshold: threshold,
        current_state: m.current_state,
    });

    let view = DeviceView {
        device,
        monthly_kwh: m.kwh_30d,
        usage_hours_per_day: m.avg_daily_hours,
    };
    (view, fields)
}
