use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type DeviceId = i64;
pub type LocationId = i64;
pub type UserId = i64;

/// On/off classification of a device, derived from its latest reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    #[default]
    Off,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::On => "on",
            PowerState::Off => "off",
        }
    }

    /// Unknown strings read back from storage count as `Off`.
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("on") {
            PowerState::On
        } else {
            PowerState::Off
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metering device as held by the device registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: DeviceId,
    pub location_id: LocationId,
    pub name: String,
    pub device_type: String,
    pub max_watts_threshold: f64,
    pub mac_address: Option<String>,
    pub pairing_code: Option<String>,
    pub is_active: bool,
    pub current_state: PowerState,
    pub created_at: DateTime<Utc>,
}

impl Device {
    pub fn is_pending(&self) -> bool {
        !self.is_active && self.pairing_code.is_some()
    }
}

/// Row shape of the `devices` table.
#[derive(Debug, sqlx::FromRow)]
pub struct DeviceRow {
    pub id: i64,
    pub location_id: i64,
    pub name: String,
    pub device_type: String,
    pub max_watts_threshold: f64,
    pub mac_address: Option<String>,
    pub pairing_code: Option<String>,
    pub is_active: bool,
    pub current_state: String,
    pub created_at: DateTime<Utc>,
}

impl From<DeviceRow> for Device {
    fn from(row: DeviceRow) -> Self {
        Self {
            id: row.id,
            location_id: row.location_id,
            name: row.name,
            device_type: row.device_type,
            max_watts_threshold: row.max_watts_threshold,
            mac_address: row.mac_address,
            pairing_code: row.pairing_code,
            is_active: row.is_active,
            current_state: PowerState::parse(&row.current_state),
            created_at: row.created_at,
        }
    }
}

/// Fields supplied when a user registers a new device.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDevice {
    pub location_id: LocationId,
    pub name: String,
    pub device_type: String,
    #[serde(default)]
    pub max_watts_threshold: f64,
}

/// A stored power sample. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub device_id: DeviceId,
    pub power_watts: f64,
    pub voltage: f64,
    pub current_amps: f64,
    pub energy_kwh: f64,
    pub frequency: f64,
    pub power_factor: f64,
    pub time: DateTime<Utc>,
}

impl Reading {
    pub fn is_spike(&self, threshold: f64) -> bool {
        self.power_watts > threshold
    }
}

/// Reading as submitted by a metering device, before normalization.
///
/// Firmware in the field sends `current`, older clients send `currentAmps`;
/// both are accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawReading {
    pub device_id: Option<DeviceId>,
    pub power_watts: Option<f64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub current_amps: Option<f64>,
    pub energy: Option<f64>,
    pub frequency: Option<f64>,
    pub power_factor: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Device record enriched with freshly computed usage figures.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    #[serde(flatten)]
    pub device: Device,
    #[serde(rename = "monthlyKWh")]
    pub monthly_kwh: f64,
    pub usage_hours_per_day: f64,
}

/// REST API response wrapper
#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    pub data: Vec<Reading>,
    pub total: usize,
    pub limit: usize,
}
