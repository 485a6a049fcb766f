use crate::errors::{Error, Result};
use crate::model::{DeviceId, RawReading, Reading};
use chrono::{DateTime, Utc};

const PAIRING_CODE_LEN: usize = 6;

/// Validates the fields a reading cannot be accepted without.
///
/// `powerWatts` may legitimately be zero, it only has to be present.
pub fn validate_reading(raw: &RawReading) -> Result<DeviceId> {
    let device_id = match raw.device_id {
        Some(id) if id > 0 => id,
        Some(id) => {
            return Err(Error::Validation(format!("Device ID {} is not valid", id)));
        }
        None => return Err(Error::Validation("Device ID is required".to_string())),
    };

    if raw.power_watts.is_none() {
        return Err(Error::Validation("powerWatts is required".to_string()));
    }

    Ok(device_id)
}

/// Turns a submitted reading into the record that gets persisted.
///
/// Missing numeric fields become 0 and a missing timestamp becomes `received_at`.
/// Values are otherwise stored as sent; the aggregation layer coerces
/// negative or non-finite samples when it reads them back.
pub fn normalize_reading(
    device_id: DeviceId,
    raw: &RawReading,
    received_at: DateTime<Utc>,
) -> Reading {
    Reading {
        device_id,
        power_watts: raw.power_watts.unwrap_or(0.0),
        voltage: raw.voltage.unwrap_or(0.0),
        current_amps: pick_current(raw.current, raw.current_amps),
        energy_kwh: raw.energy.unwrap_or(0.0),
        frequency: raw.frequency.unwrap_or(0.0),
        power_factor: raw.power_factor.unwrap_or(0.0),
        time: raw.timestamp.unwrap_or(received_at),
    }
}

// `current` wins unless it is absent or zero, then `currentAmps` is used.
fn pick_current(current: Option<f64>, current_amps: Option<f64>) -> f64 {
    match current {
        Some(c) if c != 0.0 => c,
        _ => current_amps.unwrap_or(0.0),
    }
}

pub fn validate_pairing_request(pairing_code: &str, mac_address: &str) -> Result<()> {
    if pairing_code.len() != PAIRING_CODE_LEN || !pairing_code.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(Error::Validation(format!(
            "Pairing code must be {} digits",
            PAIRING_CODE_LEN
        )));
    }

    if mac_address.trim().is_empty() {
        return Err(Error::Validation("MAC address cannot be empty".to_string()));
    }

    Ok(())
}

/// Canonical form used when storing and comparing MAC addresses.
pub fn normalize_mac(mac_address: &str) -> String {
    mac_address.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw(device_id: Option<DeviceId>, power_watts: Option<f64>) -> RawReading {
        RawReading {
            device_id,
            power_watts,
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_reading() {
        assert_eq!(validate_reading(&raw(Some(4), Some(120.0))).unwrap(), 4);
    }

    #[test]
    fn test_zero_power_is_valid() {
        assert!(validate_reading(&raw(Some(4), Some(0.0))).is_ok());
    }

    #[test]
    fn test_missing_device_id() {
        assert!(matches!(
            validate_reading(&raw(None, Some(10.0))),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_non_positive_device_id() {
        assert!(validate_reading(&raw(Some(0), Some(10.0))).is_err());
        assert!(validate_reading(&raw(Some(-3), Some(10.0))).is_err());
    }

    #[test]
    fn test_missing_power() {
        assert!(matches!(
            validate_reading(&raw(Some(1), None)),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_normalize_defaults_missing_fields() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let reading = normalize_reading(9, &raw(Some(9), Some(75.5)), now);

        assert_eq!(reading.device_id, 9);
        assert_eq!(reading.power_watts, 75.5);
        assert_eq!(reading.voltage, 0.0);
        assert_eq!(reading.current_amps, 0.0);
        assert_eq!(reading.energy_kwh, 0.0);
        assert_eq!(reading.frequency, 0.0);
        assert_eq!(reading.power_factor, 0.0);
        assert_eq!(reading.time, now);
    }

    #[test]
    fn test_normalize_keeps_device_timestamp() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let sent = Utc.with_ymd_and_hms(2024, 3, 1, 11, 59, 30).unwrap();
        let mut input = raw(Some(1), Some(1.0));
        input.timestamp = Some(sent);

        assert_eq!(normalize_reading(1, &input, now).time, sent);
    }

    #[test]
    fn test_current_field_synonyms() {
        assert_eq!(pick_current(Some(2.5), None), 2.5);
        assert_eq!(pick_current(None, Some(1.5)), 1.5);
        assert_eq!(pick_current(Some(2.5), Some(1.5)), 2.5);
        assert_eq!(pick_current(Some(0.0), Some(1.5)), 1.5);
        assert_eq!(pick_current(None, None), 0.0);
    }

    #[test]
    fn test_raw_reading_accepts_firmware_payload() {
        let payload = r#"{"deviceId":3,"powerWatts":812.4,"voltage":229.8,"current":3.54,"energy":0.42,"frequency":50.0,"powerFactor":0.98}"#;
        let raw: RawReading = serde_json::from_str(payload).unwrap();
        let reading = normalize_reading(3, &raw, Utc::now());

        assert_eq!(reading.current_amps, 3.54);
        assert_eq!(reading.energy_kwh, 0.42);
        assert_eq!(reading.power_factor, 0.98);
    }

    #[test]
    fn test_pairing_request_validation() {
        assert!(validate_pairing_request("482913", "AA:BB:CC:DD:EE:FF").is_ok());
        assert!(validate_pairing_request("48291", "AA:BB:CC:DD:EE:FF").is_err());
        assert!(validate_pairing_request("48291a", "AA:BB:CC:DD:EE:FF").is_err());
        assert!(validate_pairing_request("482913", "  ").is_err());
    }

    #[test]
    fn test_normalize_mac() {
        assert_eq!(normalize_mac(" aa:bb:cc:dd:ee:ff "), "AA:BB:CC:DD:EE:FF");
    }
}
