//! Device pairing lifecycle.
//!
//! A device starts pending with a one-time 6-digit code. Completing pairing
//! binds its MAC address and activates it; a pending device that never pairs
//! is deleted once its TTL runs out. Active devices never go back.

use crate::errors::{Error, Result};
use crate::metrics::{DEVICES_EXPIRED_TOTAL, PAIRINGS_COMPLETED_TOTAL};
use crate::model::{Device, DeviceId, NewDevice};
use crate::notify::Notifier;
use crate::store::DeviceRegistry;
use crate::validate::{normalize_mac, validate_pairing_request};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

const MAX_CODE_ATTEMPTS: u32 = 10;

/// Source of candidate pairing codes.
pub trait CodeGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Uniformly random zero-padded 6-digit codes.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomCodes;

impl CodeGenerator for RandomCodes {
    fn generate(&self) -> String {
        format!("{:06}", rand::thread_rng().gen_range(0..1_000_000))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PairingOutcome {
    Paired {
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
    },
    /// The MAC is already bound to an active device; nothing was changed.
    AlreadyPaired {
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
    },
    NotFound,
}

impl PairingOutcome {
    pub fn device_id(&self) -> Option<DeviceId> {
        match self {
            PairingOutcome::Paired { device_id } | PairingOutcome::AlreadyPaired { device_id } => {
                Some(*device_id)
            }
            PairingOutcome::NotFound => None,
        }
    }
}

pub struct PairingService {
    devices: Arc<dyn DeviceRegistry>,
    notifier: Arc<dyn Notifier>,
    codes: Box<dyn CodeGenerator>,
}

impl PairingService {
    pub fn new(devices: Arc<dyn DeviceRegistry>, notifier: Arc<dyn Notifier>) -> Self {
        Self::with_codes(devices, notifier, Box::new(RandomCodes))
    }

    pub fn with_codes(
        devices: Arc<dyn DeviceRegistry>,
        notifier: Arc<dyn Notifier>,
        codes: Box<dyn CodeGenerator>,
    ) -> Self {
        Self {
            devices,
            notifier,
            codes,
        }
    }

    /// Registers a pending device under a code that was never issued before.
    pub async fn create_pending(&self, device: &NewDevice) -> Result<Device> {
        if device.name.trim().is_empty() {
            return Err(Error::Validation("Device name cannot be empty".to_string()));
        }
        if device.device_type.trim().is_empty() {
            return Err(Error::Validation("Device type cannot be empty".to_string()));
        }

        for attempt in 1..=MAX_CODE_ATTEMPTS {
            let code = self.codes.generate();
            match self.devices.insert_pending(device, &code).await {
                Ok(created) => {
                    info!(
                        "Created pending device {} in location {}",
                        created.id, created.location_id
                    );
                    self.notifier
                        .notify_devices_changed(created.location_id)
                        .await;
                    return Ok(created);
                }
                Err(Error::PairingCodeTaken(_)) => {
                    debug!(
                        "Pairing code collision (attempt {}/{}), regenerating",
                        attempt, MAX_CODE_ATTEMPTS
                    );
                }
                Err(e) => return Err(e),
            }
        }

        warn!("No free pairing code after {} attempts", MAX_CODE_ATTEMPTS);
        Err(Error::Conflict(format!(
            "no free pairing code after {} attempts",
            MAX_CODE_ATTEMPTS
        )))
    }

    /// Binds `mac_address` to the pending device holding `pairing_code`.
    ///
    /// A device that lost the response and retries with the same MAC gets
    /// `AlreadyPaired` instead of an error, including when the MAC is refused
    /// because it is already bound to an active device.
    pub async fn complete_pairing(
        &self,
        pairing_code: &str,
        mac_address: &str,
    ) -> Result<PairingOutcome> {
        validate_pairing_request(pairing_code, mac_address)?;
        let mac = normalize_mac(mac_address);

        let refused = match self.devices.activate_pending(pairing_code, &mac).await {
            Ok(Some(device_id)) => {
                PAIRINGS_COMPLETED_TOTAL.inc();
                info!("Device {} paired with MAC {}", device_id, mac);
                return Ok(PairingOutcome::Paired { device_id });
            }
            Ok(None) => None,
            Err(Error::Conflict(reason)) => {
                debug!("Activation with code {} refused: {}", pairing_code, reason);
                Some(reason)
            }
            Err(e) => return Err(e),
        };

        match self.devices.find_by_mac(&mac).await? {
            Some(device) if device.is_active => {
                info!("Device {} already paired with MAC {}", device.id, mac);
                Ok(PairingOutcome::AlreadyPaired {
                    device_id: device.id,
                })
            }
            _ => match refused {
                Some(reason) => Err(Error::Conflict(reason)),
                None => {
                    warn!("Invalid pairing code: {}", pairing_code);
                    Ok(PairingOutcome::NotFound)
                }
            },
        }
    }

    /// Deletes pending devices older than `ttl`.
    pub async fn expire_stale_pending(&self, ttl: Duration) -> Result<u64> {
        self.expire_stale_pending_at(Utc::now(), ttl).await
    }

    pub async fn expire_stale_pending_at(&self, now: DateTime<Utc>, ttl: Duration) -> Result<u64> {
        let removed = self.devices.delete_stale_pending(now - ttl).await?;
        if removed > 0 {
            DEVICES_EXPIRED_TOTAL.inc_by(removed as f64);
        }
        Ok(removed)
    }
}
