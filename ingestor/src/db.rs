use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{Device, DeviceId, DeviceRow, LocationId, NewDevice, PowerState, Reading, UserId};
use crate::store::{DeviceRegistry, ReadingStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, warn};

const DEVICE_COLUMNS: &str = "id, location_id, name, device_type, max_watts_threshold, \
     mac_address, pairing_code, is_active, current_state, created_at";

const READING_COLUMNS: &str =
    "device_id, power_watts, voltage, current_amps, energy_kwh, frequency, power_factor, time";

const PAIRING_CODE_KEY: &str = "devices_pairing_code_key";
const ISSUED_CODE_KEY: &str = "pairing_codes_issued_pkey";
const MAC_ADDRESS_KEY: &str = "devices_mac_address_key";

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

pub async fn make_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Postgres-backed device registry and reading store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DeviceRegistry for PgStore {
    async fn insert_pending(&self, device: &NewDevice, pairing_code: &str) -> Result<Device> {
        // Both rows land in one statement: a code is recorded as issued only
        // if its device was created.
        let query = format!(
            "WITH issued AS (
                 INSERT INTO pairing_codes_issued (code) VALUES ($5) RETURNING code
             )
             INSERT INTO devices (location_id, name, device_type, max_watts_threshold, pairing_code, is_active)
             SELECT $1, $2, $3, $4, code, FALSE FROM issued
             RETURNING {DEVICE_COLUMNS}"
        );

        let row = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(device.location_id)
            .bind(&device.name)
            .bind(&device.device_type)
            .bind(device.max_watts_threshold)
            .bind(pairing_code)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_violation(&e, UNIQUE_VIOLATION, Some(ISSUED_CODE_KEY))
                    || is_violation(&e, UNIQUE_VIOLATION, Some(PAIRING_CODE_KEY))
                {
                    Error::PairingCodeTaken(pairing_code.to_string())
                } else if is_violation(&e, FOREIGN_KEY_VIOLATION, None) {
                    Error::NotFound(format!("location {}", device.location_id))
                } else {
                    track(e)
                }
            })?;

        Ok(row.into())
    }

    async fn find_by_id(&self, id: DeviceId) -> Result<Option<Device>> {
        let query = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = $1");
        let row = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(track)?;
        Ok(row.map(Device::from))
    }

    async fn find_by_mac(&self, mac_address: &str) -> Result<Option<Device>> {
        let query = format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE lower(mac_address) = lower($1) LIMIT 1"
        );
        let row = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(mac_address)
            .fetch_optional(&self.pool)
            .await
            .map_err(track)?;
        Ok(row.map(Device::from))
    }

    async fn find_by_pairing_code(&self, pairing_code: &str) -> Result<Option<Device>> {
        let query =
            format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE pairing_code = $1 LIMIT 1");
        let row = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(pairing_code)
            .fetch_optional(&self.pool)
            .await
            .map_err(track)?;
        Ok(row.map(Device::from))
    }

    async fn list(&self, owner: Option<UserId>) -> Result<Vec<Device>> {
        let rows = match owner {
            Some(user_id) => {
                let query = format!(
                    "SELECT {DEVICE_COLUMNS} FROM devices
                     WHERE location_id IN (SELECT id FROM locations WHERE user_id = $1)
                     ORDER BY id"
                );
                sqlx::query_as::<_, DeviceRow>(&query)
                    .bind(user_id)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let query = format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY id");
                sqlx::query_as::<_, DeviceRow>(&query)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(track)?;

        Ok(rows.into_iter().map(Device::from).collect())
    }

    async fn rename(&self, id: DeviceId, name: &str) -> Result<Option<Device>> {
        let query =
            format!("UPDATE devices SET name = $1 WHERE id = $2 RETURNING {DEVICE_COLUMNS}");
        let row = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(name)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(track)?;
        Ok(row.map(Device::from))
    }

    async fn move_to_location(
        &self,
        id: DeviceId,
        location_id: LocationId,
    ) -> Result<Option<Device>> {
        let query = format!(
            "UPDATE devices SET location_id = $1 WHERE id = $2 RETURNING {DEVICE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, DeviceRow>(&query)
            .bind(location_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                if is_violation(&e, FOREIGN_KEY_VIOLATION, None) {
                    Error::NotFound(format!("location {}", location_id))
                } else {
                    track(e)
                }
            })?;
        Ok(row.map(Device::from))
    }

    async fn delete(&self, id: DeviceId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM devices WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(track)?;
        Ok(result.rows_affected() > 0)
    }

    async fn activate_pending(
        &self,
        pairing_code: &str,
        mac_address: &str,
    ) -> Result<Option<DeviceId>> {
        let activated = sqlx::query_scalar::<_, i64>(
            "UPDATE devices
             SET mac_address = $2, is_active = TRUE, pairing_code = NULL
             WHERE pairing_code = $1 AND is_active = FALSE
             RETURNING id",
        )
        .bind(pairing_code)
        .bind(mac_address)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            if is_violation(&e, UNIQUE_VIOLATION, Some(MAC_ADDRESS_KEY)) {
                Error::Conflict(format!("MAC address {} is bound to another device", mac_address))
            } else {
                track(e)
            }
        })?;

        Ok(activated)
    }

    async fn delete_stale_pending(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        // The predicate is evaluated per row at delete time, so a device that
        // activated after an earlier read is never removed.
        let result = sqlx::query(
            "DELETE FROM devices
             WHERE is_active = FALSE
               AND pairing_code IS NOT NULL
               AND created_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(track)?;

        Ok(result.rows_affected())
    }

    async fn update_cached_metrics(
        &self,
        id: DeviceId,
        max_watts_threshold: f64,
        current_state: PowerState,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE devices SET max_watts_threshold = $2, current_state = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(max_watts_threshold)
        .bind(current_state.as_str())
        .execute(&self.pool)
        .await
        .map_err(track)?;

        Ok(())
    }
}

#[async_trait]
impl ReadingStore for PgStore {
    async fn insert(&self, reading: &Reading) -> Result<()> {
        let query = format!(
            "INSERT INTO readings ({READING_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        );

        sqlx::query(&query)
            .bind(reading.device_id)
            .bind(reading.power_watts)
            .bind(reading.voltage)
            .bind(reading.current_amps)
            .bind(reading.energy_kwh)
            .bind(reading.frequency)
            .bind(reading.power_factor)
            .bind(reading.time)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_violation(&e, FOREIGN_KEY_VIOLATION, None) {
                    Error::NotFound(format!("device {}", reading.device_id))
                } else {
                    track(e)
                }
            })?;

        Ok(())
    }

    async fn recent(&self, device_id: DeviceId, limit: usize) -> Result<Vec<Reading>> {
        let query = format!(
            "SELECT {READING_COLUMNS} FROM readings WHERE device_id = $1 ORDER BY time DESC LIMIT $2"
        );
        let readings = sqlx::query_as::<_, Reading>(&query)
            .bind(device_id)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(track)?;
        Ok(readings)
    }

    async fn since(
        &self,
        since: DateTime<Utc>,
        device_ids: Option<&[DeviceId]>,
    ) -> Result<Vec<Reading>> {
        let readings = match device_ids {
            Some(ids) => {
                let query = format!(
                    "SELECT {READING_COLUMNS} FROM readings
                     WHERE time >= $1 AND device_id = ANY($2)"
                );
                sqlx::query_as::<_, Reading>(&query)
                    .bind(since)
                    .bind(ids)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let query = format!("SELECT {READING_COLUMNS} FROM readings WHERE time >= $1");
                sqlx::query_as::<_, Reading>(&query)
                    .bind(since)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(track)?;

        Ok(readings)
    }

    async fn latest_per_device(&self, device_ids: Option<&[DeviceId]>) -> Result<Vec<Reading>> {
        let readings = match device_ids {
            Some(ids) => {
                let query = format!(
                    "SELECT DISTINCT ON (device_id) {READING_COLUMNS}
                     FROM readings
                     WHERE device_id = ANY($1)
                     ORDER BY device_id, time DESC"
                );
                sqlx::query_as::<_, Reading>(&query)
                    .bind(ids)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let query = format!(
                    "SELECT DISTINCT ON (device_id) {READING_COLUMNS}
                     FROM readings
                     ORDER BY device_id, time DESC"
                );
                sqlx::query_as::<_, Reading>(&query)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(track)?;

        Ok(readings)
    }
}

fn track(err: sqlx::Error) -> Error {
    if is_transient_error(&err) {
        DB_FAILURES_TOTAL.inc();
        warn!("Transient database failure: {}", err);
    }
    Error::Database(err)
}

fn is_violation(err: &sqlx::Error, code: &str, constraint: Option<&str>) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().is_some_and(|c| c == code)
                && constraint.map_or(true, |name| db_err.constraint() == Some(name))
        }
        _ => false,
    }
}

pub(crate) fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" || // too_many_connections
                code == "40001" || // serialization_failure
                code == "40P01" // deadlock_detected
            })
        }
        _ => false,
    }
}
