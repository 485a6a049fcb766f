//! Runs against a real Postgres. Start one and run with
//! `DATABASE_URL=postgres://... cargo test -- --ignored`.

use chrono::{Duration, Utc};
use power_ingestor::db::{make_pool, PgStore};
use power_ingestor::errors::Error;
use power_ingestor::model::{NewDevice, PowerState, Reading};
use power_ingestor::store::{DeviceRegistry, ReadingStore};
use rand::Rng;

async fn store() -> PgStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    PgStore::new(make_pool(&url, 5).await.expect("database reachable"))
}

async fn location(store: &PgStore, user_id: i64) -> i64 {
    sqlx::query_scalar("INSERT INTO locations (user_id, name) VALUES ($1, $2) RETURNING id")
        .bind(user_id)
        .bind("Test flat")
        .fetch_one(store.pool())
        .await
        .unwrap()
}

fn code() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000))
}

fn mac() -> String {
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| format!("{:02X}", rng.gen::<u8>()))
        .collect::<Vec<_>>()
        .join(":")
}

#[tokio::test]
#[ignore]
async fn test_pairing_round_trip() {
    let store = store().await;
    let user_id = rand::thread_rng().gen_range(1_000_000..2_000_000);
    let location_id = location(&store, user_id).await;
    let pairing_code = code();
    let mac_address = mac();

    let device = store
        .insert_pending(
            &NewDevice {
                location_id,
                name: "Freezer".to_string(),
                device_type: "freezer".to_string(),
                max_watts_threshold: 300.0,
            },
            &pairing_code,
        )
        .await
        .unwrap();
    assert!(!device.is_active);

    let activated = store
        .activate_pending(&pairing_code, &mac_address)
        .await
        .unwrap();
    assert_eq!(activated, Some(device.id));
    assert_eq!(
        store.activate_pending(&pairing_code, &mac_address).await.unwrap(),
        None
    );

    let found = store
        .find_by_mac(&mac_address.to_lowercase())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, device.id);
    assert!(found.pairing_code.is_none());

    let owned = store.list(Some(user_id)).await.unwrap();
    assert_eq!(owned.len(), 1);

    assert!(store.delete(device.id).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_duplicate_pending_code_is_reported() {
    let store = store().await;
    let location_id = location(&store, 1).await;
    let pairing_code = code();
    let device = NewDevice {
        location_id,
        name: "Lamp".to_string(),
        device_type: "light".to_string(),
        max_watts_threshold: 60.0,
    };

    let first = store.insert_pending(&device, &pairing_code).await.unwrap();
    let err = store.insert_pending(&device, &pairing_code).await.unwrap_err();
    assert!(matches!(err, Error::PairingCodeTaken(_)));

    // Still taken after the device holding it paired and was removed.
    store.activate_pending(&pairing_code, &mac()).await.unwrap();
    store.delete(first.id).await.unwrap();
    let err = store.insert_pending(&device, &pairing_code).await.unwrap_err();
    assert!(matches!(err, Error::PairingCodeTaken(_)));
}

#[tokio::test]
#[ignore]
async fn test_readings_and_cached_metrics() {
    let store = store().await;
    let location_id = location(&store, 1).await;
    let device = store
        .insert_pending(
            &NewDevice {
                location_id,
                name: "Washer".to_string(),
                device_type: "washer".to_string(),
                max_watts_threshold: 2000.0,
            },
            &code(),
        )
        .await
        .unwrap();

    let now = Utc::now();
    for (minutes_ago, watts) in [(20, 400.0), (10, 2100.0)] {
        store
            .insert(&Reading {
                device_id: device.id,
                power_watts: watts,
                voltage: 230.0,
                current_amps: watts / 230.0,
                energy_kwh: 0.0,
                frequency: 50.0,
                power_factor: 0.95,
                time: now - Duration::minutes(minutes_ago),
            })
            .await
            .unwrap();
    }

    let recent = store.recent(device.id, 10).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].power_watts, 2100.0);

    let latest = store.latest_per_device(Some(&[device.id])).await.unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].power_watts, 2100.0);

    let history = store
        .since(now - Duration::hours(1), Some(&[device.id]))
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|r| r.device_id == device.id));

    store
        .update_cached_metrics(device.id, 2100.0, PowerState::On)
        .await
        .unwrap();
    let refreshed = store.find_by_id(device.id).await.unwrap().unwrap();
    assert_eq!(refreshed.max_watts_threshold, 2100.0);
    assert_eq!(refreshed.current_state, PowerState::On);

    assert!(store.delete(device.id).await.unwrap());
    assert!(store.recent(device.id, 10).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore]
async fn test_stale_pending_sweep() {
    let store = store().await;
    let location_id = location(&store, 1).await;
    let device = store
        .insert_pending(
            &NewDevice {
                location_id,
                name: "Old plug".to_string(),
                device_type: "plug".to_string(),
                max_watts_threshold: 10.0,
            },
            &code(),
        )
        .await
        .unwrap();

    sqlx::query("UPDATE devices SET created_at = $1 WHERE id = $2")
        .bind(Utc::now() - Duration::hours(5))
        .bind(device.id)
        .execute(store.pool())
        .await
        .unwrap();

    let removed = store
        .delete_stale_pending(Utc::now() - Duration::hours(1))
        .await
        .unwrap();
    assert!(removed >= 1);
    assert!(store.find_by_id(device.id).await.unwrap().is_none());
}
