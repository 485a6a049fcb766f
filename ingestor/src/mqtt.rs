use crate::errors::{Error, Result};
use crate::metrics::{MQTT_INVALID_MESSAGES_TOTAL, MQTT_MESSAGES_TOTAL};
use crate::model::{DeviceId, RawReading};
use crate::queue::IngestQueue;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const READINGS_TOPIC: &str = "readings/#";

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2000;

/// Feeds readings published on `readings/{deviceId}` into the ingestion queue
/// until `cancel` fires.
pub async fn run_mqtt(
    broker: String,
    port: u16,
    client_id: String,
    queue: IngestQueue,
    cancel: CancellationToken,
) -> Result<()> {
    info!("Connecting to MQTT broker at {}:{}", broker, port);

    let mut mqtt_options = MqttOptions::new(client_id, broker, port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(false);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

    client.subscribe(READINGS_TOPIC, QoS::AtLeastOnce).await?;
    info!("Subscribed to {} with QoS 1", READINGS_TOPIC);

    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => break,
            notification = eventloop.poll() => notification,
        };

        match notification {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                MQTT_MESSAGES_TOTAL.inc();
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );

                if let Err(e) =
                    process_message_with_retry(&publish.topic, &publish.payload, &queue).await
                {
                    error!("Dropping message from {}: {}", publish.topic, e);
                    MQTT_INVALID_MESSAGES_TOTAL.inc();
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc reconnects on the next poll
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    info!("MQTT intake stopped");
    Ok(())
}

async fn process_message_with_retry(
    topic: &str,
    payload: &[u8],
    queue: &IngestQueue,
) -> Result<u64> {
    let mut attempt = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        attempt += 1;

        match process_message(topic, payload, queue).await {
            Ok(job_id) => {
                if attempt > 1 {
                    info!("Message queued as job {} on attempt {}", job_id, attempt);
                }
                return Ok(job_id);
            }
            Err(e) if attempt >= MAX_RETRIES || !e.is_transient() => return Err(e),
            Err(e) => {
                warn!(
                    "Queueing message failed (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt, MAX_RETRIES, e, backoff_ms
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}

async fn process_message(topic: &str, payload: &[u8], queue: &IngestQueue) -> Result<u64> {
    let mut reading = serde_json::from_slice::<RawReading>(payload)
        .map_err(|e| Error::Validation(format!("JSON parse error: {}", e)))?;

    if reading.device_id.is_none() {
        reading.device_id = device_id_from_topic(topic);
    }

    queue.enqueue(reading).await
}

/// `readings/42` -> `Some(42)`.
fn device_id_from_topic(topic: &str) -> Option<DeviceId> {
    topic.strip_prefix("readings/")?.parse().ok()
}
