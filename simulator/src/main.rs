mod telemetry;

use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Publishes simulated appliance power readings to an MQTT broker.
#[derive(Debug, Parser)]
#[command(name = "power-simulator")]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Readings per second across the whole fleet.
    #[arg(long, env = "RATE", default_value_t = 10)]
    rate: u64,

    #[arg(long, env = "DEVICES", default_value_t = 10)]
    devices: usize,

    /// Id of the first simulated device; the fleet uses consecutive ids.
    #[arg(long, env = "FIRST_DEVICE_ID", default_value_t = 1)]
    first_device_id: i64,

    /// Chance that a running appliance reports a surge.
    #[arg(long, env = "SPIKE_PROBABILITY", default_value_t = 0.02)]
    spike_probability: f64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let rate = args.rate.max(1);

    info!("Starting power simulator");
    info!(
        "Broker: {}:{}, Rate: {} readings/s, Devices: {} (ids {}..{})",
        args.broker,
        args.port,
        rate,
        args.devices,
        args.first_device_id,
        args.first_device_id + args.devices as i64
    );

    let client_id = format!("power-sim-{}", uuid::Uuid::new_v4());

    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut fleet = telemetry::fleet(
        args.first_device_id,
        args.devices.max(1),
        args.spike_probability,
    );
    let mut rng = rand::thread_rng();
    let mut counter = 0u64;

    let interval = Duration::from_micros((1_000_000 / rate).max(1));
    let mut ticker = tokio::time::interval(interval);

    info!("Connected to MQTT broker, publishing one reading every {:?}", interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping after {} readings", counter);
                return;
            }
        }

        let device = &mut fleet[(counter % args.devices.max(1) as u64) as usize];
        let reading = device.sample(&mut rng, Utc::now());

        let payload = match serde_json::to_string(&reading) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to serialize reading: {}", e);
                continue;
            }
        };

        match client
            .publish(reading.topic(), QoS::AtLeastOnce, false, payload)
            .await
        {
            Ok(_) => counter += 1,
            Err(e) => warn!("Failed to publish: {}", e),
        }

        if counter > 0 && counter % 1000 == 0 {
            info!("Published {} readings", counter);
        }
    }
}
