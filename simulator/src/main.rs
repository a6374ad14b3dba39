mod telemetry;

use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::{Duration, Instant};
use telemetry::Vehicle;
use tracing::{error, info, warn};

/// Publishes simulated vehicle telemetry to an MQTT broker.
#[derive(Debug, Parser)]
#[command(name = "simulator", version)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    mqtt_broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    mqtt_port: u16,

    /// Number of simulated vehicles
    #[arg(long, env = "VEHICLES", default_value_t = 4)]
    vehicles: usize,

    /// Seconds between readings of each vehicle
    #[arg(long, env = "INTERVAL_SECS", default_value_t = 5)]
    interval_secs: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt::init();

    info!("Starting fleet simulator");
    info!(
        "Broker: {}:{}, Vehicles: {}, Interval: {}s",
        args.mqtt_broker, args.mqtt_port, args.vehicles, args.interval_secs
    );

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(&client_id, &args.mqtt_broker, args.mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("Connected to MQTT broker, starting to publish telemetry");

    let mut rng = rand::thread_rng();
    let mut fleet: Vec<Vehicle> = (0..args.vehicles).map(|i| Vehicle::new(&mut rng, i + 1)).collect();
    let interval = Duration::from_secs(args.interval_secs.max(1));
    let mut published = 0u64;

    loop {
        let round_start = Instant::now();
        let now = Utc::now().timestamp();

        for vehicle in &mut fleet {
            let reading = vehicle.step(&mut rng, interval.as_secs_f64(), now);
            let topic = format!("vehicles/{}", reading.vehicle_number);
            let payload = match serde_json::to_string(&reading) {
                Ok(p) => p,
                Err(e) => {
                    error!("Failed to serialize telemetry: {}", e);
                    continue;
                }
            };

            match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                Ok(_) => published += 1,
                Err(e) => warn!("Failed to publish: {}", e),
            }
        }

        if published % 100 < fleet.len() as u64 {
            info!("Published {} readings", published);
        }

        let elapsed = round_start.elapsed();
        if elapsed < interval {
            tokio::time::sleep(interval - elapsed).await;
        }
    }
}
