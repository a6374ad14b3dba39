use crate::errors::{Error, Result};
use crate::metrics::{CHANNEL_FULL_TOTAL, INVALID_SAMPLES_TOTAL, MQTT_MESSAGES_TOTAL};
use crate::model::{TelemetryRecord, VehicleSample};
use crate::validate::validate;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const TELEMETRY_TOPIC: &str = "vehicles/#";

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2000;

/// Subscribes to vehicle telemetry and forwards validated samples to `tx`.
pub async fn run_mqtt(
    broker: String,
    port: u16,
    client_id: String,
    tx: mpsc::Sender<VehicleSample>,
) -> Result<()> {
    info!("Connecting to MQTT broker at {}:{}", broker, port);

    let mut mqtt_options = MqttOptions::new(client_id, broker, port);
    mqtt_options.set_keep_alive(std::time::Duration::from_secs(30));
    mqtt_options.set_clean_session(false);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

    client
        .subscribe(TELEMETRY_TOPIC, QoS::AtLeastOnce)
        .await
        .map_err(Error::Mqtt)?;

    info!("Subscribed to {} with QoS 1", TELEMETRY_TOPIC);

    loop {
        match eventloop.poll().await {
            Ok(notification) => {
                if let Event::Incoming(Packet::Publish(publish)) = notification {
                    MQTT_MESSAGES_TOTAL.inc();

                    debug!(
                        "Received message on topic {}, size: {} bytes",
                        publish.topic,
                        publish.payload.len()
                    );

                    if let Err(e) = process_message_with_retry(&publish.payload, &tx).await {
                        error!("Failed to process message on {}: {}", publish.topic, e);
                        INVALID_SAMPLES_TOTAL.inc();
                    }
                }
            }
            Err(e) => {
                // rumqttc reconnects on the next poll
                error!("MQTT error: {}", e);
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

async fn process_message_with_retry(
    payload: &[u8],
    tx: &mpsc::Sender<VehicleSample>,
) -> Result<()> {
    let mut attempt = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        attempt += 1;

        match process_message(payload, tx).await {
            Ok(()) => {
                if attempt > 1 {
                    info!("Message processed successfully on attempt {}", attempt);
                }
                return Ok(());
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    return Err(e);
                }
                if !is_retryable_error(&e) {
                    warn!("Non-retryable error: {}", e);
                    return Err(e);
                }

                warn!(
                    "Message processing failed (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt, MAX_RETRIES, e, backoff_ms
                );
                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}

async fn process_message(payload: &[u8], tx: &mpsc::Sender<VehicleSample>) -> Result<()> {
    let record = serde_json::from_slice::<TelemetryRecord>(payload)
        .map_err(|e| Error::Validation(format!("JSON parse error: {}", e)))?;
    let sample = validate(&record)?;

    match tx.try_send(sample) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(sample)) => {
            CHANNEL_FULL_TOTAL.inc();
            debug!("Channel full, using blocking send");
            tx.send(sample).await.map_err(|_| Error::ChannelSend)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            error!("Channel closed, cannot forward sample");
            Err(Error::ChannelSend)
        }
    }
}

fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::ChannelSend => true,
        Error::Http(_) | Error::Status { .. } => true,

        Error::Validation(_) => false,
        Error::Config(_) => false,
        Error::Mqtt(_) => false,
        Error::Json(_) => false,
        Error::Csv(_) => false,
        Error::Io(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(is_retryable_error(&Error::ChannelSend));
        assert!(!is_retryable_error(&Error::Validation("test".to_string())));
        assert!(!is_retryable_error(&Error::Config("test".to_string())));
    }

    #[test]
    fn test_process_message_valid() {
        tokio_test::block_on(async {
            let (tx, mut rx) = mpsc::channel(10);
            let payload = br#"{"vehicle_number":"KA01AB1234","speed":"42.5","gpstime":1700000000,"latitude":12.97,"longitude":77.59}"#;

            assert!(process_message(payload, &tx).await.is_ok());

            let received = rx.recv().await.unwrap();
            assert_eq!(received.vehicle_id, "KA01AB1234");
            assert_eq!(received.speed, 42.5);
            assert!(received.location.is_some());
        });
    }

    #[test]
    fn test_process_message_invalid_json() {
        tokio_test::block_on(async {
            let (tx, _rx) = mpsc::channel(10);
            assert!(process_message(b"invalid json", &tx).await.is_err());
        });
    }

    #[test]
    fn test_process_message_missing_speed() {
        tokio_test::block_on(async {
            let (tx, _rx) = mpsc::channel(10);
            let payload = br#"{"vehicle_number":"KA01AB1234","gpstime":1700000000}"#;
            assert!(matches!(
                process_message(payload, &tx).await,
                Err(Error::Validation(_))
            ));
        });
    }

    #[test]
    fn test_closed_channel() {
        tokio_test::block_on(async {
            let (tx, rx) = mpsc::channel(1);
            drop(rx);
            let payload = br#"{"vehicle_number":"KA01","speed":10}"#;
            assert!(matches!(
                process_message(payload, &tx).await,
                Err(Error::ChannelSend)
            ));
        });
    }
}
