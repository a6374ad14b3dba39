use crate::config::{MonitorConfig, MAX_MONITORED_VEHICLES};
use crate::model::{Alert, AlertKind, VehicleSample};
use crate::tracker::StagnationTracker;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// Keeps samples for monitored vehicles only, at most [`MAX_MONITORED_VEHICLES`]
/// of them, in source order.
pub fn monitored_batch<'a>(
    samples: &'a [VehicleSample],
    config: &'a MonitorConfig,
) -> impl Iterator<Item = &'a VehicleSample> + 'a {
    samples
        .iter()
        .filter(move |s| config.is_monitored(&s.vehicle_id))
        .take(MAX_MONITORED_VEHICLES)
}

/// Runs the speeding and stagnation rules over one batch of samples.
///
/// Speeding alerts fire on every qualifying sample. Stagnation alerts are
/// deduplicated per episode by the tracker.
pub fn analyze(
    samples: &[VehicleSample],
    config: &MonitorConfig,
    tracker: &mut StagnationTracker,
    now: DateTime<Utc>,
) -> Vec<Alert> {
    let window = config.stagnation_window();
    let mut alerts = Vec::new();

    for sample in monitored_batch(samples, config) {
        if sample.speed > config.speed_limit {
            info!(
                vehicle = %sample.vehicle_id,
                speed = sample.speed,
                limit = config.speed_limit,
                "Speed alert"
            );
            alerts.push(Alert {
                kind: AlertKind::Speeding,
                vehicle_id: sample.vehicle_id.clone(),
                vehicle_name: sample.vehicle_name.clone(),
                message: format!(
                    "Speeding at {} km/h (limit: {} km/h)",
                    sample.speed, config.speed_limit
                ),
                timestamp: now,
                location: sample.location,
            });
        }

        let verdict = tracker.evaluate(
            &sample.vehicle_id,
            sample.speed,
            sample.sample_time,
            now,
            window,
        );
        if verdict.newly_stagnant {
            debug!(vehicle = %sample.vehicle_id, "Vehicle became stationary");
        }
        if verdict.should_alert {
            let minutes = (verdict.stagnant_for.num_seconds() as f64 / 60.0).round() as i64;
            info!(vehicle = %sample.vehicle_id, minutes, "Stagnation alert");
            alerts.push(Alert {
                kind: AlertKind::Stagnation,
                vehicle_id: sample.vehicle_id.clone(),
                vehicle_name: sample.vehicle_name.clone(),
                message: format!("Stagnant for {} minutes", minutes),
                timestamp: now,
                location: sample.location,
            });
        }
    }

    alerts
}
