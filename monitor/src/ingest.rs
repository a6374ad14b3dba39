//! Server side of the push model: keeps the latest record per vehicle and
//! runs every pushed sample through the alert rules.

use crate::config::{ConfigStore, MonitorConfig};
use crate::engine::analyze;
use crate::metrics::{SAMPLES_TOTAL, TRACKED_VEHICLES};
use crate::model::{AlertsResponse, FleetSnapshot, HealthResponse, VehicleRecord, VehicleSample};
use crate::sink::{AlertSink, Notifier, SERVER_ALERT_CAP};
use crate::tracker::{ReferenceTime, StagnationTracker};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::debug;

pub const DEFAULT_ALERT_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub vehicle_count: usize,
    pub alert_count: usize,
    pub raised: usize,
}

pub struct IngestService {
    config: ConfigStore,
    vehicles: RwLock<HashMap<String, VehicleRecord>>,
    tracker: Mutex<StagnationTracker>,
    sink: AlertSink,
    started: Instant,
}

impl IngestService {
    pub fn new(config: MonitorConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config: ConfigStore::new(config),
            vehicles: RwLock::new(HashMap::new()),
            tracker: Mutex::new(StagnationTracker::new(ReferenceTime::SampleTime)),
            sink: AlertSink::new(SERVER_ALERT_CAP, notifier),
            started: Instant::now(),
        }
    }

    pub fn sink(&self) -> &AlertSink {
        &self.sink
    }

    pub async fn ingest(&self, samples: Vec<VehicleSample>) -> IngestSummary {
        self.ingest_at(samples, Utc::now()).await
    }

    /// Stores and analyzes a batch of pushed samples in arrival order.
    pub async fn ingest_at(&self, samples: Vec<VehicleSample>, now: DateTime<Utc>) -> IngestSummary {
        let config = self.config.snapshot();
        let mut tracker = self.tracker.lock().await;
        let mut alerts = Vec::new();

        for sample in &samples {
            SAMPLES_TOTAL.inc();
            self.write_vehicles(|vehicles| {
                vehicles.insert(
                    sample.vehicle_id.clone(),
                    VehicleRecord::from_sample(sample, now),
                );
            });
            // Each push is its own batch, so the per-cycle fleet cap never drops one.
            alerts.extend(analyze(std::slice::from_ref(sample), &config, &mut tracker, now));
        }
        TRACKED_VEHICLES.set(tracker.tracked() as f64);

        let raised = alerts.len();
        self.sink.commit(alerts).await;
        drop(tracker);

        let summary = IngestSummary {
            vehicle_count: self.vehicle_count(),
            alert_count: self.sink.len(),
            raised,
        };
        debug!(
            samples = samples.len(),
            raised,
            vehicles = summary.vehicle_count,
            "Ingested samples"
        );
        summary
    }

    pub fn vehicle_count(&self) -> usize {
        self.read_vehicles(|vehicles| vehicles.len())
    }

    pub fn fleet_snapshot(&self) -> FleetSnapshot {
        self.read_vehicles(|vehicles| {
            let mut records: Vec<VehicleRecord> = vehicles.values().cloned().collect();
            records.sort_by(|a, b| a.vehicle_number.cmp(&b.vehicle_number));
            let last_update = records.iter().map(|v| v.last_update).max().unwrap_or(0);
            FleetSnapshot {
                vehicles: records,
                last_update,
            }
        })
    }

    pub fn alerts(&self, limit: usize) -> AlertsResponse {
        AlertsResponse {
            alerts: self.sink.recent(limit),
            total: self.sink.len(),
        }
    }

    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "OK".to_string(),
            vehicles: self.vehicle_count(),
            alerts: self.sink.len(),
            uptime: self.started.elapsed().as_secs_f64(),
        }
    }

    fn read_vehicles<T>(&self, f: impl FnOnce(&HashMap<String, VehicleRecord>) -> T) -> T {
        match self.vehicles.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn write_vehicles<T>(&self, f: impl FnOnce(&mut HashMap<String, VehicleRecord>) -> T) -> T {
        match self.vehicles.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AlertKind;
    use crate::sink::LogNotifier;
    use chrono::{Duration, TimeZone};

    fn service() -> IngestService {
        IngestService::new(MonitorConfig::all_vehicles(80.0, 30), Arc::new(LogNotifier))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_ingest_counts() {
        let service = service();
        let fresh = now().timestamp();

        let summary = service
            .ingest_at(vec![VehicleSample::new("KA01", 95.0, fresh)], now())
            .await;
        assert_eq!(summary.vehicle_count, 1);
        assert_eq!(summary.alert_count, 1);
        assert_eq!(summary.raised, 1);

        let summary = service
            .ingest_at(vec![VehicleSample::new("KA02", 30.0, fresh)], now())
            .await;
        assert_eq!(summary.vehicle_count, 2);
        assert_eq!(summary.alert_count, 1);
        assert_eq!(summary.raised, 0);
    }

    #[tokio::test]
    async fn test_latest_record_wins() {
        let service = service();
        let t = now().timestamp();
        service
            .ingest_at(vec![VehicleSample::new("KA01", 10.0, t - 60)], now())
            .await;
        service
            .ingest_at(vec![VehicleSample::new("KA01", 20.0, t)], now())
            .await;

        let snapshot = service.fleet_snapshot();
        assert_eq!(snapshot.vehicles.len(), 1);
        assert_eq!(snapshot.vehicles[0].speed, 20.0);
        assert_eq!(snapshot.last_update, now().timestamp_millis());
    }

    #[tokio::test]
    async fn test_stale_parked_vehicle_alerts_once() {
        let service = service();
        let stale = (now() - Duration::minutes(45)).timestamp();

        for minute in 0..5 {
            service
                .ingest_at(
                    vec![VehicleSample::new("KA01", 0.0, stale)],
                    now() + Duration::minutes(minute),
                )
                .await;
        }

        let alerts = service.alerts(DEFAULT_ALERT_LIMIT);
        assert_eq!(alerts.total, 1);
        assert_eq!(alerts.alerts[0].kind, AlertKind::Stagnation);
    }

    #[tokio::test]
    async fn test_batches_are_not_capped() {
        let service = service();
        let t = now().timestamp();
        let batch: Vec<VehicleSample> = (0..10)
            .map(|i| VehicleSample::new(format!("V{}", i), 120.0, t))
            .collect();

        let summary = service.ingest_at(batch, now()).await;
        assert_eq!(summary.vehicle_count, 10);
        assert_eq!(summary.raised, 10);
    }

    #[tokio::test]
    async fn test_server_log_capped_at_100() {
        let service = service();
        let t = now().timestamp();
        for _ in 0..120 {
            service
                .ingest_at(vec![VehicleSample::new("KA01", 150.0, t)], now())
                .await;
        }
        let health = service.health();
        assert_eq!(health.alerts, SERVER_ALERT_CAP);
        assert_eq!(health.vehicles, 1);
        assert_eq!(health.status, "OK");
        assert_eq!(service.alerts(10).alerts.len(), 10);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = service().fleet_snapshot();
        assert!(snapshot.vehicles.is_empty());
        assert_eq!(snapshot.last_update, 0);
    }
}
