//! Local state kept between runs of the pull monitor: the last known sample of
//! every monitored vehicle, the alert history and the daily distance history.

use crate::config::MonitorConfig;
use crate::errors::Result;
use crate::model::{Alert, VehicleSample, VehicleSnapshot};
use crate::rollup::DailyDistance;
use crate::tracker::MOVING_SPEED_KMH;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalState {
    #[serde(default)]
    pub vehicles: BTreeMap<String, VehicleSnapshot>,
    #[serde(default)]
    pub alerts: Vec<Alert>,
    #[serde(default)]
    pub distance_history: Vec<DailyDistance>,
    #[serde(default)]
    pub last_rollup: Option<NaiveDate>,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
}

impl LocalState {
    /// Replaces the per-vehicle snapshots with the given samples.
    pub fn record_snapshots<'a>(
        &mut self,
        samples: impl IntoIterator<Item = &'a VehicleSample>,
        config: &MonitorConfig,
        now: DateTime<Utc>,
    ) {
        self.vehicles.clear();
        for sample in samples {
            self.vehicles.insert(
                sample.vehicle_id.clone(),
                VehicleSnapshot {
                    sample: sample.clone(),
                    status: vehicle_status(sample, config, now).to_string(),
                },
            );
        }
        self.last_update = Some(now);
    }
}

/// Display status for a vehicle card.
pub fn vehicle_status(sample: &VehicleSample, config: &MonitorConfig, now: DateTime<Utc>) -> &'static str {
    if sample.sample_time == 0 {
        return "No data";
    }
    if sample.speed > config.speed_limit {
        return "Speeding!";
    }
    let idle_minutes = (now.timestamp() - sample.sample_time) as f64 / 60.0;
    if idle_minutes > f64::from(config.stagnation_minutes) && sample.speed < MOVING_SPEED_KMH {
        return "Stagnant";
    }
    if sample.speed > 0.0 {
        return "Moving";
    }
    "Stopped"
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<LocalState>;
    async fn save(&self, state: &LocalState) -> Result<()>;
}

/// Persists [`LocalState`] as a JSON document on disk.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> Result<LocalState> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let state: LocalState = serde_json::from_slice(&bytes)?;
                info!(
                    path = %self.path.display(),
                    vehicles = state.vehicles.len(),
                    alerts = state.alerts.len(),
                    "Loaded local state"
                );
                Ok(state)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No local state yet, starting fresh");
                Ok(LocalState::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, state: &LocalState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "Saved local state");
        Ok(())
    }
}

/// In-process store, used when no state file is configured.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<LocalState>,
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> Result<LocalState> {
        Ok(match self.state.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        })
    }

    async fn save(&self, state: &LocalState) -> Result<()> {
        match self.state.lock() {
            Ok(mut guard) => *guard = state.clone(),
            Err(poisoned) => *poisoned.into_inner() = state.clone(),
        }
        Ok(())
    }
}
