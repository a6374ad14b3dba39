//! Daily distance rollup.
//!
//! Sums the trip distances of every vehicle for one calendar day. A vehicle
//! whose trip query fails is kept in the day's summary with its error and a
//! zero distance; the other vehicles are unaffected.

use crate::config::MonitorConfig;
use crate::model::VehicleSample;
use crate::source::TripSource;
use chrono::{DateTime, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

pub const DISTANCE_HISTORY_DAYS: usize = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleDistance {
    pub date: NaiveDate,
    pub vehicle_id: String,
    pub vehicle_name: String,
    /// meters
    pub distance: f64,
    pub trips: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyDistance {
    pub date: NaiveDate,
    pub vehicles: Vec<VehicleDistance>,
    /// meters
    pub total_distance: f64,
}

impl DailyDistance {
    pub fn total_trips(&self) -> usize {
        self.vehicles.iter().map(|v| v.trips).sum()
    }

    /// At least one vehicle reported its trips.
    pub fn succeeded(&self) -> bool {
        self.vehicles.iter().any(|v| v.error.is_none())
    }
}

/// When the rollup runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RollupPolicy {
    /// Only during the last minute of the local day.
    #[default]
    LastMinute,
    /// Also roll up yesterday on any cycle if it was missed.
    CatchUp,
}

pub fn is_last_minute(local: NaiveDateTime) -> bool {
    local.hour() == 23 && local.minute() == 59
}

/// Days whose rollup should run on a cycle at local time `local`.
pub fn due_dates(
    policy: RollupPolicy,
    local: NaiveDateTime,
    last_rollup: Option<NaiveDate>,
) -> Vec<NaiveDate> {
    let today = local.date();
    let mut dates = Vec::new();

    if policy == RollupPolicy::CatchUp {
        let yesterday = today - Duration::days(1);
        if last_rollup.map_or(true, |last| last < yesterday) {
            dates.push(yesterday);
        }
    }
    if is_last_minute(local) {
        dates.push(today);
    }
    dates
}

/// UTC bounds of a local calendar day.
pub fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = date.and_time(NaiveTime::default());
    let end = start + Duration::days(1) - Duration::milliseconds(1);
    let to_utc = |naive: NaiveDateTime| {
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
    };
    (to_utc(start), to_utc(end))
}

/// Fetches every vehicle's trips for `date`, isolating per-vehicle failures.
pub async fn run_rollup(
    trips: &dyn TripSource,
    config: &MonitorConfig,
    vehicles: &[VehicleSample],
    date: NaiveDate,
) -> DailyDistance {
    let (start, end) = day_bounds(date);
    let mut results = Vec::with_capacity(vehicles.len());

    for vehicle in vehicles {
        let entry = match trips.fetch_trips(config, &vehicle.vehicle_id, start, end).await {
            Ok(list) => VehicleDistance {
                date,
                vehicle_id: vehicle.vehicle_id.clone(),
                vehicle_name: vehicle.vehicle_name.clone(),
                distance: list.iter().filter_map(|t| t.distance).sum(),
                trips: list.len(),
                error: None,
            },
            Err(e) => {
                error!(
                    "Error fetching daily distance for vehicle {}: {}",
                    vehicle.vehicle_id, e
                );
                VehicleDistance {
                    date,
                    vehicle_id: vehicle.vehicle_id.clone(),
                    vehicle_name: vehicle.vehicle_name.clone(),
                    distance: 0.0,
                    trips: 0,
                    error: Some(e.to_string()),
                }
            }
        };
        results.push(entry);
    }

    let total_distance: f64 = results.iter().map(|v| v.distance).sum();
    info!(
        date = %date,
        vehicles = results.len(),
        total_km = total_distance / 1000.0,
        "Daily distance rollup complete"
    );
    DailyDistance {
        date,
        vehicles: results,
        total_distance,
    }
}

/// Stores a day's summary, replacing any previous entry for the same date and
/// keeping only the most recent [`DISTANCE_HISTORY_DAYS`] days.
pub fn record_day(history: &mut Vec<DailyDistance>, day: DailyDistance) {
    history.retain(|entry| entry.date != day.date);
    history.push(day);
    history.sort_by_key(|entry| entry.date);
    if history.len() > DISTANCE_HISTORY_DAYS {
        let excess = history.len() - DISTANCE_HISTORY_DAYS;
        history.drain(..excess);
    }
}
