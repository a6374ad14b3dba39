use crate::errors::{Error, Result};
use crate::model::{TelemetryRecord, VehicleSample};

const LATITUDE_RANGE: (f64, f64) = (-90.0, 90.0);
const LONGITUDE_RANGE: (f64, f64) = (-180.0, 180.0);

/// Validates a pushed telemetry record and normalizes it into a sample.
pub fn validate(record: &TelemetryRecord) -> Result<VehicleSample> {
    // Validate vehicle number
    let has_vehicle = record
        .vehicle_number
        .as_deref()
        .is_some_and(|v| !v.trim().is_empty());
    if !has_vehicle {
        return Err(Error::Validation("Vehicle number is required".to_string()));
    }

    // Speed must be present; null or malformed values read as standing still
    if record.speed.is_none() {
        return Err(Error::Validation("Speed is required".to_string()));
    }

    let mut sample = record
        .to_sample()
        .ok_or_else(|| Error::Validation("Vehicle number is required".to_string()))?;

    // Out-of-range coordinates are dropped rather than rejected
    if let Some(location) = sample.location {
        let lat_ok = location.latitude >= LATITUDE_RANGE.0 && location.latitude <= LATITUDE_RANGE.1;
        let lon_ok =
            location.longitude >= LONGITUDE_RANGE.0 && location.longitude <= LONGITUDE_RANGE.1;
        if !(lat_ok && lon_ok) {
            sample.location = None;
        }
    }

    Ok(sample)
}
