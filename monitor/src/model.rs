use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// One normalized telemetry reading for a vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleSample {
    pub vehicle_id: String,
    pub vehicle_name: String,
    /// km/h
    pub speed: f64,
    /// Seconds since epoch as reported by the GPS unit, 0 when unknown.
    pub sample_time: i64,
    pub location: Option<Location>,
    pub ignition: Option<bool>,
    pub odometer: Option<f64>,
    pub direction: Option<f64>,
    pub device_imei: Option<String>,
}

impl VehicleSample {
    pub fn new(vehicle_id: impl Into<String>, speed: f64, sample_time: i64) -> Self {
        let vehicle_id = vehicle_id.into();
        Self {
            vehicle_name: vehicle_id.clone(),
            vehicle_id,
            speed: sanitize_speed(speed),
            sample_time,
            location: None,
            ignition: None,
            odometer: None,
            direction: None,
            device_imei: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.vehicle_name = name.into();
        self
    }

    pub fn with_location(mut self, latitude: f64, longitude: f64) -> Self {
        self.location = Some(Location {
            latitude,
            longitude,
        });
        self
    }
}

/// Negative, NaN and infinite speeds are read as standing still.
pub fn sanitize_speed(speed: f64) -> f64 {
    if speed.is_finite() && speed > 0.0 {
        speed
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Speeding,
    Stagnation,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Speeding => "speeding",
            AlertKind::Stagnation => "stagnation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub vehicle_id: String,
    pub vehicle_name: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub location: Option<Location>,
}

/// Telemetry record as delivered by the push source (webhook body or MQTT
/// payload). Numeric fields accept numbers or numeric strings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryRecord {
    #[serde(default, deserialize_with = "lenient_string")]
    pub device_imei: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub vehicle_number: Option<String>,
    /// `None` when the key is missing; `Some(None)` for null or non-numeric values.
    #[serde(default, deserialize_with = "lenient_present_f64")]
    pub speed: Option<Option<f64>>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub gpstime: Option<i64>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub ignition_on: Option<bool>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub odometer_reading: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub latitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub longitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub direction: Option<f64>,
}

impl TelemetryRecord {
    /// Normalizes the record, returning `None` when it carries no vehicle number.
    pub fn to_sample(&self) -> Option<VehicleSample> {
        let vehicle_id = self
            .vehicle_number
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())?;

        let location = match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Location {
                latitude,
                longitude,
            }),
            _ => None,
        };

        Some(VehicleSample {
            location,
            ignition: self.ignition_on,
            odometer: self.odometer_reading,
            direction: self.direction,
            device_imei: self.device_imei.clone(),
            ..VehicleSample::new(
                vehicle_id,
                self.speed.flatten().unwrap_or(0.0),
                self.gpstime.unwrap_or(0),
            )
        })
    }
}

/// Server-side view of the latest record received for a vehicle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub device_imei: Option<String>,
    pub vehicle_number: String,
    pub speed: f64,
    pub gpstime: i64,
    pub ignition_on: bool,
    pub odometer_reading: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub direction: Option<f64>,
    /// Wall-clock arrival time, epoch millis.
    #[serde(rename = "lastUpdate")]
    pub last_update: i64,
}

impl VehicleRecord {
    pub fn from_sample(sample: &VehicleSample, received_at: DateTime<Utc>) -> Self {
        Self {
            device_imei: sample.device_imei.clone(),
            vehicle_number: sample.vehicle_id.clone(),
            speed: sample.speed,
            gpstime: sample.sample_time,
            ignition_on: sample.ignition.unwrap_or(false),
            odometer_reading: sample.odometer,
            latitude: sample.location.map(|l| l.latitude),
            longitude: sample.location.map(|l| l.longitude),
            direction: sample.direction,
            last_update: received_at.timestamp_millis(),
        }
    }
}

/// Latest known state of a vehicle kept for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleSnapshot {
    #[serde(flatten)]
    pub sample: VehicleSample,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub vehicles: Vec<VehicleRecord>,
    #[serde(rename = "lastUpdate")]
    pub last_update: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub success: bool,
    pub message: String,
    pub vehicle_count: usize,
    pub alert_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AlertsResponse {
    pub alerts: Vec<Alert>,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub vehicles: usize,
    pub alerts: usize,
    /// Seconds since the process started.
    pub uptime: f64,
}

fn number_from_value(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    n.filter(|n| n.is_finite())
}

pub(crate) fn lenient_f64<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(number_from_value))
}

/// Like [`lenient_f64`], but keeps an explicit null apart from a missing key.
pub(crate) fn lenient_present_f64<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Option<f64>>, D::Error>
where
    D: Deserializer<'de>,
{
    lenient_f64(deserializer).map(Some)
}

pub(crate) fn lenient_i64<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(|v| v.as_i64().or_else(|| number_from_value(v).map(|n| n as i64))))
}

pub(crate) fn lenient_bool<'de, D>(deserializer: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(b)) => Some(b),
        Some(Value::Number(n)) => n.as_f64().map(|n| n != 0.0),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "on" | "yes" => Some(true),
            "false" | "0" | "off" | "no" | "" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

pub(crate) fn lenient_string<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
