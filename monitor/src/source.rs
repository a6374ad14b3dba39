//! Pull-side telemetry sources.
//!
//! [`RelaySource`] polls the fleet snapshot published by a push ingestion
//! server. [`ApiSource`] polls the vehicle API directly and can also answer
//! trip queries for the daily distance rollup.

use crate::config::{Credentials, MonitorConfig};
use crate::errors::{Error, Result};
use crate::model::{lenient_f64, lenient_i64, lenient_string, Location, TelemetryRecord, VehicleSample};
use crate::tracker::ReferenceTime;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[async_trait]
pub trait SampleSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Clock the stagnation tracker should measure this source's samples against.
    fn reference_time(&self) -> ReferenceTime;

    async fn fetch(&self, config: &MonitorConfig) -> Result<Vec<VehicleSample>>;

    /// Trip queries, when the source supports them.
    fn trips(&self) -> Option<&dyn TripSource> {
        None
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Trip {
    /// meters
    #[serde(default, deserialize_with = "lenient_f64")]
    pub distance: Option<f64>,
}

#[async_trait]
pub trait TripSource: Send + Sync {
    async fn fetch_trips(
        &self,
        config: &MonitorConfig,
        vehicle_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Trip>>;
}

fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?)
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        return Err(Error::Status {
            status,
            url: response.url().to_string(),
        });
    }
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Either `{ "<key>": [...] }` or a bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Vehicles { vehicles: Vec<T> },
    Trips { trips: Vec<T> },
    Bare(Vec<T>),
}

impl<T> Listing<T> {
    fn into_items(self) -> Vec<T> {
        match self {
            Listing::Vehicles { vehicles } => vehicles,
            Listing::Trips { trips } => trips,
            Listing::Bare(items) => items,
        }
    }
}

/// Reads the fleet snapshot of a push ingestion server.
pub struct RelaySource {
    client: reqwest::Client,
}

impl RelaySource {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: http_client()?,
        })
    }

    pub fn snapshot_url(webhook_url: &str) -> String {
        webhook_url.replace("/loconav-webhook", "/api/vehicles")
    }
}

#[async_trait]
impl SampleSource for RelaySource {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn reference_time(&self) -> ReferenceTime {
        ReferenceTime::SampleTime
    }

    async fn fetch(&self, config: &MonitorConfig) -> Result<Vec<VehicleSample>> {
        let url = Self::snapshot_url(&config.webhook_url);
        debug!(url = %url, "Fetching fleet snapshot");

        let mut request = self.client.get(&url).header(CONTENT_TYPE, "application/json");
        if let Some(auth) = &config.auth_header {
            request = request.header(AUTHORIZATION, auth);
        }

        let listing: Listing<TelemetryRecord> = read_json(request.send().await?).await?;
        Ok(listing
            .into_items()
            .iter()
            .filter_map(TelemetryRecord::to_sample)
            .collect())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ApiLocation {
    #[serde(default, alias = "lat", deserialize_with = "lenient_f64")]
    latitude: Option<f64>,
    #[serde(default, alias = "lng", alias = "lon", deserialize_with = "lenient_f64")]
    longitude: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiVehicle {
    #[serde(default, deserialize_with = "lenient_string")]
    id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    vehicle_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    vehicle_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    speed: Option<f64>,
    #[serde(default)]
    location: Option<ApiLocation>,
    #[serde(default, deserialize_with = "lenient_i64")]
    last_update: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    timestamp: Option<i64>,
}

impl ApiVehicle {
    fn to_sample(&self) -> Option<VehicleSample> {
        let vehicle_id = self
            .id
            .as_ref()
            .or(self.vehicle_id.as_ref())
            .or(self.name.as_ref())
            .filter(|id| !id.trim().is_empty())?
            .clone();
        let vehicle_name = self
            .name
            .clone()
            .or_else(|| self.vehicle_name.clone())
            .unwrap_or_else(|| format!("Vehicle {}", vehicle_id));

        let mut sample_time = self.last_update.or(self.timestamp).unwrap_or(0);
        // Millisecond timestamps are normalized to seconds
        if sample_time > 100_000_000_000 {
            sample_time /= 1000;
        }

        let location = self.location.as_ref().and_then(|l| match (l.latitude, l.longitude) {
            (Some(latitude), Some(longitude)) => Some(Location {
                latitude,
                longitude,
            }),
            _ => None,
        });

        Some(VehicleSample {
            location,
            ..VehicleSample::new(vehicle_id, self.speed.unwrap_or(0.0), sample_time)
                .with_name(vehicle_name)
        })
    }
}

/// Polls the vehicle API with a session token.
pub struct ApiSource {
    client: reqwest::Client,
}

impl ApiSource {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: http_client()?,
        })
    }

    fn credentials(config: &MonitorConfig) -> Result<&Credentials> {
        config
            .credentials
            .as_ref()
            .ok_or_else(|| Error::Config("Vehicle API credentials are not configured".to_string()))
    }

    fn get(&self, url: &str, credentials: &Credentials) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .bearer_auth(&credentials.session_token)
            .header(CONTENT_TYPE, "application/json")
    }
}

#[async_trait]
impl SampleSource for ApiSource {
    fn name(&self) -> &'static str {
        "api"
    }

    fn reference_time(&self) -> ReferenceTime {
        ReferenceTime::FirstObserved
    }

    async fn fetch(&self, config: &MonitorConfig) -> Result<Vec<VehicleSample>> {
        let credentials = Self::credentials(config)?;
        let url = format!("{}/api/v1/vehicles", credentials.base_url);
        debug!(url = %url, "Fetching vehicles");

        let listing: Listing<ApiVehicle> = read_json(self.get(&url, credentials).send().await?).await?;
        Ok(listing
            .into_items()
            .iter()
            .filter_map(ApiVehicle::to_sample)
            .collect())
    }

    fn trips(&self) -> Option<&dyn TripSource> {
        Some(self)
    }
}

#[async_trait]
impl TripSource for ApiSource {
    async fn fetch_trips(
        &self,
        config: &MonitorConfig,
        vehicle_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Trip>> {
        let credentials = Self::credentials(config)?;
        let url = format!("{}/api/v1/vehicles/{}/trips", credentials.base_url, vehicle_id);
        let request = self.get(&url, credentials).query(&[
            ("start", start.to_rfc3339_opts(SecondsFormat::Millis, true)),
            ("end", end.to_rfc3339_opts(SecondsFormat::Millis, true)),
        ]);

        let listing: Listing<Trip> = read_json(request.send().await?).await?;
        Ok(listing.into_items())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_url() {
        assert_eq!(
            RelaySource::snapshot_url("https://fleet.example.com/loconav-webhook"),
            "https://fleet.example.com/api/vehicles"
        );
    }

    #[test]
    fn test_relay_listing() {
        let body = r#"{"vehicles":[
            {"vehicle_number":"KA01","speed":12.5,"gpstime":1700000000,"latitude":12.9,"longitude":77.6,"lastUpdate":1700000001000},
            {"speed":3}
        ],"lastUpdate":1700000001000}"#;
        let listing: Listing<TelemetryRecord> = serde_json::from_str(body).unwrap();
        let samples: Vec<VehicleSample> = listing
            .into_items()
            .iter()
            .filter_map(TelemetryRecord::to_sample)
            .collect();

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].vehicle_id, "KA01");
        assert_eq!(samples[0].sample_time, 1_700_000_000);
    }

    #[test]
    fn test_api_vehicle_fallbacks() {
        let body = r#"[
            {"id": 42, "speed": "61", "location": {"latitude": 1.0, "longitude": 2.0}, "lastUpdate": 1700000000000},
            {"vehicleId": "truck-7", "vehicleName": "Truck 7", "timestamp": 1700000000},
            {"name": "Van"},
            {"speed": 10}
        ]"#;
        let listing: Listing<ApiVehicle> = serde_json::from_str(body).unwrap();
        let samples: Vec<VehicleSample> = listing
            .into_items()
            .iter()
            .filter_map(ApiVehicle::to_sample)
            .collect();

        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].vehicle_id, "42");
        assert_eq!(samples[0].vehicle_name, "Vehicle 42");
        assert_eq!(samples[0].speed, 61.0);
        assert_eq!(samples[0].sample_time, 1_700_000_000);
        assert!(samples[0].location.is_some());
        assert_eq!(samples[1].vehicle_id, "truck-7");
        assert_eq!(samples[1].vehicle_name, "Truck 7");
        assert_eq!(samples[2].vehicle_id, "Van");
        assert_eq!(samples[2].speed, 0.0);
    }

    #[test]
    fn test_trip_listing() {
        let listing: Listing<Trip> =
            serde_json::from_str(r#"{"trips":[{"distance":1200.5},{"distance":null},{}]}"#).unwrap();
        let trips = listing.into_items();
        assert_eq!(trips.len(), 3);
        assert_eq!(trips[0].distance, Some(1200.5));
        assert_eq!(trips[1].distance, None);
    }
}
