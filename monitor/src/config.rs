use crate::errors::{Error, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::info;

/// Fixed fleet size handled per cycle.
pub const MAX_MONITORED_VEHICLES: usize = 4;

pub const DEFAULT_SPEED_LIMIT_KMH: f64 = 80.0;
pub const DEFAULT_STAGNATION_MINUTES: u32 = 30;

/// Session credentials for the remote vehicle API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub base_url: String,
    pub session_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Immutable snapshot of the operator settings used by one analysis cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub webhook_url: String,
    pub auth_header: Option<String>,
    /// km/h
    pub speed_limit: f64,
    pub stagnation_minutes: u32,
    /// Ordered vehicle ids. Empty means every vehicle is monitored.
    pub monitored_vehicles: Vec<String>,
    pub credentials: Option<Credentials>,
}

impl MonitorConfig {
    /// Configuration used by the ingestion service, which watches every
    /// vehicle that reports in.
    pub fn all_vehicles(speed_limit: f64, stagnation_minutes: u32) -> Self {
        Self {
            webhook_url: String::new(),
            auth_header: None,
            speed_limit,
            stagnation_minutes,
            monitored_vehicles: Vec::new(),
            credentials: None,
        }
    }

    pub fn stagnation_window(&self) -> Duration {
        Duration::minutes(i64::from(self.stagnation_minutes))
    }

    pub fn is_monitored(&self, vehicle_id: &str) -> bool {
        self.monitored_vehicles.is_empty() || self.monitored_vehicles.iter().any(|v| v == vehicle_id)
    }

    /// True once the session token has an expiry that lies in the past.
    pub fn credentials_expired(&self, now: DateTime<Utc>) -> bool {
        self.credentials
            .as_ref()
            .and_then(|c| c.expires_at)
            .is_some_and(|expiry| now > expiry)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::all_vehicles(DEFAULT_SPEED_LIMIT_KMH, DEFAULT_STAGNATION_MINUTES)
    }
}

/// Raw operator settings, as entered on the command line or in the environment.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct MonitorSettings {
    /// Push server webhook URL; the fleet snapshot is read from the sibling /api/vehicles
    #[arg(long, env = "WEBHOOK_URL", default_value = "")]
    pub webhook_url: String,

    /// Value sent verbatim as the Authorization header to the push server
    #[arg(long, env = "AUTH_HEADER")]
    pub auth_header: Option<String>,

    /// Speed limit in km/h
    #[arg(long, env = "SPEED_LIMIT", default_value_t = DEFAULT_SPEED_LIMIT_KMH)]
    pub speed_limit: f64,

    /// Minutes a vehicle may stand still before an alert is raised
    #[arg(long, env = "STAGNATION_MINUTES", default_value_t = DEFAULT_STAGNATION_MINUTES)]
    pub stagnation_minutes: u32,

    /// Comma separated vehicle numbers (1-4)
    #[arg(long, env = "VEHICLES", default_value = "")]
    pub vehicles: String,

    /// Base URL of the vehicle API, enables direct polling
    #[arg(long, env = "API_BASE_URL")]
    pub api_base_url: Option<String>,

    /// Bearer token for the vehicle API
    #[arg(long, env = "SESSION_TOKEN")]
    pub session_token: Option<String>,

    /// Token expiry, RFC 3339 or epoch milliseconds
    #[arg(long, env = "TOKEN_EXPIRES_AT")]
    pub token_expires_at: Option<String>,
}

impl MonitorSettings {
    pub fn validate(&self) -> Result<MonitorConfig> {
        let webhook_url = self.webhook_url.trim();
        let vehicles = parse_vehicle_list(&self.vehicles);

        if webhook_url.is_empty() && self.api_base_url.is_none() {
            return Err(Error::Config(
                "Webhook URL (or API base URL) and vehicle numbers are required".to_string(),
            ));
        }
        if !webhook_url.is_empty() {
            Url::parse(webhook_url)
                .map_err(|e| Error::Config(format!("Invalid webhook URL '{}': {}", webhook_url, e)))?;
        }
        if vehicles.is_empty() || vehicles.len() > MAX_MONITORED_VEHICLES {
            return Err(Error::Config(format!(
                "Expected 1-{} vehicle numbers separated by commas, got {}",
                MAX_MONITORED_VEHICLES,
                vehicles.len()
            )));
        }
        if !(self.speed_limit.is_finite() && self.speed_limit > 0.0) {
            return Err(Error::Config(format!(
                "Speed limit must be positive, got {}",
                self.speed_limit
            )));
        }
        if self.stagnation_minutes == 0 {
            return Err(Error::Config(
                "Stagnation window must be at least one minute".to_string(),
            ));
        }

        let credentials = match &self.api_base_url {
            Some(base_url) => {
                let base_url = base_url.trim().trim_end_matches('/').to_string();
                Url::parse(&base_url)
                    .map_err(|e| Error::Config(format!("Invalid API base URL '{}': {}", base_url, e)))?;
                let session_token = self.session_token.clone().ok_or_else(|| {
                    Error::Config("A session token is required with an API base URL".to_string())
                })?;
                let expires_at = self
                    .token_expires_at
                    .as_deref()
                    .map(parse_expiry)
                    .transpose()?;
                Some(Credentials {
                    base_url,
                    session_token,
                    expires_at,
                })
            }
            None => None,
        };

        Ok(MonitorConfig {
            webhook_url: webhook_url.to_string(),
            auth_header: self
                .auth_header
                .as_deref()
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string),
            speed_limit: self.speed_limit,
            stagnation_minutes: self.stagnation_minutes,
            monitored_vehicles: vehicles,
            credentials,
        })
    }
}

fn parse_vehicle_list(raw: &str) -> Vec<String> {
    let mut vehicles: Vec<String> = Vec::new();
    for v in raw.split(',').map(str::trim).filter(|v| !v.is_empty()) {
        if !vehicles.iter().any(|existing| existing == v) {
            vehicles.push(v.to_string());
        }
    }
    vehicles
}

fn parse_expiry(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(millis) = raw.parse::<i64>() {
        return Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| Error::Config(format!("Token expiry out of range: {}", raw)));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Config(format!("Invalid token expiry '{}': {}", raw, e)))
}

/// Holds the active configuration and swaps it atomically on update.
#[derive(Debug, Default)]
pub struct ConfigStore {
    current: RwLock<Arc<MonitorConfig>>,
}

impl ConfigStore {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<MonitorConfig> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, config: MonitorConfig) {
        info!(
            speed_limit = config.speed_limit,
            stagnation_minutes = config.stagnation_minutes,
            vehicles = ?config.monitored_vehicles,
            "Configuration updated"
        );
        let config = Arc::new(config);
        match self.current.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }
}
