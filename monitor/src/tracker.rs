//! Per-vehicle stagnation state machine.
//!
//! A vehicle is stagnant while it reports less than [`MOVING_SPEED_KMH`]. Each
//! continuous stagnant episode may raise at most one alert; a sample at or
//! above the moving threshold ends the episode and re-arms alerting.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use tracing::debug;

/// Speeds at or above this value count as moving.
pub const MOVING_SPEED_KMH: f64 = 5.0;

/// Which clock an episode is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceTime {
    /// Wall-clock time at which the tracker first saw the vehicle stand still.
    FirstObserved,
    /// The GPS time carried by the sample itself.
    SampleTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VehicleState {
    pub is_stagnant: bool,
    pub stagnant_since: Option<DateTime<Utc>>,
    pub alerted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagnationVerdict {
    pub newly_stagnant: bool,
    pub should_alert: bool,
    /// How long the vehicle has been standing still, zero while moving.
    pub stagnant_for: Duration,
}

impl StagnationVerdict {
    fn quiet() -> Self {
        Self {
            newly_stagnant: false,
            should_alert: false,
            stagnant_for: Duration::zero(),
        }
    }
}

#[derive(Debug)]
pub struct StagnationTracker {
    reference: ReferenceTime,
    states: HashMap<String, VehicleState>,
}

impl StagnationTracker {
    pub fn new(reference: ReferenceTime) -> Self {
        Self {
            reference,
            states: HashMap::new(),
        }
    }

    pub fn state(&self, vehicle_id: &str) -> Option<&VehicleState> {
        self.states.get(vehicle_id)
    }

    pub fn tracked(&self) -> usize {
        self.states.len()
    }

    /// Feeds one observation and reports whether it opened an episode or
    /// crossed the stagnation window for the first time.
    pub fn evaluate(
        &mut self,
        vehicle_id: &str,
        speed: f64,
        sample_time: i64,
        now: DateTime<Utc>,
        window: Duration,
    ) -> StagnationVerdict {
        let state = self.states.entry(vehicle_id.to_string()).or_default();
        let speed = if speed.is_finite() { speed } else { 0.0 };

        if speed >= MOVING_SPEED_KMH {
            if state.is_stagnant {
                debug!(vehicle_id, speed, "Vehicle moving again, stagnation reset");
            }
            *state = VehicleState::default();
            return StagnationVerdict::quiet();
        }

        match self.reference {
            ReferenceTime::FirstObserved => {
                let since = match (state.is_stagnant, state.stagnant_since) {
                    (true, Some(since)) => since,
                    _ => {
                        *state = VehicleState {
                            is_stagnant: true,
                            stagnant_since: Some(now),
                            alerted: false,
                        };
                        return StagnationVerdict {
                            newly_stagnant: true,
                            ..StagnationVerdict::quiet()
                        };
                    }
                };

                let stagnant_for = now - since;
                let should_alert = stagnant_for > window && !state.alerted;
                if should_alert {
                    state.alerted = true;
                }
                StagnationVerdict {
                    newly_stagnant: false,
                    should_alert,
                    stagnant_for,
                }
            }
            ReferenceTime::SampleTime => {
                let reported = Utc
                    .timestamp_opt(sample_time, 0)
                    .single()
                    .unwrap_or_default();
                // Whole seconds on both sides; sub-second wall-clock time is ignored.
                let stagnant_for = Duration::seconds(now.timestamp() - sample_time);
                if stagnant_for.num_seconds() <= window.num_seconds() {
                    return StagnationVerdict {
                        stagnant_for,
                        ..StagnationVerdict::quiet()
                    };
                }

                let newly_stagnant = !state.is_stagnant;
                let should_alert = !state.alerted;
                if should_alert {
                    *state = VehicleState {
                        is_stagnant: true,
                        stagnant_since: Some(reported),
                        alerted: true,
                    };
                }
                StagnationVerdict {
                    newly_stagnant,
                    should_alert,
                    stagnant_for,
                }
            }
        }
    }
}
