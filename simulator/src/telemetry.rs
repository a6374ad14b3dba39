use rand::Rng;
use serde::{Deserialize, Serialize};

/// Payload published per vehicle, in the shape the monitor's webhook accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleTelemetry {
    pub device_imei: String,
    pub vehicle_number: String,
    pub speed: f64,
    pub gpstime: i64,
    pub ignition_on: bool,
    pub odometer_reading: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub direction: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Cruising,
    Speeding,
    Parked,
}

/// One simulated vehicle moving around a start point.
#[derive(Debug, Clone)]
pub struct Vehicle {
    pub number: String,
    imei: String,
    behavior: Behavior,
    latitude: f64,
    longitude: f64,
    direction: f64,
    /// km
    odometer: f64,
    /// Fix time of the first parked reading; a parked tracker stops refreshing its fix.
    parked_since: Option<i64>,
}

impl Vehicle {
    pub fn new(rng: &mut impl Rng, index: usize) -> Self {
        Self {
            number: format!("KA{:02}SIM{:04}", index % 100, index),
            imei: format!("86{:013}", rng.gen_range(0..10_000_000_000_000u64)),
            behavior: Behavior::Cruising,
            latitude: 12.97 + rng.gen_range(-0.2..0.2),
            longitude: 77.59 + rng.gen_range(-0.2..0.2),
            direction: rng.gen_range(0.0..360.0),
            odometer: rng.gen_range(1_000.0..90_000.0),
            parked_since: None,
        }
    }

    pub fn behavior(&self) -> Behavior {
        self.behavior
    }

    /// Advances the vehicle by `elapsed_secs` and returns its new reading.
    pub fn step(&mut self, rng: &mut impl Rng, elapsed_secs: f64, now: i64) -> VehicleTelemetry {
        // Occasionally switch behavior; parked vehicles stay put for a while
        let switch = match self.behavior {
            Behavior::Parked => 0.01,
            _ => 0.05,
        };
        if rng.gen_bool(switch) {
            self.behavior = match rng.gen_range(0..10) {
                0..=1 => Behavior::Speeding,
                2..=4 => Behavior::Parked,
                _ => Behavior::Cruising,
            };
        }

        let speed = match self.behavior {
            Behavior::Cruising => rng.gen_range(20.0..75.0),
            Behavior::Speeding => rng.gen_range(85.0..130.0),
            Behavior::Parked => 0.0,
        };

        let gpstime = match self.behavior {
            Behavior::Parked => *self.parked_since.get_or_insert(now),
            _ => {
                self.parked_since = None;
                now
            }
        };

        if speed > 0.0 {
            self.direction = (self.direction + rng.gen_range(-15.0..15.0)).rem_euclid(360.0);
            let km = speed * elapsed_secs / 3600.0;
            let radians = self.direction.to_radians();
            // Roughly 111 km per degree
            self.latitude += km * radians.cos() / 111.0;
            self.longitude += km * radians.sin() / 111.0;
            self.odometer += km;
        }

        VehicleTelemetry {
            device_imei: self.imei.clone(),
            vehicle_number: self.number.clone(),
            speed: (speed * 10.0_f64).round() / 10.0,
            gpstime,
            ignition_on: self.behavior != Behavior::Parked,
            odometer_reading: (self.odometer * 10.0).round() / 10.0,
            latitude: self.latitude,
            longitude: self.longitude,
            direction: self.direction.round(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn test_step_produces_valid_reading() {
        let mut rng = rand::thread_rng();
        let mut vehicle = Vehicle::new(&mut rng, 7);
        assert_eq!(vehicle.number, "KA07SIM0007");

        for t in 0..500 {
            let reading = vehicle.step(&mut rng, 5.0, 1_700_000_000 + t);
            assert!(reading.speed >= 0.0);
            assert!(reading.direction >= 0.0 && reading.direction <= 360.0);
            assert_eq!(reading.ignition_on, vehicle.behavior() != Behavior::Parked);
            assert_eq!(reading.vehicle_number, "KA07SIM0007");
        }
    }

    #[test]
    fn test_parked_vehicle_keeps_fix_time() {
        // High draws never pass `gen_bool`, so the behavior stays put
        let mut rng = StepRng::new(u64::MAX, 0);
        let mut vehicle = Vehicle::new(&mut rand::thread_rng(), 1);
        vehicle.behavior = Behavior::Parked;

        let parked_at = 1_700_000_000;
        for t in 0..20 {
            let reading = vehicle.step(&mut rng, 60.0, parked_at + t * 60);
            assert_eq!(reading.speed, 0.0);
            assert_eq!(reading.gpstime, parked_at);
        }

        vehicle.behavior = Behavior::Speeding;
        let reading = vehicle.step(&mut rng, 60.0, parked_at + 3_600);
        assert_eq!(reading.gpstime, parked_at + 3_600);
        assert_eq!(vehicle.parked_since, None);
    }
}
