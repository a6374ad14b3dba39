//! CSV export of the daily distance history.

use crate::errors::Result;
use crate::rollup::DailyDistance;
use chrono::NaiveDate;
use std::io::Write;

const HEADER: [&str; 5] = [
    "Date",
    "Vehicle Name",
    "Distance (km)",
    "Number of Trips",
    "Status",
];

fn km(meters: f64) -> String {
    format!("{:.1}", meters / 1000.0)
}

/// Writes one day as CSV: a row per vehicle followed by a fleet total.
pub fn write_distance_report<W: Write>(writer: W, day: &DailyDistance) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(HEADER)?;

    let date = day.date.to_string();
    for vehicle in &day.vehicles {
        let status = if vehicle.error.is_some() { "Error" } else { "OK" };
        csv.write_record([
            date.as_str(),
            vehicle.vehicle_name.as_str(),
            km(vehicle.distance).as_str(),
            vehicle.trips.to_string().as_str(),
            status,
        ])?;
    }

    csv.write_record([
        date.as_str(),
        "TOTAL FLEET",
        km(day.total_distance).as_str(),
        day.total_trips().to_string().as_str(),
        "",
    ])?;
    csv.flush()?;
    Ok(())
}

/// Default export file name for a day.
pub fn report_file_name(date: NaiveDate) -> String {
    format!("fleet-distance-{}.csv", date)
}
