pub mod lap_corrector;
pub mod parser;

pub use lap_corrector::{CorrectedLap, CorrectorConfig, CorrectorDiagnostics, LapIntegrityCorrector};
pub use parser::{ParserConfig, RecordParser};

use serde::{Deserialize, Serialize};

/// Flag markers that put the session under caution wherever they appear
const CAUTION_MARKERS: [&str; 3] = ["FCY", "YELLOW", "CAUTION"];
/// Too short to match inside words, so it only counts as a token of its own
const SAFETY_CAR_MARKER: &str = "SC";

/// A latitude/longitude fix in decimal degrees
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
}

impl GpsFix {
    pub fn new(latitude_deg: f64, longitude_deg: f64) -> Self {
        Self {
            latitude_deg,
            longitude_deg,
        }
    }
}

/// One validated sample from a vehicle log.
///
/// Records are built once by the parser and handed by value down the pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    /// Milliseconds since the unix epoch
    pub timestamp_ms: i64,
    pub vehicle_id: String,
    /// Lap index after integrity correction
    pub lap: u32,
    /// Meters traveled from S/F this lap, absent when the logger did not report it
    pub lap_distance_m: Option<f64>,
    pub speed_kph: f64,
    /// Throttle position, 0-100
    pub throttle_pct: f64,
    pub brake_front_bar: f64,
    pub brake_rear_bar: f64,
    pub gear: i32,
    pub steering_angle_deg: f64,
    /// Longitudinal acceleration in g
    pub accel_long_g: f64,
    /// Lateral acceleration in g
    pub accel_lat_g: f64,
    pub gps: Option<GpsFix>,
    /// Race control flag as logged, empty when green
    pub flag: String,
    /// Sector index (1..=3) derived from lap distance
    pub sector: u8,
}

impl Default for TelemetryRecord {
    fn default() -> Self {
        Self {
            timestamp_ms: 0,
            vehicle_id: String::new(),
            lap: 1,
            lap_distance_m: None,
            speed_kph: 0.,
            throttle_pct: 0.,
            brake_front_bar: 0.,
            brake_rear_bar: 0.,
            gear: 0,
            steering_angle_deg: 0.,
            accel_long_g: 0.,
            accel_lat_g: 0.,
            gps: None,
            flag: String::new(),
            sector: 1,
        }
    }
}

impl TelemetryRecord {
    pub fn is_caution(&self) -> bool {
        is_caution_flag(&self.flag)
    }
}

/// Whether a logged flag string denotes a caution period
pub fn is_caution_flag(flag: &str) -> bool {
    let upper = flag.trim().to_uppercase();
    if upper.is_empty() {
        return false;
    }
    CAUTION_MARKERS.iter().any(|marker| upper.contains(marker))
        || upper
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| token == SAFETY_CAR_MARKER)
}
