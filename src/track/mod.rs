// Circuit reference data: length, sector boundaries, pit lane, turns and zones

pub mod position;

pub use position::{DisplayPoint, PositionSource, TrackPosition, TrackPositionMapper};

use serde::{Deserialize, Serialize};

use crate::telemetry::GpsFix;

/// A numbered corner at a fixed lap distance
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TurnMarker {
    pub id: u32,
    /// Meters from S/F to the apex
    pub distance_m: f64,
    pub name: Option<String>,
}

impl TurnMarker {
    pub fn new(id: u32, distance_m: f64) -> Self {
        Self {
            id,
            distance_m,
            name: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

/// A labelled stretch of the circuit. `start_m > end_m` wraps through S/F.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TrackZone {
    pub name: String,
    pub start_m: f64,
    pub end_m: f64,
}

impl TrackZone {
    pub fn new(name: &str, start_m: f64, end_m: f64) -> Self {
        Self {
            name: name.to_string(),
            start_m,
            end_m,
        }
    }

    pub fn contains(&self, distance_m: f64) -> bool {
        in_span(distance_m, self.start_m, self.end_m)
    }
}

/// Half-open `[start, end)` test that wraps through zero when `start > end`
pub(crate) fn in_span(distance_m: f64, start_m: f64, end_m: f64) -> bool {
    if start_m <= end_m {
        distance_m >= start_m && distance_m < end_m
    } else {
        distance_m >= start_m || distance_m < end_m
    }
}

/// Fixed geometry of one circuit.
///
/// Defaults describe a 5.5 km, 20 turn road course.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TrackLayout {
    pub name: String,
    pub circuit_length_m: f64,
    /// Cumulative distances where sector 2 and sector 3 begin
    pub sector_boundaries_m: [f64; 2],
    pub pit_entry_m: f64,
    pub pit_exit_m: f64,
    pub pit_exit_buffer_m: f64,
    pub speed_trap_m: f64,
    pub speed_trap_tolerance_m: f64,
    /// Ordered by distance
    pub turns: Vec<TurnMarker>,
    pub zones: Vec<TrackZone>,
    pub finish_line: GpsFix,
    pub canvas_width: f64,
    pub canvas_height: f64,
    pub display_radius: f64,
    /// Display correction applied per sector, in canvas units
    pub sector_offsets: [(f64, f64); 3],
}

impl Default for TrackLayout {
    fn default() -> Self {
        let turns = [
            520.0, 700.0, 1000.0, 1120.0, 1250.0, 1450.0, 1600.0, 1750.0, 1880.0, 2150.0, 2600.0,
            3650.0, 3850.0, 3950.0, 4250.0, 4500.0, 4600.0, 4750.0, 4950.0, 5300.0,
        ]
        .iter()
        .enumerate()
        .map(|(i, distance_m)| TurnMarker::new(i as u32 + 1, *distance_m))
        .collect();

        Self {
            name: "Default Road Course".to_string(),
            circuit_length_m: 5513.0,
            sector_boundaries_m: [1300.0, 4200.0],
            pit_entry_m: 4950.0,
            pit_exit_m: 5400.0,
            pit_exit_buffer_m: 50.0,
            speed_trap_m: 3000.0,
            speed_trap_tolerance_m: 25.0,
            turns,
            zones: vec![
                TrackZone::new("Main Straight", 5350.0, 300.0),
                TrackZone::new("Turn 1 Complex", 300.0, 1300.0),
                TrackZone::new("Esses", 1300.0, 2000.0),
                TrackZone::new("Back Straight", 2600.0, 3600.0),
                TrackZone::new("Stadium Section", 3600.0, 4300.0),
                TrackZone::new("Carousel", 4300.0, 4900.0),
                TrackZone::new("Final Corners", 4900.0, 5350.0),
            ],
            finish_line: GpsFix::new(30.13297, -97.64111),
            canvas_width: 800.0,
            canvas_height: 600.0,
            display_radius: 250.0,
            sector_offsets: [(12.0, -8.0), (-10.0, 14.0), (6.0, 6.0)],
        }
    }
}

impl TrackLayout {
    /// Wrap any distance into `[0, circuit_length_m)`
    pub fn normalize(&self, distance_m: f64) -> f64 {
        if !distance_m.is_finite() || self.circuit_length_m <= 0.0 {
            return 0.0;
        }
        let wrapped = distance_m.rem_euclid(self.circuit_length_m);
        // rem_euclid can round up to the modulus for tiny negative inputs
        if wrapped >= self.circuit_length_m {
            0.0
        } else {
            wrapped
        }
    }

    /// Sector (1..=3) for a distance, normalizing first
    pub fn sector_for(&self, distance_m: f64) -> u8 {
        let distance_m = self.normalize(distance_m);
        if distance_m < self.sector_boundaries_m[0] {
            1
        } else if distance_m < self.sector_boundaries_m[1] {
            2
        } else {
            3
        }
    }

    /// Distance where a sector (1..=3) begins
    pub fn sector_start(&self, sector: u8) -> f64 {
        match sector {
            2 => self.sector_boundaries_m[0],
            3 => self.sector_boundaries_m[1],
            _ => 0.0,
        }
    }

    pub fn is_in_pit_lane(&self, distance_m: f64) -> bool {
        let pit_end = self.normalize(self.pit_exit_m + self.pit_exit_buffer_m);
        in_span(self.normalize(distance_m), self.pit_entry_m, pit_end)
    }

    pub fn is_at_speed_trap(&self, distance_m: f64) -> bool {
        (self.normalize(distance_m) - self.speed_trap_m).abs() <= self.speed_trap_tolerance_m
    }

    /// Closest turn by absolute distance along the lap
    pub fn nearest_turn(&self, distance_m: f64) -> Option<&TurnMarker> {
        let distance_m = self.normalize(distance_m);
        self.turns.iter().min_by(|a, b| {
            (a.distance_m - distance_m)
                .abs()
                .total_cmp(&(b.distance_m - distance_m).abs())
        })
    }

    pub fn zone_for(&self, distance_m: f64) -> String {
        let distance_m = self.normalize(distance_m);
        self.zones
            .iter()
            .find(|z| z.contains(distance_m))
            .map(|z| z.name.clone())
            .unwrap_or_else(|| format!("Sector {}", self.sector_for(distance_m)))
    }
}
