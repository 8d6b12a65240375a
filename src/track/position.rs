use std::f64::consts::{PI, TAU};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::TrackLayout;
use crate::telemetry::{GpsFix, TelemetryRecord};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Point on the display canvas
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisplayPoint {
    pub x: f64,
    pub y: f64,
}

/// Which signal a position was derived from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSource {
    LapDistance,
    /// Estimated from a GPS fix, lower fidelity
    Gps,
}

/// Where a vehicle is on the circuit, recomputed for every record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackPosition {
    /// Lap distance wrapped into `[0, circuit length)`
    pub lap_distance_m: f64,
    pub sector: u8,
    pub distance_into_sector_m: f64,
    pub lap_progress_pct: f64,
    pub in_pit_lane: bool,
    pub at_speed_trap: bool,
    /// Speed recorded while inside the speed trap window
    pub speed_trap_kph: Option<f64>,
    pub nearest_turn: Option<u32>,
    pub zone: String,
    pub display: DisplayPoint,
    pub source: PositionSource,
}

/// Converts lap distance, or a GPS fix when distance is missing, into a [`TrackPosition`].
///
/// Holds no mutable state and can be shared between sessions.
#[derive(Clone, Debug)]
pub struct TrackPositionMapper {
    layout: Arc<TrackLayout>,
}

impl TrackPositionMapper {
    pub fn new(layout: Arc<TrackLayout>) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &TrackLayout {
        &self.layout
    }

    pub fn map_distance(&self, distance_m: f64, speed_kph: Option<f64>) -> TrackPosition {
        self.build(distance_m, speed_kph, PositionSource::LapDistance)
    }

    /// Position for a record, falling back to GPS and then to the previous distance.
    ///
    /// `previous_distance_m` disambiguates the GPS estimate, which on its own
    /// cannot tell the first half of a lap from the second.
    pub fn map_record(
        &self,
        record: &TelemetryRecord,
        previous_distance_m: Option<f64>,
    ) -> TrackPosition {
        let speed = Some(record.speed_kph);
        match (record.lap_distance_m, record.gps) {
            (Some(distance), _) => self.build(distance, speed, PositionSource::LapDistance),
            (None, Some(fix)) => self.build(
                self.estimate_distance_from_gps(&fix, previous_distance_m),
                speed,
                PositionSource::Gps,
            ),
            (None, None) => self.build(
                previous_distance_m.unwrap_or(0.0),
                speed,
                PositionSource::LapDistance,
            ),
        }
    }

    /// Approximate lap distance from straight-line displacement to the S/F line.
    ///
    /// The circuit is treated as a circle of the same length, so the chord to
    /// the finish line maps to an arc of at most half a lap. When the previous
    /// distance is past half a lap the arc is measured back from S/F instead.
    pub fn estimate_distance_from_gps(
        &self,
        fix: &GpsFix,
        previous_distance_m: Option<f64>,
    ) -> f64 {
        let origin = &self.layout.finish_line;
        let mean_lat = ((fix.latitude_deg + origin.latitude_deg) / 2.0).to_radians();
        let dx = (fix.longitude_deg - origin.longitude_deg).to_radians()
            * mean_lat.cos()
            * EARTH_RADIUS_M;
        let dy = (fix.latitude_deg - origin.latitude_deg).to_radians() * EARTH_RADIUS_M;
        let chord = (dx * dx + dy * dy).sqrt();

        let length = self.layout.circuit_length_m;
        let radius = length / TAU;
        let ratio = (chord / (2.0 * radius)).clamp(0.0, 1.0);
        let arc = 2.0 * radius * ratio.asin();

        let second_half = previous_distance_m
            .map(|d| self.layout.normalize(d) > length / 2.0)
            .unwrap_or(false);
        if second_half {
            self.layout.normalize(length - arc)
        } else {
            self.layout.normalize(arc)
        }
    }

    /// Canvas coordinate for a normalized distance
    pub fn display_point(&self, normalized_m: f64, sector: u8) -> DisplayPoint {
        let layout = &self.layout;
        let progress = if layout.circuit_length_m > 0.0 {
            normalized_m / layout.circuit_length_m
        } else {
            0.0
        };
        // S/F at the top of the canvas, running clockwise
        let angle = progress * TAU - PI / 2.0;
        let (dx, dy) = layout.sector_offsets[usize::from(sector.clamp(1, 3) - 1)];
        let x = layout.canvas_width / 2.0 + layout.display_radius * angle.cos() + dx;
        let y = layout.canvas_height / 2.0 + layout.display_radius * angle.sin() + dy;
        DisplayPoint {
            x: x.clamp(0.0, layout.canvas_width),
            y: y.clamp(0.0, layout.canvas_height),
        }
    }

    fn build(&self, distance_m: f64, speed_kph: Option<f64>, source: PositionSource) -> TrackPosition {
        let layout = &self.layout;
        let normalized = layout.normalize(distance_m);
        let sector = layout.sector_for(normalized);
        let at_speed_trap = layout.is_at_speed_trap(normalized);
        TrackPosition {
            lap_distance_m: normalized,
            sector,
            distance_into_sector_m: normalized - layout.sector_start(sector),
            lap_progress_pct: normalized / layout.circuit_length_m * 100.0,
            in_pit_lane: layout.is_in_pit_lane(normalized),
            at_speed_trap,
            speed_trap_kph: if at_speed_trap { speed_kph } else { None },
            nearest_turn: layout.nearest_turn(normalized).map(|t| t.id),
            zone: layout.zone_for(normalized),
            display: self.display_point(normalized, sector),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn mapper() -> TrackPositionMapper {
        TrackPositionMapper::new(Arc::new(TrackLayout::default()))
    }

    #[test]
    fn test_map_distance() {
        let position = mapper().map_distance(1400.0, Some(180.0));
        assert_eq!(position.sector, 2);
        assert_eq!(position.distance_into_sector_m, 100.0);
        assert!(!position.in_pit_lane);
        assert!(!position.at_speed_trap);
        assert_eq!(position.speed_trap_kph, None);
        assert_eq!(position.nearest_turn, Some(6));
        assert_eq!(position.zone, "Esses");
        assert_eq!(position.source, PositionSource::LapDistance);
    }

    #[test]
    fn test_map_overflowed_distance() {
        let mapper = mapper();
        let position = mapper.map_distance(5513.0 + 3000.0, Some(250.0));
        assert_eq!(position.lap_distance_m, 3000.0);
        assert!(position.at_speed_trap);
        assert_eq!(position.speed_trap_kph, Some(250.0));
    }

    #[test]
    fn test_display_point_at_start_finish() {
        let mapper = mapper();
        let point = mapper.display_point(0.0, 1);
        // top of the circle plus the sector 1 offset
        assert!((point.x - (400.0 + 12.0)).abs() < 1e-9);
        assert!((point.y - (300.0 - 250.0 - 8.0)).abs() < 1e-9);
    }

    #[test]
    fn test_display_point_clamped_to_canvas() {
        let layout = TrackLayout {
            display_radius: 2000.0,
            ..TrackLayout::default()
        };
        let mapper = TrackPositionMapper::new(Arc::new(layout));
        let point = mapper.display_point(0.0, 1);
        assert_eq!(point.y, 0.0);
    }

    #[test]
    fn test_gps_at_finish_line_is_lap_start() {
        let mapper = mapper();
        let finish = mapper.layout().finish_line;
        assert!(mapper.estimate_distance_from_gps(&finish, None) < 1e-6);
    }

    #[test]
    fn test_gps_estimate_uses_previous_distance_half() {
        let mapper = mapper();
        let finish = mapper.layout().finish_line;
        // roughly 300 m north of the finish line
        let fix = GpsFix::new(finish.latitude_deg + 0.0027, finish.longitude_deg);
        let first_half = mapper.estimate_distance_from_gps(&fix, Some(100.0));
        let second_half = mapper.estimate_distance_from_gps(&fix, Some(5300.0));
        assert!(first_half > 250.0 && first_half < 350.0);
        assert!((second_half - (5513.0 - first_half)).abs() < 1e-6);
    }

    #[test]
    fn test_map_record_falls_back_to_gps() {
        let mapper = mapper();
        let finish = mapper.layout().finish_line;
        let record = TelemetryRecord {
            lap_distance_m: None,
            gps: Some(finish),
            ..TelemetryRecord::default()
        };
        let position = mapper.map_record(&record, None);
        assert_eq!(position.source, PositionSource::Gps);
        assert_eq!(position.sector, 1);
    }

    proptest! {
        #[test]
        fn prop_display_point_within_canvas(distance in -20000.0f64..20000.0) {
            let mapper = mapper();
            let position = mapper.map_distance(distance, None);
            prop_assert!(position.display.x >= 0.0 && position.display.x <= 800.0);
            prop_assert!(position.display.y >= 0.0 && position.display.y <= 600.0);
            prop_assert!(position.lap_progress_pct >= 0.0 && position.lap_progress_pct < 100.0);
        }
    }
}
