use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime};
use csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter, Trim};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::lap_corrector::{CorrectorConfig, CorrectorDiagnostics, LapIntegrityCorrector};
use super::{GpsFix, TelemetryRecord};
use crate::errors::TracksideError;
use crate::track::{TrackLayout, TrackPositionMapper};

/// Epoch values below this are seconds rather than milliseconds
const EPOCH_SECONDS_LIMIT: f64 = 1e11;
/// Timestamps farther than this from the epoch (about 3000 years) are corrupt
const MAX_TIMESTAMP_MS: f64 = 1e14;
/// Skipped rows logged at `warn` before dropping to `debug`
const MAX_SKIP_WARNINGS: usize = 10;
/// Fed to the corrector when a row has no usable lap value
const MISSING_LAP: i64 = -1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Rows between progress notifications
    pub progress_interval: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            progress_interval: 10_000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseProgress {
    pub rows_read: usize,
    pub records_emitted: usize,
    pub rows_skipped: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParserDiagnostics {
    pub progress: ParseProgress,
    /// Rows that belonged to another vehicle
    pub rows_filtered: usize,
    pub lap_wraps: usize,
    pub laps_corrected: usize,
    pub corrector: CorrectorDiagnostics,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Field {
    Timestamp,
    Vehicle,
    Lap,
    LapDistance,
    Speed,
    Throttle,
    BrakeFront,
    BrakeRear,
    Gear,
    Steering,
    AccelLong,
    AccelLat,
    Latitude,
    Longitude,
    Flag,
}

impl Field {
    const ALL: [Field; 15] = [
        Field::Timestamp,
        Field::Vehicle,
        Field::Lap,
        Field::LapDistance,
        Field::Speed,
        Field::Throttle,
        Field::BrakeFront,
        Field::BrakeRear,
        Field::Gear,
        Field::Steering,
        Field::AccelLong,
        Field::AccelLat,
        Field::Latitude,
        Field::Longitude,
        Field::Flag,
    ];

    /// Header names accepted for this field, already normalized
    fn aliases(&self) -> &'static [&'static str] {
        match self {
            Field::Timestamp => &["timestamp", "timestamp_ms", "time", "time_ms", "meta_time"],
            Field::Vehicle => &["vehicle_id", "vehicle", "car", "car_id"],
            Field::Lap => &["lap", "lap_number", "lap_no"],
            Field::LapDistance => &[
                "lap_distance",
                "lap_distance_m",
                "laptrigger_lapdist_dls",
                "lap_dist",
                "distance",
            ],
            Field::Speed => &["speed", "speed_kph", "vcar"],
            Field::Throttle => &["throttle", "throttle_pct", "aps", "ath"],
            Field::BrakeFront => &["pbrake_f", "brake_front", "brake_front_bar"],
            Field::BrakeRear => &["pbrake_r", "brake_rear", "brake_rear_bar"],
            Field::Gear => &["gear", "ngear"],
            Field::Steering => &["steering_angle", "steering_angle_deg", "steering"],
            Field::AccelLong => &["accx_can", "accel_x", "accel_long", "accel_long_g"],
            Field::AccelLat => &["accy_can", "accel_y", "accel_lat", "accel_lat_g"],
            Field::Latitude => &["vbox_lat_min", "latitude", "lat"],
            Field::Longitude => &["vbox_long_minutes", "longitude", "lon", "lng"],
            Field::Flag => &["flag", "flag_status", "track_status"],
        }
    }
}

fn normalize_header(header: &str) -> String {
    header
        .trim()
        .to_lowercase()
        .replace([' ', '-'], "_")
}

/// Column index for each field found in the header row
#[derive(Clone, Debug, Default)]
struct ColumnMap {
    indices: HashMap<Field, usize>,
}

impl ColumnMap {
    fn from_headers(headers: &StringRecord) -> Self {
        let normalized: Vec<String> = headers.iter().map(normalize_header).collect();
        let indices = Field::ALL
            .iter()
            .filter_map(|field| {
                // earlier aliases win when a log carries more than one
                field
                    .aliases()
                    .iter()
                    .find_map(|alias| normalized.iter().position(|h| h == alias))
                    .map(|index| (*field, index))
            })
            .collect();
        Self { indices }
    }

    fn contains(&self, field: Field) -> bool {
        self.indices.contains_key(&field)
    }

    fn get<'r>(&self, row: &'r StringRecord, field: Field) -> Option<&'r str> {
        self.indices
            .get(&field)
            .and_then(|index| row.get(*index))
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    fn number(&self, row: &StringRecord, field: Field) -> Option<f64> {
        self.get(row, field)
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| value.is_finite())
    }
}

/// Milliseconds since the unix epoch from a numeric epoch or a date-time string
pub fn parse_timestamp_ms(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Ok(epoch) = value.parse::<f64>() {
        if !epoch.is_finite() {
            return None;
        }
        let ms = if epoch.abs() < EPOCH_SECONDS_LIMIT {
            epoch * 1000.0
        } else {
            epoch
        };
        if ms.abs() > MAX_TIMESTAMP_MS {
            return None;
        }
        return Some(ms.round() as i64);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.timestamp_millis());
    }
    // loggers that drop the offset write UTC
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc().timestamp_millis())
}

/// Streams [`TelemetryRecord`]s out of a delimited log for one vehicle.
///
/// Rows are read lazily from the underlying reader and never buffered as a
/// whole. A row without a readable timestamp is skipped and logged, unusable
/// numeric fields fall back to zero or absent. Lap values pass through a
/// [`LapIntegrityCorrector`] before the record is produced.
pub struct RecordParser<R: Read> {
    rows: StringRecordsIntoIter<R>,
    columns: ColumnMap,
    vehicle_id: String,
    mapper: TrackPositionMapper,
    corrector: LapIntegrityCorrector,
    config: ParserConfig,
    progress_callback: Option<Box<dyn FnMut(&ParseProgress) + Send>>,
    last_distance_m: Option<f64>,
    last_sector: u8,
    rows_read: usize,
    records_emitted: usize,
    rows_skipped: usize,
    rows_filtered: usize,
    lap_wraps: usize,
    laps_corrected: usize,
    finished: bool,
}

impl RecordParser<File> {
    pub fn from_path(
        path: &Path,
        vehicle_id: &str,
        layout: Arc<TrackLayout>,
    ) -> Result<Self, TracksideError> {
        let file = File::open(path).map_err(|e| TracksideError::InputOpenError {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_reader(file, vehicle_id, layout)
    }
}

impl<R: Read> RecordParser<R> {
    /// Reads the header row and prepares to stream records
    pub fn from_reader(
        reader: R,
        vehicle_id: &str,
        layout: Arc<TrackLayout>,
    ) -> Result<Self, TracksideError> {
        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .trim(Trim::All)
            .from_reader(reader);
        let headers = reader
            .headers()
            .map_err(|e| TracksideError::CsvReadError { source: e })?
            .clone();
        let columns = ColumnMap::from_headers(&headers);
        if !columns.contains(Field::Timestamp) {
            warn!("Telemetry log has no timestamp column, every row will be skipped");
        }
        if !columns.contains(Field::LapDistance) {
            debug!("Telemetry log has no lap distance column, positions will come from GPS");
        }

        let circuit_length_m = layout.circuit_length_m;
        Ok(Self {
            rows: reader.into_records(),
            columns,
            vehicle_id: vehicle_id.to_string(),
            mapper: TrackPositionMapper::new(layout),
            corrector: LapIntegrityCorrector::new(CorrectorConfig::default(), circuit_length_m),
            config: ParserConfig::default(),
            progress_callback: None,
            last_distance_m: None,
            last_sector: 1,
            rows_read: 0,
            records_emitted: 0,
            rows_skipped: 0,
            rows_filtered: 0,
            lap_wraps: 0,
            laps_corrected: 0,
            finished: false,
        })
    }

    pub fn with_config(mut self, config: ParserConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_corrector(mut self, config: CorrectorConfig) -> Self {
        self.corrector = LapIntegrityCorrector::new(config, self.mapper.layout().circuit_length_m);
        self
    }

    /// Called every `progress_interval` rows in addition to the log line
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&ParseProgress) + Send + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    pub fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    pub fn progress(&self) -> ParseProgress {
        ParseProgress {
            rows_read: self.rows_read,
            records_emitted: self.records_emitted,
            rows_skipped: self.rows_skipped,
        }
    }

    pub fn diagnostics(&self) -> ParserDiagnostics {
        ParserDiagnostics {
            progress: self.progress(),
            rows_filtered: self.rows_filtered,
            lap_wraps: self.lap_wraps,
            laps_corrected: self.laps_corrected,
            corrector: self.corrector.diagnostics(),
        }
    }

    /// `Ok(None)` for rows that belong to a different vehicle
    fn parse_row(
        &mut self,
        row_no: usize,
        row: &StringRecord,
    ) -> Result<Option<TelemetryRecord>, TracksideError> {
        let columns = &self.columns;
        if let Some(vehicle) = columns.get(row, Field::Vehicle) {
            if vehicle != self.vehicle_id {
                return Ok(None);
            }
        }

        let raw_timestamp = columns
            .get(row, Field::Timestamp)
            .ok_or(TracksideError::MissingTimestamp { row: row_no })?;
        let timestamp_ms =
            parse_timestamp_ms(raw_timestamp).ok_or_else(|| TracksideError::InvalidTimestamp {
                row: row_no,
                value: raw_timestamp.to_string(),
            })?;

        let gps = match (
            columns.number(row, Field::Latitude),
            columns.number(row, Field::Longitude),
        ) {
            (Some(latitude), Some(longitude)) => Some(GpsFix::new(latitude, longitude)),
            _ => None,
        };
        let lap_distance_m = columns.number(row, Field::LapDistance);

        let layout = self.mapper.layout();
        let effective_distance_m = match (lap_distance_m, gps) {
            (Some(distance), _) => Some(layout.normalize(distance)),
            (None, Some(fix)) => Some(
                self.mapper
                    .estimate_distance_from_gps(&fix, self.last_distance_m),
            ),
            (None, None) => None,
        };
        let sector = effective_distance_m
            .map(|d| layout.sector_for(d))
            .unwrap_or(self.last_sector);

        let reported_lap = columns
            .number(row, Field::Lap)
            .map(|lap| lap.trunc() as i64)
            .unwrap_or(MISSING_LAP);
        let corrected = self
            .corrector
            .correct(reported_lap, timestamp_ms, effective_distance_m);
        if corrected.wrapped {
            self.lap_wraps += 1;
        }
        if corrected.corrected {
            self.laps_corrected += 1;
        }

        let record = TelemetryRecord {
            timestamp_ms,
            vehicle_id: self.vehicle_id.clone(),
            lap: corrected.lap,
            lap_distance_m,
            speed_kph: columns.number(row, Field::Speed).unwrap_or(0.0),
            throttle_pct: columns.number(row, Field::Throttle).unwrap_or(0.0),
            brake_front_bar: columns.number(row, Field::BrakeFront).unwrap_or(0.0),
            brake_rear_bar: columns.number(row, Field::BrakeRear).unwrap_or(0.0),
            gear: columns
                .number(row, Field::Gear)
                .map(|gear| gear.round() as i32)
                .unwrap_or(0),
            steering_angle_deg: columns.number(row, Field::Steering).unwrap_or(0.0),
            accel_long_g: columns.number(row, Field::AccelLong).unwrap_or(0.0),
            accel_lat_g: columns.number(row, Field::AccelLat).unwrap_or(0.0),
            gps,
            flag: columns
                .get(row, Field::Flag)
                .map(str::to_string)
                .unwrap_or_default(),
            sector,
        };

        if effective_distance_m.is_some() {
            self.last_distance_m = effective_distance_m;
        }
        self.last_sector = sector;
        Ok(Some(record))
    }

    fn report_progress(&mut self) {
        if self.config.progress_interval == 0 || self.rows_read % self.config.progress_interval != 0
        {
            return;
        }
        let progress = self.progress();
        info!(
            "{}: parsed {} rows, {} records, {} skipped",
            self.vehicle_id, progress.rows_read, progress.records_emitted, progress.rows_skipped
        );
        if let Some(callback) = self.progress_callback.as_mut() {
            callback(&progress);
        }
    }

    fn skip(&mut self, row_no: usize, error: &TracksideError) {
        self.rows_skipped += 1;
        if self.rows_skipped <= MAX_SKIP_WARNINGS {
            warn!("Skipping telemetry row {}: {}", row_no, error);
        } else {
            debug!("Skipping telemetry row {}: {}", row_no, error);
        }
    }
}

impl<R: Read> Iterator for RecordParser<R> {
    type Item = TelemetryRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            let Some(row) = self.rows.next() else {
                self.finished = true;
                info!(
                    "{}: finished parsing {} rows into {} records ({} skipped, {} laps corrected)",
                    self.vehicle_id,
                    self.rows_read,
                    self.records_emitted,
                    self.rows_skipped,
                    self.laps_corrected
                );
                return None;
            };
            self.rows_read += 1;
            let row_no = self.rows_read;
            let parsed = row
                .map_err(|e| TracksideError::CsvReadError { source: e })
                .and_then(|row| self.parse_row(row_no, &row));

            let outcome = match parsed {
                Ok(Some(record)) => {
                    self.records_emitted += 1;
                    Some(record)
                }
                Ok(None) => {
                    self.rows_filtered += 1;
                    None
                }
                Err(e) => {
                    self.skip(row_no, &e);
                    None
                }
            };
            self.report_progress();
            if outcome.is_some() {
                return outcome;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn parser<'a>(csv: &'a str, vehicle_id: &str) -> RecordParser<&'a [u8]> {
        RecordParser::from_reader(csv.as_bytes(), vehicle_id, Arc::new(TrackLayout::default()))
            .unwrap()
    }

    #[test]
    fn test_sector_sequence_and_single_wrap() {
        let csv = "timestamp,lap,lap_distance,speed\n\
                   1000,1,0,100\n\
                   1250,1,500,150\n\
                   1500,1,1400,160\n\
                   1750,1,3600,200\n\
                   2000,1,5490,210\n\
                   2250,1,10,205\n";
        let mut parser = parser(csv, "Car1");
        let records: Vec<TelemetryRecord> = parser.by_ref().collect();

        let sectors: Vec<u8> = records.iter().map(|r| r.sector).collect();
        assert_eq!(sectors, vec![1, 1, 2, 2, 3, 1]);
        assert!(records.iter().all(|r| r.lap == 1 && r.vehicle_id == "Car1"));
        assert_eq!(parser.diagnostics().lap_wraps, 1);
    }

    #[test]
    fn test_wrap_flag_on_last_record_only() {
        let layout = TrackLayout::default();
        let mut corrector = LapIntegrityCorrector::new(CorrectorConfig::default(), 5513.0);
        let wraps: Vec<bool> = [0.0, 500.0, 1400.0, 3600.0, 5490.0, 10.0]
            .iter()
            .enumerate()
            .map(|(i, d)| {
                corrector
                    .correct(1, i as i64 * 250, Some(layout.normalize(*d)))
                    .wrapped
            })
            .collect();
        assert_eq!(wraps, vec![false, false, false, false, false, true]);
    }

    #[test]
    fn test_bad_rows_are_skipped() {
        let csv = "timestamp,lap,lap_distance,speed\n\
                   1000,1,100,100\n\
                   ,1,110,100\n\
                   not-a-time,1,120,100\n\
                   1300,1,130,abc\n";
        let mut parser = parser(csv, "Car1");
        let records: Vec<TelemetryRecord> = parser.by_ref().collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].speed_kph, 0.0);
        let progress = parser.progress();
        assert_eq!(progress.rows_read, 4);
        assert_eq!(progress.rows_skipped, 2);
    }

    #[test]
    fn test_out_of_range_timestamps_are_skipped() {
        let csv = "timestamp,lap,lap_distance\n\
                   -1e20,1,100\n\
                   1e20,32768,200\n\
                   1000,1,300\n";
        let mut parser = parser(csv, "Car1");
        let records: Vec<TelemetryRecord> = parser.by_ref().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp_ms, 1_000_000);
        assert_eq!(parser.progress().rows_skipped, 2);
    }

    #[test]
    fn test_sentinel_lap_is_not_trusted() {
        let csv = "timestamp,lap,lap_distance\n\
                   1000,4,2000\n\
                   1100,32768,2010\n\
                   1200,-1,2020\n\
                   1300,4,2030\n";
        let mut parser = parser(csv, "Car1");
        let laps: Vec<u32> = parser.by_ref().map(|r| r.lap).collect();
        assert_eq!(laps, vec![4, 4, 4, 4]);
        assert_eq!(parser.diagnostics().laps_corrected, 2);
    }

    #[test]
    fn test_header_aliases_and_column_order() {
        let csv = "PBRAKE_F,Lap Number,Laptrigger_lapdist_dls,meta_time,accx_can,VBOX_Lat_Min,VBOX_Long_Minutes,Gear,Flag\n\
                   85.5,2,1500,2024-05-01T14:00:00.250Z,-1.2,30.1,-97.6,4.0,FCY\n";
        let records: Vec<TelemetryRecord> = parser(csv, "Car7").collect();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.brake_front_bar, 85.5);
        assert_eq!(record.lap, 2);
        assert_eq!(record.lap_distance_m, Some(1500.0));
        assert_eq!(record.timestamp_ms, 1_714_572_000_250);
        assert_eq!(record.accel_long_g, -1.2);
        assert_eq!(record.gps, Some(GpsFix::new(30.1, -97.6)));
        assert_eq!(record.gear, 4);
        assert_eq!(record.sector, 2);
        assert!(record.is_caution());
    }

    #[test]
    fn test_rows_for_other_vehicles_are_filtered() {
        let csv = "timestamp,vehicle_id,lap,lap_distance\n\
                   1000,Car1,1,100\n\
                   1000,Car2,1,900\n\
                   1100,Car1,1,200\n";
        let mut parser = parser(csv, "Car1");
        let distances: Vec<Option<f64>> = parser.by_ref().map(|r| r.lap_distance_m).collect();
        assert_eq!(distances, vec![Some(100.0), Some(200.0)]);
        assert_eq!(parser.diagnostics().rows_filtered, 1);
    }

    #[test]
    fn test_sector_from_gps_when_distance_missing() {
        let layout = TrackLayout::default();
        let finish = layout.finish_line;
        let csv = format!(
            "timestamp,lap,latitude,longitude\n1000,1,{},{}\n",
            finish.latitude_deg, finish.longitude_deg
        );
        let records: Vec<TelemetryRecord> = parser(&csv, "Car1").collect();
        assert_eq!(records[0].sector, 1);
        assert_eq!(records[0].lap_distance_m, None);
    }

    #[test]
    fn test_progress_callback() {
        let mut csv = String::from("timestamp,lap,lap_distance\n");
        for i in 0..25 {
            csv.push_str(&format!("{},1,{}\n", 1000 + i * 100, i * 10));
        }
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let parser = parser(&csv, "Car1")
            .with_config(ParserConfig {
                progress_interval: 10,
            })
            .with_progress_callback(move |p| sink.lock().unwrap().push(p.rows_read));
        assert_eq!(parser.count(), 25);
        assert_eq!(*seen.lock().unwrap(), vec![10, 20]);
    }

    #[test]
    fn test_timestamp_formats() {
        assert_eq!(parse_timestamp_ms("1714572000"), Some(1_714_572_000_000));
        assert_eq!(parse_timestamp_ms("1714572000123"), Some(1_714_572_000_123));
        assert_eq!(parse_timestamp_ms("12.5"), Some(12_500));
        assert_eq!(
            parse_timestamp_ms("2024-05-01T16:00:00.500+02:00"),
            Some(1_714_572_000_500)
        );
        assert_eq!(
            parse_timestamp_ms("2024-05-01 14:00:00.5"),
            Some(1_714_572_000_500)
        );
        assert_eq!(parse_timestamp_ms("yesterday"), None);
        assert_eq!(parse_timestamp_ms("NaN"), None);
        assert_eq!(parse_timestamp_ms("1e20"), None);
        assert_eq!(parse_timestamp_ms("-1e20"), None);
    }
}
