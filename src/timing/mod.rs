// Reference lap times and sector delta classification

pub mod sector_tracker;

pub use sector_tracker::{SectorCompletion, SectorPhase, SectorTimingState, SectorTimingTracker};

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::TracksideError;

/// Deltas below this (and not negative) count as close to the benchmark
const CLOSE_DELTA_S: f64 = 1.0;

/// Best lap and sector times for an event, shared read-only by every session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BestLapBenchmark {
    pub lap_time_s: f64,
    pub sector_times_s: [f64; 3],
}

impl BestLapBenchmark {
    pub fn new(sector_times_s: [f64; 3]) -> Self {
        Self {
            lap_time_s: sector_times_s.iter().sum(),
            sector_times_s,
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self, TracksideError> {
        let file = std::fs::File::open(path).map_err(|e| TracksideError::BenchmarkLoadError {
            reason: format!("{:?}: {}", path, e),
        })?;
        let benchmark: BestLapBenchmark =
            serde_json::from_reader(file).map_err(|e| TracksideError::BenchmarkLoadError {
                reason: format!("{:?}: {}", path, e),
            })?;
        if benchmark.lap_time_s <= 0.0 || benchmark.sector_times_s.iter().any(|s| *s <= 0.0) {
            return Err(TracksideError::BenchmarkLoadError {
                reason: format!("{:?}: lap and sector times must be positive", path),
            });
        }
        Ok(benchmark)
    }

    /// Best time for a sector (1..=3)
    pub fn sector_time(&self, sector: u8) -> Option<f64> {
        (1..=3)
            .contains(&sector)
            .then(|| self.sector_times_s[usize::from(sector - 1)])
    }

    pub fn compare_sector(&self, sector: u8, time_s: f64) -> Option<SectorDelta> {
        let best_s = self.sector_time(sector)?;
        let delta_s = time_s - best_s;
        Some(SectorDelta {
            sector,
            time_s,
            best_s,
            delta_s,
            status: DeltaStatus::from_delta(delta_s),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaStatus {
    Ahead,
    Close,
    Behind,
}

impl DeltaStatus {
    pub fn from_delta(delta_s: f64) -> Self {
        if delta_s < 0.0 {
            DeltaStatus::Ahead
        } else if delta_s < CLOSE_DELTA_S {
            DeltaStatus::Close
        } else {
            DeltaStatus::Behind
        }
    }
}

impl std::fmt::Display for DeltaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeltaStatus::Ahead => write!(f, "ahead"),
            DeltaStatus::Close => write!(f, "close"),
            DeltaStatus::Behind => write!(f, "behind"),
        }
    }
}

/// A completed sector compared with the benchmark
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectorDelta {
    pub sector: u8,
    pub time_s: f64,
    pub best_s: f64,
    pub delta_s: f64,
    pub status: DeltaStatus,
}
