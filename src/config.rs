use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::TracksideError;
use crate::strategy::{StrategyConfig, TireModelConfig};
use crate::telemetry::{CorrectorConfig, ParserConfig};
use crate::track::TrackLayout;

const CONFIG_DIR_NAME: &str = "trackside";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub min_speed: f64,
    pub max_speed: f64,
    /// Delay after a record with no successor
    pub default_cadence_ms: u64,
    /// Recording gaps longer than this are replayed as this, before scaling
    pub max_gap_ms: u64,
    /// Recent records kept for the tire model's braking window
    pub telemetry_window: usize,
    pub max_laps_retained: usize,
    pub status_every_records: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            min_speed: 0.1,
            max_speed: 20.0,
            default_cadence_ms: 100,
            max_gap_ms: 10_000,
            telemetry_window: 600,
            max_laps_retained: 10,
            status_every_records: 50,
        }
    }
}

impl PlaybackConfig {
    /// Speed multiplier forced into `[min_speed, max_speed]`, non-finite values become 1x
    pub fn clamp_speed(&self, speed: f64) -> f64 {
        let speed = if speed.is_finite() { speed } else { 1.0 };
        // max/min rather than clamp, a hand-edited config may have min > max
        speed.max(self.min_speed).min(self.max_speed)
    }
}

/// Every tunable of the pipeline, loaded from a JSON file or defaulted
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub track: TrackLayout,
    pub corrector: CorrectorConfig,
    pub tire: TireModelConfig,
    pub strategy: StrategyConfig,
    pub playback: PlaybackConfig,
    pub parser: ParserConfig,
}

impl PipelineConfig {
    pub fn local_file_path() -> Result<PathBuf, TracksideError> {
        Ok(dirs::config_dir()
            .ok_or(TracksideError::NoConfigDir)?
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME))
    }

    pub fn from_file(path: &Path) -> Result<Self, TracksideError> {
        let file =
            std::fs::File::open(path).map_err(|e| TracksideError::ConfigIOError { source: e })?;
        serde_json::from_reader(file).map_err(|e| TracksideError::ConfigSerializeError { source: e })
    }

    /// `Ok(None)` when no config file has been saved yet
    pub fn from_local_file() -> Result<Option<Self>, TracksideError> {
        let config_path = Self::local_file_path()?;
        if config_path.exists() {
            Self::from_file(&config_path).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn save(&self) -> Result<(), TracksideError> {
        self.save_to(&Self::local_file_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), TracksideError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| TracksideError::ConfigIOError { source: e })?;
            }
        }
        let file =
            std::fs::File::create(path).map_err(|e| TracksideError::ConfigIOError { source: e })?;
        serde_json::to_writer_pretty(file, self)
            .map_err(|e| TracksideError::ConfigSerializeError { source: e })
    }
}
