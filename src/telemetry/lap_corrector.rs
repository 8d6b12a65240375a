use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Tunables for lap counter recovery.
///
/// The average lap duration and the distance windows are assumptions about the
/// circuit and the logger, so they live in config rather than in code.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectorConfig {
    /// Value the logger writes when the lap counter is lost
    pub lap_sentinel: i64,
    /// Anything above this is treated like the sentinel
    pub max_plausible_lap: i64,
    pub average_lap_duration_s: f64,
    /// A new distance below this counts as "just past S/F" for wrap detection
    pub wrap_start_window_m: f64,
    /// A previous distance within this of the circuit length counts as "about to cross S/F"
    pub wrap_end_window_m: f64,
    /// Reported changes larger than this are never trusted
    pub max_lap_jump: u32,
    pub lap_start_window_m: f64,
    pub mid_lap_threshold_m: f64,
    /// Consecutive invalid laps tolerated before the corrector reports itself unhealthy
    pub health_invalid_limit: u32,
}

impl Default for CorrectorConfig {
    fn default() -> Self {
        Self {
            lap_sentinel: 32768,
            max_plausible_lap: 1000,
            average_lap_duration_s: 150.0,
            wrap_start_window_m: 200.0,
            wrap_end_window_m: 200.0,
            max_lap_jump: 2,
            lap_start_window_m: 100.0,
            mid_lap_threshold_m: 1000.0,
            health_invalid_limit: 10,
        }
    }
}

/// Outcome of correcting one record's lap value
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CorrectedLap {
    pub lap: u32,
    /// Lap distance wrapped from the end of the circuit back to S/F on this record
    pub wrapped: bool,
    /// The reported value was replaced
    pub corrected: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CorrectorDiagnostics {
    pub last_valid_lap: Option<u32>,
    pub consecutive_invalid: u32,
    pub healthy: bool,
}

/// Repairs lap counters that wrap, drop to the sentinel or go negative.
///
/// Corrected laps never decrease unless [`LapIntegrityCorrector::reset`] is called.
#[derive(Clone, Debug)]
pub struct LapIntegrityCorrector {
    config: CorrectorConfig,
    circuit_length_m: f64,
    last_valid_lap: Option<u32>,
    last_timestamp_ms: Option<i64>,
    last_distance_m: Option<f64>,
    consecutive_invalid: u32,
}

impl LapIntegrityCorrector {
    pub fn new(config: CorrectorConfig, circuit_length_m: f64) -> Self {
        Self {
            config,
            circuit_length_m,
            last_valid_lap: None,
            last_timestamp_ms: None,
            last_distance_m: None,
            consecutive_invalid: 0,
        }
    }

    /// True when the distance went from near the end of the lap to near S/F
    pub fn is_distance_wrap(&self, previous_m: f64, current_m: f64) -> bool {
        previous_m >= self.circuit_length_m - self.config.wrap_end_window_m
            && current_m < self.config.wrap_start_window_m
    }

    fn is_out_of_range(&self, reported_lap: i64) -> bool {
        reported_lap < 0
            || reported_lap == self.config.lap_sentinel
            || reported_lap > self.config.max_plausible_lap
    }

    /// Correct the lap reported by one record
    pub fn correct(
        &mut self,
        reported_lap: i64,
        timestamp_ms: i64,
        lap_distance_m: Option<f64>,
    ) -> CorrectedLap {
        let wrapped = match (self.last_distance_m, lap_distance_m) {
            (Some(previous), Some(current)) => self.is_distance_wrap(previous, current),
            _ => false,
        };

        let lap = if self.is_out_of_range(reported_lap) {
            self.consecutive_invalid = self.consecutive_invalid.saturating_add(1);
            let base = self.last_valid_lap.unwrap_or(1);
            let estimate = match self.last_timestamp_ms {
                None => 1,
                Some(previous_ms) => {
                    let elapsed_s = timestamp_ms.saturating_sub(previous_ms).max(0) as f64 / 1000.0;
                    let laps_elapsed = if self.config.average_lap_duration_s > 0.0 {
                        (elapsed_s / self.config.average_lap_duration_s).floor() as u32
                    } else {
                        0
                    };
                    base.saturating_add(laps_elapsed)
                }
            };
            let lap = if wrapped {
                base.saturating_add(1)
            } else {
                estimate.max(self.last_valid_lap.unwrap_or(0))
            };
            if self.consecutive_invalid == self.config.health_invalid_limit {
                warn!(
                    "Lap counter invalid for {} consecutive records, last reported value {}",
                    self.consecutive_invalid, reported_lap
                );
            }
            debug!("Replaced out-of-range lap {} with {}", reported_lap, lap);
            lap
        } else {
            self.consecutive_invalid = 0;
            // in range, so it fits in a u32
            let reported = reported_lap as u32;
            match self.last_valid_lap {
                None => reported,
                Some(last) => self.validate_change(last, reported, wrapped, lap_distance_m),
            }
        };

        self.last_valid_lap = Some(lap);
        self.last_timestamp_ms = Some(timestamp_ms);
        if lap_distance_m.is_some() {
            self.last_distance_m = lap_distance_m;
        }

        CorrectedLap {
            lap,
            wrapped,
            corrected: i64::from(lap) != reported_lap,
        }
    }

    fn validate_change(
        &self,
        last: u32,
        reported: u32,
        wrapped: bool,
        lap_distance_m: Option<f64>,
    ) -> u32 {
        if reported == last {
            return last;
        }
        let jump = reported.abs_diff(last);
        if jump > self.config.max_lap_jump {
            debug!(
                "Implausible lap jump {} -> {}, falling back to distance wrap",
                last, reported
            );
            return if wrapped { last.saturating_add(1) } else { last };
        }
        if reported < last {
            debug!("Rejected lap regression {} -> {}", last, reported);
            return last;
        }
        match lap_distance_m {
            Some(distance) if distance < self.config.lap_start_window_m => reported,
            Some(distance) if distance > self.config.mid_lap_threshold_m && jump > 1 => {
                debug!(
                    "Rejected mid-lap jump {} -> {} at {:.0}m",
                    last, reported, distance
                );
                last
            }
            // Between the start window and the mid-lap threshold no rule fires,
            // the reported value is accepted
            _ => reported,
        }
    }

    /// Start over from a known good lap
    pub fn reset(&mut self, last_valid_lap: u32) {
        self.last_valid_lap = Some(last_valid_lap);
        self.last_timestamp_ms = None;
        self.last_distance_m = None;
        self.consecutive_invalid = 0;
    }

    pub fn diagnostics(&self) -> CorrectorDiagnostics {
        CorrectorDiagnostics {
            last_valid_lap: self.last_valid_lap,
            consecutive_invalid: self.consecutive_invalid,
            healthy: self.consecutive_invalid < self.config.health_invalid_limit,
        }
    }
}
