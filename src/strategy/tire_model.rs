use serde::{Deserialize, Serialize};

use crate::telemetry::TelemetryRecord;
use crate::timing::BestLapBenchmark;

/// Completed laps used for the pace-loss average
const PACE_WINDOW_LAPS: usize = 3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TireModelConfig {
    /// Stint length at which baseline wear reaches its full weight
    pub nominal_stint_laps: u32,
    pub baseline_weight: f64,
    pub braking_weight: f64,
    pub pace_weight: f64,
    /// Average front brake pressure mapped to full braking contribution
    pub reference_brake_pressure_bar: f64,
    /// Pace loss mapped to full pace contribution. Tuned for one circuit,
    /// not a physical constant.
    pub pace_loss_saturation_s: f64,
    /// Wear at which the tires are considered done
    pub wear_threshold_pct: f64,
    /// Share of the pace loss recovered by fresh tires
    pub recovery_fraction: f64,
    pub cool_below_c: f64,
    pub cool_multiplier: f64,
    pub warm_below_c: f64,
    pub hot_below_c: f64,
    pub hot_multiplier: f64,
    pub extreme_multiplier: f64,
}

impl Default for TireModelConfig {
    fn default() -> Self {
        Self {
            nominal_stint_laps: 30,
            baseline_weight: 0.5,
            braking_weight: 0.2,
            pace_weight: 0.3,
            reference_brake_pressure_bar: 120.0,
            pace_loss_saturation_s: 3.0,
            wear_threshold_pct: 75.0,
            recovery_fraction: 0.8,
            cool_below_c: 25.0,
            cool_multiplier: 0.9,
            warm_below_c: 35.0,
            hot_below_c: 45.0,
            hot_multiplier: 1.15,
            extreme_multiplier: 1.3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LapSummary {
    pub lap_number: u32,
    pub lap_time_s: f64,
}

/// Wear snapshot for the current lap
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TireDegradation {
    pub lap_number: u32,
    /// 0 = fresh, 100 = fully degraded
    pub wear_pct: f64,
    /// Average of the last three laps minus the benchmark lap
    pub lap_time_delta_s: f64,
    pub avg_brake_pressure_bar: f64,
    pub peak_brake_pressure_bar: f64,
    pub temperature_multiplier: f64,
}

/// Estimates tire wear from lap count, braking, pace loss and track temperature
#[derive(Clone, Debug, Default)]
pub struct TireDegradationModel {
    config: TireModelConfig,
}

impl TireDegradationModel {
    pub fn new(config: TireModelConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TireModelConfig {
        &self.config
    }

    pub fn temperature_multiplier(&self, track_temp_c: f64) -> f64 {
        let c = &self.config;
        if track_temp_c < c.cool_below_c {
            c.cool_multiplier
        } else if track_temp_c < c.warm_below_c {
            1.0
        } else if track_temp_c < c.hot_below_c {
            c.hot_multiplier
        } else {
            c.extreme_multiplier
        }
    }

    pub fn estimate(
        &self,
        current_lap: u32,
        completed_laps: &[LapSummary],
        recent_telemetry: &[TelemetryRecord],
        benchmark: Option<&BestLapBenchmark>,
        track_temp_c: f64,
    ) -> TireDegradation {
        let c = &self.config;

        let baseline = if c.nominal_stint_laps > 0 {
            f64::from(current_lap) / f64::from(c.nominal_stint_laps) * 100.0 * c.baseline_weight
        } else {
            0.0
        };

        let (avg_brake, peak_brake) = brake_pressure_stats(recent_telemetry);
        let braking_ratio = if c.reference_brake_pressure_bar > 0.0 {
            saturate(avg_brake / c.reference_brake_pressure_bar)
        } else {
            0.0
        };
        let braking = braking_ratio * 100.0 * c.braking_weight;

        let lap_time_delta_s = match benchmark {
            Some(benchmark) => recent_pace(completed_laps)
                .map(|avg| avg - benchmark.lap_time_s)
                .unwrap_or(0.0),
            None => 0.0,
        };
        let pace_ratio = if c.pace_loss_saturation_s > 0.0 {
            saturate(lap_time_delta_s / c.pace_loss_saturation_s)
        } else {
            0.0
        };
        let pace = pace_ratio * 100.0 * c.pace_weight;

        let temperature_multiplier = self.temperature_multiplier(track_temp_c);
        let raw = (baseline + braking + pace) * temperature_multiplier;
        let wear_pct = if raw.is_nan() { 0.0 } else { raw.clamp(0.0, 100.0) };

        TireDegradation {
            lap_number: current_lap,
            wear_pct,
            lap_time_delta_s,
            avg_brake_pressure_bar: avg_brake,
            peak_brake_pressure_bar: peak_brake,
            temperature_multiplier,
        }
    }

    /// Laps until the wear threshold at the wear rate seen so far
    pub fn laps_remaining(&self, degradation: &TireDegradation) -> Option<u32> {
        let threshold = self.config.wear_threshold_pct;
        if degradation.wear_pct >= threshold {
            return Some(0);
        }
        if degradation.lap_number == 0 || degradation.wear_pct <= 0.0 {
            return None;
        }
        let wear_per_lap = degradation.wear_pct / f64::from(degradation.lap_number);
        Some(((threshold - degradation.wear_pct) / wear_per_lap).ceil() as u32)
    }

    /// Lap time expected back per lap after a tire change
    pub fn lap_time_recovery_s(&self, degradation: &TireDegradation) -> f64 {
        degradation.lap_time_delta_s.max(0.0) * self.config.recovery_fraction
    }
}

fn saturate(ratio: f64) -> f64 {
    if ratio.is_nan() { 0.0 } else { ratio.clamp(0.0, 1.0) }
}

fn brake_pressure_stats(records: &[TelemetryRecord]) -> (f64, f64) {
    if records.is_empty() {
        return (0.0, 0.0);
    }
    let sum: f64 = records.iter().map(|r| r.brake_front_bar).sum();
    let peak = records
        .iter()
        .map(|r| r.brake_front_bar)
        .fold(0.0f64, f64::max);
    (sum / records.len() as f64, peak)
}

fn recent_pace(completed_laps: &[LapSummary]) -> Option<f64> {
    if completed_laps.is_empty() {
        return None;
    }
    let window = &completed_laps[completed_laps.len().saturating_sub(PACE_WINDOW_LAPS)..];
    Some(window.iter().map(|l| l.lap_time_s).sum::<f64>() / window.len() as f64)
}
