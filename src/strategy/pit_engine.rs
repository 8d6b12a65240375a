use serde::{Deserialize, Serialize};

use super::tire_model::TireDegradation;
use crate::track::TrackLayout;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub total_race_laps: u32,
    pub track_temperature_c: f64,
    /// A caution before this lap is too early to pit under
    pub caution_min_lap: u32,
    pub caution_time_saving_s: f64,
    pub high_wear_pct: f64,
    pub hard_pace_loss_s: f64,
    pub moderate_wear_pct: f64,
    pub moderate_pace_loss_s: f64,
    pub moderate_gain_s: f64,
    /// Share of race distance where the planned stop falls
    pub optimal_pit_fraction: f64,
    pub min_pit_lap: u32,
    /// Laps either side of the optimal lap that trigger an advisory
    pub optimal_window_laps: u32,
    pub hot_track_c: f64,
    pub very_hot_track_c: f64,
    pub pit_lane_loss_s: f64,
    pub caution_pit_loss_factor: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            total_race_laps: 30,
            track_temperature_c: 30.0,
            caution_min_lap: 5,
            caution_time_saving_s: 12.0,
            high_wear_pct: 70.0,
            hard_pace_loss_s: 2.0,
            moderate_wear_pct: 50.0,
            moderate_pace_loss_s: 1.0,
            moderate_gain_s: 5.0,
            optimal_pit_fraction: 0.45,
            min_pit_lap: 5,
            optimal_window_laps: 1,
            hot_track_c: 35.0,
            very_hot_track_c: 40.0,
            pit_lane_loss_s: 25.0,
            caution_pit_loss_factor: 0.6,
        }
    }
}

/// Ordered from least to most urgent
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Urgency {
    Info,
    Advisory,
    Warning,
    Critical,
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Urgency::Info => write!(f, "Info"),
            Urgency::Advisory => write!(f, "Advisory"),
            Urgency::Warning => write!(f, "Warning"),
            Urgency::Critical => write!(f, "Critical"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PitRecommendation {
    pub vehicle_id: String,
    pub current_lap: u32,
    pub recommended_lap: u32,
    pub urgency: Urgency,
    pub reason: String,
    /// Contributing reasons, for audit
    pub factors: Vec<String>,
    pub expected_time_gain_s: f64,
    pub caution_opportunity: bool,
}

/// Race state the engine decides on
#[derive(Clone, Debug)]
pub struct PitContext<'a> {
    pub vehicle_id: &'a str,
    pub current_lap: u32,
    pub degradation: &'a TireDegradation,
    /// Per-lap time expected back on fresh tires
    pub lap_time_recovery_s: f64,
    pub caution_active: bool,
    pub track_temp_c: f64,
}

/// Rule cascade from tire state and race state to a pit call
#[derive(Clone, Debug, Default)]
pub struct PitStrategyEngine {
    config: StrategyConfig,
}

impl PitStrategyEngine {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    /// Planned stop lap, earlier on hot tracks, never before `min_pit_lap`
    pub fn optimal_pit_lap(&self, track_temp_c: f64) -> u32 {
        let c = &self.config;
        let planned = (f64::from(c.total_race_laps) * c.optimal_pit_fraction).floor() as u32;
        let shift = if track_temp_c > c.very_hot_track_c {
            2
        } else if track_temp_c > c.hot_track_c {
            1
        } else {
            0
        };
        planned.saturating_sub(shift).max(c.min_pit_lap)
    }

    /// Time lost driving through the pit lane
    pub fn pit_loss_s(&self, caution_active: bool) -> f64 {
        if caution_active {
            self.config.pit_lane_loss_s * self.config.caution_pit_loss_factor
        } else {
            self.config.pit_lane_loss_s
        }
    }

    /// A pit call made in the sector holding the pit entry, or the one before
    /// it, can still be acted on this lap
    pub fn is_favorable_pit_sector(&self, sector: u8, layout: &TrackLayout) -> bool {
        let entry_sector = layout.sector_for(layout.pit_entry_m);
        let approach_sector = if entry_sector == 1 { 3 } else { entry_sector - 1 };
        sector == entry_sector || sector == approach_sector
    }

    /// First matching rule wins
    pub fn recommend(&self, ctx: &PitContext<'_>) -> PitRecommendation {
        let c = &self.config;
        let wear = ctx.degradation.wear_pct;
        let pace_loss = ctx.degradation.lap_time_delta_s;
        let remaining_laps = c.total_race_laps.saturating_sub(ctx.current_lap);
        let optimal_lap = self.optimal_pit_lap(ctx.track_temp_c);

        let recommendation = |recommended_lap: u32,
                              urgency: Urgency,
                              reason: String,
                              factors: Vec<String>,
                              expected_time_gain_s: f64,
                              caution_opportunity: bool| PitRecommendation {
            vehicle_id: ctx.vehicle_id.to_string(),
            current_lap: ctx.current_lap,
            recommended_lap,
            urgency,
            reason,
            factors,
            expected_time_gain_s,
            caution_opportunity,
        };

        if ctx.caution_active && ctx.current_lap > c.caution_min_lap {
            return recommendation(
                ctx.current_lap,
                Urgency::Critical,
                "Caution period: pit now while the field is slowed".to_string(),
                vec![
                    "Caution flag active".to_string(),
                    format!("Lap {} is past lap {}", ctx.current_lap, c.caution_min_lap),
                    format!("Pit loss reduced to {:.1}s", self.pit_loss_s(true)),
                    format!("Tire wear {:.0}%", wear),
                ],
                c.caution_time_saving_s,
                true,
            );
        }

        if wear > c.high_wear_pct || pace_loss > c.hard_pace_loss_s {
            let mut factors = Vec::new();
            if wear > c.high_wear_pct {
                factors.push(format!("Tire wear {:.0}% above {:.0}%", wear, c.high_wear_pct));
            }
            if pace_loss > c.hard_pace_loss_s {
                factors.push(format!(
                    "Pace loss {:.2}s above {:.1}s",
                    pace_loss, c.hard_pace_loss_s
                ));
            }
            factors.push(format!("{} laps remaining", remaining_laps));
            return recommendation(
                ctx.current_lap.saturating_add(1),
                Urgency::Warning,
                "Tires are past their best: pit next lap".to_string(),
                factors,
                ctx.lap_time_recovery_s * f64::from(remaining_laps),
                false,
            );
        }

        if wear > c.moderate_wear_pct || pace_loss > c.moderate_pace_loss_s {
            let mut factors = Vec::new();
            if wear > c.moderate_wear_pct {
                factors.push(format!(
                    "Tire wear {:.0}% above {:.0}%",
                    wear, c.moderate_wear_pct
                ));
            }
            if pace_loss > c.moderate_pace_loss_s {
                factors.push(format!(
                    "Pace loss {:.2}s above {:.1}s",
                    pace_loss, c.moderate_pace_loss_s
                ));
            }
            return recommendation(
                ctx.current_lap.saturating_add(2),
                Urgency::Advisory,
                "Tire performance dropping: plan to pit in two laps".to_string(),
                factors,
                c.moderate_gain_s,
                false,
            );
        }

        if ctx.current_lap.abs_diff(optimal_lap) <= c.optimal_window_laps {
            return recommendation(
                optimal_lap,
                Urgency::Advisory,
                format!("Pit window open: optimal stop on lap {}", optimal_lap),
                vec![
                    format!("Optimal pit lap {} of {}", optimal_lap, c.total_race_laps),
                    format!("Track temperature {:.0}°C", ctx.track_temp_c),
                    format!("Tire wear {:.0}%", wear),
                ],
                ctx.lap_time_recovery_s * f64::from(c.total_race_laps.saturating_sub(optimal_lap)),
                false,
            );
        }

        recommendation(
            optimal_lap,
            Urgency::Info,
            format!("No action: planned stop on lap {}", optimal_lap),
            vec![
                format!("Tire wear {:.0}%", wear),
                format!("Pace loss {:.2}s", pace_loss),
            ],
            0.0,
            false,
        )
    }
}
