pub mod pit_engine;
pub mod tire_model;

pub use pit_engine::{PitContext, PitRecommendation, PitStrategyEngine, StrategyConfig, Urgency};
pub use tire_model::{LapSummary, TireDegradation, TireDegradationModel, TireModelConfig};
