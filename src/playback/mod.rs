// Replay events, the sink they are published to and the session scheduler

pub mod scheduler;
pub mod session;

pub use scheduler::PlaybackScheduler;
pub use session::SimulationSession;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::errors::TracksideError;
use crate::strategy::PitRecommendation;
use crate::telemetry::TelemetryRecord;
use crate::timing::SectorDelta;
use crate::track::TrackPosition;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionUpdate {
    pub session_id: Uuid,
    pub telemetry: TelemetryRecord,
    pub position: TrackPosition,
    pub timestamp: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectorCrossing {
    pub session_id: Uuid,
    pub vehicle_id: String,
    pub lap_number: u32,
    /// The sector that was just completed
    pub sector: u8,
    pub sector_time_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deltas: Option<SectorDelta>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LapCompleted {
    pub session_id: Uuid,
    pub vehicle_id: String,
    pub lap_number: u32,
    /// Absent when one of the sectors could not be timed
    pub lap_time_seconds: Option<f64>,
    pub deltas: Vec<SectorDelta>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PitRecommendationUpdate {
    pub session_id: Uuid,
    #[serde(flatten)]
    pub recommendation: PitRecommendation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CautionFlag {
    pub session_id: Uuid,
    pub vehicle_id: String,
    pub flag_type: String,
    pub lap_number: u32,
    pub position: TrackPosition,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: Uuid,
    pub vehicle_id: String,
    pub is_running: bool,
    pub speed_multiplier: f64,
    pub progress_percent: f64,
    pub records_processed: usize,
    pub total_records: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayComplete {
    pub session_id: Uuid,
    pub vehicle_id: String,
    pub records_processed: usize,
}

/// Everything a replay publishes, in emission order per session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ReplayEvent {
    PositionUpdate(Box<PositionUpdate>),
    SectorCrossing(SectorCrossing),
    LapCompleted(LapCompleted),
    PitRecommendation(Box<PitRecommendationUpdate>),
    CautionFlag(Box<CautionFlag>),
    Status(SessionStatus),
    ReplayComplete(ReplayComplete),
}

impl ReplayEvent {
    pub fn session_id(&self) -> Uuid {
        match self {
            ReplayEvent::PositionUpdate(e) => e.session_id,
            ReplayEvent::SectorCrossing(e) => e.session_id,
            ReplayEvent::LapCompleted(e) => e.session_id,
            ReplayEvent::PitRecommendation(e) => e.session_id,
            ReplayEvent::CautionFlag(e) => e.session_id,
            ReplayEvent::Status(e) => e.session_id,
            ReplayEvent::ReplayComplete(e) => e.session_id,
        }
    }
}

/// Downstream transport for replay events.
///
/// A failed publish is logged by the scheduler and never stops a replay.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: ReplayEvent) -> Result<(), TracksideError>;
}

/// Sink over an unbounded tokio channel, for in-process consumers
#[derive(Clone, Debug)]
pub struct ChannelSink {
    sender: UnboundedSender<ReplayEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, UnboundedReceiver<ReplayEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: ReplayEvent) -> Result<(), TracksideError> {
        self.sender
            .send(event)
            .map_err(|_| TracksideError::SinkClosed)
    }
}
