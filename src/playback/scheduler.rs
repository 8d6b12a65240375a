use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{
    CautionFlag, EventSink, LapCompleted, PitRecommendationUpdate, PositionUpdate, ReplayComplete,
    ReplayEvent, SectorCrossing, SessionStatus, SimulationSession,
};
use crate::config::{PipelineConfig, PlaybackConfig};
use crate::strategy::{LapSummary, PitContext, PitStrategyEngine, TireDegradationModel};
use crate::telemetry::TelemetryRecord;
use crate::timing::{BestLapBenchmark, SectorTimingTracker};
use crate::track::{TrackLayout, TrackPositionMapper};

type SessionMap = Arc<RwLock<HashMap<Uuid, Arc<SimulationSession>>>>;

/// Analytics shared read-only by every replay loop
struct ReplayContext {
    sink: Arc<dyn EventSink>,
    mapper: TrackPositionMapper,
    tire_model: TireDegradationModel,
    pit_engine: PitStrategyEngine,
    benchmark: Option<Arc<BestLapBenchmark>>,
    playback: PlaybackConfig,
    track_temp_c: f64,
}

/// What one replay loop remembers between records
struct ReplayState {
    tracker: SectorTimingTracker,
    previous_distance_m: Option<f64>,
    caution_active: bool,
    completed_laps: Vec<LapSummary>,
    window: VecDeque<TelemetryRecord>,
}

impl ReplayState {
    fn new(ctx: &ReplayContext) -> Self {
        Self {
            tracker: SectorTimingTracker::new(ctx.benchmark.clone(), ctx.playback.max_laps_retained),
            previous_distance_m: None,
            caution_active: false,
            completed_laps: Vec::new(),
            window: VecDeque::with_capacity(ctx.playback.telemetry_window),
        }
    }
}

/// Runs one paced replay per session and publishes what it finds to a sink.
///
/// Must be used from within a tokio runtime, each session is a spawned task.
pub struct PlaybackScheduler {
    sessions: SessionMap,
    tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    context: Arc<ReplayContext>,
}

impl PlaybackScheduler {
    pub fn new(config: &PipelineConfig, sink: Arc<dyn EventSink>) -> Self {
        Self::with_benchmark(config, sink, None)
    }

    pub fn with_benchmark(
        config: &PipelineConfig,
        sink: Arc<dyn EventSink>,
        benchmark: Option<Arc<BestLapBenchmark>>,
    ) -> Self {
        let layout: Arc<TrackLayout> = Arc::new(config.track.clone());
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            tasks: Mutex::new(HashMap::new()),
            context: Arc::new(ReplayContext {
                sink,
                mapper: TrackPositionMapper::new(layout),
                tire_model: TireDegradationModel::new(config.tire.clone()),
                pit_engine: PitStrategyEngine::new(config.strategy.clone()),
                benchmark,
                playback: config.playback.clone(),
                track_temp_c: config.strategy.track_temperature_c,
            }),
        }
    }

    /// Sorts the records, registers a session and starts replaying it
    pub fn start(&self, records: Vec<TelemetryRecord>, vehicle_id: &str, speed: f64) -> Uuid {
        let id = Uuid::new_v4();
        let session = Arc::new(SimulationSession::new(
            id,
            vehicle_id,
            records,
            speed,
            &self.context.playback,
        ));
        info!(
            "Starting replay {} for {} with {} records at {:.1}x",
            id,
            vehicle_id,
            session.len(),
            session.speed()
        );
        self.sessions.write().insert(id, session.clone());

        let handle = tokio::spawn(run_session(
            session,
            self.context.clone(),
            self.sessions.clone(),
        ));
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(id, handle);
        id
    }

    fn session(&self, id: Uuid) -> Option<Arc<SimulationSession>> {
        self.sessions.read().get(&id).cloned()
    }

    pub fn pause(&self, id: Uuid) -> bool {
        let Some(session) = self.session(id) else {
            return false;
        };
        session.pause();
        debug!("Paused replay {}", id);
        self.context.publish(ReplayEvent::Status(session.status()));
        true
    }

    pub fn resume(&self, id: Uuid) -> bool {
        let Some(session) = self.session(id) else {
            return false;
        };
        session.resume();
        debug!("Resumed replay {}", id);
        self.context.publish(ReplayEvent::Status(session.status()));
        true
    }

    /// Takes effect from the next pacing delay. `None` for unknown sessions.
    pub fn set_speed(&self, id: Uuid, speed: f64) -> Option<f64> {
        let session = self.session(id)?;
        let applied = session.set_speed(speed);
        debug!("Replay {} speed set to {:.2}x", id, applied);
        self.context.publish(ReplayEvent::Status(session.status()));
        Some(applied)
    }

    /// Stops the replay at its next step and forgets the session
    pub fn stop(&self, id: Uuid) -> bool {
        let Some(session) = self.sessions.write().remove(&id) else {
            return false;
        };
        session.stop();
        info!(
            "Stopped replay {} after {} of {} records",
            id,
            session.cursor(),
            session.len()
        );
        self.context.publish(ReplayEvent::Status(session.status()));
        true
    }

    pub fn status(&self, id: Uuid) -> Option<SessionStatus> {
        self.session(id).map(|s| s.status())
    }

    pub fn active_sessions(&self) -> Vec<Uuid> {
        self.sessions.read().keys().copied().collect()
    }

    /// Waits for a session's loop to exit. False when there is nothing to wait for.
    pub async fn join(&self, id: Uuid) -> bool {
        let handle = self.tasks.lock().remove(&id);
        let Some(handle) = handle else {
            return false;
        };
        if let Err(e) = handle.await {
            warn!("Replay task {} ended abnormally: {}", id, e);
        }
        true
    }
}

async fn run_session(session: Arc<SimulationSession>, ctx: Arc<ReplayContext>, sessions: SessionMap) {
    let mut state = ReplayState::new(&ctx);

    'replay: loop {
        if session.is_stopped() {
            break;
        }
        while !session.is_running() {
            tokio::select! {
                _ = session.resumed() => {}
                _ = session.stopped() => break 'replay,
            }
        }

        let index = session.cursor();
        let Some(record) = session.record(index) else {
            finish(&session, &ctx, &sessions);
            return;
        };
        ctx.process_record(&session, &mut state, record.clone());
        session.advance();

        let every = ctx.playback.status_every_records;
        if every > 0 && session.cursor() % every == 0 {
            ctx.publish(ReplayEvent::Status(session.status()));
        }

        // read after processing, a speed change applies to this delay onwards
        let delay = ctx.delay(record, session.record(index + 1), session.speed());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = session.stopped() => break 'replay,
        }
    }
    debug!("Replay {} loop exited after stop", session.id());
}

fn finish(session: &SimulationSession, ctx: &ReplayContext, sessions: &SessionMap) {
    session.finish();
    sessions.write().remove(&session.id());
    info!(
        "Replay {} for {} complete, {} records",
        session.id(),
        session.vehicle_id(),
        session.cursor()
    );
    ctx.publish(ReplayEvent::Status(session.status()));
    ctx.publish(ReplayEvent::ReplayComplete(ReplayComplete {
        session_id: session.id(),
        vehicle_id: session.vehicle_id().to_string(),
        records_processed: session.cursor(),
    }));
}

impl ReplayContext {
    fn publish(&self, event: ReplayEvent) {
        let session_id = event.session_id();
        if let Err(e) = self.sink.publish(event) {
            warn!("Could not publish event for replay {}: {}", session_id, e);
        }
    }

    /// Recorded gap to the next record scaled by the speed multiplier
    fn delay(&self, current: &TelemetryRecord, next: Option<&TelemetryRecord>, speed: f64) -> Duration {
        let cadence = Duration::from_millis(self.playback.default_cadence_ms);
        let Some(next) = next else {
            return cadence;
        };
        let max_gap_ms = i64::try_from(self.playback.max_gap_ms).unwrap_or(i64::MAX);
        let gap_ms = next
            .timestamp_ms
            .saturating_sub(current.timestamp_ms)
            .clamp(0, max_gap_ms);
        Duration::try_from_secs_f64(gap_ms as f64 / 1000.0 / speed).unwrap_or(cadence)
    }

    fn process_record(
        &self,
        session: &SimulationSession,
        state: &mut ReplayState,
        record: TelemetryRecord,
    ) {
        let session_id = session.id();
        let position = self.mapper.map_record(&record, state.previous_distance_m);

        let previous_lap = state.tracker.current_lap(&record.vehicle_id);
        let crossing = state.tracker.update(
            &record.vehicle_id,
            record.lap,
            position.sector,
            record.timestamp_ms,
        );
        // the tracker advances on a lap counter tick or a 3 -> 1 wrap, whichever comes first
        let timing_lap = state
            .tracker
            .current_lap(&record.vehicle_id)
            .unwrap_or(record.lap);
        let completed_lap = previous_lap.filter(|lap| timing_lap > *lap);

        let caution = record.is_caution();
        let caution_started = caution && !state.caution_active;

        state.window.push_back(record.clone());
        while state.window.len() > self.playback.telemetry_window.max(1) {
            state.window.pop_front();
        }
        state.previous_distance_m = Some(position.lap_distance_m);
        state.caution_active = caution;

        self.publish(ReplayEvent::PositionUpdate(Box::new(PositionUpdate {
            session_id,
            timestamp: record.timestamp_ms,
            telemetry: record.clone(),
            position: position.clone(),
        })));

        if let Some(crossing) = crossing {
            self.publish(ReplayEvent::SectorCrossing(SectorCrossing {
                session_id,
                vehicle_id: crossing.vehicle_id,
                lap_number: crossing.lap,
                sector: crossing.sector,
                sector_time_seconds: crossing.duration_s,
                deltas: crossing.delta,
            }));
        }

        if let Some(lap) = completed_lap {
            let lap_time_s = state.tracker.lap_time_s(&record.vehicle_id, lap);
            info!(
                "{} completed lap {} in {}",
                record.vehicle_id,
                lap,
                lap_time_s
                    .map(|t| format!("{:.3}s", t))
                    .unwrap_or_else(|| "an untimed lap".to_string())
            );
            if let Some(lap_time_s) = lap_time_s {
                state.completed_laps.push(LapSummary {
                    lap_number: lap,
                    lap_time_s,
                });
            }
            self.publish(ReplayEvent::LapCompleted(LapCompleted {
                session_id,
                vehicle_id: record.vehicle_id.clone(),
                lap_number: lap,
                lap_time_seconds: lap_time_s,
                deltas: state.tracker.sector_deltas(&record.vehicle_id, lap),
            }));
            self.recommend(session_id, &record.vehicle_id, timing_lap, caution, state);
        }

        if caution_started {
            info!(
                "{} caution '{}' on lap {}",
                record.vehicle_id, record.flag, timing_lap
            );
            self.publish(ReplayEvent::CautionFlag(Box::new(CautionFlag {
                session_id,
                vehicle_id: record.vehicle_id.clone(),
                flag_type: record.flag.clone(),
                lap_number: timing_lap,
                position,
            })));
            // a caution is a pit opportunity that cannot wait for the lap to end
            if completed_lap.is_none() {
                self.recommend(session_id, &record.vehicle_id, timing_lap, caution, state);
            }
        }
    }

    fn recommend(
        &self,
        session_id: Uuid,
        vehicle_id: &str,
        current_lap: u32,
        caution_active: bool,
        state: &mut ReplayState,
    ) {
        let degradation = self.tire_model.estimate(
            current_lap,
            &state.completed_laps,
            state.window.make_contiguous(),
            self.benchmark.as_deref(),
            self.track_temp_c,
        );
        let recommendation = self.pit_engine.recommend(&PitContext {
            vehicle_id,
            current_lap,
            degradation: &degradation,
            lap_time_recovery_s: self.tire_model.lap_time_recovery_s(&degradation),
            caution_active,
            track_temp_c: self.track_temp_c,
        });
        debug!(
            "{} lap {}: wear {:.1}%, {} recommendation for lap {}",
            vehicle_id,
            current_lap,
            degradation.wear_pct,
            recommendation.urgency,
            recommendation.recommended_lap
        );
        self.publish(ReplayEvent::PitRecommendation(Box::new(
            PitRecommendationUpdate {
                session_id,
                recommendation,
            },
        )));
    }
}
