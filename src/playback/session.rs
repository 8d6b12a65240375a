use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::SessionStatus;
use crate::config::PlaybackConfig;
use crate::telemetry::TelemetryRecord;

/// One replay: its records and the control flags shared with the replay loop.
///
/// Control calls write the flags, the loop reads them at its next step. Flags
/// only need eventual visibility, so relaxed atomics are enough.
#[derive(Debug)]
pub struct SimulationSession {
    id: Uuid,
    vehicle_id: String,
    records: Vec<TelemetryRecord>,
    cursor: AtomicUsize,
    running: AtomicBool,
    speed_bits: AtomicU64,
    min_speed: f64,
    max_speed: f64,
    resumed: Notify,
    cancellation: CancellationToken,
}

impl SimulationSession {
    /// Records are sorted by timestamp, ties keep their input order
    pub fn new(
        id: Uuid,
        vehicle_id: &str,
        mut records: Vec<TelemetryRecord>,
        speed: f64,
        config: &PlaybackConfig,
    ) -> Self {
        records.sort_by_key(|r| r.timestamp_ms);
        Self {
            id,
            vehicle_id: vehicle_id.to_string(),
            records,
            cursor: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            speed_bits: AtomicU64::new(config.clamp_speed(speed).to_bits()),
            min_speed: config.min_speed,
            max_speed: config.max_speed,
            resumed: Notify::new(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record(&self, index: usize) -> Option<&TelemetryRecord> {
        self.records.get(index)
    }

    /// Index of the next record to replay, never past `len()`
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    pub(crate) fn advance(&self) {
        let next = (self.cursor() + 1).min(self.records.len());
        self.cursor.store(next, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn speed(&self) -> f64 {
        f64::from_bits(self.speed_bits.load(Ordering::Relaxed))
    }

    /// Returns the multiplier actually applied after clamping
    pub fn set_speed(&self, speed: f64) -> f64 {
        let speed = if speed.is_finite() { speed } else { 1.0 };
        let clamped = speed.max(self.min_speed).min(self.max_speed);
        self.speed_bits.store(clamped.to_bits(), Ordering::Relaxed);
        clamped
    }

    pub fn pause(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.running.store(true, Ordering::Relaxed);
        // notify_one keeps a permit when the loop is not waiting yet
        self.resumed.notify_one();
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.cancellation.cancel();
    }

    pub(crate) fn finish(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub(crate) async fn resumed(&self) {
        self.resumed.notified().await
    }

    pub(crate) async fn stopped(&self) {
        self.cancellation.cancelled().await
    }

    pub fn progress_percent(&self) -> f64 {
        if self.records.is_empty() {
            100.0
        } else {
            self.cursor() as f64 / self.records.len() as f64 * 100.0
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.id,
            vehicle_id: self.vehicle_id.clone(),
            is_running: self.is_running(),
            speed_multiplier: self.speed(),
            progress_percent: self.progress_percent(),
            records_processed: self.cursor(),
            total_records: self.records.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(timestamp_ms: i64) -> TelemetryRecord {
        TelemetryRecord {
            timestamp_ms,
            vehicle_id: "Car1".to_string(),
            ..TelemetryRecord::default()
        }
    }

    fn session(records: Vec<TelemetryRecord>, speed: f64) -> SimulationSession {
        SimulationSession::new(
            Uuid::new_v4(),
            "Car1",
            records,
            speed,
            &PlaybackConfig::default(),
        )
    }

    #[test]
    fn test_records_sorted_by_timestamp() {
        let session = session(vec![record(300), record(100), record(200)], 1.0);
        let timestamps: Vec<i64> = (0..session.len())
            .filter_map(|i| session.record(i).map(|r| r.timestamp_ms))
            .collect();
        assert_eq!(timestamps, vec![100, 200, 300]);
    }

    #[test]
    fn test_initial_speed_is_clamped() {
        assert_eq!(session(vec![], 100.0).speed(), 20.0);
        assert_eq!(session(vec![], 0.01).speed(), 0.1);
    }

    #[test]
    fn test_cursor_never_exceeds_record_count() {
        let session = session(vec![record(0), record(100)], 1.0);
        for _ in 0..5 {
            session.advance();
        }
        assert_eq!(session.cursor(), 2);
        assert_eq!(session.progress_percent(), 100.0);
    }

    #[test]
    fn test_pause_resume_stop() {
        let session = session(vec![record(0)], 1.0);
        assert!(session.is_running());
        session.pause();
        assert!(!session.is_running());
        session.resume();
        assert!(session.is_running());
        session.stop();
        assert!(!session.is_running());
        assert!(session.is_stopped());
    }

    #[test]
    fn test_status_snapshot() {
        let session = session(vec![record(0), record(100), record(200), record(300)], 4.0);
        session.advance();
        let status = session.status();
        assert_eq!(status.records_processed, 1);
        assert_eq!(status.total_records, 4);
        assert_eq!(status.progress_percent, 25.0);
        assert_eq!(status.speed_multiplier, 4.0);
        assert!(status.is_running);
    }

    proptest! {
        #[test]
        fn prop_speed_always_within_clamp(speed in proptest::num::f64::ANY) {
            let session = session(vec![], 1.0);
            let applied = session.set_speed(speed);
            prop_assert!((0.1..=20.0).contains(&applied));
            prop_assert_eq!(applied, session.speed());
        }
    }
}
