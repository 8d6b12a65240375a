use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;
use log::debug;
use parking_lot::{Mutex, RwLock};

use super::{BestLapBenchmark, SectorDelta};

type LapKey = (String, u32);
type SharedState = Arc<Mutex<SectorTimingState>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectorPhase {
    AwaitingFirstSector,
    Active(u8),
    /// The lap ended, further records for it are ignored
    Complete,
}

/// Timing for one (vehicle, lap) pair
#[derive(Clone, Debug, PartialEq)]
pub struct SectorTimingState {
    pub phase: SectorPhase,
    pub lap_start_ms: Option<i64>,
    pub sector_entry_ms: Option<i64>,
    pub sector_times_s: [Option<f64>; 3],
    /// First observed sector was not sector 1, so that sector's time is partial
    started_mid_lap: Option<u8>,
}

impl SectorTimingState {
    fn new() -> Self {
        Self {
            phase: SectorPhase::AwaitingFirstSector,
            lap_start_ms: None,
            sector_entry_ms: None,
            sector_times_s: [None; 3],
            started_mid_lap: None,
        }
    }

    /// Sum of the sector times once all three are known
    pub fn lap_time_s(&self) -> Option<f64> {
        let [s1, s2, s3] = self.sector_times_s;
        Some(s1? + s2? + s3?)
    }
}

/// A sector that was just exited
#[derive(Clone, Debug, PartialEq)]
pub struct SectorCompletion {
    pub vehicle_id: String,
    pub lap: u32,
    pub sector: u8,
    pub duration_s: f64,
    /// Present when a benchmark is loaded
    pub delta: Option<SectorDelta>,
    /// All three sectors of the lap are now known
    pub lap_complete: bool,
}

/// Detects sector boundary crossings per vehicle and lap.
///
/// Each key owns its own lock. The map lock is only held to find or insert a
/// key, so updates for different keys do not contend and updates to the same
/// key serialize.
///
/// The lap being timed only moves forward. A reported lap at or below it is
/// timed against it, and a 3 -> 1 wrap opens the next lap at the crossing even
/// when the reported lap has not changed yet.
pub struct SectorTimingTracker {
    states: RwLock<HashMap<LapKey, SharedState>>,
    timing_laps: Mutex<HashMap<String, u32>>,
    benchmark: Option<Arc<BestLapBenchmark>>,
    max_laps_retained: usize,
}

impl SectorTimingTracker {
    pub fn new(benchmark: Option<Arc<BestLapBenchmark>>, max_laps_retained: usize) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            timing_laps: Mutex::new(HashMap::new()),
            benchmark,
            max_laps_retained: max_laps_retained.max(1),
        }
    }

    pub fn benchmark(&self) -> Option<&BestLapBenchmark> {
        self.benchmark.as_deref()
    }

    /// Lap currently being timed for a vehicle
    pub fn current_lap(&self, vehicle_id: &str) -> Option<u32> {
        self.timing_laps.lock().get(vehicle_id).copied()
    }

    fn entry(&self, vehicle_id: &str, lap: u32) -> Option<SharedState> {
        self.states
            .read()
            .get(&(vehicle_id.to_string(), lap))
            .cloned()
    }

    /// Previous and new timing lap for a reported lap
    fn advance_timing_lap(&self, vehicle_id: &str, reported_lap: u32) -> (Option<u32>, u32) {
        let mut laps = self.timing_laps.lock();
        match laps.get_mut(vehicle_id) {
            Some(lap) => {
                let previous = *lap;
                *lap = previous.max(reported_lap);
                (Some(previous), *lap)
            }
            None => {
                laps.insert(vehicle_id.to_string(), reported_lap);
                (None, reported_lap)
            }
        }
    }

    fn open_lap(&self, vehicle_id: &str, lap: u32, sector: u8, timestamp_ms: i64) {
        let entry = self
            .states
            .write()
            .entry((vehicle_id.to_string(), lap))
            .or_insert_with(|| Arc::new(Mutex::new(SectorTimingState::new())))
            .clone();
        entry.lock().enter_first_sector(sector, timestamp_ms);
        self.evict(vehicle_id, self.max_laps_retained);
    }

    /// Feed one record. Returns the sector that was exited, if any.
    pub fn update(
        &self,
        vehicle_id: &str,
        reported_lap: u32,
        sector: u8,
        timestamp_ms: i64,
    ) -> Option<SectorCompletion> {
        let (previous_lap, lap) = self.advance_timing_lap(vehicle_id, reported_lap);
        let Some(entry) = self.entry(vehicle_id, lap) else {
            // A new lap key closes whatever sector the previous lap was in
            let closed = previous_lap
                .filter(|previous| *previous != lap)
                .and_then(|previous| self.close_lap(vehicle_id, previous, timestamp_ms));
            self.open_lap(vehicle_id, lap, sector, timestamp_ms);
            return closed;
        };

        let mut state = entry.lock();
        match state.phase {
            SectorPhase::Complete => None,
            SectorPhase::AwaitingFirstSector => {
                state.enter_first_sector(sector, timestamp_ms);
                None
            }
            SectorPhase::Active(current) if current == sector => None,
            SectorPhase::Active(current) => {
                let lap_wrapped = current == 3 && sector == 1;
                let duration_s = state.exit_sector(current, timestamp_ms);
                if lap_wrapped && duration_s.is_none() {
                    // only a partial sector 3 was seen, the lap restarts at S/F
                    state.restart(timestamp_ms);
                    return None;
                } else if lap_wrapped {
                    state.phase = SectorPhase::Complete;
                } else {
                    state.phase = SectorPhase::Active(sector);
                    state.sector_entry_ms = Some(timestamp_ms);
                }
                let lap_complete = state.lap_time_s().is_some();
                drop(state);
                if lap_wrapped {
                    let next_lap = lap.saturating_add(1);
                    self.timing_laps
                        .lock()
                        .insert(vehicle_id.to_string(), next_lap);
                    self.open_lap(vehicle_id, next_lap, 1, timestamp_ms);
                }
                duration_s.map(|d| self.completion(vehicle_id, lap, current, d, lap_complete))
            }
        }
    }

    fn close_lap(&self, vehicle_id: &str, lap: u32, timestamp_ms: i64) -> Option<SectorCompletion> {
        let entry = self.entry(vehicle_id, lap)?;
        let mut state = entry.lock();
        let SectorPhase::Active(current) = state.phase else {
            return None;
        };
        state.phase = SectorPhase::Complete;
        let duration_s = state.exit_sector(current, timestamp_ms)?;
        let lap_complete = state.lap_time_s().is_some();
        drop(state);
        Some(self.completion(vehicle_id, lap, current, duration_s, lap_complete))
    }

    fn completion(
        &self,
        vehicle_id: &str,
        lap: u32,
        sector: u8,
        duration_s: f64,
        lap_complete: bool,
    ) -> SectorCompletion {
        SectorCompletion {
            vehicle_id: vehicle_id.to_string(),
            lap,
            sector,
            duration_s,
            delta: self
                .benchmark
                .as_ref()
                .and_then(|b| b.compare_sector(sector, duration_s)),
            lap_complete,
        }
    }

    pub fn lap_time_s(&self, vehicle_id: &str, lap: u32) -> Option<f64> {
        self.entry(vehicle_id, lap)?.lock().lap_time_s()
    }

    /// Benchmark comparison for every completed sector of a lap
    pub fn sector_deltas(&self, vehicle_id: &str, lap: u32) -> Vec<SectorDelta> {
        let (Some(benchmark), Some(entry)) =
            (self.benchmark.as_ref(), self.entry(vehicle_id, lap))
        else {
            return Vec::new();
        };
        let sector_times_s = entry.lock().sector_times_s;
        sector_times_s
            .iter()
            .zip(1u8..)
            .filter_map(|(time, sector)| benchmark.compare_sector(sector, (*time)?))
            .collect()
    }

    pub fn state(&self, vehicle_id: &str, lap: u32) -> Option<SectorTimingState> {
        self.entry(vehicle_id, lap).map(|s| s.lock().clone())
    }

    /// Keep only the `keep` highest-numbered laps for a vehicle
    pub fn evict(&self, vehicle_id: &str, keep: usize) -> usize {
        let mut states = self.states.write();
        let stale = states
            .keys()
            .filter(|key| key.0 == vehicle_id)
            .map(|key| key.1)
            .sorted_by(|a, b| b.cmp(a))
            .skip(keep)
            .collect_vec();
        let evicted = stale
            .into_iter()
            .filter(|lap| states.remove(&(vehicle_id.to_string(), *lap)).is_some())
            .count();
        drop(states);
        if evicted > 0 {
            debug!("Evicted {} laps of sector timing for {}", evicted, vehicle_id);
        }
        evicted
    }

    pub fn tracked_laps(&self) -> usize {
        self.states.read().len()
    }

    pub fn clear(&self) {
        self.states.write().clear();
        self.timing_laps.lock().clear();
    }
}

impl SectorTimingState {
    fn enter_first_sector(&mut self, sector: u8, timestamp_ms: i64) {
        if self.phase != SectorPhase::AwaitingFirstSector {
            return;
        }
        self.phase = SectorPhase::Active(sector);
        self.lap_start_ms = Some(timestamp_ms);
        self.sector_entry_ms = Some(timestamp_ms);
        if sector != 1 {
            self.started_mid_lap = Some(sector);
        }
    }

    fn restart(&mut self, timestamp_ms: i64) {
        *self = Self::new();
        self.enter_first_sector(1, timestamp_ms);
    }

    /// Record the time spent in `sector`; `None` when the time would be partial
    fn exit_sector(&mut self, sector: u8, timestamp_ms: i64) -> Option<f64> {
        let entry_ms = self.sector_entry_ms?;
        if self.started_mid_lap.take() == Some(sector) {
            return None;
        }
        let duration_s = timestamp_ms.saturating_sub(entry_ms).max(0) as f64 / 1000.0;
        let slot = self.sector_times_s.get_mut(usize::from(sector.checked_sub(1)?))?;
        *slot = Some(duration_s);
        Some(duration_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::DeltaStatus;

    fn benchmark() -> Arc<BestLapBenchmark> {
        Arc::new(BestLapBenchmark::new([30.0, 60.0, 40.0]))
    }

    #[test]
    fn test_full_lap_timing() {
        let tracker = SectorTimingTracker::new(Some(benchmark()), 10);
        assert!(tracker.update("Car1", 1, 1, 0).is_none());
        assert!(tracker.update("Car1", 1, 1, 10_000).is_none());

        let s1 = tracker.update("Car1", 1, 2, 29_500).unwrap();
        assert_eq!(s1.sector, 1);
        assert_eq!(s1.duration_s, 29.5);
        assert_eq!(s1.delta.as_ref().unwrap().status, DeltaStatus::Ahead);
        assert!(!s1.lap_complete);

        let s2 = tracker.update("Car1", 1, 3, 90_000).unwrap();
        assert_eq!(s2.sector, 2);
        assert_eq!(s2.duration_s, 60.5);
        assert_eq!(s2.delta.as_ref().unwrap().status, DeltaStatus::Close);

        // first record of lap 2 closes sector 3 of lap 1
        let s3 = tracker.update("Car1", 2, 1, 132_000).unwrap();
        assert_eq!(s3.lap, 1);
        assert_eq!(s3.sector, 3);
        assert_eq!(s3.duration_s, 42.0);
        assert_eq!(s3.delta.as_ref().unwrap().status, DeltaStatus::Behind);
        assert!(s3.lap_complete);

        assert_eq!(tracker.lap_time_s("Car1", 1), Some(132.0));
        assert_eq!(tracker.sector_deltas("Car1", 1).len(), 3);
        assert_eq!(tracker.state("Car1", 1).unwrap().phase, SectorPhase::Complete);
        assert_eq!(tracker.state("Car1", 2).unwrap().phase, SectorPhase::Active(1));
    }

    #[test]
    fn test_lap_wrap_without_lap_change_completes_lap() {
        let tracker = SectorTimingTracker::new(None, 10);
        tracker.update("Car1", 1, 1, 0);
        tracker.update("Car1", 1, 2, 30_000);
        tracker.update("Car1", 1, 3, 90_000);
        let s3 = tracker.update("Car1", 1, 1, 130_000).unwrap();
        assert_eq!(s3.lap, 1);
        assert_eq!(s3.sector, 3);
        assert!(s3.lap_complete);
        assert!(s3.delta.is_none());
        assert_eq!(tracker.lap_time_s("Car1", 1), Some(130.0));
        assert_eq!(tracker.current_lap("Car1"), Some(2));
        assert_eq!(tracker.state("Car1", 2).unwrap().lap_start_ms, Some(130_000));
    }

    #[test]
    fn test_constant_lap_counter_keeps_timing_laps() {
        let tracker = SectorTimingTracker::new(None, 10);
        let samples = [
            (0, 1),
            (30_000, 2),
            (90_000, 3),
            (130_000, 1),
            (160_000, 2),
            (220_000, 3),
            (260_000, 1),
            (270_000, 1),
        ];
        let crossings: Vec<(u32, u8, f64)> = samples
            .iter()
            .filter_map(|(ts, sector)| tracker.update("Car1", 1, *sector, *ts))
            .map(|c| (c.lap, c.sector, c.duration_s))
            .collect();
        assert_eq!(
            crossings,
            vec![
                (1, 1, 30.0),
                (1, 2, 60.0),
                (1, 3, 40.0),
                (2, 1, 30.0),
                (2, 2, 60.0),
                (2, 3, 40.0),
            ]
        );
        assert_eq!(tracker.lap_time_s("Car1", 2), Some(130.0));
        assert_eq!(tracker.current_lap("Car1"), Some(3));
    }

    #[test]
    fn test_late_lap_increment_times_from_start_finish() {
        let tracker = SectorTimingTracker::new(None, 10);
        tracker.update("Car1", 1, 1, 0);
        tracker.update("Car1", 1, 2, 30_000);
        tracker.update("Car1", 1, 3, 90_000);
        tracker.update("Car1", 1, 1, 130_000);
        // the counter ticks five seconds after the crossing
        assert!(tracker.update("Car1", 2, 1, 135_000).is_none());
        let s1 = tracker.update("Car1", 2, 2, 160_000).unwrap();
        assert_eq!((s1.lap, s1.sector, s1.duration_s), (2, 1, 30.0));
        assert_eq!(tracker.current_lap("Car1"), Some(2));
    }

    #[test]
    fn test_lap_jump_closes_the_lap_being_timed() {
        let tracker = SectorTimingTracker::new(None, 10);
        tracker.update("Car1", 1, 1, 0);
        tracker.update("Car1", 1, 2, 30_000);
        let closed = tracker.update("Car1", 3, 3, 50_000).unwrap();
        assert_eq!((closed.lap, closed.sector, closed.duration_s), (1, 2, 20.0));
        assert_eq!(tracker.current_lap("Car1"), Some(3));
    }

    #[test]
    fn test_lap_time_requires_all_sectors() {
        let tracker = SectorTimingTracker::new(None, 10);
        tracker.update("Car1", 3, 1, 0);
        tracker.update("Car1", 3, 2, 30_000);
        assert_eq!(tracker.lap_time_s("Car1", 3), None);
        assert!(tracker.sector_deltas("Car1", 3).is_empty());
    }

    #[test]
    fn test_partial_first_sector_is_not_timed() {
        let tracker = SectorTimingTracker::new(Some(benchmark()), 10);
        // recording starts in the middle of sector 2
        tracker.update("Car1", 1, 2, 0);
        assert!(tracker.update("Car1", 1, 3, 20_000).is_none());
        let s3 = tracker.update("Car1", 2, 1, 60_000).unwrap();
        assert_eq!(s3.sector, 3);
        assert_eq!(s3.duration_s, 40.0);
        assert!(!s3.lap_complete);
    }

    #[test]
    fn test_early_lap_increment_restarts_at_start_finish() {
        let tracker = SectorTimingTracker::new(None, 10);
        // the lap counter ticked over before S/F
        tracker.update("Car1", 2, 3, 0);
        assert!(tracker.update("Car1", 2, 1, 2_000).is_none());
        assert_eq!(tracker.state("Car1", 2).unwrap().phase, SectorPhase::Active(1));

        tracker.update("Car1", 2, 2, 32_000);
        tracker.update("Car1", 2, 3, 92_000);
        let s3 = tracker.update("Car1", 2, 1, 132_000).unwrap();
        assert!(s3.lap_complete);
        assert_eq!(tracker.lap_time_s("Car1", 2), Some(130.0));
    }

    #[test]
    fn test_eviction_keeps_most_recent_laps() {
        let tracker = SectorTimingTracker::new(None, 3);
        for lap in 1..=6 {
            tracker.update("Car1", lap, 1, i64::from(lap) * 100_000);
        }
        tracker.update("Car2", 1, 1, 0);
        assert_eq!(tracker.tracked_laps(), 4);
        assert!(tracker.state("Car1", 3).is_none());
        assert!(tracker.state("Car1", 4).is_some());
        assert!(tracker.state("Car1", 6).is_some());
        assert!(tracker.state("Car2", 1).is_some());

        assert_eq!(tracker.evict("Car1", 1), 2);
        assert!(tracker.state("Car1", 6).is_some());
    }

    #[test]
    fn test_concurrent_vehicles() {
        let tracker = Arc::new(SectorTimingTracker::new(Some(benchmark()), 10));
        std::thread::scope(|scope| {
            for car in 0..8 {
                let tracker = tracker.clone();
                scope.spawn(move || {
                    let vehicle = format!("Car{}", car);
                    tracker.update(&vehicle, 1, 1, 0);
                    tracker.update(&vehicle, 1, 2, 30_000);
                    tracker.update(&vehicle, 1, 3, 90_000);
                    tracker.update(&vehicle, 2, 1, 130_000);
                });
            }
        });
        assert_eq!(tracker.tracked_laps(), 16);
        for car in 0..8 {
            assert_eq!(tracker.lap_time_s(&format!("Car{}", car), 1), Some(130.0));
        }
    }
}
