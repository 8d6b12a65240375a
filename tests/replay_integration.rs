// End to end replay: CSV log -> parser -> scheduler -> channel sink

use std::io::Write;
use std::sync::Arc;

use tempfile::NamedTempFile;
use tokio::sync::mpsc::UnboundedReceiver;
use trackside::playback::LapCompleted;
use trackside::strategy::Urgency;
use trackside::{
    BestLapBenchmark, ChannelSink, JsonLinesSink, PipelineConfig, PlaybackScheduler,
    RecordParser, ReplayEvent, TelemetryRecord,
};

const SAMPLE: &str = "telemetry_samples/car1_three_laps.csv";

fn sample_records(config: &PipelineConfig) -> Vec<TelemetryRecord> {
    RecordParser::from_path(SAMPLE.as_ref(), "Car1", Arc::new(config.track.clone()))
        .expect("Failed to open telemetry sample")
        .with_corrector(config.corrector.clone())
        .collect()
}

fn benchmark_file() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{"lap_time_s": 130.5, "sector_times_s": [30.5, 60.0, 40.0]}}"#
    )
    .unwrap();
    file.flush().unwrap();
    file
}

async fn drain(receiver: &mut UnboundedReceiver<ReplayEvent>) -> Vec<ReplayEvent> {
    let mut events = Vec::new();
    while let Some(event) = receiver.recv().await {
        let done = matches!(event, ReplayEvent::ReplayComplete(_));
        events.push(event);
        if done {
            break;
        }
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_replay_sample_log() {
    let config = PipelineConfig::default();
    let benchmark_file = benchmark_file();
    let benchmark = Arc::new(BestLapBenchmark::from_json_file(benchmark_file.path()).unwrap());
    let records = sample_records(&config);
    let record_count = records.len();

    let (sink, mut receiver) = ChannelSink::new();
    let scheduler = PlaybackScheduler::with_benchmark(&config, Arc::new(sink), Some(benchmark));
    let id = scheduler.start(records, "Car1", 20.0);
    let events = drain(&mut receiver).await;

    let positions = events
        .iter()
        .filter(|e| matches!(e, ReplayEvent::PositionUpdate(_)))
        .count();
    assert_eq!(positions, record_count);

    let laps: Vec<&LapCompleted> = events
        .iter()
        .filter_map(|e| match e {
            ReplayEvent::LapCompleted(lap) => Some(lap),
            _ => None,
        })
        .collect();
    assert_eq!(laps.iter().map(|l| l.lap_number).collect::<Vec<_>>(), vec![1, 2]);
    let lap_1 = laps[0].lap_time_seconds.unwrap();
    let lap_2 = laps[1].lap_time_seconds.unwrap();
    assert!((lap_1 - 131.0).abs() < 1e-6, "lap 1 was {}", lap_1);
    assert!((lap_2 - 131.5).abs() < 1e-6, "lap 2 was {}", lap_2);
    assert!(laps.iter().all(|l| l.deltas.len() == 3));

    let sector_crossings = events
        .iter()
        .filter(|e| matches!(e, ReplayEvent::SectorCrossing(_)))
        .count();
    // three per completed lap plus sectors 1 and 2 of lap 3
    assert_eq!(sector_crossings, 8);

    let cautions = events
        .iter()
        .filter(|e| matches!(e, ReplayEvent::CautionFlag(_)))
        .count();
    assert_eq!(cautions, 1);

    let urgencies: Vec<Urgency> = events
        .iter()
        .filter_map(|e| match e {
            ReplayEvent::PitRecommendation(r) => Some(r.recommendation.urgency),
            _ => None,
        })
        .collect();
    // two lap completions and the caution, too early in the race to pit under it
    assert_eq!(urgencies.len(), 3);
    assert!(!urgencies.contains(&Urgency::Critical));

    match events.last() {
        Some(ReplayEvent::ReplayComplete(complete)) => {
            assert_eq!(complete.session_id, id);
            assert_eq!(complete.records_processed, record_count);
        }
        other => panic!("Expected ReplayComplete, got {:?}", other),
    }
    assert!(scheduler.active_sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_sessions_are_independent() {
    let config = PipelineConfig::default();
    let records = sample_records(&config);
    let (sink, mut receiver) = ChannelSink::new();
    let scheduler = PlaybackScheduler::new(&config, Arc::new(sink));

    let fast = scheduler.start(records.clone(), "Car1", 20.0);
    let slow = scheduler.start(records, "Car1", 10.0);
    assert_eq!(scheduler.active_sessions().len(), 2);
    assert!(scheduler.pause(slow));

    let events = drain(&mut receiver).await;
    match events.last() {
        Some(ReplayEvent::ReplayComplete(complete)) => assert_eq!(complete.session_id, fast),
        other => panic!("Expected ReplayComplete, got {:?}", other),
    }
    let slow_status = scheduler.status(slow).unwrap();
    assert!(!slow_status.is_running);
    assert!(slow_status.records_processed <= 1);

    assert!(scheduler.stop(slow));
    assert!(scheduler.join(slow).await);
    assert!(scheduler.active_sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_replay_to_json_lines_file() {
    let config = PipelineConfig::default();
    let records: Vec<TelemetryRecord> = sample_records(&config).into_iter().take(50).collect();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");

    let sink = Arc::new(JsonLinesSink::create(&path).unwrap());
    let scheduler = PlaybackScheduler::new(&config, sink.clone());
    let id = scheduler.start(records, "Car1", 20.0);
    assert!(scheduler.join(id).await);
    sink.flush().unwrap();

    let events = serde_jsonlines::json_lines::<ReplayEvent, _>(&path)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let positions = events
        .iter()
        .filter(|e| matches!(e, ReplayEvent::PositionUpdate(_)))
        .count();
    assert_eq!(positions, 50);
    assert!(matches!(events.last(), Some(ReplayEvent::ReplayComplete(_))));
}

#[tokio::test(start_paused = true)]
async fn test_stopped_replay_flushes_every_event() {
    let config = PipelineConfig::default();
    let records = sample_records(&config);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");

    let sink = Arc::new(JsonLinesSink::create(&path).unwrap());
    let scheduler = PlaybackScheduler::new(&config, sink.clone());
    let id = scheduler.start(records, "Car1", 20.0);
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    assert!(scheduler.stop(id));
    assert!(scheduler.join(id).await);
    sink.flush().unwrap();

    let events = serde_jsonlines::json_lines::<ReplayEvent, _>(&path)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let positions = events
        .iter()
        .filter(|e| matches!(e, ReplayEvent::PositionUpdate(_)))
        .count();
    // 0.5s between records at 20x
    assert!(positions >= 30, "only {} positions", positions);
    assert!(!events.iter().any(|e| matches!(e, ReplayEvent::ReplayComplete(_))));
    match events.last() {
        Some(ReplayEvent::Status(status)) => {
            assert_eq!(status.session_id, id);
            assert!(!status.is_running);
            assert_eq!(status.records_processed, positions);
        }
        other => panic!("Expected the stop status last, got {:?}", other),
    }
}
