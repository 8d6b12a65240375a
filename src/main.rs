use std::{path::Path, path::PathBuf, sync::Arc};

use clap::{Args as ClapArgs, Parser, Subcommand};
use log::{LevelFilter, error, info, warn};
use tokio_util::sync::CancellationToken;
use trackside::{
    BestLapBenchmark, EventSink, JsonLinesSink, PipelineConfig, PlaybackScheduler, RecordParser,
    TracksideError,
    timing::{SectorTimingState, SectorTimingTracker},
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(ClapArgs, Debug)]
struct InputArgs {
    /// Telemetry log in CSV format
    #[arg(short, long)]
    input: PathBuf,

    #[arg(long)]
    vehicle: String,

    /// Pipeline config JSON, defaults to the local config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Best lap and sector times JSON
    #[arg(short, long)]
    benchmark: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a log at a chosen speed, printing or writing every event
    Replay {
        #[command(flatten)]
        input: InputArgs,

        #[arg(short, long, default_value_t = 1.0)]
        speed: f64,

        /// Write events to this JSON lines file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long)]
        track_temp: Option<f64>,

        #[arg(long)]
        race_laps: Option<u32>,
    },
    /// Parse a log and print lap, sector and lap counter diagnostics
    Inspect {
        #[command(flatten)]
        input: InputArgs,
    },
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig, TracksideError> {
    match path {
        Some(path) => PipelineConfig::from_file(path),
        None => Ok(PipelineConfig::from_local_file()?.unwrap_or_default()),
    }
}

fn load_benchmark(path: Option<&Path>) -> Result<Option<Arc<BestLapBenchmark>>, TracksideError> {
    path.map(|p| BestLapBenchmark::from_json_file(p).map(Arc::new))
        .transpose()
}

fn load_records(
    input: &InputArgs,
    config: &PipelineConfig,
) -> Result<Vec<trackside::TelemetryRecord>, TracksideError> {
    let parser = RecordParser::from_path(
        &input.input,
        &input.vehicle,
        Arc::new(config.track.clone()),
    )?
    .with_config(config.parser.clone())
    .with_corrector(config.corrector.clone());
    Ok(parser.collect())
}

fn replay(
    input: &InputArgs,
    speed: f64,
    output: Option<&Path>,
    track_temp: Option<f64>,
    race_laps: Option<u32>,
    interrupted: &CancellationToken,
) -> Result<(), TracksideError> {
    let mut config = load_config(input.config.as_deref())?;
    if let Some(track_temp) = track_temp {
        config.strategy.track_temperature_c = track_temp;
    }
    if let Some(race_laps) = race_laps {
        config.strategy.total_race_laps = race_laps;
    }
    let benchmark = load_benchmark(input.benchmark.as_deref())?;
    let records = load_records(input, &config)?;
    if records.is_empty() {
        warn!("No records for {} in {:?}", input.vehicle, input.input);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| TracksideError::RuntimeError { source: e })?;

    match output {
        Some(output) => {
            let sink = Arc::new(JsonLinesSink::create(output)?);
            runtime.block_on(run_replay(
                &config,
                sink.clone(),
                benchmark,
                records,
                &input.vehicle,
                speed,
                interrupted,
            ));
            sink.flush()?;
            info!("Events written to {:?}", output);
        }
        None => {
            let sink = Arc::new(JsonLinesSink::new(std::io::stdout()));
            runtime.block_on(run_replay(
                &config,
                sink.clone(),
                benchmark,
                records,
                &input.vehicle,
                speed,
                interrupted,
            ));
            sink.flush()?;
        }
    }
    Ok(())
}

async fn run_replay(
    config: &PipelineConfig,
    sink: Arc<dyn EventSink>,
    benchmark: Option<Arc<BestLapBenchmark>>,
    records: Vec<trackside::TelemetryRecord>,
    vehicle_id: &str,
    speed: f64,
    interrupted: &CancellationToken,
) {
    let scheduler = Arc::new(PlaybackScheduler::with_benchmark(config, sink, benchmark));
    let id = scheduler.start(records, vehicle_id, speed);
    // stop the session on Ctrl-C so the loop exits and the sink can be flushed
    let stopper = {
        let scheduler = scheduler.clone();
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            interrupted.cancelled().await;
            warn!("Interrupted, stopping replay {}", id);
            scheduler.stop(id);
        })
    };
    scheduler.join(id).await;
    stopper.abort();
}

fn format_time(time_s: Option<f64>) -> String {
    time_s
        .map(|t| format!("{:>8.3}", t))
        .unwrap_or_else(|| format!("{:>8}", "-"))
}

fn print_lap(lap: u32, state: &SectorTimingState) {
    let [s1, s2, s3] = state.sector_times_s;
    println!(
        "Lap {:>3}  {}  S1 {}  S2 {}  S3 {}",
        lap,
        format_time(state.lap_time_s()),
        format_time(s1),
        format_time(s2),
        format_time(s3)
    );
}

fn inspect(input: &InputArgs, interrupted: &CancellationToken) -> Result<(), TracksideError> {
    let config = load_config(input.config.as_deref())?;
    let benchmark = load_benchmark(input.benchmark.as_deref())?;
    let mut parser = RecordParser::from_path(
        &input.input,
        &input.vehicle,
        Arc::new(config.track.clone()),
    )?
    .with_config(config.parser.clone())
    .with_corrector(config.corrector.clone());
    let tracker = SectorTimingTracker::new(benchmark, config.playback.max_laps_retained);

    for record in parser.by_ref() {
        if interrupted.is_cancelled() {
            warn!("Interrupted, diagnostics cover the rows read so far");
            break;
        }
        let previous_lap = tracker.current_lap(&record.vehicle_id);
        tracker.update(&record.vehicle_id, record.lap, record.sector, record.timestamp_ms);
        let timing_lap = tracker.current_lap(&record.vehicle_id);
        if let Some(lap) = previous_lap.filter(|lap| timing_lap > Some(*lap)) {
            if let Some(state) = tracker.state(&input.vehicle, lap) {
                print_lap(lap, &state);
            }
        }
    }
    // the last lap is usually partial
    if let Some(lap) = tracker.current_lap(&input.vehicle) {
        if let Some(state) = tracker.state(&input.vehicle, lap) {
            print_lap(lap, &state);
        }
    }

    let diagnostics = parser.diagnostics();
    match serde_json::to_string_pretty(&diagnostics) {
        Ok(json) => println!("{}", json),
        Err(e) => warn!("Could not format diagnostics: {}", e),
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    colog::default_builder().filter_level(level).init();
}

fn main() {
    let cli = Args::parse();
    init_logging(cli.verbose);

    // the first Ctrl-C lets the command wind down, a second one exits
    let interrupted = CancellationToken::new();
    let handler_token = interrupted.clone();
    ctrlc::set_handler(move || {
        if handler_token.is_cancelled() {
            std::process::exit(0);
        }
        println!("Exiting...");
        handler_token.cancel();
    })
    .expect("Could not set Ctrl-C handler");

    let result = match &cli.command {
        Commands::Replay {
            input,
            speed,
            output,
            track_temp,
            race_laps,
        } => replay(
            input,
            *speed,
            output.as_deref(),
            *track_temp,
            *race_laps,
            &interrupted,
        ),
        Commands::Inspect { input } => inspect(input, &interrupted),
    };
    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}
