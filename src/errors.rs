// Error types for trackside

use snafu::Snafu;
use std::io;

#[derive(Debug, Snafu)]
pub enum TracksideError {
    // Errors while reading raw telemetry logs
    #[snafu(display("Unable to open telemetry log {path}"))]
    InputOpenError { path: String, source: io::Error },
    #[snafu(display("Error reading telemetry CSV"))]
    CsvReadError { source: csv::Error },
    #[snafu(display("Row {row} has no timestamp"))]
    MissingTimestamp { row: usize },
    #[snafu(display("Row {row} has an unreadable timestamp: {value}"))]
    InvalidTimestamp { row: usize, value: String },

    // Config management errors
    #[snafu(display("Could not find application config directory"))]
    NoConfigDir,
    #[snafu(display("Error reading or writing config file"))]
    ConfigIOError { source: io::Error },
    #[snafu(display("Error (de)serializing config file"))]
    ConfigSerializeError { source: serde_json::Error },

    // Reference data errors
    #[snafu(display("Could not load lap benchmark: {reason}"))]
    BenchmarkLoadError { reason: String },

    // Replay runtime errors
    #[snafu(display("Could not start the replay runtime"))]
    RuntimeError { source: io::Error },

    // Event delivery errors
    #[snafu(display("Event sink is closed"))]
    SinkClosed,
    #[snafu(display("Error writing event stream"))]
    WriterError { source: io::Error },
}
