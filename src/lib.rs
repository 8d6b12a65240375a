// Library interface for trackside
// The binary and the integration tests both build on these modules

pub mod config;
pub mod errors;
pub mod playback;
pub mod strategy;
pub mod telemetry;
pub mod timing;
pub mod track;
pub mod writer;

// Re-export commonly used types
pub use config::{PipelineConfig, PlaybackConfig};
pub use errors::TracksideError;
pub use playback::{ChannelSink, EventSink, PlaybackScheduler, ReplayEvent, SessionStatus};
pub use telemetry::{RecordParser, TelemetryRecord};
pub use timing::BestLapBenchmark;
pub use track::{TrackLayout, TrackPosition, TrackPositionMapper};
pub use writer::JsonLinesSink;
