use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use parking_lot::Mutex;
use serde_jsonlines::JsonLinesWriter;

use crate::{
    errors::TracksideError,
    playback::{EventSink, ReplayEvent},
};

/// Writes every replay event as one JSON object per line
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<JsonLinesWriter<W>>,
}

impl JsonLinesSink<BufWriter<File>> {
    pub fn create(file: &Path) -> Result<Self, TracksideError> {
        let events_file = File::create(file).map_err(|e| TracksideError::WriterError { source: e })?;
        Ok(Self::new(BufWriter::new(events_file)))
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(JsonLinesWriter::new(writer)),
        }
    }

    pub fn flush(&self) -> Result<(), TracksideError> {
        self.writer
            .lock()
            .flush()
            .map_err(|e| TracksideError::WriterError { source: e })
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner().into_inner()
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn publish(&self, event: ReplayEvent) -> Result<(), TracksideError> {
        self.writer
            .lock()
            .write(&event)
            .map_err(|e| TracksideError::WriterError { source: e })
    }
}
