//! Wearable side of the chunk transfer protocol.
//!
//! Used by replay tooling and tests to produce the same chunk stream a
//! watch would send for a recorded session.

use crate::codec;
use crate::error::SeriesError;
use crate::reconciler::Chunk;
use crate::series::{Duration, TimeSeries, Timestamp};
use uuid::Uuid;

/// Default length of one transmitted chunk
pub const DEFAULT_CHUNK_SECONDS: Duration = 5.0;

/// Splits a recorded session into transmittable chunks
#[derive(Clone, Debug)]
pub struct SessionTransmitter {
    session_id: String,
    model_id: String,
    start: Timestamp,
    chunk_seconds: Duration,
}

impl SessionTransmitter {
    /// A transmitter for a new session with a random id
    pub fn new(model_id: impl Into<String>, start: Timestamp) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            model_id: model_id.into(),
            start,
            chunk_seconds: DEFAULT_CHUNK_SECONDS,
        }
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = id.into();
        self
    }

    pub fn with_chunk_seconds(mut self, seconds: Duration) -> Self {
        self.chunk_seconds = seconds;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// Cut `series` into chunks of `chunk_seconds` (at least one row each)
    ///
    /// Chunk timestamps increase strictly; the last chunk carries the end
    /// marker. An empty series still yields one (empty) final chunk so the
    /// receiving side sees the session end.
    pub fn chunks(&self, series: &TimeSeries) -> Result<Vec<Chunk>, SeriesError> {
        let rate = f64::from(series.samples_per_second());
        let rows_per_chunk = ((self.chunk_seconds * rate).round() as usize).max(1);
        let dimension = series.dimension();
        let end = self.start + series.end();

        let pieces: Vec<&[f32]> = if series.is_empty() {
            vec![series.samples()]
        } else {
            series.samples().chunks(rows_per_chunk * dimension).collect()
        };
        let last = pieces.len() - 1;

        let mut first_row = 0;
        let mut chunks = Vec::with_capacity(pieces.len());
        for (i, samples) in pieces.into_iter().enumerate() {
            let fragment = TimeSeries::new(
                series.types().to_vec(),
                series.start() + first_row as f64 / rate,
                series.samples_per_second(),
                samples.to_vec(),
            )?;
            first_row += samples.len() / dimension;

            chunks.push(Chunk {
                session_id: self.session_id.clone(),
                model_id: self.model_id.clone(),
                start: self.start,
                end: (i == last).then_some(end),
                timestamp: self.start + fragment.end(),
                payload: codec::encode(&fragment),
            });
        }

        tracing::debug!(
            "Split session {} into {} chunks of {} rows",
            self.session_id,
            chunks.len(),
            rows_per_chunk
        );
        Ok(chunks)
    }
}
