//! Error types for the motion_core library.
//!
//! Each component surfaces its own typed error to its direct caller; the
//! crate-wide [`Error`] aggregates them for binaries and glue code.

use crate::channel::ChannelType;
use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for motion_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Time series construction or reconciliation error
    #[error("Series error: {0}")]
    Series(#[from] SeriesError),

    /// Binary codec error
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Neural network configuration or input error
    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    /// Classification error
    #[error("Classification error: {0}")]
    Classify(#[from] ClassifyError),

    /// Chunk reconciliation error
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Model lookup or validation error
    #[error("Model error: {0}")]
    Model(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Failures of [`TimeSeries`](crate::series::TimeSeries) construction and mutation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SeriesError {
    #[error("a time series needs at least one channel type")]
    EmptyChannelTypes,

    #[error("{samples} samples do not fill whole rows of dimension {dimension}")]
    InvalidSampleCount { samples: usize, dimension: usize },

    #[error("sample rate must be at least one sample per second")]
    InvalidSampleRate,

    /// The wire format counts channel types in one byte
    #[error("{count} channel types exceed the limit of {max}")]
    TooManyChannelTypes { count: usize, max: usize },

    /// The wire format counts samples in four bytes
    #[error("{samples} samples exceed the limit of {max}")]
    TooManySamples { samples: usize, max: usize },

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("sample rate mismatch: expected {expected} Hz, got {actual} Hz")]
    RateMismatch { expected: u8, actual: u8 },

    #[error("gap of {gap:.3}s is too long to fill")]
    TooDiscontinuous { gap: f64 },

    /// The appended fragment starts before the first buffered sample
    #[error("fragment overlaps {overlap:.3}s but only {buffered:.3}s are buffered")]
    OvershootOverlap { overlap: f64, buffered: f64 },

    #[error("requested slice is outside the series")]
    SliceOutOfRange,
}

/// Failures of the binary wire format
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("not enough input")]
    NotEnoughInput,

    #[error("bad header")]
    BadHeader,

    #[error("decoded series is invalid: {0}")]
    InvalidSeries(#[from] SeriesError),
}

/// Failures of the forward propagator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InferenceError {
    #[error("layer configuration needs {expected} weights, got {actual}")]
    InvalidWeightsForLayerConfiguration { expected: usize, actual: usize },

    #[error("feature matrix of length {length} is not a non-empty multiple of {input_width}")]
    InvalidFeatureMatrixSize { length: usize, input_width: usize },
}

/// Failures of a single classification call
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClassifyError {
    #[error("none of the required channels {required:?} are present in {received:?}")]
    NoSensorDataType {
        received: Vec<ChannelType>,
        required: Vec<ChannelType>,
    },

    #[error("{received} rows received, at least {required} required")]
    NotEnoughRows { received: usize, required: usize },

    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// Failures while applying a chunk to a session
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReconcileError {
    #[error("session {session_id}: chunk {timestamp} could not be decoded: {source}")]
    Decode {
        session_id: String,
        timestamp: f64,
        source: CodecError,
    },

    #[error("session {session_id}: chunk {timestamp} could not be appended: {source}")]
    Append {
        session_id: String,
        timestamp: f64,
        source: SeriesError,
    },
}

impl ReconcileError {
    /// The session the failing chunk belonged to
    pub fn session_id(&self) -> &str {
        match self {
            ReconcileError::Decode { session_id, .. }
            | ReconcileError::Append { session_id, .. } => session_id,
        }
    }

    /// True when the failure ends the session rather than dropping one chunk
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReconcileError::Append {
                source: SeriesError::OvershootOverlap { .. },
                ..
            }
        )
    }
}
