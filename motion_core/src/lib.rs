#![forbid(unsafe_code)]

//! Core library for wrist-worn motion sensing and exercise recognition.
//!
//! This crate provides:
//! - Multi-channel sensor time series with gap filling and overlap handling
//! - The binary recording format and CSV export
//! - Neural network inference and sliding-window exercise classification
//! - Reconciliation of chunked session transfers
//! - A threaded classification pipeline with ordered per-session delivery

pub mod channel;
pub mod error;
pub mod series;
pub mod codec;
pub mod csv_export;
pub mod activation;
pub mod inference;
pub mod model;
pub mod classifier;
pub mod reconciler;
pub mod transmitter;
pub mod pipeline;
pub mod journal;
pub mod config;
pub mod logging;

// Re-export commonly used types
pub use error::{Error, Result};
pub use channel::{ChannelType, Location};
pub use series::{SampleValue, TimeSeries};
pub use activation::Activation;
pub use inference::{ForwardPropagator, NetworkConfig};
pub use model::{DirectoryModelSource, ExerciseModel, ModelSource, StaticModelSource};
pub use classifier::{Classifier, ClassifierSettings, ExerciseEvent};
pub use reconciler::{Chunk, SessionEvent, SessionReconciler};
pub use transmitter::SessionTransmitter;
pub use pipeline::{Pipeline, PipelineEvent, PipelineSettings};
pub use journal::{EventSink, JsonlJournal};
pub use config::Config;
