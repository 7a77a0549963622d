//! Sliding-window exercise classification.
//!
//! A series is projected onto the channels a model needs, cut into
//! overlapping windows, and every window is run through the model's network.
//! Consecutive windows that agree on their best label are merged into
//! segments, and segments shorter than the model's minimum duration are
//! dropped.

use crate::error::{ClassifyError, InferenceError};
use crate::model::ExerciseModel;
use crate::series::{Duration, TimeSeries};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Window geometry and acceptance rules
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClassifierSettings {
    /// Rows per window
    pub window_size: usize,
    /// Rows between the starts of consecutive windows
    pub step: usize,
    /// A prediction must exceed this score to count
    pub threshold: f64,
    /// Largest confidence difference still merged into one segment
    pub merge_tolerance: f64,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            window_size: 400,
            step: 10,
            threshold: 0.7,
            merge_tolerance: 0.1,
        }
    }
}

/// A candidate label for one window or a merged run of windows
#[derive(Clone, Debug, PartialEq)]
pub struct ClassifiedBlock {
    pub confidence: f64,
    pub label: String,
    pub duration: Duration,
    pub offset: Duration,
}

impl ClassifiedBlock {
    fn mergeable(&self, other: &ClassifiedBlock, tolerance: f64) -> bool {
        self.label == other.label && (self.confidence - other.confidence).abs() < tolerance
    }

    /// Absorb `other`, weighting confidences by duration
    fn extend(&mut self, other: &ClassifiedBlock) {
        let total = self.duration + other.duration;
        self.confidence =
            (self.confidence * self.duration + other.confidence * other.duration) / total;
        self.duration = total;
    }
}

/// Candidates of a single window, best first
#[derive(Clone, Debug, PartialEq)]
pub struct ClassifiedWindow {
    pub index: usize,
    pub blocks: Vec<ClassifiedBlock>,
}

impl ClassifiedWindow {
    /// The best candidate above threshold, if any
    pub fn into_top(self) -> Option<ClassifiedBlock> {
        self.blocks.into_iter().next()
    }
}

/// A recognised exercise within a session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExerciseEvent {
    pub confidence: f64,
    pub label: String,
    pub duration: Duration,
    /// Seconds from the start of the classified data
    pub offset: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetitions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

impl ExerciseEvent {
    /// The same event with its offset moved by `by` seconds
    pub fn shifted(self, by: Duration) -> Self {
        Self {
            offset: self.offset + by,
            ..self
        }
    }
}

impl From<ClassifiedBlock> for ExerciseEvent {
    fn from(block: ClassifiedBlock) -> Self {
        Self {
            confidence: block.confidence,
            label: block.label,
            duration: block.duration,
            offset: block.offset,
            repetitions: None,
            intensity: None,
            weight: None,
        }
    }
}

/// Lazy scan over the windows of a projected feature buffer
pub struct WindowScan<'a> {
    model: &'a ExerciseModel,
    features: &'a [f32],
    dimension: usize,
    settings: ClassifierSettings,
    max_results: usize,
    window_duration: Duration,
    next: usize,
    count: usize,
}

impl<'a> WindowScan<'a> {
    fn new(
        model: &'a ExerciseModel,
        features: &'a [f32],
        dimension: usize,
        settings: ClassifierSettings,
        max_results: usize,
        samples_per_second: u8,
    ) -> Self {
        let rows = features.len() / dimension;
        let count = if rows < settings.window_size {
            0
        } else {
            (rows - settings.window_size) / settings.step + 1
        };

        Self {
            model,
            features,
            dimension,
            settings,
            max_results,
            window_duration: settings.step as f64 / f64::from(samples_per_second),
            next: 0,
            count,
        }
    }

    fn classify_window(
        &self,
        index: usize,
    ) -> std::result::Result<ClassifiedWindow, InferenceError> {
        let from = index * self.settings.step * self.dimension;
        let to = from + self.settings.window_size * self.dimension;
        let prediction = self.model.network().predict(&self.features[from..to])?;

        let labels = self.model.labels();
        let scores = &prediction[..labels.len()];
        let mut ranking: Vec<usize> = (0..scores.len()).collect();
        ranking.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

        let offset = self.window_duration * index as f64;
        let blocks = ranking
            .into_iter()
            .take(self.max_results)
            .filter(|&i| f64::from(scores[i]) > self.settings.threshold)
            .map(|i| ClassifiedBlock {
                confidence: f64::from(scores[i]),
                label: labels[i].clone(),
                duration: self.window_duration,
                offset,
            })
            .collect();

        Ok(ClassifiedWindow { index, blocks })
    }
}

impl Iterator for WindowScan<'_> {
    type Item = std::result::Result<ClassifiedWindow, InferenceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.count {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(self.classify_window(index))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.count - self.next;
        (left, Some(left))
    }
}

/// Merge per-window best blocks into segments
///
/// Runs of blocks with the same label and confidences within `tolerance` of
/// the open segment are merged; a different label starts a new segment and
/// a window without a block closes the open one.
pub fn merge_blocks<I>(windows: I, tolerance: f64) -> Vec<ClassifiedBlock>
where
    I: IntoIterator<Item = Option<ClassifiedBlock>>,
{
    let (mut segments, open) = windows.into_iter().fold(
        (Vec::new(), None::<ClassifiedBlock>),
        |(mut segments, open), block| {
            let open = match (open, block) {
                (None, block) => block,
                (Some(mut acc), Some(block)) if acc.mergeable(&block, tolerance) => {
                    acc.extend(&block);
                    Some(acc)
                }
                (Some(acc), block) => {
                    segments.push(acc);
                    block
                }
            };
            (segments, open)
        },
    );
    segments.extend(open);
    segments
}

/// Classifies series against one model
#[derive(Clone, Debug)]
pub struct Classifier {
    model: Arc<ExerciseModel>,
    settings: ClassifierSettings,
}

impl Classifier {
    pub fn new(model: Arc<ExerciseModel>) -> Self {
        Self {
            model,
            settings: ClassifierSettings::default(),
        }
    }

    pub fn with_settings(model: Arc<ExerciseModel>, settings: ClassifierSettings) -> Result<Self> {
        if settings.window_size == 0 || settings.step == 0 {
            return Err(Error::Config(format!(
                "window size and step must be positive, got {} and {}",
                settings.window_size, settings.step
            )));
        }
        Ok(Self { model, settings })
    }

    pub fn model(&self) -> &ExerciseModel {
        &self.model
    }

    pub fn settings(&self) -> &ClassifierSettings {
        &self.settings
    }

    /// Find up to `max_results` labels per window and merge them into events
    ///
    /// Offsets are relative to the start of `series`.
    pub fn classify(
        &self,
        series: &TimeSeries,
        max_results: usize,
    ) -> std::result::Result<Vec<ExerciseEvent>, ClassifyError> {
        let required = self.model.channel_types();
        let (dimension, features) = series.project(required);
        if dimension == 0 {
            return Err(ClassifyError::NoSensorDataType {
                received: series.types().to_vec(),
                required: required.to_vec(),
            });
        }

        let rows = features.len() / dimension;
        if rows < self.settings.window_size {
            return Err(ClassifyError::NotEnoughRows {
                received: rows,
                required: self.settings.window_size,
            });
        }

        let input_width = self.model.network().input_width();
        let window_length = self.settings.window_size * dimension;
        if window_length % input_width != 0 {
            return Err(InferenceError::InvalidFeatureMatrixSize {
                length: window_length,
                input_width,
            }
            .into());
        }

        let scan = WindowScan::new(
            &self.model,
            &features,
            dimension,
            self.settings,
            max_results,
            series.samples_per_second(),
        );
        tracing::debug!(
            "Classifying {} windows of {} rows with model {}",
            scan.size_hint().0,
            self.settings.window_size,
            self.model.id()
        );

        let mut failure = None;
        let best = scan.map_while(|window| match window {
            Ok(window) => Some(window.into_top()),
            Err(e) => {
                failure = Some(e);
                None
            }
        });
        let segments = merge_blocks(best, self.settings.merge_tolerance);
        if let Some(e) = failure {
            return Err(e.into());
        }

        let minimum = self.model.minimum_duration();
        Ok(segments
            .into_iter()
            .filter(|s| s.duration >= minimum)
            .map(ExerciseEvent::from)
            .collect())
    }
}
