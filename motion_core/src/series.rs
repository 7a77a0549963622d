//! Multi-channel time series.
//!
//! A [`TimeSeries`] is a row-major buffer of `f32` samples. Each row is the
//! concatenation of the values of its channel types, in order, so a series of
//! `[Accelerometer(LeftWrist), HeartRate]` has rows `x, y, z, hr`.
//!
//! Fragments of the same recording arrive separately and are stitched back
//! together with [`TimeSeries::append`], which fills short gaps by linear
//! interpolation and resolves overlaps in favour of the newer fragment.

use crate::channel::{dimension_of, ChannelType};
use crate::error::SeriesError;
use std::borrow::Cow;
use std::ops::Range;

/// Seconds since the UNIX epoch (or since session start, by convention of the caller)
pub type Timestamp = f64;

/// Duration in seconds
pub type Duration = f64;

/// The longest gap [`TimeSeries::append`] will bridge with synthetic rows
pub const MAX_GAP: Duration = 10.0;

/// Most channel types a series may carry
pub const MAX_CHANNEL_TYPES: usize = u8::MAX as usize;

/// Most samples a series may carry
pub const MAX_SAMPLES: usize = u32::MAX as usize;

/// Slack allowed when comparing slice bounds against the series end
const BOUNDS_EPSILON: f64 = 1e-9;

/// Ordered rows of interleaved samples for a fixed list of channel types
#[derive(Clone, Debug, PartialEq)]
pub struct TimeSeries {
    types: Vec<ChannelType>,
    dimension: usize,
    start: Timestamp,
    samples_per_second: u8,
    samples: Vec<f32>,
}

/// Recipe for generated sample values
#[derive(Clone, Copy, Debug)]
pub enum SampleValue {
    /// Every value equals the constant
    Constant(f32),
    /// `sin(row / period)` for every column of the row
    Sine { period: usize },
}

impl TimeSeries {
    /// Create a series, validating the channel list and the sample count
    pub fn new(
        types: Vec<ChannelType>,
        start: Timestamp,
        samples_per_second: u8,
        samples: Vec<f32>,
    ) -> Result<Self, SeriesError> {
        if types.is_empty() {
            return Err(SeriesError::EmptyChannelTypes);
        }
        if types.len() > MAX_CHANNEL_TYPES {
            return Err(SeriesError::TooManyChannelTypes {
                count: types.len(),
                max: MAX_CHANNEL_TYPES,
            });
        }
        if samples_per_second == 0 {
            return Err(SeriesError::InvalidSampleRate);
        }

        let dimension = dimension_of(&types);
        if samples.len() % dimension != 0 {
            return Err(SeriesError::InvalidSampleCount {
                samples: samples.len(),
                dimension,
            });
        }
        check_sample_count(samples.len())?;

        Ok(Self {
            types,
            dimension,
            start,
            samples_per_second,
            samples,
        })
    }

    /// Generate `rows` rows of synthetic data starting at time 0
    pub fn generate(
        types: Vec<ChannelType>,
        samples_per_second: u8,
        rows: usize,
        value: SampleValue,
    ) -> Result<Self, SeriesError> {
        let dimension = dimension_of(&types);
        let samples = (0..rows * dimension)
            .map(|idx| match value {
                SampleValue::Constant(x) => x,
                SampleValue::Sine { period } => {
                    let row = (idx / dimension) as f32;
                    (row / period.max(1) as f32).sin()
                }
            })
            .collect();
        Self::new(types, 0.0, samples_per_second, samples)
    }

    /// Parse comma-separated values (whitespace and newlines allowed) into a series starting at 0
    pub fn from_csv_values(
        types: Vec<ChannelType>,
        samples_per_second: u8,
        text: &str,
    ) -> crate::Result<Self> {
        let samples = text
            .split(|c: char| c == ',' || c == '\n')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<f32>()
                    .map_err(|e| crate::Error::Config(format!("bad sample value {:?}: {}", s, e)))
            })
            .collect::<crate::Result<Vec<f32>>>()?;
        Ok(Self::new(types, 0.0, samples_per_second, samples)?)
    }

    pub fn types(&self) -> &[ChannelType] {
        &self.types
    }

    /// Scalar width of one row
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn samples_per_second(&self) -> u8 {
        self.samples_per_second
    }

    /// The raw row-major sample buffer
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Number of complete rows
    pub fn row_count(&self) -> usize {
        self.samples.len() / self.dimension
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        self.row_count() as f64 / f64::from(self.samples_per_second)
    }

    pub fn end(&self) -> Timestamp {
        self.start + self.duration()
    }

    /// The values of row `index`, if present
    pub fn row(&self, index: usize) -> Option<&[f32]> {
        let from = index.checked_mul(self.dimension)?;
        self.samples.get(from..from + self.dimension)
    }

    /// A new series holding exactly `duration` seconds starting at `offset`
    pub fn slice(&self, offset: Timestamp, duration: Duration) -> Result<Self, SeriesError> {
        if duration < 0.0
            || offset < self.start
            || offset + duration > self.end() + BOUNDS_EPSILON
        {
            return Err(SeriesError::SliceOutOfRange);
        }

        let rate = f64::from(self.samples_per_second);
        let first_row = ((offset - self.start) * rate).round() as usize;
        let rows = (duration * rate).round() as usize;
        if first_row + rows > self.row_count() {
            return Err(SeriesError::SliceOutOfRange);
        }

        let from = first_row * self.dimension;
        let to = from + rows * self.dimension;
        Self::new(
            self.types.clone(),
            offset,
            self.samples_per_second,
            self.samples[from..to].to_vec(),
        )
    }

    /// Column projection onto `types`, returning `(dimension, samples)`
    ///
    /// Columns keep the order in which they are stored in this series. When
    /// `types` is exactly this series' channel list the buffer is borrowed.
    pub fn project(&self, types: &[ChannelType]) -> (usize, Cow<'_, [f32]>) {
        self.project_range(types, 0..self.row_count())
    }

    /// Like [`TimeSeries::project`], restricted to a range of rows
    pub fn project_range(
        &self,
        types: &[ChannelType],
        rows: Range<usize>,
    ) -> (usize, Cow<'_, [f32]>) {
        let rows = rows.start.min(self.row_count())..rows.end.min(self.row_count());
        let rows = rows.start..rows.end.max(rows.start);

        if types == self.types.as_slice() {
            let elements = rows.start * self.dimension..rows.end * self.dimension;
            return (self.dimension, Cow::Borrowed(&self.samples[elements]));
        }

        let mask: Vec<bool> = self
            .types
            .iter()
            .flat_map(|t| std::iter::repeat(types.contains(t)).take(t.width()))
            .collect();
        let included = mask.iter().filter(|&&m| m).count();
        if included == 0 {
            return (0, Cow::Owned(Vec::new()));
        }

        let mut projected = Vec::with_capacity(included * rows.len());
        for row in rows {
            let values = &self.samples[row * self.dimension..(row + 1) * self.dimension];
            projected.extend(
                values
                    .iter()
                    .zip(&mask)
                    .filter_map(|(v, &keep)| keep.then_some(*v)),
            );
        }
        (included, Cow::Owned(projected))
    }

    /// Append `other`, bridging gaps of up to [`MAX_GAP`] seconds
    pub fn append(&mut self, other: &TimeSeries) -> Result<(), SeriesError> {
        self.append_with_max_gap(other, MAX_GAP)
    }

    /// Append `other`, filling gaps and resolving overlaps
    ///
    /// - an exact continuation is concatenated;
    /// - an overlap drops this series' overlapping tail rows and keeps `other`'s;
    /// - a gap is filled with rows linearly interpolated per column between this
    ///   series' last row and `other`'s first row;
    /// - an overlap reaching before this series' first row is rejected with
    ///   [`SeriesError::OvershootOverlap`].
    ///
    /// On error `self` is left unchanged.
    pub fn append_with_max_gap(
        &mut self,
        other: &TimeSeries,
        max_gap: Duration,
    ) -> Result<(), SeriesError> {
        if other.is_empty() {
            return Ok(());
        }
        if self.dimension != other.dimension {
            return Err(SeriesError::DimensionMismatch {
                expected: self.dimension,
                actual: other.dimension,
            });
        }
        if self.samples_per_second != other.samples_per_second {
            return Err(SeriesError::RateMismatch {
                expected: self.samples_per_second,
                actual: other.samples_per_second,
            });
        }
        if self.is_empty() {
            self.start = other.start;
            self.samples = other.samples.clone();
            return Ok(());
        }

        let gap = other.start - self.end();
        if gap > max_gap {
            return Err(SeriesError::TooDiscontinuous { gap });
        }

        let delta_rows = (gap * f64::from(self.samples_per_second)).round() as i64;
        let buffered_rows = self.row_count() as i64;
        if delta_rows >= -buffered_rows {
            let rows = (buffered_rows + delta_rows) as usize + other.row_count();
            check_sample_count(rows * self.dimension)?;
        }

        match delta_rows {
            0 => {
                self.samples.extend_from_slice(&other.samples);
            }
            d if d < 0 && -d < buffered_rows => {
                let keep = (buffered_rows + d) as usize * self.dimension;
                self.samples.truncate(keep);
                self.samples.extend_from_slice(&other.samples);
            }
            d if d < 0 && -d == buffered_rows => {
                self.samples.clear();
                self.samples.extend_from_slice(&other.samples);
            }
            d if d < 0 => {
                return Err(SeriesError::OvershootOverlap {
                    overlap: -gap,
                    buffered: self.duration(),
                });
            }
            d => {
                let filler = d as usize;
                let last = self.samples.len() - self.dimension;
                let mut bridge = Vec::with_capacity(filler * self.dimension);
                for step in 1..=filler {
                    let fraction = step as f32 / (filler + 1) as f32;
                    for col in 0..self.dimension {
                        let from = self.samples[last + col];
                        let to = other.samples[col];
                        bridge.push(from + (to - from) * fraction);
                    }
                }
                tracing::trace!("Bridged {:.3}s gap with {} rows", gap, filler);
                self.samples.extend_from_slice(&bridge);
                self.samples.extend_from_slice(&other.samples);
            }
        }

        Ok(())
    }
}

fn check_sample_count(samples: usize) -> Result<(), SeriesError> {
    if samples > MAX_SAMPLES {
        return Err(SeriesError::TooManySamples {
            samples,
            max: MAX_SAMPLES,
        });
    }
    Ok(())
}
