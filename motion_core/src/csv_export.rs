//! CSV export of recordings for offline inspection and training.
//!
//! One line per sample row: every channel value, then the
//! `label,intensity,weight,repetitions` quadruple of the labelled exercise
//! covering that row (all four empty when no label covers it).

use crate::series::{TimeSeries, Timestamp};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// A span of a session explicitly labelled with an exercise
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LabelledExercise {
    pub label: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub repetitions: u32,
    /// Intensity in 0..1
    pub intensity: f64,
    /// Weight in kg
    pub weight: f64,
}

impl LabelledExercise {
    fn covers(&self, at: Timestamp) -> bool {
        epoch_seconds(&self.start) <= at && at < epoch_seconds(&self.end)
    }
}

fn epoch_seconds(t: &DateTime<Utc>) -> f64 {
    t.timestamp_millis() as f64 / 1000.0
}

/// Format a value the way the offline tooling expects (`0.0`, `8.0`, `0.8`)
fn format_value<T: std::fmt::Debug>(value: T) -> String {
    format!("{:?}", value)
}

/// Write `series` as CSV rows into `writer`
///
/// `session_start` is added to the series start to place each row on the
/// same clock as the labels.
pub fn write_csv<W: Write>(
    writer: W,
    series: &TimeSeries,
    session_start: Timestamp,
    labels: &[LabelledExercise],
) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);

    let rate = f64::from(series.samples_per_second());
    let mut record: Vec<String> = Vec::with_capacity(series.dimension() + 4);

    for row in 0..series.row_count() {
        record.clear();
        if let Some(values) = series.row(row) {
            record.extend(values.iter().map(|v| format_value(*v)));
        }

        let at = session_start + series.start() + row as f64 / rate;
        match labels.iter().find(|l| l.covers(at)) {
            Some(label) => {
                record.push(label.label.clone());
                record.push(format_value(label.intensity));
                record.push(format_value(label.weight));
                record.push(label.repetitions.to_string());
            }
            None => record.extend(std::iter::repeat(String::new()).take(4)),
        }

        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(())
}

/// Render `series` as a CSV string
pub fn encode_csv(
    series: &TimeSeries,
    session_start: Timestamp,
    labels: &[LabelledExercise],
) -> Result<String> {
    let mut buffer = Vec::new();
    write_csv(&mut buffer, series, session_start, labels)?;
    String::from_utf8(buffer).map_err(|e| crate::Error::Other(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelType, Location};
    use chrono::TimeZone;

    fn accel_zeros(rows: usize) -> TimeSeries {
        TimeSeries::new(
            vec![ChannelType::Accelerometer(Location::LeftWrist)],
            0.0,
            1,
            vec![0.0; rows * 3],
        )
        .unwrap()
    }

    fn label(name: &str, from: i64, to: i64, intensity: f64, weight: f64) -> LabelledExercise {
        LabelledExercise {
            label: name.into(),
            start: Utc.timestamp_opt(from, 0).unwrap(),
            end: Utc.timestamp_opt(to, 0).unwrap(),
            repetitions: 10,
            intensity,
            weight,
        }
    }

    #[test]
    fn test_encode_no_labels() {
        let csv = encode_csv(&accel_zeros(2), 0.0, &[]).unwrap();
        assert_eq!(csv, "0.0,0.0,0.0,,,,\n0.0,0.0,0.0,,,,\n");
    }

    #[test]
    fn test_encode_with_labels() {
        let labels = vec![label("bc", 0, 1, 0.8, 8.0), label("te", 2, 3, 0.9, 9.0)];
        let csv = encode_csv(&accel_zeros(3), 0.0, &labels).unwrap();
        assert_eq!(
            csv,
            "0.0,0.0,0.0,bc,0.8,8.0,10\n0.0,0.0,0.0,,,,\n0.0,0.0,0.0,te,0.9,9.0,10\n"
        );
    }

    #[test]
    fn test_session_start_shifts_rows() {
        let labels = vec![label("sq", 100, 101, 0.5, 20.0)];
        let csv = encode_csv(&accel_zeros(2), 99.0, &labels).unwrap();
        assert_eq!(csv, "0.0,0.0,0.0,,,,\n0.0,0.0,0.0,sq,0.5,20.0,10\n");
    }

    #[test]
    fn test_labels_load_from_json() {
        let json = r#"[{"label":"bc","start":"1970-01-01T00:00:00Z","end":"1970-01-01T00:00:01Z",
            "repetitions":10,"intensity":0.8,"weight":8.0}]"#;
        let labels: Vec<LabelledExercise> = serde_json::from_str(json).unwrap();
        assert_eq!(labels[0], label("bc", 0, 1, 0.8, 8.0));
    }
}
