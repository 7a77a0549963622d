//! Event journal for pipeline output.
//!
//! Pipeline events are appended to a JSONL (JSON Lines) file with file
//! locking so that several processes can share one journal. Sensor data is
//! summarised (row count and duration); recognised exercises are stored in
//! full.

use crate::classifier::ExerciseEvent;
use crate::pipeline::PipelineEvent;
use crate::series::{Duration, TimeSeries};
use crate::Result;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Consumer of pipeline events
pub trait EventSink {
    fn record(&mut self, event: &PipelineEvent) -> Result<()>;
}

/// One journal line
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JournalEntry {
    pub recorded_at: DateTime<Utc>,
    pub session_id: String,
    pub instance: u64,
    pub model_id: String,
    pub kind: String,
    /// Rows of the data the event refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<ExerciseEvent>,
}

impl JournalEntry {
    pub fn from_event(event: &PipelineEvent, recorded_at: DateTime<Utc>) -> Self {
        let session = event.session();
        let none: &[ExerciseEvent] = &[];
        let (data, events) = match event {
            PipelineEvent::SessionStarted { .. } => (None, none),
            PipelineEvent::DataReceived { fragment, .. } => (Some(fragment.as_ref()), none),
            PipelineEvent::Classified {
                events, snapshot, ..
            } => (Some(snapshot.as_ref()), events.as_slice()),
            PipelineEvent::SessionEnded { series, .. } => (series.as_deref(), none),
        };

        Self {
            recorded_at,
            session_id: session.id.clone(),
            instance: session.instance,
            model_id: session.model_id.clone(),
            kind: event.kind().to_string(),
            rows: data.map(TimeSeries::row_count),
            duration: data.map(TimeSeries::duration),
            events: events.to_vec(),
        }
    }
}

/// JSONL journal with file locking
pub struct JsonlJournal {
    path: PathBuf,
}

impl JsonlJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl EventSink for JsonlJournal {
    fn record(&mut self, event: &PipelineEvent) -> Result<()> {
        self.ensure_parent_dir()?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;

        let entry = JournalEntry::from_event(event, Utc::now());
        let mut writer = std::io::BufWriter::new(&file);
        let line = serde_json::to_string(&entry)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        drop(writer);

        file.unlock()?;

        tracing::debug!("Journaled {} for session {}", entry.kind, entry.session_id);
        Ok(())
    }
}

/// Read all entries of a journal, skipping lines that do not parse
pub fn read_journal(path: &Path) -> Result<Vec<JournalEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    file.lock_shared()?;

    let reader = BufReader::new(&file);
    let mut entries = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<JournalEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::warn!("Failed to parse journal entry at line {}: {}", line_num + 1, e);
            }
        }
    }

    file.unlock()?;
    tracing::debug!("Read {} journal entries", entries.len());
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelType;
    use crate::reconciler::SessionInfo;
    use std::sync::Arc;

    fn session() -> SessionInfo {
        SessionInfo {
            id: "1234".into(),
            model_id: "arms".into(),
            start: 1000.0,
            end: None,
            instance: 3,
        }
    }

    fn series(rows: usize) -> Arc<TimeSeries> {
        Arc::new(TimeSeries::new(vec![ChannelType::HeartRate], 0.0, 50, vec![0.0; rows]).unwrap())
    }

    fn classified() -> PipelineEvent {
        PipelineEvent::Classified {
            session: session(),
            events: vec![ExerciseEvent {
                confidence: 0.9,
                label: "curl".into(),
                duration: 12.0,
                offset: 4.0,
                repetitions: None,
                intensity: None,
                weight: None,
            }],
            snapshot: series(100),
        }
    }

    #[test]
    fn test_entry_summaries() {
        let now = Utc::now();
        let started =
            JournalEntry::from_event(&PipelineEvent::SessionStarted { session: session() }, now);
        assert_eq!(started.kind, "session_started");
        assert_eq!(started.rows, None);

        let entry = JournalEntry::from_event(&classified(), now);
        assert_eq!(entry.kind, "classified");
        assert_eq!(entry.instance, 3);
        assert_eq!(entry.rows, Some(100));
        assert_eq!(entry.duration, Some(2.0));
        assert_eq!(entry.events[0].label, "curl");

        let ended = JournalEntry::from_event(
            &PipelineEvent::SessionEnded {
                session: session(),
                series: None,
            },
            now,
        );
        assert_eq!(ended.rows, None);
    }

    #[test]
    fn test_record_and_read() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("journal").join("events.jsonl");

        let mut journal = JsonlJournal::new(&path);
        journal
            .record(&PipelineEvent::SessionStarted { session: session() })
            .unwrap();
        journal.record(&classified()).unwrap();

        let entries = read_journal(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, "session_started");
        assert_eq!(entries[1].events.len(), 1);
        assert_eq!(entries[1].events[0].offset, 4.0);
    }

    #[test]
    fn test_read_skips_corrupt_lines() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("events.jsonl");

        let mut journal = JsonlJournal::new(&path);
        journal.record(&classified()).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"{\"truncated\": \n\n").unwrap();
        }
        journal.record(&classified()).unwrap();

        assert_eq!(read_journal(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_read_missing_journal() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(read_journal(&temp_dir.path().join("none.jsonl")).unwrap().is_empty());
    }
}
