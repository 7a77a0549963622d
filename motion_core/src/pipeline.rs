//! Live classification of incoming sessions.
//!
//! Chunks are reconciled synchronously on the submitting thread. Every new
//! fragment is classified on a pool of worker threads, and a sequencer
//! thread puts worker results back in order so that each session's events
//! reach the consumer as started, data, classified, ..., ended.

use crate::classifier::{Classifier, ClassifierSettings, ExerciseEvent};
use crate::error::{ClassifyError, ReconcileError};
use crate::model::ModelSource;
use crate::reconciler::{Chunk, SessionEvent, SessionInfo, SessionReconciler};
use crate::series::{Duration, TimeSeries, Timestamp, MAX_GAP};
use crate::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Events delivered to the consumer
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    SessionStarted {
        session: SessionInfo,
    },
    DataReceived {
        session: SessionInfo,
        accumulated: Arc<TimeSeries>,
        fragment: Arc<TimeSeries>,
    },
    /// Exercises found in one fragment, offsets relative to the session data start
    Classified {
        session: SessionInfo,
        events: Vec<ExerciseEvent>,
        snapshot: Arc<TimeSeries>,
    },
    SessionEnded {
        session: SessionInfo,
        series: Option<Arc<TimeSeries>>,
    },
}

impl PipelineEvent {
    pub fn session(&self) -> &SessionInfo {
        match self {
            PipelineEvent::SessionStarted { session }
            | PipelineEvent::DataReceived { session, .. }
            | PipelineEvent::Classified { session, .. }
            | PipelineEvent::SessionEnded { session, .. } => session,
        }
    }

    /// Short name used in logs and journals
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::SessionStarted { .. } => "session_started",
            PipelineEvent::DataReceived { .. } => "data_received",
            PipelineEvent::Classified { .. } => "classified",
            PipelineEvent::SessionEnded { .. } => "session_ended",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PipelineSettings {
    /// Classification worker threads
    pub workers: usize,
    /// Candidates considered per window
    pub max_results: usize,
    /// Longest gap bridged between chunks
    pub max_gap: Duration,
    pub classifier: ClassifierSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            max_results: 10,
            max_gap: MAX_GAP,
            classifier: ClassifierSettings::default(),
        }
    }
}

/// A session instance; event sequences are numbered per key
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SessionKey {
    id: String,
    instance: u64,
}

impl SessionKey {
    fn of(session: &SessionInfo) -> Self {
        Self {
            id: session.id.clone(),
            instance: session.instance,
        }
    }
}

/// A numbered place in a session's event stream; `None` releases the place
/// without delivering anything
struct Slot {
    key: SessionKey,
    sequence: u64,
    event: Option<PipelineEvent>,
    last: bool,
}

struct Job {
    key: SessionKey,
    sequence: u64,
    session: SessionInfo,
    accumulated: Arc<TimeSeries>,
    fragment: Arc<TimeSeries>,
}

/// Reconciler plus background classification
pub struct Pipeline {
    reconciler: SessionReconciler,
    sequences: HashMap<SessionKey, u64>,
    jobs: Option<Sender<Job>>,
    slots: Option<Sender<Slot>>,
    workers: Vec<JoinHandle<()>>,
    sequencer: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Start the worker pool and sequencer
    ///
    /// Events are delivered on the returned receiver until [`Pipeline::finish`]
    /// (or drop) has flushed everything in flight.
    pub fn new(
        source: Arc<dyn ModelSource>,
        settings: PipelineSettings,
    ) -> Result<(Self, Receiver<PipelineEvent>)> {
        if settings.workers == 0 {
            return Err(Error::Config("pipeline needs at least one worker".into()));
        }
        if settings.classifier.window_size == 0 || settings.classifier.step == 0 {
            return Err(Error::Config(
                "classifier window size and step must be positive".into(),
            ));
        }

        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
        let (slot_tx, slot_rx) = crossbeam_channel::unbounded::<Slot>();
        let (event_tx, event_rx) = crossbeam_channel::unbounded::<PipelineEvent>();

        let sequencer = std::thread::Builder::new()
            .name("pipeline-sequencer".into())
            .spawn(move || run_sequencer(slot_rx, event_tx))?;

        let mut workers = Vec::with_capacity(settings.workers);
        for n in 0..settings.workers {
            let jobs = job_rx.clone();
            let slots = slot_tx.clone();
            let source = Arc::clone(&source);
            let handle = std::thread::Builder::new()
                .name(format!("pipeline-classify-{}", n))
                .spawn(move || run_worker(jobs, slots, source, settings))?;
            workers.push(handle);
        }
        tracing::info!("Pipeline started with {} classification workers", settings.workers);

        let pipeline = Self {
            reconciler: SessionReconciler::with_max_gap(settings.max_gap),
            sequences: HashMap::new(),
            jobs: Some(job_tx),
            slots: Some(slot_tx),
            workers,
            sequencer: Some(sequencer),
        };
        Ok((pipeline, event_rx))
    }

    pub fn reconciler(&self) -> &SessionReconciler {
        &self.reconciler
    }

    /// Forward an explicit session start signal
    pub fn start_session(&mut self, id: &str, model_id: &str, start: Timestamp) {
        if let Some(event) = self.reconciler.start_session(id, model_id, start) {
            self.dispatch(event);
        }
    }

    /// Reconcile one chunk and schedule classification of its data
    ///
    /// Events are dispatched even when the chunk also reports an error.
    pub fn submit(&mut self, chunk: Chunk) -> std::result::Result<(), ReconcileError> {
        let outcome = self.reconciler.receive(chunk);
        for event in outcome.events {
            self.dispatch(event);
        }
        match outcome.error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Reserve `count` consecutive sequence numbers for a session instance
    fn reserve(&mut self, key: &SessionKey, count: u64) -> u64 {
        let next = self.sequences.entry(key.clone()).or_insert(0);
        let first = *next;
        *next += count;
        first
    }

    fn release(&self, key: SessionKey, sequence: u64, event: Option<PipelineEvent>, last: bool) {
        if let Some(slots) = &self.slots {
            let slot = Slot {
                key,
                sequence,
                event,
                last,
            };
            if slots.send(slot).is_err() {
                tracing::error!("Pipeline sequencer has stopped, dropping event");
            }
        }
    }

    fn dispatch(&mut self, event: SessionEvent) {
        let key = SessionKey::of(event.session());
        match event {
            SessionEvent::Started { session } => {
                let sequence = self.reserve(&key, 1);
                let event = PipelineEvent::SessionStarted { session };
                self.release(key, sequence, Some(event), false);
            }
            SessionEvent::DataReceived {
                session,
                accumulated,
                fragment,
            } => {
                let sequence = self.reserve(&key, 2);
                let job = Job {
                    key: key.clone(),
                    sequence: sequence + 1,
                    session: session.clone(),
                    accumulated: Arc::clone(&accumulated),
                    fragment: Arc::clone(&fragment),
                };
                self.release(
                    key.clone(),
                    sequence,
                    Some(PipelineEvent::DataReceived {
                        session,
                        accumulated,
                        fragment,
                    }),
                    false,
                );

                let queued = self.jobs.as_ref().map(|jobs| jobs.send(job).is_ok());
                if queued != Some(true) {
                    tracing::error!("Classification workers have stopped");
                    self.release(key, sequence + 1, None, false);
                }
            }
            SessionEvent::Ended { session, series } => {
                let sequence = self.reserve(&key, 1);
                self.sequences.remove(&key);
                let event = PipelineEvent::SessionEnded { session, series };
                self.release(key, sequence, Some(event), true);
            }
        }
    }

    /// Stop intake and wait until every event in flight has been delivered
    pub fn finish(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Workers exit once the job queue is closed and drained
        self.jobs.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("Classification worker panicked");
            }
        }

        self.slots.take();
        if let Some(handle) = self.sequencer.take() {
            if handle.join().is_err() {
                tracing::error!("Pipeline sequencer panicked");
            }
            tracing::info!("Pipeline stopped");
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    jobs: Receiver<Job>,
    slots: Sender<Slot>,
    source: Arc<dyn ModelSource>,
    settings: PipelineSettings,
) {
    let mut classifiers: HashMap<String, Classifier> = HashMap::new();
    while let Ok(job) = jobs.recv() {
        // A panic must still release the slot, or the session stalls behind it
        let event = panic::catch_unwind(AssertUnwindSafe(|| {
            classify_job(&job, &mut classifiers, source.as_ref(), &settings)
        }))
        .unwrap_or_else(|_| {
            tracing::error!("Session {}: classification panicked", job.session.id);
            classifiers.clear();
            None
        });
        let slot = Slot {
            key: job.key,
            sequence: job.sequence,
            event,
            last: false,
        };
        if slots.send(slot).is_err() {
            break;
        }
    }
}

fn classify_job(
    job: &Job,
    classifiers: &mut HashMap<String, Classifier>,
    source: &dyn ModelSource,
    settings: &PipelineSettings,
) -> Option<PipelineEvent> {
    let model_id = &job.session.model_id;
    let classifier = match classifiers.entry(model_id.clone()) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => {
            let resolved = source
                .exercise_model(model_id)
                .and_then(|model| Classifier::with_settings(model, settings.classifier));
            match resolved {
                Ok(classifier) => entry.insert(classifier),
                Err(e) => {
                    tracing::error!(
                        "Cannot classify session {}: model {}: {}",
                        job.session.id,
                        model_id,
                        e
                    );
                    return None;
                }
            }
        }
    };

    match classifier.classify(&job.fragment, settings.max_results) {
        Ok(events) => {
            // Fragment offsets are relative to the fragment; move them onto the session
            let shift = job.accumulated.duration() - job.fragment.duration();
            tracing::debug!(
                "Session {}: {} exercises in {:.2}s fragment",
                job.session.id,
                events.len(),
                job.fragment.duration()
            );
            Some(PipelineEvent::Classified {
                session: job.session.clone(),
                events: events.into_iter().map(|e| e.shifted(shift)).collect(),
                snapshot: Arc::clone(&job.accumulated),
            })
        }
        Err(e @ ClassifyError::NotEnoughRows { .. })
        | Err(e @ ClassifyError::NoSensorDataType { .. }) => {
            tracing::debug!("Session {}: fragment not classified: {}", job.session.id, e);
            None
        }
        Err(e) => {
            tracing::warn!("Session {}: classification failed: {}", job.session.id, e);
            None
        }
    }
}

#[derive(Default)]
struct SessionQueue {
    next: u64,
    pending: BTreeMap<u64, Slot>,
}

fn run_sequencer(slots: Receiver<Slot>, output: Sender<PipelineEvent>) {
    let mut queues: HashMap<SessionKey, SessionQueue> = HashMap::new();

    while let Ok(slot) = slots.recv() {
        let key = slot.key.clone();
        let queue = queues.entry(key.clone()).or_default();
        queue.pending.insert(slot.sequence, slot);

        let mut finished = false;
        while let Some(ready) = queue.pending.remove(&queue.next) {
            queue.next += 1;
            finished |= ready.last;
            if let Some(event) = ready.event {
                if output.send(event).is_err() {
                    tracing::trace!("Pipeline consumer has gone away");
                }
            }
        }

        if finished {
            queues.remove(&key);
        }
    }

    for (key, queue) in &queues {
        if !queue.pending.is_empty() {
            tracing::warn!(
                "Session {} stopped with {} undelivered events",
                key.id,
                queue.pending.len()
            );
        }
    }
}
