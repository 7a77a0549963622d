//! Session reconciliation of chunked sensor transfers.
//!
//! The wearable sends a session as a sequence of encoded chunks. Chunks may
//! be re-sent, may overlap or leave gaps, and the last one carries the
//! session's end marker. [`SessionReconciler`] stitches them back into one
//! [`TimeSeries`] per session and reports what happened as
//! [`SessionEvent`]s.
//!
//! Calls must be serialized: appends are order dependent, and the duplicate
//! check relies on seeing every chunk of a session in delivery order.

use crate::codec;
use crate::error::{ReconcileError, SeriesError};
use crate::series::{Duration, TimeSeries, Timestamp, MAX_GAP};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// One transmitted piece of a session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub session_id: String,
    pub model_id: String,
    /// Session start, epoch seconds
    pub start: Timestamp,
    /// Session end, present on the final chunk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Timestamp>,
    /// Send time; unique per chunk within a session
    pub timestamp: Timestamp,
    /// Encoded [`TimeSeries`]
    pub payload: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Announced, no data applied yet
    Pending,
    /// Receiving data
    Active,
    /// Finished and removed from the live set
    Ended,
}

/// Identity of one session instance, carried by every event
#[derive(Clone, Debug, PartialEq)]
pub struct SessionInfo {
    pub id: String,
    pub model_id: String,
    pub start: Timestamp,
    pub end: Option<Timestamp>,
    /// Distinguishes a session id reused after its previous instance ended
    pub instance: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Started {
        session: SessionInfo,
    },
    DataReceived {
        session: SessionInfo,
        /// Everything received so far, including `fragment`
        accumulated: Arc<TimeSeries>,
        fragment: Arc<TimeSeries>,
    },
    Ended {
        session: SessionInfo,
        /// Final buffer; `None` if no data was ever applied
        series: Option<Arc<TimeSeries>>,
    },
}

impl SessionEvent {
    pub fn session(&self) -> &SessionInfo {
        match self {
            SessionEvent::Started { session }
            | SessionEvent::DataReceived { session, .. }
            | SessionEvent::Ended { session, .. } => session,
        }
    }
}

/// What a single chunk caused
///
/// Events produced before a failure are kept, so a chunk can both fail and
/// start or end its session.
#[derive(Debug, Default)]
pub struct ChunkOutcome {
    pub events: Vec<SessionEvent>,
    pub error: Option<ReconcileError>,
}

/// A live session record
#[derive(Debug)]
pub struct Session {
    info: SessionInfo,
    state: SessionState,
    series: Option<Arc<TimeSeries>>,
    applied: HashSet<u64>,
}

impl Session {
    fn new(info: SessionInfo, state: SessionState) -> Self {
        Self {
            info,
            state,
            series: None,
            applied: HashSet::new(),
        }
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Data accumulated so far
    pub fn series(&self) -> Option<&Arc<TimeSeries>> {
        self.series.as_ref()
    }

    /// Number of distinct chunks applied
    pub fn applied_chunks(&self) -> usize {
        self.applied.len()
    }

    /// Stitch `fragment` onto the buffer and return the new buffer
    fn apply(
        &mut self,
        fragment: &Arc<TimeSeries>,
        max_gap: Duration,
    ) -> Result<Arc<TimeSeries>, SeriesError> {
        match &mut self.series {
            None => self.series = Some(Arc::clone(fragment)),
            // Copy-on-write: snapshots handed out earlier are never mutated
            Some(series) => Arc::make_mut(series).append_with_max_gap(fragment, max_gap)?,
        }
        self.state = SessionState::Active;
        Ok(self.series.clone().unwrap_or_else(|| Arc::clone(fragment)))
    }
}

/// Number of ended sessions whose chunk timestamps are remembered
pub const ENDED_HISTORY: usize = 64;

/// Arena of live sessions
#[derive(Debug)]
pub struct SessionReconciler {
    sessions: HashMap<String, Session>,
    /// Applied timestamps of recently ended sessions, so re-sent chunks of a
    /// finished session are not mistaken for a new one
    ended: HashMap<String, HashSet<u64>>,
    ended_order: VecDeque<String>,
    next_instance: u64,
    max_gap: Duration,
}

impl Default for SessionReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionReconciler {
    pub fn new() -> Self {
        Self::with_max_gap(MAX_GAP)
    }

    /// Reconciler bridging gaps of up to `max_gap` seconds
    pub fn with_max_gap(max_gap: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            ended: HashMap::new(),
            ended_order: VecDeque::new(),
            next_instance: 1,
            max_gap,
        }
    }

    pub fn live_sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    fn allocate_instance(&mut self) -> u64 {
        let instance = self.next_instance;
        self.next_instance += 1;
        instance
    }

    fn remember_ended(&mut self, id: &str, applied: HashSet<u64>) {
        if self.ended.insert(id.to_string(), applied).is_none() {
            self.ended_order.push_back(id.to_string());
        }
        while self.ended_order.len() > ENDED_HISTORY {
            if let Some(oldest) = self.ended_order.pop_front() {
                self.ended.remove(&oldest);
            }
        }
    }

    /// Whether `chunk` was already applied to an ended instance of its session
    fn is_ended_duplicate(&self, chunk: &Chunk) -> bool {
        self.ended
            .get(&chunk.session_id)
            .is_some_and(|applied| applied.contains(&chunk.timestamp.to_bits()))
    }

    /// Announce a session before any of its data arrives
    ///
    /// Returns `None` when a session with this id is already live.
    pub fn start_session(
        &mut self,
        id: &str,
        model_id: &str,
        start: Timestamp,
    ) -> Option<SessionEvent> {
        if self.sessions.contains_key(id) {
            tracing::warn!("Session {} is already live, ignoring start signal", id);
            return None;
        }

        let info = SessionInfo {
            id: id.to_string(),
            model_id: model_id.to_string(),
            start,
            end: None,
            instance: self.allocate_instance(),
        };
        tracing::info!("Session {} started (model {})", id, model_id);
        self.sessions
            .insert(id.to_string(), Session::new(info.clone(), SessionState::Pending));
        Some(SessionEvent::Started { session: info })
    }

    /// Apply one chunk
    pub fn receive(&mut self, chunk: Chunk) -> ChunkOutcome {
        let mut outcome = ChunkOutcome::default();
        let max_gap = self.max_gap;

        if !self.sessions.contains_key(&chunk.session_id) {
            if self.is_ended_duplicate(&chunk) {
                tracing::warn!(
                    "Discarding chunk {} re-sent after session {} ended",
                    chunk.timestamp,
                    chunk.session_id
                );
                return outcome;
            }

            let info = SessionInfo {
                id: chunk.session_id.clone(),
                model_id: chunk.model_id.clone(),
                start: chunk.start,
                end: None,
                instance: self.allocate_instance(),
            };
            tracing::info!(
                "Session {} started by its first chunk (model {})",
                chunk.session_id,
                chunk.model_id
            );
            outcome.events.push(SessionEvent::Started {
                session: info.clone(),
            });
            self.sessions
                .insert(chunk.session_id.clone(), Session::new(info, SessionState::Active));
        }

        let session = match self.sessions.get_mut(&chunk.session_id) {
            Some(session) => session,
            None => return outcome,
        };

        if session.info.end.is_none() && chunk.end.is_some() {
            session.info.end = chunk.end;
        }

        if !session.applied.insert(chunk.timestamp.to_bits()) {
            tracing::warn!(
                "Discarding duplicate chunk {} of session {}",
                chunk.timestamp,
                chunk.session_id
            );
            return outcome;
        }

        let mut fatal = false;
        match codec::decode(&chunk.payload) {
            Ok(fragment) => {
                let fragment = Arc::new(fragment);
                match session.apply(&fragment, max_gap) {
                    Ok(accumulated) => {
                        tracing::debug!(
                            "Session {}: applied {:.2}s chunk, {:.2}s accumulated",
                            chunk.session_id,
                            fragment.duration(),
                            accumulated.duration()
                        );
                        outcome.events.push(SessionEvent::DataReceived {
                            session: session.info.clone(),
                            accumulated,
                            fragment,
                        });
                    }
                    Err(source) => {
                        let error = ReconcileError::Append {
                            session_id: chunk.session_id.clone(),
                            timestamp: chunk.timestamp,
                            source,
                        };
                        tracing::warn!("{}", error);
                        fatal = error.is_fatal();
                        outcome.error = Some(error);
                    }
                }
            }
            Err(source) => {
                let error = ReconcileError::Decode {
                    session_id: chunk.session_id.clone(),
                    timestamp: chunk.timestamp,
                    source,
                };
                tracing::warn!("{}", error);
                outcome.error = Some(error);
            }
        }

        if session.info.end.is_some() || fatal {
            if let Some(mut ended) = self.sessions.remove(&chunk.session_id) {
                ended.state = SessionState::Ended;
                tracing::info!(
                    "Session {} ended after {} chunks",
                    chunk.session_id,
                    ended.applied_chunks()
                );
                let applied = std::mem::take(&mut ended.applied);
                self.remember_ended(&chunk.session_id, applied);
                outcome.events.push(SessionEvent::Ended {
                    session: ended.info,
                    series: ended.series,
                });
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelType, Location};

    const ACCEL: ChannelType = ChannelType::Accelerometer(Location::LeftWrist);

    fn accel(start: f64, rows: usize, value: f32) -> TimeSeries {
        TimeSeries::new(vec![ACCEL], start, 1, vec![value; rows * 3]).unwrap()
    }

    fn chunk(timestamp: f64, series: &TimeSeries, end: Option<f64>) -> Chunk {
        Chunk {
            session_id: "1234".into(),
            model_id: "arms".into(),
            start: 1000.0,
            end,
            timestamp,
            payload: codec::encode(series),
        }
    }

    fn kinds(events: &[SessionEvent]) -> Vec<&'static str> {
        events
            .iter()
            .map(|e| match e {
                SessionEvent::Started { .. } => "started",
                SessionEvent::DataReceived { .. } => "data",
                SessionEvent::Ended { .. } => "ended",
            })
            .collect()
    }

    #[test]
    fn test_start_then_last_chunk() {
        let mut reconciler = SessionReconciler::new();
        let started = reconciler.start_session("1234", "arms", 1000.0).unwrap();
        assert_eq!(started.session().model_id, "arms");
        assert_eq!(started.session().start, 1000.0);
        assert_eq!(reconciler.session("1234").unwrap().state(), SessionState::Pending);

        let outcome = reconciler.receive(chunk(0.0, &accel(0.0, 100, 0.0), Some(2000.0)));
        assert!(outcome.error.is_none());
        assert_eq!(kinds(&outcome.events), vec!["data", "ended"]);
        assert!(reconciler.session("1234").is_none());

        match &outcome.events[1] {
            SessionEvent::Ended { session, series } => {
                assert_eq!(session.end, Some(2000.0));
                assert_eq!(series.as_ref().unwrap().row_count(), 100);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_first_chunk_starts_session() {
        let mut reconciler = SessionReconciler::new();
        let outcome = reconciler.receive(chunk(0.0, &accel(0.0, 10, 0.0), None));
        assert_eq!(kinds(&outcome.events), vec!["started", "data"]);
        assert_eq!(reconciler.session("1234").unwrap().state(), SessionState::Active);
        assert_eq!(reconciler.live_sessions().count(), 1);
    }

    #[test]
    fn test_duplicate_chunk_is_ignored() {
        let mut reconciler = SessionReconciler::new();
        let data = accel(0.0, 100, 1.0);

        let first = reconciler.receive(chunk(0.0, &data, None));
        match &first.events[1] {
            SessionEvent::DataReceived { fragment, .. } => assert_eq!(**fragment, data),
            other => panic!("unexpected event {:?}", other),
        }

        let second = reconciler.receive(chunk(0.0, &data, None));
        assert!(second.events.is_empty());
        assert!(second.error.is_none());

        let session = reconciler.session("1234").unwrap();
        assert_eq!(session.series().unwrap().row_count(), 100);
        assert_eq!(session.applied_chunks(), 1);
    }

    #[test]
    fn test_chunks_are_stitched_with_gap_fill() {
        let mut reconciler = SessionReconciler::new();
        reconciler.receive(chunk(1.0, &accel(0.0, 3, 0.0), None));
        let outcome = reconciler.receive(chunk(2.0, &accel(4.0, 2, 2.0), None));

        match &outcome.events[0] {
            SessionEvent::DataReceived {
                accumulated,
                fragment,
                ..
            } => {
                assert_eq!(fragment.row_count(), 2);
                assert_eq!(accumulated.row_count(), 6);
                assert_eq!(accumulated.row(3).unwrap(), &[1.0, 1.0, 1.0]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_snapshots_are_not_mutated_by_later_chunks() {
        let mut reconciler = SessionReconciler::new();
        let first = reconciler.receive(chunk(1.0, &accel(0.0, 3, 0.0), None));
        let snapshot = match &first.events[1] {
            SessionEvent::DataReceived { accumulated, .. } => Arc::clone(accumulated),
            other => panic!("unexpected event {:?}", other),
        };

        reconciler.receive(chunk(2.0, &accel(3.0, 3, 0.0), None));
        assert_eq!(snapshot.row_count(), 3);
        assert_eq!(reconciler.session("1234").unwrap().series().unwrap().row_count(), 6);
    }

    #[test]
    fn test_session_id_reused_after_end_is_new_instance() {
        let mut reconciler = SessionReconciler::new();
        let first = reconciler.receive(chunk(1.0, &accel(0.0, 3, 0.0), Some(1003.0)));
        assert_eq!(kinds(&first.events), vec!["started", "data", "ended"]);

        // a straggler for the same id opens a fresh instance
        let second = reconciler.receive(chunk(0.5, &accel(0.0, 3, 0.0), None));
        assert_eq!(kinds(&second.events), vec!["started", "data"]);
        assert!(second.events[0].session().instance > first.events[0].session().instance);
    }

    #[test]
    fn test_resent_end_chunk_is_ignored() {
        let mut reconciler = SessionReconciler::new();
        reconciler.receive(chunk(1.0, &accel(0.0, 3, 0.0), None));
        let last = chunk(2.0, &accel(3.0, 3, 0.0), Some(1006.0));
        let ended = reconciler.receive(last.clone());
        assert_eq!(kinds(&ended.events), vec!["data", "ended"]);

        for resent in [last, chunk(1.0, &accel(0.0, 3, 0.0), None)] {
            let outcome = reconciler.receive(resent);
            assert!(outcome.events.is_empty());
            assert!(outcome.error.is_none());
        }
        assert_eq!(reconciler.live_sessions().count(), 0);
    }

    #[test]
    fn test_ended_history_is_bounded() {
        let mut reconciler = SessionReconciler::new();
        for n in 0..=ENDED_HISTORY {
            let mut last = chunk(1.0, &accel(0.0, 1, 0.0), Some(1001.0));
            last.session_id = format!("s{}", n);
            reconciler.receive(last);
        }
        assert_eq!(reconciler.ended.len(), ENDED_HISTORY);
        assert!(!reconciler.ended.contains_key("s0"));

        // the oldest session has been forgotten, so its re-send starts over
        let mut resent = chunk(1.0, &accel(0.0, 1, 0.0), None);
        resent.session_id = "s0".into();
        assert_eq!(kinds(&reconciler.receive(resent).events), vec!["started", "data"]);
    }

    #[test]
    fn test_end_marker_is_kept_from_first_sighting() {
        let mut reconciler = SessionReconciler::new();
        reconciler.start_session("1234", "arms", 1000.0);

        let mut broken = chunk(1.0, &accel(0.0, 3, 0.0), Some(1003.0));
        broken.payload.truncate(10);
        let outcome = reconciler.receive(broken);
        assert!(matches!(outcome.error, Some(ReconcileError::Decode { .. })));
        assert_eq!(kinds(&outcome.events), vec!["ended"]);
        assert!(reconciler.session("1234").is_none());
    }

    #[test]
    fn test_undecodable_chunk_keeps_session_alive() {
        let mut reconciler = SessionReconciler::new();
        reconciler.receive(chunk(1.0, &accel(0.0, 3, 0.0), None));

        let mut broken = chunk(2.0, &accel(3.0, 3, 0.0), None);
        broken.payload[0] = 0;
        let outcome = reconciler.receive(broken);
        match outcome.error {
            Some(ReconcileError::Decode { ref session_id, timestamp, .. }) => {
                assert_eq!(session_id, "1234");
                assert_eq!(timestamp, 2.0);
            }
            ref other => panic!("unexpected error {:?}", other),
        }
        assert!(outcome.events.is_empty());

        let next = reconciler.receive(chunk(3.0, &accel(3.0, 3, 0.0), None));
        assert_eq!(kinds(&next.events), vec!["data"]);
    }

    #[test]
    fn test_mismatched_chunk_is_rejected() {
        let mut reconciler = SessionReconciler::new();
        reconciler.receive(chunk(1.0, &accel(0.0, 3, 0.0), None));

        let hr = TimeSeries::new(vec![ChannelType::HeartRate], 3.0, 1, vec![60.0]).unwrap();
        let outcome = reconciler.receive(chunk(2.0, &hr, None));
        let error = outcome.error.unwrap();
        assert!(!error.is_fatal());
        assert!(matches!(
            error,
            ReconcileError::Append {
                source: SeriesError::DimensionMismatch { expected: 3, actual: 1 },
                ..
            }
        ));
        assert_eq!(reconciler.session("1234").unwrap().series().unwrap().row_count(), 3);
    }

    #[test]
    fn test_overshoot_ends_session_with_data_so_far() {
        let mut reconciler = SessionReconciler::new();
        reconciler.receive(chunk(1.0, &accel(10.0, 3, 0.0), None));

        let outcome = reconciler.receive(chunk(2.0, &accel(5.0, 2, 1.0), None));
        assert!(outcome.error.as_ref().unwrap().is_fatal());
        assert_eq!(kinds(&outcome.events), vec!["ended"]);
        match &outcome.events[0] {
            SessionEvent::Ended { series, .. } => {
                assert_eq!(series.as_ref().unwrap().row_count(), 3)
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(reconciler.session("1234").is_none());
    }

    #[test]
    fn test_start_signal_for_live_session_is_ignored() {
        let mut reconciler = SessionReconciler::new();
        assert!(reconciler.start_session("1234", "arms", 1000.0).is_some());
        assert!(reconciler.start_session("1234", "arms", 1000.0).is_none());
        assert_eq!(reconciler.live_sessions().count(), 1);
    }

    #[test]
    fn test_chunk_json() {
        let c = chunk(1.5, &accel(0.0, 1, 0.0), None);
        let json = serde_json::to_string(&c).unwrap();
        assert!(!json.contains("\"end\""));
        assert_eq!(serde_json::from_str::<Chunk>(&json).unwrap(), c);
    }
}
