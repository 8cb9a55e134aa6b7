//! Detection recorder.
//!
//! Turns a sampled `(count, confidences)` reading into a logged
//! `DetectionEvent`:
//! 1. Normalize the scores, then drop the reading if it repeats the
//!    immediately preceding event
//! 2. Resolve a location (GPS fix, else IP lookup)
//! 3. Derive the working area
//! 4. Append to the bounded event log
//! 5. Forward a detection-log record to the document sinks (best effort)
//!
//! Location lookups and sink writes are network I/O, so the producer hands
//! readings to a `RecorderWorker` thread instead of calling `record` inline.
//! The queue is bounded; readings offered while it is full are dropped and
//! counted.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::event_log::{AppendOutcome, DetectionEvent, EventLog};
use crate::location::{working_area, Location, LocationResolver};
use crate::sink::SinkGateway;

/// Scores recorded for a frame with no detections.
pub const NO_DETECTION_SENTINEL: [f64; 1] = [0.0];

/// Readings the worker queue holds before new ones are dropped.
pub const RECORDER_QUEUE_DEPTH: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    Appended {
        evicted: usize,
        document_id: Option<String>,
    },
    Duplicate,
}

/// Detection-log document as written to the sinks.
#[derive(Serialize)]
struct DetectionLogRecord<'a> {
    detection_count: u32,
    confidence_scores: &'a [f64],
    location: Option<&'a Location>,
    working_area: &'a str,
    detected_at: DateTime<Utc>,
    logged_at: DateTime<Utc>,
    status: &'static str,
    reviewed: bool,
    source: &'static str,
}

impl<'a> DetectionLogRecord<'a> {
    fn new(event: &'a DetectionEvent, logged_at: DateTime<Utc>) -> Self {
        Self {
            detection_count: event.detection_count,
            confidence_scores: &event.confidence_scores,
            location: event.location.as_ref(),
            working_area: &event.working_area,
            detected_at: event.timestamp,
            logged_at,
            status: "new",
            reviewed: false,
            source: "stream",
        }
    }
}

pub struct DetectionRecorder {
    log: Arc<EventLog>,
    resolver: Arc<LocationResolver>,
    sink: Arc<SinkGateway>,
    collection: String,
    client: Option<IpAddr>,
}

impl DetectionRecorder {
    pub fn new(
        log: Arc<EventLog>,
        resolver: Arc<LocationResolver>,
        sink: Arc<SinkGateway>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            log,
            resolver,
            sink,
            collection: collection.into(),
            client: None,
        }
    }

    /// Address of the client the stream is served to, used for IP lookups.
    pub fn with_client(mut self, client: Option<IpAddr>) -> Self {
        self.client = client;
        self
    }

    pub fn record(&self, detection_count: u32, confidence_scores: Vec<f64>) -> RecordOutcome {
        self.record_at(detection_count, confidence_scores, crate::now_utc())
    }

    pub fn record_at(
        &self,
        detection_count: u32,
        confidence_scores: Vec<f64>,
        at: DateTime<Utc>,
    ) -> RecordOutcome {
        let confidence_scores = if detection_count == 0 {
            NO_DETECTION_SENTINEL.to_vec()
        } else {
            normalize_scores(confidence_scores)
        };

        // Cheap early exit before any network lookups; the authoritative
        // check happens again under the log lock.
        if self.log.repeats_latest(detection_count, &confidence_scores) {
            log::debug!("duplicate reading skipped: count={}", detection_count);
            return RecordOutcome::Duplicate;
        }

        let location = self.resolver.resolve_current(self.client);
        let event = DetectionEvent {
            timestamp: at,
            detection_count,
            confidence_scores,
            working_area: working_area(location.as_ref()),
            location,
        };

        let evicted = match self.log.append_unless_duplicate(event.clone()) {
            AppendOutcome::Duplicate => return RecordOutcome::Duplicate,
            AppendOutcome::Appended { evicted } => evicted,
        };
        log::info!(
            "detection logged: count={} area={} evicted={}",
            event.detection_count,
            event.working_area,
            evicted
        );

        let record = DetectionLogRecord::new(&event, crate::now_utc());
        let document_id = self.sink.persist_serialized(&self.collection, &record);
        RecordOutcome::Appended {
            evicted,
            document_id,
        }
    }
}

/// Drop non-finite scores and clamp the rest into [0, 1].
fn normalize_scores(scores: Vec<f64>) -> Vec<f64> {
    scores
        .into_iter()
        .filter(|score| score.is_finite())
        .map(|score| score.clamp(0.0, 1.0))
        .collect()
}

// -------------------- Worker --------------------

struct Sample {
    detection_count: u32,
    confidence_scores: Vec<f64>,
    at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// Queue full; the reading was discarded.
    Dropped,
    /// The worker has exited.
    Closed,
}

/// Sending half used by the frame producer.
#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::SyncSender<Sample>,
    dropped: Arc<AtomicU64>,
}

impl RecorderHandle {
    /// Offer a reading without blocking the producer.
    pub fn submit(&self, detection_count: u32, confidence_scores: Vec<f64>) -> SubmitOutcome {
        let sample = Sample {
            detection_count,
            confidence_scores,
            at: crate::now_utc(),
        };
        match self.tx.try_send(sample) {
            Ok(()) => SubmitOutcome::Queued,
            Err(TrySendError::Full(sample)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!(
                    "recorder queue full, reading dropped: count={} (dropped so far: {})",
                    sample.detection_count,
                    dropped
                );
                SubmitOutcome::Dropped
            }
            Err(TrySendError::Disconnected(_)) => SubmitOutcome::Closed,
        }
    }
}

/// Background thread draining readings into a `DetectionRecorder`.
///
/// The worker exits once every `RecorderHandle` has been dropped and the
/// queue is empty.
pub struct RecorderWorker {
    join: Option<JoinHandle<RecorderStats>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecorderStats {
    pub appended: u64,
    pub duplicates: u64,
    pub dropped: u64,
}

impl RecorderWorker {
    pub fn spawn(recorder: DetectionRecorder) -> Result<(RecorderHandle, RecorderWorker)> {
        Self::spawn_with_depth(recorder, RECORDER_QUEUE_DEPTH)
    }

    pub fn spawn_with_depth(
        recorder: DetectionRecorder,
        depth: usize,
    ) -> Result<(RecorderHandle, RecorderWorker)> {
        let (tx, rx) = mpsc::sync_channel::<Sample>(depth);
        let dropped = Arc::new(AtomicU64::new(0));
        let dropped_thread = dropped.clone();
        let join = std::thread::Builder::new()
            .name("detection-recorder".to_string())
            .spawn(move || {
                let mut stats = RecorderStats::default();
                for sample in rx {
                    match recorder.record_at(
                        sample.detection_count,
                        sample.confidence_scores,
                        sample.at,
                    ) {
                        RecordOutcome::Appended { .. } => stats.appended += 1,
                        RecordOutcome::Duplicate => stats.duplicates += 1,
                    }
                }
                stats.dropped = dropped_thread.load(Ordering::Relaxed);
                stats
            })?;
        Ok((
            RecorderHandle { tx, dropped },
            RecorderWorker { join: Some(join) },
        ))
    }

    /// Wait for the queue to drain. Call after dropping every handle.
    pub fn join(mut self) -> Result<RecorderStats> {
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| anyhow!("detection recorder thread panicked")),
            None => Ok(RecorderStats::default()),
        }
    }
}
