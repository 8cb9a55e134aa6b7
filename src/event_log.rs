//! Bounded detection event history.
//!
//! - `DetectionEvent`: one sampled detection outcome, immutable once logged.
//! - `EventLog`: FIFO ring of the most recent events, shared between the
//!   recorder (writer), the report scheduler and on-demand queries (readers).
//!
//! Insertion order is time order. Readers take a cloned snapshot, so a report
//! never observes a half-applied append.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use crate::location::Location;

/// Default maximum number of retained events.
pub const DEFAULT_LOG_CAPACITY: usize = 100;

/// One observed frame-level detection outcome.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DetectionEvent {
    pub timestamp: DateTime<Utc>,
    /// Objects detected in the sampled frame. 0 is the "no detection" sentinel.
    pub detection_count: u32,
    pub confidence_scores: Vec<f64>,
    pub location: Option<Location>,
    pub working_area: String,
}

impl DetectionEvent {
    /// Same reading as `count`/`scores`, compared by value.
    pub fn same_reading(&self, count: u32, scores: &[f64]) -> bool {
        self.detection_count == count && self.confidence_scores == scores
    }

    /// Mean of the finite confidence scores, 0 when there are none.
    pub fn average_confidence(&self) -> f64 {
        let finite: Vec<f64> = self
            .confidence_scores
            .iter()
            .copied()
            .filter(|score| score.is_finite())
            .collect();
        if finite.is_empty() {
            0.0
        } else {
            finite.iter().sum::<f64>() / finite.len() as f64
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended { evicted: usize },
    /// Identical to the immediately preceding event; nothing was stored.
    Duplicate,
}

/// Bounded FIFO event log.
#[derive(Debug)]
pub struct EventLog {
    events: Mutex<VecDeque<DetectionEvent>>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True when `count`/`scores` repeats the most recent event.
    pub fn repeats_latest(&self, count: u32, scores: &[f64]) -> bool {
        self.lock()
            .back()
            .is_some_and(|latest| latest.same_reading(count, scores))
    }

    /// Append `event` unless it repeats the most recent one. Evicts the oldest
    /// entries once the capacity is exceeded.
    pub fn append_unless_duplicate(&self, event: DetectionEvent) -> AppendOutcome {
        let mut events = self.lock();
        if events
            .back()
            .is_some_and(|latest| latest.same_reading(event.detection_count, &event.confidence_scores))
        {
            return AppendOutcome::Duplicate;
        }
        events.push_back(event);
        let mut evicted = 0;
        while events.len() > self.capacity {
            events.pop_front();
            evicted += 1;
        }
        AppendOutcome::Appended { evicted }
    }

    /// Copy of the log, oldest first.
    pub fn snapshot(&self) -> Vec<DetectionEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<DetectionEvent> {
        self.lock().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // Appends are applied in one step under the lock, so a poisoned guard
    // still protects a consistent log.
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<DetectionEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(count: u32, scores: &[f64]) -> DetectionEvent {
        DetectionEvent {
            timestamp: crate::now_utc(),
            detection_count: count,
            confidence_scores: scores.to_vec(),
            location: None,
            working_area: "Unknown".to_string(),
        }
    }

    #[test]
    fn log_never_exceeds_capacity_and_keeps_newest() {
        let log = EventLog::new(3);
        let mut evicted_total = 0;
        for i in 1..=7u32 {
            match log.append_unless_duplicate(event(i, &[0.5])) {
                AppendOutcome::Appended { evicted } => evicted_total += evicted,
                AppendOutcome::Duplicate => panic!("distinct payloads must not dedup"),
            }
            assert!(log.len() <= 3);
        }
        assert_eq!(evicted_total, 4);
        let counts: Vec<u32> = log.snapshot().iter().map(|e| e.detection_count).collect();
        assert_eq!(counts, vec![5, 6, 7]);
    }

    #[test]
    fn consecutive_duplicates_are_dropped() {
        let log = EventLog::new(10);
        assert_eq!(
            log.append_unless_duplicate(event(2, &[0.9, 0.8])),
            AppendOutcome::Appended { evicted: 0 }
        );
        assert_eq!(
            log.append_unless_duplicate(event(2, &[0.9, 0.8])),
            AppendOutcome::Duplicate
        );
        assert_eq!(
            log.append_unless_duplicate(event(2, &[0.9, 0.7])),
            AppendOutcome::Appended { evicted: 0 }
        );
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn alternating_readings_are_not_deduplicated() {
        let log = EventLog::new(10);
        for _ in 0..2 {
            log.append_unless_duplicate(event(1, &[0.4]));
            log.append_unless_duplicate(event(3, &[0.6, 0.6, 0.6]));
        }
        assert_eq!(log.len(), 4);
        assert!(log.repeats_latest(3, &[0.6, 0.6, 0.6]));
        assert!(!log.repeats_latest(1, &[0.4]));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let log = EventLog::new(0);
        assert_eq!(log.capacity(), 1);
        log.append_unless_duplicate(event(1, &[0.1]));
        log.append_unless_duplicate(event(2, &[0.2]));
        assert_eq!(log.latest().unwrap().detection_count, 2);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn average_ignores_non_finite_scores() {
        assert_eq!(event(0, &[]).average_confidence(), 0.0);
        let avg = event(2, &[0.5, f64::NAN, 0.7]).average_confidence();
        assert!((avg - 0.6).abs() < 1e-12);
    }
}
