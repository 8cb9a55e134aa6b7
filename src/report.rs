//! Windowed aggregation over the detection event log.
//!
//! `aggregate` is a pure function of an event snapshot, the current GPS fix,
//! and "now". It never fails: missing or malformed confidence data degrades to
//! zero-valued statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::event_log::DetectionEvent;
use crate::location::{working_area, Location, LocationSource};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(30);
pub const DEFAULT_RECENT_LIMIT: usize = 10;

/// Scoring policy constants: score = min(CAP, total * average * MULTIPLIER).
pub const OVERFLOW_MULTIPLIER: f64 = 10.0;
pub const OVERFLOW_CAP: f64 = 100.0;
pub const HIGH_OVERFLOW_THRESHOLD: f64 = 70.0;
pub const MEDIUM_OVERFLOW_THRESHOLD: f64 = 30.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AggregationParams {
    /// Trailing window ending at "now".
    pub window: Duration,
    /// Number of window events echoed in `recent_detections`.
    pub recent_limit: usize,
}

impl Default for AggregationParams {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            recent_limit: DEFAULT_RECENT_LIMIT,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverflowStatus {
    HighOverflow,
    MediumOverflow,
    LowOverflow,
    NoDetections,
}

impl OverflowStatus {
    pub fn from_score(score: f64) -> Self {
        if score > HIGH_OVERFLOW_THRESHOLD {
            OverflowStatus::HighOverflow
        } else if score > MEDIUM_OVERFLOW_THRESHOLD {
            OverflowStatus::MediumOverflow
        } else {
            OverflowStatus::LowOverflow
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OverflowStatus::HighOverflow => "HIGH_OVERFLOW",
            OverflowStatus::MediumOverflow => "MEDIUM_OVERFLOW",
            OverflowStatus::LowOverflow => "LOW_OVERFLOW",
            OverflowStatus::NoDetections => "NO_DETECTIONS",
        }
    }
}

/// Heuristic severity index combining volume and confidence.
pub fn overflow_score(total_detections: u64, average_confidence: f64) -> f64 {
    let raw = total_detections as f64 * average_confidence * OVERFLOW_MULTIPLIER;
    if raw.is_finite() {
        raw.clamp(0.0, OVERFLOW_CAP)
    } else {
        0.0
    }
}

/// GPS fix as echoed in a report.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GpsSnapshot {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub accuracy: String,
    pub address: Option<String>,
    pub source: LocationSource,
    pub timestamp: DateTime<Utc>,
}

impl From<&Location> for GpsSnapshot {
    fn from(location: &Location) -> Self {
        Self {
            latitude: location.latitude,
            longitude: location.longitude,
            accuracy: location.accuracy.clone(),
            address: location.address.clone(),
            source: location.source,
            timestamp: location.timestamp,
        }
    }
}

/// Window statistics. Confidences are fractions in [0, 1].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DetectionSummary {
    pub total_detections: u64,
    pub average_confidence: f64,
    pub max_confidence: f64,
    pub min_confidence: f64,
    pub overflow_score: f64,
    /// Number of sampled frames in the window, not objects.
    pub detection_frequency: usize,
    pub status: OverflowStatus,
}

impl DetectionSummary {
    fn empty() -> Self {
        Self {
            total_detections: 0,
            average_confidence: 0.0,
            max_confidence: 0.0,
            min_confidence: 0.0,
            overflow_score: 0.0,
            detection_frequency: 0,
            status: OverflowStatus::NoDetections,
        }
    }
}

/// Per-event entry. Confidences are percentages rounded to two decimals.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RecentDetection {
    pub timestamp: DateTime<Utc>,
    pub detection_count: u32,
    pub confidence_scores: Vec<f64>,
    pub average_confidence: f64,
    pub location: Option<Location>,
    pub working_area: String,
}

impl From<&DetectionEvent> for RecentDetection {
    fn from(event: &DetectionEvent) -> Self {
        Self {
            timestamp: event.timestamp,
            detection_count: event.detection_count,
            confidence_scores: event
                .confidence_scores
                .iter()
                .map(|score| round_percent(*score))
                .collect(),
            average_confidence: round_percent(event.average_confidence()),
            location: event.location.clone(),
            working_area: event.working_area.clone(),
        }
    }
}

/// One aggregation over the report window.
///
/// Units differ by section: `detection_summary` confidences are fractions in
/// [0, 1], while `recent_detections` carry percentages (0 to 100, two
/// decimals). `overflow_score` is on a 0 to 100 scale.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Report {
    pub timestamp: DateTime<Utc>,
    pub gps_location: Option<GpsSnapshot>,
    /// Fractions in [0, 1].
    pub detection_summary: DetectionSummary,
    /// Percentages, newest last.
    pub recent_detections: Vec<RecentDetection>,
}

/// Compute the report for the window `(now - params.window, now]`.
///
/// `events` must be in insertion (time) order, as returned by
/// `EventLog::snapshot`.
pub fn aggregate(
    events: &[DetectionEvent],
    gps: Option<&Location>,
    params: &AggregationParams,
    now: DateTime<Utc>,
) -> Report {
    let cutoff = chrono::Duration::from_std(params.window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window));
    let window: Vec<&DetectionEvent> = events
        .iter()
        .filter(|event| cutoff.map_or(true, |cutoff| event.timestamp > cutoff))
        .collect();
    let total_detections: u64 = window
        .iter()
        .map(|event| u64::from(event.detection_count))
        .sum();

    let gps_location = gps.map(GpsSnapshot::from);

    if window.is_empty() || total_detections == 0 {
        return Report {
            timestamp: now,
            gps_location,
            detection_summary: DetectionSummary::empty(),
            recent_detections: vec![no_activity_entry(gps, now)],
        };
    }

    let confidences: Vec<f64> = window
        .iter()
        .flat_map(|event| event.confidence_scores.iter().copied())
        .filter(|score| score.is_finite())
        .collect();
    let (average_confidence, max_confidence, min_confidence) = if confidences.is_empty() {
        (0.0, 0.0, 0.0)
    } else {
        let sum: f64 = confidences.iter().sum();
        let max = confidences.iter().copied().fold(f64::MIN, f64::max);
        let min = confidences.iter().copied().fold(f64::MAX, f64::min);
        (sum / confidences.len() as f64, max, min)
    };
    let score = overflow_score(total_detections, average_confidence);

    let skip = window.len().saturating_sub(params.recent_limit);
    let recent_detections = window
        .iter()
        .skip(skip)
        .map(|event| RecentDetection::from(*event))
        .collect();

    Report {
        timestamp: now,
        gps_location,
        detection_summary: DetectionSummary {
            total_detections,
            average_confidence,
            max_confidence,
            min_confidence,
            overflow_score: score,
            detection_frequency: window.len(),
            status: OverflowStatus::from_score(score),
        },
        recent_detections,
    }
}

/// Synthetic zero entry standing for "no activity observed".
fn no_activity_entry(gps: Option<&Location>, now: DateTime<Utc>) -> RecentDetection {
    RecentDetection {
        timestamp: now,
        detection_count: 0,
        confidence_scores: Vec::new(),
        average_confidence: 0.0,
        location: gps.cloned(),
        working_area: working_area(gps),
    }
}

fn round_percent(fraction: f64) -> f64 {
    if !fraction.is_finite() {
        return 0.0;
    }
    (fraction * 100.0 * 100.0).round() / 100.0
}
