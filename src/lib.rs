//! Overflow Monitor
//!
//! Windowed detection aggregation and reporting for garbage-overflow
//! monitoring.
//!
//! # Architecture
//!
//! A frame producer runs detector backends over a video stream and, at a fixed
//! sampling cadence, hands `(count, confidences)` readings to the detection
//! recorder. The recorder deduplicates against the previous event, attaches a
//! location, appends to a bounded in-memory log and forwards a record to the
//! document sinks. A report scheduler aggregates the trailing window while a
//! stream is active; the same report is available on demand over HTTP.
//!
//! # Module Structure
//!
//! - `event_log`: bounded FIFO of `DetectionEvent`s
//! - `recorder`: dedup, location, append, persist
//! - `report`: pure window aggregation and overflow scoring
//! - `scheduler`: periodic report emission gated on stream state
//! - `location`: GPS fix store and IP/geocoding fallback chains
//! - `sink`: ordered document sinks (Firestore, Firestore REST, SQLite)
//! - `stream`, `detect`: frame sources and detector backends
//! - `api`: local HTTP interface
//! - `config`: file + environment configuration

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod api;
pub mod config;
pub mod detect;
pub mod event_log;
pub mod location;
pub mod recorder;
pub mod report;
pub mod scheduler;
pub mod sink;
pub mod stream;

pub use config::MonitorConfig;
pub use detect::{DetectorBackend, StubBackend};
pub use event_log::{DetectionEvent, EventLog};
pub use location::{GpsStore, GpsSubmission, Location, LocationResolver, LocationSource};
pub use recorder::{
    DetectionRecorder, RecordOutcome, RecorderHandle, RecorderWorker, SubmitOutcome,
};
pub use report::{aggregate, AggregationParams, OverflowStatus, Report};
pub use scheduler::{ReportScheduler, SchedulerHandle, TickOutcome};
pub use sink::{Collections, DocumentSink, SinkGateway};
pub use stream::{spawn_stream, StreamHandle, StreamSettings, StreamState};

/// Wall-clock time used for every event, fix and report timestamp.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Shared state handed to every actor (producer, recorder, scheduler, API).
///
/// Cloning is cheap: every container is behind an `Arc`. Consistency across
/// containers is best-effort; a report may or may not include an event
/// appended while it is being computed.
#[derive(Clone)]
pub struct MonitorContext {
    pub event_log: Arc<EventLog>,
    pub resolver: Arc<LocationResolver>,
    pub sink: Arc<SinkGateway>,
    pub stream_state: Arc<StreamState>,
    pub aggregation: AggregationParams,
    pub collections: Collections,
    shutdown: Arc<AtomicBool>,
}

impl MonitorContext {
    pub fn new(
        event_log: Arc<EventLog>,
        resolver: Arc<LocationResolver>,
        sink: Arc<SinkGateway>,
        aggregation: AggregationParams,
        collections: Collections,
    ) -> Self {
        Self {
            event_log,
            resolver,
            sink,
            stream_state: Arc::new(StreamState::new()),
            aggregation,
            collections,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wire the production providers described by `cfg`.
    pub fn from_config(cfg: &MonitorConfig) -> Result<Self> {
        let resolver = build_resolver(&cfg.location);
        let sink = build_sink(&cfg.sink)?;
        if sink.is_empty() {
            log::warn!("no document sinks configured; detections and reports stay in memory");
        } else {
            log::info!("document sinks: [{}]", sink.provider_names().join(", "));
        }
        Ok(Self::new(
            Arc::new(EventLog::new(cfg.log_capacity)),
            Arc::new(resolver),
            Arc::new(sink),
            cfg.aggregation(),
            cfg.sink.collections.clone(),
        ))
    }

    pub fn gps(&self) -> &Arc<GpsStore> {
        self.resolver.gps()
    }

    /// Aggregate the current log snapshot. Always computed, whether or not a
    /// stream is active.
    pub fn report_at(&self, now: DateTime<Utc>) -> Report {
        let events = self.event_log.snapshot();
        let gps = self.gps().current();
        aggregate(&events, gps.as_ref(), &self.aggregation, now)
    }

    pub fn report_now(&self) -> Report {
        self.report_at(now_utc())
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Context with no working network providers and no sinks.
    #[cfg(test)]
    pub(crate) fn offline(capacity: usize) -> Self {
        Self::new(
            Arc::new(EventLog::new(capacity)),
            Arc::new(location::testing::offline_resolver(Arc::new(GpsStore::new()))),
            Arc::new(SinkGateway::disabled()),
            AggregationParams::default(),
            Collections::default(),
        )
    }
}

fn build_resolver(settings: &config::LocationSettings) -> LocationResolver {
    let ip_agent = location::http_agent(settings.public_ip_timeout);
    let lookup_agent = location::http_agent(settings.lookup_timeout);
    LocationResolver::new(
        Arc::new(GpsStore::new()),
        vec![
            Box::new(location::IpifyIp::new(ip_agent.clone(), &settings.ipify_url)),
            Box::new(location::HttpBinIp::new(ip_agent, &settings.httpbin_url)),
        ],
        Box::new(location::IpApiGeolocator::new(
            lookup_agent.clone(),
            &settings.ipapi_url,
        )),
        Box::new(location::NominatimGeocoder::new(
            lookup_agent,
            &settings.nominatim_url,
            &settings.user_agent,
        )),
    )
}

fn build_sink(settings: &config::SinkSettings) -> Result<SinkGateway> {
    let agent = location::http_agent(settings.timeout);
    let mut providers: Vec<Box<dyn DocumentSink>> = Vec::new();
    if let Some(project) = &settings.firestore_project {
        let mut target =
            sink::FirestoreTarget::new(project).with_endpoint(&settings.firestore_endpoint);
        target.database = settings.firestore_database.clone();
        providers.push(Box::new(sink::FirestoreClient::new(
            target.clone(),
            settings
                .access_token
                .as_ref()
                .map(|token| token.as_str().to_string()),
            agent.clone(),
        )));
        if let Some(key) = &settings.api_key {
            providers.push(Box::new(sink::FirestoreRest::new(
                target,
                key.as_str().to_string(),
                agent,
            )));
        }
    }
    if let Some(path) = &settings.local_db {
        let path = path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("local_db path must be valid UTF-8"))?;
        providers.push(Box::new(sink::SqliteDocumentSink::open(path)?));
    }
    Ok(SinkGateway::new(providers))
}
