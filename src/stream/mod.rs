//! Frame producer.
//!
//! A stream pulls frames from a `FrameSource`, runs them through a detector
//! backend, and every `sample_every`-th processed frame hands the reading to
//! the detection recorder.
//!
//! Stream lifecycle drives the Idle/Streaming state the report scheduler is
//! gated on:
//! - Idle -> Streaming once the source opens
//! - Streaming -> Idle on source exhaustion, a stop request, or a read failure
//! - an open failure leaves the state Idle
//!
//! Only one stream runs at a time.

pub mod synthetic;

use anyhow::{anyhow, Result};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::detect::{summarize, DetectorBackend};
use crate::recorder::{DetectionRecorder, RecorderStats, RecorderWorker, SubmitOutcome};
use crate::MonitorContext;

pub use synthetic::SyntheticSource;

pub const DEFAULT_SAMPLE_EVERY: u32 = 30;
pub const DEFAULT_TARGET_FPS: u32 = 30;

/// Decoded frame handed to detector backends.
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// 1-based position in the stream.
    pub sequence: u64,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Self {
        Self {
            data,
            width,
            height,
            sequence,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }
}

/// Source of frames for one stream.
pub trait FrameSource: Send {
    /// Acquire the source. Failure keeps the stream Idle.
    fn open(&mut self) -> Result<()>;

    /// Next frame, or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn describe(&self) -> String;
}

/// Build a frame source from its locator. Only `stub://` sources ship with
/// this crate; camera and file decoding live outside it.
pub fn open_source(locator: &str) -> Result<Box<dyn FrameSource>> {
    if locator.starts_with("stub://") {
        Ok(Box::new(SyntheticSource::parse(locator)?))
    } else {
        Err(anyhow!("unsupported frame source '{}'", locator))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSettings {
    /// Source locator (e.g., "stub://front_bin?frames=900").
    pub source: String,
    /// Record every Nth processed frame.
    pub sample_every: u32,
    /// Producer pacing; 0 runs as fast as the source allows.
    pub target_fps: u32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            source: "stub://front_bin".to_string(),
            sample_every: DEFAULT_SAMPLE_EVERY,
            target_fps: DEFAULT_TARGET_FPS,
        }
    }
}

// -------------------- Stream state --------------------

/// Idle/Streaming flag plus the single-producer claim.
#[derive(Debug, Default)]
pub struct StreamState {
    streaming: AtomicBool,
    claimed: AtomicBool,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    pub fn mark_streaming(&self) {
        self.streaming.store(true, Ordering::SeqCst);
    }

    pub fn mark_idle(&self) {
        self.streaming.store(false, Ordering::SeqCst);
    }

    /// Reserve the producer slot. False when another stream holds it.
    pub fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn release(&self) {
        self.claimed.store(false, Ordering::SeqCst);
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }
}

// -------------------- Producer --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEnd {
    OpenFailed,
    Exhausted,
    Stopped,
    SourceError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamSummary {
    pub end: StreamEnd,
    pub frames_processed: u64,
    pub samples_submitted: u64,
    pub recorder: RecorderStats,
}

pub struct StreamHandle {
    source: String,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<StreamSummary>>,
}

impl StreamHandle {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |join| join.is_finished())
    }

    /// Ask the producer to stop after the current frame.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn join(mut self) -> Result<StreamSummary> {
        let join = self
            .join
            .take()
            .ok_or_else(|| anyhow!("stream already joined"))?;
        join.join()
            .map_err(|_| anyhow!("stream producer thread panicked"))
    }

    pub fn stop(self) -> Result<StreamSummary> {
        self.request_stop();
        self.join()
    }
}

/// Start a producer thread for `settings.source`.
///
/// Fails immediately when another stream holds the producer slot. Source
/// open failures are reported through `StreamSummary::end` instead.
pub fn spawn_stream(
    ctx: &MonitorContext,
    settings: StreamSettings,
    client: Option<IpAddr>,
    detector: Box<dyn DetectorBackend>,
) -> Result<StreamHandle> {
    if !ctx.stream_state.claim() {
        return Err(anyhow!("a stream is already active"));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let stop_thread = stop.clone();
    let ctx_thread = ctx.clone();
    let source = settings.source.clone();
    let spawned = std::thread::Builder::new()
        .name("stream-producer".to_string())
        .spawn(move || {
            let summary = run_stream(&ctx_thread, &settings, client, detector, &stop_thread);
            ctx_thread.stream_state.mark_idle();
            ctx_thread.stream_state.release();
            log::info!(
                "stream {} ended ({:?}): frames={} samples={} logged={} duplicates={} dropped={}",
                settings.source,
                summary.end,
                summary.frames_processed,
                summary.samples_submitted,
                summary.recorder.appended,
                summary.recorder.duplicates,
                summary.recorder.dropped
            );
            summary
        });
    match spawned {
        Ok(join) => Ok(StreamHandle {
            source,
            stop,
            join: Some(join),
        }),
        Err(err) => {
            ctx.stream_state.release();
            Err(anyhow!("failed to spawn stream producer: {}", err))
        }
    }
}

fn run_stream(
    ctx: &MonitorContext,
    settings: &StreamSettings,
    client: Option<IpAddr>,
    mut detector: Box<dyn DetectorBackend>,
    stop: &AtomicBool,
) -> StreamSummary {
    let mut summary = StreamSummary {
        end: StreamEnd::OpenFailed,
        frames_processed: 0,
        samples_submitted: 0,
        recorder: RecorderStats::default(),
    };

    let mut source = match open_source(&settings.source).and_then(|mut source| {
        source.open()?;
        Ok(source)
    }) {
        Ok(source) => source,
        Err(err) => {
            log::warn!("stream source {} failed to open: {:#}", settings.source, err);
            return summary;
        }
    };
    if let Err(err) = detector.warm_up() {
        log::warn!("detector {} warm-up failed: {:#}", detector.name(), err);
    }

    let recorder = DetectionRecorder::new(
        ctx.event_log.clone(),
        ctx.resolver.clone(),
        ctx.sink.clone(),
        ctx.collections.detection_log.clone(),
    )
    .with_client(client);
    let (handle, worker) = match RecorderWorker::spawn(recorder) {
        Ok(pair) => pair,
        Err(err) => {
            log::error!("failed to start detection recorder: {:#}", err);
            return summary;
        }
    };

    ctx.stream_state.mark_streaming();
    log::info!(
        "streaming from {} via detector {} (sampling every {} frames)",
        source.describe(),
        detector.name(),
        settings.sample_every
    );

    let sample_every = u64::from(settings.sample_every.max(1));
    let pacing = frame_interval(settings.target_fps);
    summary.end = loop {
        if ctx.is_shutdown() || stop.load(Ordering::SeqCst) {
            break StreamEnd::Stopped;
        }
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break StreamEnd::Exhausted,
            Err(err) => {
                log::warn!("stream {} read failed: {:#}", source.describe(), err);
                break StreamEnd::SourceError;
            }
        };
        let detections = match detector.detect(&frame) {
            Ok(detections) => detections,
            Err(err) => {
                log::debug!("detector failed on frame {}: {:#}", frame.sequence, err);
                continue;
            }
        };
        summary.frames_processed += 1;

        if summary.frames_processed % sample_every == 0 {
            let (count, scores) = summarize(&detections);
            if handle.submit(count, scores) == SubmitOutcome::Queued {
                summary.samples_submitted += 1;
            }
        }

        if let Some(pacing) = pacing {
            std::thread::sleep(pacing);
        }
    };

    // Streaming ends here; queued readings still drain into the log.
    ctx.stream_state.mark_idle();
    drop(handle);
    match worker.join() {
        Ok(stats) => summary.recorder = stats,
        Err(err) => log::error!("{:#}", err),
    }
    summary
}

// -------------------- Controller --------------------

pub type DetectorFactory = Box<dyn Fn() -> Box<dyn DetectorBackend> + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started { source: String },
    AlreadyActive,
}

/// Owns the handle of the current stream so start/stop requests from the API
/// and the daemon share one producer slot.
pub struct StreamController {
    ctx: MonitorContext,
    defaults: StreamSettings,
    detector: DetectorFactory,
    active: Mutex<Option<StreamHandle>>,
}

impl StreamController {
    pub fn new(ctx: MonitorContext, defaults: StreamSettings, detector: DetectorFactory) -> Self {
        Self {
            ctx,
            defaults,
            detector,
            active: Mutex::new(None),
        }
    }

    /// Start a stream from `source`, or the configured default source.
    pub fn start(&self, source: Option<String>, client: Option<IpAddr>) -> Result<StartOutcome> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = active.take() {
            if !handle.is_finished() {
                *active = Some(handle);
                return Ok(StartOutcome::AlreadyActive);
            }
            reap(handle);
        }
        let settings = StreamSettings {
            source: source
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| self.defaults.source.clone()),
            ..self.defaults.clone()
        };
        let source = settings.source.clone();
        if self.ctx.stream_state.is_claimed() {
            return Ok(StartOutcome::AlreadyActive);
        }
        let handle = spawn_stream(&self.ctx, settings, client, (self.detector)())?;
        *active = Some(handle);
        Ok(StartOutcome::Started { source })
    }

    /// Ask the current stream to stop. Returns false when none is running.
    pub fn request_stop(&self) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.as_ref() {
            Some(handle) if !handle.is_finished() => {
                handle.request_stop();
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Stop and join the current stream, if any.
    pub fn shutdown(&self) -> Option<StreamSummary> {
        let handle = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        match handle.stop() {
            Ok(summary) => Some(summary),
            Err(err) => {
                log::error!("{:#}", err);
                None
            }
        }
    }
}

fn reap(handle: StreamHandle) {
    let source = handle.source().to_string();
    if let Err(err) = handle.join() {
        log::error!("stream {}: {:#}", source, err);
    }
}

fn frame_interval(target_fps: u32) -> Option<Duration> {
    if target_fps == 0 {
        None
    } else {
        Some(Duration::from_secs_f64(1.0 / f64::from(target_fps)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubBackend;

    fn settings(source: &str, sample_every: u32) -> StreamSettings {
        StreamSettings {
            source: source.to_string(),
            sample_every,
            target_fps: 0,
        }
    }

    #[test]
    fn exhausted_stream_returns_to_idle() {
        let ctx = MonitorContext::offline(100);
        let handle = spawn_stream(
            &ctx,
            settings("stub://bin?frames=90&scene_every=30", 30),
            None,
            Box::new(StubBackend::new()),
        )
        .unwrap();
        let summary = handle.join().unwrap();
        assert_eq!(summary.end, StreamEnd::Exhausted);
        assert_eq!(summary.frames_processed, 90);
        assert_eq!(summary.samples_submitted, 3);
        assert_eq!(
            summary.recorder.appended + summary.recorder.duplicates,
            summary.samples_submitted
        );
        assert!(!ctx.stream_state.is_streaming());
        assert!(!ctx.stream_state.is_claimed());
    }

    #[test]
    fn static_scene_is_deduplicated() {
        let ctx = MonitorContext::offline(100);
        let handle = spawn_stream(
            &ctx,
            settings("stub://bin?frames=300&scene_every=0", 30),
            None,
            Box::new(StubBackend::new()),
        )
        .unwrap();
        let summary = handle.join().unwrap();
        assert_eq!(summary.samples_submitted, 10);
        assert_eq!(summary.recorder.appended, 1);
        assert_eq!(ctx.event_log.len(), 1);
    }

    #[test]
    fn open_failure_stays_idle() {
        let ctx = MonitorContext::offline(100);
        let handle = spawn_stream(
            &ctx,
            settings("rtsp://camera/stream", 30),
            None,
            Box::new(StubBackend::new()),
        )
        .unwrap();
        let summary = handle.join().unwrap();
        assert_eq!(summary.end, StreamEnd::OpenFailed);
        assert_eq!(summary.frames_processed, 0);
        assert!(!ctx.stream_state.is_streaming());
        assert!(ctx.stream_state.claim());
    }

    #[test]
    fn second_stream_is_rejected_while_first_runs() {
        let ctx = MonitorContext::offline(100);
        let first = spawn_stream(
            &ctx,
            settings("stub://bin", 30),
            None,
            Box::new(StubBackend::new()),
        )
        .unwrap();
        assert!(spawn_stream(
            &ctx,
            settings("stub://other", 30),
            None,
            Box::new(StubBackend::new())
        )
        .is_err());
        let summary = first.stop().unwrap();
        assert_eq!(summary.end, StreamEnd::Stopped);
        assert!(!ctx.stream_state.is_streaming());
    }

    #[test]
    fn global_shutdown_stops_producer() {
        let ctx = MonitorContext::offline(100);
        let handle = spawn_stream(
            &ctx,
            settings("stub://bin", 1),
            None,
            Box::new(StubBackend::new()),
        )
        .unwrap();
        ctx.request_shutdown();
        let summary = handle.join().unwrap();
        assert_eq!(summary.end, StreamEnd::Stopped);
    }

    #[test]
    fn controller_shares_one_producer_slot() {
        let ctx = MonitorContext::offline(100);
        let controller = StreamController::new(
            ctx.clone(),
            settings("stub://default", 30),
            Box::new(|| Box::new(StubBackend::new()) as Box<dyn DetectorBackend>),
        );
        assert!(!controller.request_stop());
        assert_eq!(
            controller.start(None, None).unwrap(),
            StartOutcome::Started {
                source: "stub://default".to_string()
            }
        );
        assert_eq!(
            controller.start(Some("stub://other".to_string()), None).unwrap(),
            StartOutcome::AlreadyActive
        );
        assert!(controller.is_active());
        let summary = controller.shutdown().unwrap();
        assert_eq!(summary.end, StreamEnd::Stopped);
        assert!(!controller.is_active());
        assert!(matches!(
            controller.start(Some("stub://next?frames=1".to_string()), None).unwrap(),
            StartOutcome::Started { .. }
        ));
        controller.shutdown();
    }
}
