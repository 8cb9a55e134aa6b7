//! Periodic report emission.
//!
//! The timer runs for the life of the process and is only ever gated: a tick
//! while Idle is a logged no-op, a tick while Streaming aggregates the window,
//! logs the report and forwards it to the sinks.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::report::Report;
use crate::MonitorContext;

pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Longest uninterrupted sleep; bounds how late a stop request is noticed.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

const REPORT_BANNER: &str = "==================== OVERFLOW REPORT ====================";

#[derive(Clone, Debug, PartialEq)]
pub enum TickOutcome {
    /// Idle: nothing aggregated, nothing written.
    Skipped,
    /// Global stop requested.
    Stopped,
    Emitted {
        report: Report,
        document_id: Option<String>,
    },
}

pub struct ReportScheduler {
    ctx: MonitorContext,
    interval: Duration,
}

impl ReportScheduler {
    pub fn new(ctx: MonitorContext, interval: Duration) -> Self {
        Self { ctx, interval }
    }

    /// One timer tick evaluated at `now`.
    pub fn tick(&self, now: DateTime<Utc>) -> TickOutcome {
        if self.ctx.is_shutdown() {
            return TickOutcome::Stopped;
        }
        if !self.ctx.stream_state.is_streaming() {
            log::info!("report tick skipped: no active stream");
            return TickOutcome::Skipped;
        }

        let report = self.ctx.report_at(now);
        match serde_json::to_string_pretty(&report) {
            Ok(pretty) => log::info!("\n{}\n{}\n{}", REPORT_BANNER, pretty, REPORT_BANNER),
            Err(err) => log::warn!("report could not be rendered: {}", err),
        }
        let document_id = self
            .ctx
            .sink
            .persist_serialized(&self.ctx.collections.report, &report);
        match &document_id {
            Some(id) => log::info!("report stored as {}", id),
            None => log::info!("report not persisted"),
        }
        TickOutcome::Emitted {
            report,
            document_id,
        }
    }

    /// Run ticks every `interval` on a background thread until global stop.
    pub fn spawn(self) -> Result<SchedulerHandle> {
        let join = std::thread::Builder::new()
            .name("report-scheduler".to_string())
            .spawn(move || self.run())?;
        Ok(SchedulerHandle { join: Some(join) })
    }

    fn run(&self) -> u64 {
        log::info!("report scheduler started (every {:?})", self.interval);
        let mut emitted = 0u64;
        let mut next = Instant::now() + self.interval;
        loop {
            if !self.sleep_until(next) {
                break;
            }
            next += self.interval;
            match self.tick(crate::now_utc()) {
                TickOutcome::Emitted { .. } => emitted += 1,
                TickOutcome::Skipped => {}
                TickOutcome::Stopped => break,
            }
        }
        log::info!("report scheduler stopped after {} reports", emitted);
        emitted
    }

    /// False when a stop was requested before `deadline`.
    fn sleep_until(&self, deadline: Instant) -> bool {
        loop {
            if self.ctx.is_shutdown() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

pub struct SchedulerHandle {
    join: Option<JoinHandle<u64>>,
}

impl SchedulerHandle {
    /// Wait for the scheduler to observe the global stop flag. Returns the
    /// number of reports emitted.
    pub fn join(mut self) -> Result<u64> {
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| anyhow!("report scheduler thread panicked")),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::DetectionEvent;
    use crate::report::OverflowStatus;
    use crate::sink::{InMemoryDocumentSink, SinkGateway};
    use std::sync::Arc;

    fn context_with_memory_sink() -> (MonitorContext, InMemoryDocumentSink) {
        let memory = InMemoryDocumentSink::new();
        let mut ctx = MonitorContext::offline(100);
        ctx.sink = Arc::new(SinkGateway::new(vec![Box::new(memory.clone())]));
        (ctx, memory)
    }

    fn event(at: DateTime<Utc>, count: u32) -> DetectionEvent {
        DetectionEvent {
            timestamp: at,
            detection_count: count,
            confidence_scores: vec![0.9; count as usize],
            location: None,
            working_area: "Unknown".to_string(),
        }
    }

    #[test]
    fn idle_ticks_never_write() {
        let (ctx, memory) = context_with_memory_sink();
        let now = crate::now_utc();
        ctx.event_log.append_unless_duplicate(event(now, 4));
        let scheduler = ReportScheduler::new(ctx, DEFAULT_REPORT_INTERVAL);
        for _ in 0..3 {
            assert_eq!(scheduler.tick(now), TickOutcome::Skipped);
        }
        assert!(memory.documents().is_empty());
    }

    #[test]
    fn streaming_tick_emits_and_idle_restores_noop() {
        let (ctx, memory) = context_with_memory_sink();
        let now = crate::now_utc();
        ctx.event_log.append_unless_duplicate(event(now, 8));
        let scheduler = ReportScheduler::new(ctx.clone(), DEFAULT_REPORT_INTERVAL);

        ctx.stream_state.mark_streaming();
        match scheduler.tick(now) {
            TickOutcome::Emitted {
                report,
                document_id,
            } => {
                assert_eq!(report.detection_summary.status, OverflowStatus::HighOverflow);
                assert!(document_id.is_some());
            }
            other => panic!("expected report, got {:?}", other),
        }
        assert_eq!(memory.in_collection(&ctx.collections.report).len(), 1);

        ctx.stream_state.mark_idle();
        assert_eq!(scheduler.tick(now), TickOutcome::Skipped);
        assert_eq!(memory.documents().len(), 1);
    }

    #[test]
    fn shutdown_stops_timer_thread() {
        let (ctx, _memory) = context_with_memory_sink();
        let handle = ReportScheduler::new(ctx.clone(), Duration::from_secs(3600))
            .spawn()
            .unwrap();
        ctx.request_shutdown();
        assert_eq!(handle.join().unwrap(), 0);
        let scheduler = ReportScheduler::new(ctx, DEFAULT_REPORT_INTERVAL);
        assert_eq!(scheduler.tick(crate::now_utc()), TickOutcome::Stopped);
    }
}
