use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::{IpAddr, TcpListener};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use overflow_monitor::location::{http_agent, IpGeolocator, PublicIpProvider, ReverseGeocoder};
use overflow_monitor::sink::{
    FirestoreClient, FirestoreRest, FirestoreTarget, InMemoryDocumentSink,
};
use overflow_monitor::stream::{spawn_stream, StreamEnd};
use overflow_monitor::{
    AggregationParams, Collections, EventLog, GpsStore, Location, LocationResolver,
    MonitorContext, OverflowStatus, ReportScheduler, SinkGateway, StreamSettings, StubBackend,
    TickOutcome,
};

struct Offline;

impl PublicIpProvider for Offline {
    fn name(&self) -> &'static str {
        "offline"
    }

    fn public_ip(&self) -> Result<IpAddr> {
        Err(anyhow!("offline"))
    }
}

impl IpGeolocator for Offline {
    fn name(&self) -> &'static str {
        "offline"
    }

    fn locate(&self, _ip: IpAddr) -> Result<Location> {
        Err(anyhow!("offline"))
    }
}

impl ReverseGeocoder for Offline {
    fn name(&self) -> &'static str {
        "offline"
    }

    fn address(&self, _latitude: f64, _longitude: f64) -> Result<String> {
        Err(anyhow!("offline"))
    }
}

fn context(memory: &InMemoryDocumentSink) -> MonitorContext {
    let resolver = LocationResolver::new(
        Arc::new(GpsStore::new()),
        vec![Box::new(Offline)],
        Box::new(Offline),
        Box::new(Offline),
    );
    MonitorContext::new(
        Arc::new(EventLog::new(100)),
        Arc::new(resolver),
        Arc::new(SinkGateway::new(vec![Box::new(memory.clone())])),
        AggregationParams::default(),
        Collections::default(),
    )
}

fn settings(source: &str) -> StreamSettings {
    StreamSettings {
        source: source.to_string(),
        sample_every: 30,
        target_fps: 0,
    }
}

#[test]
fn synthetic_stream_feeds_report() -> Result<()> {
    let memory = InMemoryDocumentSink::new();
    let ctx = context(&memory);

    let handle = spawn_stream(
        &ctx,
        settings("stub://bay?frames=600&scene_every=60"),
        None,
        Box::new(StubBackend::new()),
    )?;
    let summary = handle.join()?;
    assert_eq!(summary.end, StreamEnd::Exhausted);
    assert_eq!(summary.frames_processed, 600);
    assert_eq!(summary.samples_submitted, 20);
    assert!(!ctx.stream_state.is_streaming());

    let events = ctx.event_log.snapshot();
    assert_eq!(events.len() as u64, summary.recorder.appended);
    for pair in events.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
        assert!(!pair[1].same_reading(pair[0].detection_count, &pair[0].confidence_scores));
    }
    let logged = memory.in_collection(&ctx.collections.detection_log);
    assert_eq!(logged.len(), events.len());
    assert_eq!(logged[0].record["source"], "stream");

    let report = ctx.report_now();
    let summary = &report.detection_summary;
    let total: u64 = events.iter().map(|e| u64::from(e.detection_count)).sum();
    if total == 0 {
        assert_eq!(summary.status, OverflowStatus::NoDetections);
    } else {
        assert_eq!(summary.total_detections, total);
        assert_eq!(summary.detection_frequency, events.len());
        assert_eq!(summary.status, OverflowStatus::from_score(summary.overflow_score));
        assert!(report.recent_detections.len() <= 10);
    }
    Ok(())
}

#[test]
fn scheduler_follows_stream_state() -> Result<()> {
    let memory = InMemoryDocumentSink::new();
    let ctx = context(&memory);
    let scheduler = ReportScheduler::new(ctx.clone(), Duration::from_secs(30));

    assert_eq!(scheduler.tick(overflow_monitor::now_utc()), TickOutcome::Skipped);

    let handle = spawn_stream(
        &ctx,
        settings("stub://bay"),
        None,
        Box::new(StubBackend::new()),
    )?;
    let deadline = Instant::now() + Duration::from_secs(5);
    while !ctx.stream_state.is_streaming() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(ctx.stream_state.is_streaming());

    match scheduler.tick(overflow_monitor::now_utc()) {
        TickOutcome::Emitted { document_id, .. } => assert!(document_id.is_some()),
        other => panic!("expected emitted report, got {:?}", other),
    }
    assert_eq!(memory.in_collection(&ctx.collections.report).len(), 1);

    let summary = handle.stop()?;
    assert_eq!(summary.end, StreamEnd::Stopped);
    assert_eq!(scheduler.tick(overflow_monitor::now_utc()), TickOutcome::Skipped);
    assert_eq!(memory.in_collection(&ctx.collections.report).len(), 1);
    Ok(())
}

struct CapturedRequest {
    request_line: String,
    body: Value,
}

/// One-shot HTTP server answering a single request with `status` and `body`.
fn fake_firestore(status: &'static str, body: String) -> Result<(String, JoinHandle<Result<CapturedRequest>>)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let endpoint = format!("http://{}/v1", listener.local_addr()?);
    let join = std::thread::spawn(move || -> Result<CapturedRequest> {
        let (mut stream, _) = listener.accept()?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        let header_end = loop {
            let n = stream.read(&mut buf)?;
            if n == 0 {
                return Err(anyhow!("connection closed before headers"));
            }
            data.extend_from_slice(&buf[..n]);
            if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&data[..header_end]).to_string();
        let content_length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim()
                    .eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        while data.len() < header_end + content_length {
            let n = stream.read(&mut buf)?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        stream.write_all(response.as_bytes())?;
        Ok(CapturedRequest {
            request_line: head.lines().next().unwrap_or("").to_string(),
            body: serde_json::from_slice(&data[header_end..header_end + content_length])?,
        })
    });
    Ok((endpoint, join))
}

fn firestore_gateway(endpoint: &str) -> SinkGateway {
    let agent = http_agent(Duration::from_secs(5));
    let target = FirestoreTarget::new("bins-test").with_endpoint(endpoint);
    SinkGateway::new(vec![
        Box::new(FirestoreClient::new(target.clone(), None, agent.clone())),
        Box::new(FirestoreRest::new(target, "test-key".to_string(), agent)),
    ])
}

#[test]
fn rest_fallback_returns_created_document_id() -> Result<()> {
    let (endpoint, server) = fake_firestore(
        "200 OK",
        json!({
            "name": "projects/bins-test/databases/(default)/documents/model_results/Xy12AbCdEfGhIjKlMnOp"
        })
        .to_string(),
    )?;
    let gateway = firestore_gateway(&endpoint);
    let record = json!({
        "detection_summary": {"total_detections": 3, "overflow_score": 24.5, "status": "LOW_OVERFLOW"},
        "gps_location": null,
        "recent_detections": [{"confidence_scores": [81.0, 64.5]}]
    });

    let id = gateway.persist("model_results", &record);
    assert_eq!(id.as_deref(), Some("Xy12AbCdEfGhIjKlMnOp"));

    let captured = server.join().map_err(|_| anyhow!("server panicked"))??;
    assert!(captured.request_line.starts_with("POST /v1/projects/bins-test/databases/"));
    assert!(captured.request_line.contains("/documents/model_results?key=test-key"));

    let fields = &captured.body["fields"];
    let summary = &fields["detection_summary"]["mapValue"]["fields"];
    assert_eq!(summary["total_detections"], json!({"integerValue": "3"}));
    assert_eq!(summary["overflow_score"], json!({"doubleValue": 24.5}));
    assert_eq!(summary["status"], json!({"stringValue": "LOW_OVERFLOW"}));
    assert_eq!(fields["gps_location"], json!({"nullValue": null}));
    assert!(fields["createdAt"]["timestampValue"].is_string());
    Ok(())
}

#[test]
fn rest_failure_exhausts_chain() -> Result<()> {
    let (endpoint, server) = fake_firestore(
        "500 Internal Server Error",
        json!({"error": {"code": 500}}).to_string(),
    )?;
    let gateway = firestore_gateway(&endpoint);
    assert_eq!(gateway.persist("detection_logs", &json!({"detection_count": 1})), None);
    let captured = server.join().map_err(|_| anyhow!("server panicked"))??;
    assert_eq!(
        captured.body["fields"]["detection_count"],
        json!({"integerValue": "1"})
    );
    Ok(())
}
