//! Capture pipeline integration tests.
//!
//! Raw text enters through a capture strategy, is parsed and deduplicated
//! by the scheduler, and lands as an envelope in the destination queue.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use warden::capture::{
    build_strategy, CaptureEvent, CaptureKind, CapturePoller, CaptureStrategy, RawCandidate,
};
use warden::config::CaptureSpec;
use warden::inbox::{Envelope, PayloadKind, QueueDir, EMPTY_MARKER, ENVELOPE_VERSION};
use warden::notice::Notice;
use warden::scheduler::IngestOutcome;
use warden::WorkerId;

use crate::fixtures::TestEnv;

const STRUCTURED: &str = "Task: Parser\n\
Actions:\n\
- split fields\n\
- added tests\n\
Commit Message: commit 9f8e7d6 wire parser\n\
Status: in progress";

fn candidates(events: Vec<CaptureEvent>) -> Vec<RawCandidate> {
    events
        .into_iter()
        .filter_map(|e| match e {
            CaptureEvent::Candidate(c) => Some(c),
            _ => None,
        })
        .collect()
}

/// Test: Evidence file end to end
/// Given a worker whose evidence file does not exist yet
/// When the worker writes a structured reply and the file is polled
/// Then the reply is routed to the coordinator and archived by the bridge
#[tokio::test]
async fn test_file_capture_routes_to_coordinator() {
    let env = TestEnv::new();
    let config = env.config(&["w1"], &[]);
    let id = WorkerId::new("w1");
    let strategy = build_strategy(&CaptureSpec::file(), &id, &config).unwrap();
    let (tx, _rx) = mpsc::channel(8);
    let mut poller = CapturePoller::new(id.clone(), strategy, tx);
    let mut sched = env.scheduler(config);

    // Nothing to read while the file is missing
    assert!(candidates(poller.poll_once().await).is_empty());

    let dir = env.side_root().join("w1");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("response.md"), STRUCTURED).unwrap();

    let found = candidates(poller.poll_once().await);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].source, CaptureKind::File);

    let outcome = sched.ingest(found[0].clone()).await;
    let delivery = match outcome {
        IngestOutcome::Routed(d) => d,
        other => panic!("expected routed, got {:?}", other),
    };
    assert!(delivery.bridged.is_some());

    // The bridge archived the file after applying it
    let queue = QueueDir::new(env.queue_root().join("coordinator"));
    assert!(queue.pending().unwrap().is_empty());
    let archived: Vec<_> = fs::read_dir(queue.path().join("archive"))
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(archived.len(), 1);

    let bridge = sched.bridge();
    let bridge = bridge.read().await;
    let task = bridge.task("parser").expect("task created from reply");
    assert_eq!(task.owner, id);
    assert_eq!(task.evidence.len(), 1);

    // A second poll without new writes yields nothing
    drop(bridge);
    assert!(candidates(poller.poll_once().await).is_empty());
}

/// Test: Unbridged destination keeps the envelope file
/// Given a config that bridges no destination
/// When a reply is ingested
/// Then a versioned envelope file waits in the coordinator queue
#[tokio::test]
async fn test_unbridged_envelope_stays_queued() {
    let env = TestEnv::new();
    let mut config = env.config(&["w1"], &[]);
    config.router.bridge = Vec::new();
    let mut sched = env.scheduler(config);
    let id = WorkerId::new("w1");

    let outcome = sched
        .ingest(RawCandidate::new(&id, CaptureKind::File, STRUCTURED.to_string()))
        .await;
    assert!(matches!(outcome, IngestOutcome::Routed(_)));

    let queue = QueueDir::new(env.queue_root().join("coordinator"));
    let pending = queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    let name = pending[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.contains("_w1_to_coordinator_"), "unexpected name {}", name);

    let envelope: Envelope = QueueDir::read(&pending[0]).unwrap();
    assert_eq!(envelope.version, ENVELOPE_VERSION);
    assert_eq!(envelope.from, id);
    assert_eq!(envelope.to, "coordinator");
    assert_eq!(envelope.task_id.as_deref(), Some("parser"));
    assert_eq!(
        envelope.payload.as_ref().map(|p| p.kind),
        Some(PayloadKind::Structured)
    );

    // Nothing reached the task bridge
    let bridge = sched.bridge();
    assert!(bridge.read().await.book().tasks.is_empty());
}

/// Test: Same reply through two sources
/// Given a reply already captured from the evidence file
/// When the clipboard yields the same text
/// Then only one envelope is written
#[tokio::test]
async fn test_duplicate_across_sources_is_dropped() {
    let env = TestEnv::new();
    let mut config = env.config(&["w1"], &[]);
    config.router.bridge = Vec::new();
    let mut sched = env.scheduler(config);
    let id = WorkerId::new("w1");

    let first = sched
        .ingest(RawCandidate::new(&id, CaptureKind::File, STRUCTURED.to_string()))
        .await;
    assert!(matches!(first, IngestOutcome::Routed(_)));

    let second = sched
        .ingest(RawCandidate::new(&id, CaptureKind::Clipboard, STRUCTURED.to_string()))
        .await;
    assert!(matches!(second, IngestOutcome::Duplicate));

    let queue = QueueDir::new(env.queue_root().join("coordinator"));
    assert_eq!(queue.pending().unwrap().len(), 1);
    assert_eq!(sched.worker(&id).unwrap().responses, 1);
}

/// Test: Blank capture
/// Given a source that yields only whitespace
/// When it is ingested
/// Then one envelope carrying the empty marker is delivered, but it is not counted as a reply
#[tokio::test]
async fn test_blank_capture_is_delivered_with_marker() {
    let env = TestEnv::new();
    let mut config = env.config(&["w1"], &[]);
    config.router.bridge = Vec::new();
    let mut sched = env.scheduler(config);
    let id = WorkerId::new("w1");

    let blank = sched
        .ingest(RawCandidate::new(&id, CaptureKind::Ocr, "   \n".to_string()))
        .await;
    assert!(matches!(blank, IngestOutcome::Routed(_)));

    let queue = QueueDir::new(env.queue_root().join("coordinator"));
    let pending = queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    let envelope = QueueDir::read(&pending[0]).unwrap();
    assert_eq!(envelope.summary, EMPTY_MARKER);
    assert!(envelope.payload.is_none());
    assert!(envelope.task_id.is_none());
    assert_eq!(sched.worker(&id).unwrap().responses, 0);

    // The same blank again is a duplicate like any other text
    let again = sched
        .ingest(RawCandidate::new(&id, CaptureKind::Ocr, "   \n".to_string()))
        .await;
    assert!(matches!(again, IngestOutcome::Duplicate));
}

/// A source whose reachability the test controls.
struct Flaky {
    up: Arc<AtomicBool>,
}

#[async_trait]
impl CaptureStrategy for Flaky {
    fn kind(&self) -> CaptureKind {
        CaptureKind::Clipboard
    }

    async fn poll(&mut self, _worker: &WorkerId) -> Vec<RawCandidate> {
        Vec::new()
    }

    fn available(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }
}

/// Test: Source degradation is surfaced
/// Given a clipboard source that cannot be reached
/// When it stays unreachable for the configured number of polls
/// Then health lists it as degraded until it comes back
#[tokio::test]
async fn test_unreachable_source_reports_degraded_and_recovered() {
    let env = TestEnv::new();
    let mut sched = env.scheduler(env.config(&["w1"], &[]));
    let id = WorkerId::new("w1");
    let up = Arc::new(AtomicBool::new(false));
    let (tx, _rx) = mpsc::channel(8);
    let mut poller =
        CapturePoller::new(id.clone(), Box::new(Flaky { up: up.clone() }), tx).with_degraded_after(3);

    let mut events = Vec::new();
    for _ in 0..3 {
        events.extend(poller.poll_once().await);
    }
    assert_eq!(
        events,
        vec![CaptureEvent::Degraded {
            worker: id.clone(),
            source: CaptureKind::Clipboard,
            empty_polls: 3,
        }]
    );
    for event in events {
        sched.handle_capture(event).await;
    }
    assert!(sched.health().workers[&id]
        .degraded_sources
        .contains("clipboard"));

    // Still down: no repeated report
    assert!(poller.poll_once().await.is_empty());

    up.store(true, Ordering::SeqCst);
    for event in poller.poll_once().await {
        sched.handle_capture(event).await;
    }
    assert!(sched.health().workers[&id].degraded_sources.is_empty());

    let notices = env.sink.notices();
    assert!(matches!(notices[0], Notice::SourceDegraded { empty_polls: 3, .. }));
    assert!(matches!(notices[1], Notice::SourceRecovered { .. }));
}

/// Test: Failed write is held and redelivered
/// Given a queue root that cannot be created
/// When a reply is ingested
/// Then it is held, reported, and delivered on the next retry round
#[tokio::test]
async fn test_unwritable_queue_holds_then_redelivers() {
    let env = TestEnv::new();
    let mut config = env.config(&["w1"], &[]);
    config.router.max_attempts = 1;
    config.router.bridge = Vec::new();
    let mut sched = env.scheduler(config);
    let id = WorkerId::new("w1");

    // A plain file where the queue root directory should be
    fs::write(env.queue_root(), "in the way").unwrap();

    let outcome = sched
        .ingest(RawCandidate::new(&id, CaptureKind::File, STRUCTURED.to_string()))
        .await;
    assert!(matches!(outcome, IngestOutcome::Held(_)));
    assert_eq!(sched.router().pending_count(), 1);
    assert_eq!(sched.health().workers[&id].delivery_failures, 1);
    assert!(matches!(
        env.sink.notices().last(),
        Some(Notice::DeliveryFailed { .. })
    ));

    // Still blocked: stays held
    assert_eq!(sched.retry_deliveries().await, (0, 0));

    fs::remove_file(env.queue_root()).unwrap();
    assert_eq!(sched.retry_deliveries().await, (1, 0));
    assert_eq!(sched.router().pending_count(), 0);

    let queue = QueueDir::new(env.queue_root().join("coordinator"));
    assert_eq!(queue.pending().unwrap().len(), 1);
}
