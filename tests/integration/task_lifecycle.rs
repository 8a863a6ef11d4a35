//! Task lifecycle integration tests.
//!
//! Worker replies flow through the scheduler into the task bridge; tasks
//! only complete when their evidence carries a commit and a passing marker.

use warden::capture::{CaptureKind, RawCandidate};
use warden::inbox::router::write_envelope;
use warden::inbox::{parse, Envelope, PayloadKind, QueueDir};
use warden::notice::Notice;
use warden::scheduler::IngestOutcome;
use warden::tasks::{BridgeOutcome, TaskBook, TaskState};
use warden::WorkerId;

use crate::fixtures::TestEnv;

const PROGRESS: &str = "Task: X\nCommit Message: commit 1a2b3c4 - tests passed\nStatus: in progress";
const DONE: &str = "Task: X\nActions:\n- did A\nCommit Message: fix\nStatus: done";

/// Test: Clean completion
/// Given a worker reporting a commit with passing tests, then done
/// When both replies are ingested
/// Then the task completes once, a notice names the commit, and the book survives a restart
#[tokio::test]
async fn test_clean_completion_is_verified_and_persisted() {
    let env = TestEnv::new();
    let config = env.config(&["w1"], &[]);
    let mut sched = env.scheduler(config.clone());
    let id = WorkerId::new("w1");

    sched
        .ingest(RawCandidate::new(&id, CaptureKind::File, PROGRESS.to_string()))
        .await;
    {
        let bridge = sched.bridge();
        let bridge = bridge.read().await;
        assert_eq!(bridge.task("x").unwrap().state, TaskState::InProgress);
    }

    sched
        .ingest(RawCandidate::new(&id, CaptureKind::File, DONE.to_string()))
        .await;

    let completions: Vec<_> = env
        .sink
        .notices()
        .into_iter()
        .filter(|n| matches!(n, Notice::TaskCompleted { .. }))
        .collect();
    assert_eq!(
        completions,
        vec![Notice::TaskCompleted {
            task_id: "x".to_string(),
            owner: id.clone(),
            commit_ref: Some("1a2b3c4".to_string()),
        }]
    );
    assert_eq!(completions[0].to_string(), "task completed: x by w1 (1a2b3c4)");

    // Repeating the claim changes nothing
    sched
        .ingest(RawCandidate::new(
            &id,
            CaptureKind::Clipboard,
            format!("{}\n", DONE).replace("did A", "did A again"),
        ))
        .await;
    assert_eq!(
        env.sink
            .notices()
            .iter()
            .filter(|n| matches!(n, Notice::TaskCompleted { .. }))
            .count(),
        1
    );

    sched.persist().await.unwrap();
    let book = TaskBook::load(&config.tasks_path()).unwrap();
    let task = &book.tasks["x"];
    assert_eq!(task.state, TaskState::Completed);
    assert!(task.verified_at.is_some());
    assert_eq!(task.evidence.len(), 3);

    let reloaded = env.scheduler(config);
    let bridge = reloaded.bridge();
    assert_eq!(bridge.read().await.task("x").unwrap().state, TaskState::Completed);
}

/// Test: Done confirms an earlier commit
/// Given a worker that reported a commit id, then replied in the standard layout with done
/// When both replies are ingested
/// Then the task goes new -> in_progress -> completed with one verification
#[tokio::test]
async fn test_done_reply_after_commit_completes() {
    let env = TestEnv::new();
    let mut sched = env.scheduler(env.config(&["w1"], &[]));
    let id = WorkerId::new("w1");

    sched
        .ingest(RawCandidate::new(
            &id,
            CaptureKind::File,
            "Task: X\nCommit Message: commit 1a2b3c4\nStatus: in progress".to_string(),
        ))
        .await;
    sched
        .ingest(RawCandidate::new(&id, CaptureKind::File, DONE.to_string()))
        .await;

    let bridge = sched.bridge();
    let bridge = bridge.read().await;
    assert_eq!(bridge.task("x").unwrap().state, TaskState::Completed);
    assert_eq!(bridge.verified_total(), 1);
    assert_eq!(
        env.sink
            .notices()
            .into_iter()
            .filter(|n| matches!(n, Notice::TaskCompleted { .. }))
            .collect::<Vec<_>>(),
        vec![Notice::TaskCompleted {
            task_id: "x".to_string(),
            owner: id,
            commit_ref: Some("1a2b3c4".to_string()),
        }]
    );
}

/// Test: Done without proof
/// Given a worker that only says it is done
/// When the reply is ingested
/// Then the task stays in progress and no completion is announced
#[tokio::test]
async fn test_unproven_done_claim_is_not_completion() {
    let env = TestEnv::new();
    let mut sched = env.scheduler(env.config(&["w1"], &[]));
    let id = WorkerId::new("w1");

    let outcome = sched
        .ingest(RawCandidate::new(&id, CaptureKind::File, "Task: Y\nStatus: done".to_string()))
        .await;
    match outcome {
        IngestOutcome::Routed(delivery) => match delivery.bridged {
            Some(BridgeOutcome::Applied(applied)) => {
                assert!(applied.unverified_claim);
                assert!(applied.verification.is_none());
            }
            other => panic!("expected applied, got {:?}", other),
        },
        other => panic!("expected routed, got {:?}", other),
    }

    let bridge = sched.bridge();
    assert_eq!(bridge.read().await.task("y").unwrap().state, TaskState::InProgress);
    assert!(!env
        .sink
        .notices()
        .iter()
        .any(|n| matches!(n, Notice::TaskCompleted { .. })));
}

/// Test: Malformed evidence
/// Given a reply with no recognizable fields
/// When it is ingested
/// Then it is still delivered with a fallback summary, and no task is touched
#[tokio::test]
async fn test_malformed_reply_is_delivered_without_task() {
    let env = TestEnv::new();
    let mut sched = env.scheduler(env.config(&["w1"], &[]));
    let id = WorkerId::new("w1");

    let outcome = sched
        .ingest(RawCandidate::new(
            &id,
            CaptureKind::Ocr,
            "asdf whatever no structure".to_string(),
        ))
        .await;
    let delivery = match outcome {
        IngestOutcome::Routed(d) => d,
        other => panic!("expected routed, got {:?}", other),
    };
    assert!(matches!(delivery.bridged, Some(BridgeOutcome::NoOp { .. })));

    let name = delivery.path.file_name().unwrap();
    let archived = env
        .queue_root()
        .join("coordinator")
        .join("archive")
        .join(name);
    let envelope = QueueDir::read(&archived).unwrap();
    assert!(envelope.task_id.is_none());
    assert_eq!(envelope.summary, "asdf whatever no structure");
    assert_eq!(
        envelope.payload.as_ref().map(|p| p.kind),
        Some(PayloadKind::Fallback)
    );

    let bridge = sched.bridge();
    assert!(bridge.read().await.book().tasks.is_empty());
    assert_eq!(sched.worker(&id).unwrap().responses, 1);
}

/// Test: Envelopes left by other writers
/// Given task envelopes written straight into the coordinator queue
/// When the scheduler drains bridged queues
/// Then they are applied in order and archived
#[tokio::test]
async fn test_drain_applies_queued_envelopes() {
    let env = TestEnv::new();
    let mut sched = env.scheduler(env.config(&["w1"], &[]));
    let id = WorkerId::new("w1");
    let queue_dir = env.queue_root().join("coordinator");
    let start = env.now();

    for (offset, text) in [(0, PROGRESS), (5, DONE)] {
        let candidate = RawCandidate::new(&id, CaptureKind::File, text.to_string());
        let envelope = Envelope::from_capture(
            &candidate,
            parse(text),
            "coordinator",
            start + chrono::Duration::seconds(offset),
        );
        write_envelope(&queue_dir, &envelope).unwrap();
    }
    std::fs::write(queue_dir.join("garbage.json"), "{ not json").unwrap();

    assert_eq!(sched.drain_bridged().await, 2);

    let queue = QueueDir::new(&queue_dir);
    assert!(queue.pending().unwrap().is_empty());
    assert!(queue_dir.join("rejected").join("garbage.json").exists());

    let bridge = sched.bridge();
    let bridge = bridge.read().await;
    assert_eq!(bridge.task("x").unwrap().state, TaskState::Completed);
    assert_eq!(bridge.verified_total(), 1);
}
