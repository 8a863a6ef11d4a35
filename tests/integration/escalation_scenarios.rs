//! Escalation integration tests.
//!
//! Time is driven by the manual clock; side-channel activity is simulated
//! by writing files whose mtime matches the clock.

use warden::monitor::{Decision, EscalationStep, Tier};
use warden::notice::Notice;
use warden::{ActivityLevel, WorkerId};

use crate::fixtures::TestEnv;

fn decision_for(steps: &[(WorkerId, EscalationStep)], worker: &str) -> Decision {
    steps
        .iter()
        .find(|(id, _)| id.as_str() == worker)
        .map(|(_, step)| step.decision)
        .expect("worker evaluated")
}

/// Test: Quiet worker is warned, rescued, then resets on activity
/// Given an onboarded worker with no side-channel activity
/// When 480s and then 600s pass, and the worker writes a file at 610s
/// Then input is cleared, a rescue prompt is sent, and escalation resets
#[tokio::test]
async fn test_warn_rescue_then_reset() {
    let env = TestEnv::new();
    let start = env.now();
    let mut sched = env.scheduler(env.config(&["w2"], &[]));
    let id = WorkerId::new("w2");

    env.at(start, 300);
    let steps = sched.monitor_pass().await;
    assert_eq!(decision_for(&steps, "w2"), Decision::NoOp);
    assert_eq!(sched.worker(&id).unwrap().level, ActivityLevel::Idle);

    env.at(start, 480);
    let steps = sched.monitor_pass().await;
    assert_eq!(decision_for(&steps, "w2"), Decision::Act(Tier::Warned));
    assert_eq!(env.channel.clears(), vec![id.clone()]);
    assert!(env.channel.instructions().is_empty());

    // Warn cooldown still running
    env.at(start, 540);
    let steps = sched.monitor_pass().await;
    assert_eq!(decision_for(&steps, "w2"), Decision::NoOp);

    env.at(start, 600);
    let steps = sched.monitor_pass().await;
    assert_eq!(decision_for(&steps, "w2"), Decision::Act(Tier::Rescued));
    assert_eq!(env.channel.tags_for("w2"), vec!["rescue".to_string()]);
    let rescue = &env.channel.instructions()[0];
    assert!(rescue.text.contains("600s"), "rescue text: {}", rescue.text);
    assert!(!rescue.new_session);
    assert_eq!(sched.escalation().tier(&id), Tier::Rescued);

    env.at(start, 610);
    env.touch("w2", "notes.md");
    let steps = sched.monitor_pass().await;
    assert_eq!(
        decision_for(&steps, "w2"),
        Decision::Reset {
            from: Tier::Rescued
        }
    );
    assert_eq!(sched.escalation().tier(&id), Tier::None);
    assert_eq!(sched.worker(&id).unwrap().level, ActivityLevel::Active);
    assert_eq!(sched.worker(&id).unwrap().escalation_attempts, 2);

    let lines = env.sink.lines();
    assert_eq!(
        lines,
        vec![
            "escalation: w2 warned after 480s idle".to_string(),
            "worker stalled: w2 silent for 600s".to_string(),
            "escalation: w2 rescued after 600s idle".to_string(),
            "worker recovered: w2".to_string(),
        ]
    );
}

/// Test: Onboarding grace withholds escalation
/// Given a worker still onboarding with a 600s grace period
/// When it stays silent
/// Then nothing escalates until the grace period has run out
#[tokio::test]
async fn test_onboarding_grace_defers_escalation() {
    let env = TestEnv::new();
    let start = env.now();
    let mut sched = env.scheduler(env.config(&["w3"], &["w3"]));
    let id = WorkerId::new("w3");

    for secs in [300, 540, 599] {
        env.at(start, secs);
        let steps = sched.monitor_pass().await;
        assert_eq!(decision_for(&steps, "w3"), Decision::NoOp, "at {}s", secs);
        assert!(sched.worker(&id).unwrap().level <= ActivityLevel::Idle);
    }
    assert!(env.channel.clears().is_empty());

    env.at(start, 900);
    let steps = sched.monitor_pass().await;
    assert_eq!(sched.worker(&id).unwrap().level, ActivityLevel::Stall);
    assert_eq!(decision_for(&steps, "w3"), Decision::Act(Tier::Warned));
}

/// Test: A reply counts as activity
/// Given a warned worker
/// When a reply from it is ingested
/// Then the next pass resets its escalation
#[tokio::test]
async fn test_reply_resets_escalation() {
    use warden::capture::{CaptureKind, RawCandidate};

    let env = TestEnv::new();
    let start = env.now();
    let mut sched = env.scheduler(env.config(&["w2"], &[]));
    let id = WorkerId::new("w2");

    env.at(start, 500);
    sched.monitor_pass().await;
    assert_eq!(sched.escalation().tier(&id), Tier::Warned);

    env.at(start, 520);
    sched
        .ingest(RawCandidate::new(
            &id,
            CaptureKind::Clipboard,
            "Task: Docs\nStatus: working".to_string(),
        ))
        .await;
    let steps = sched.monitor_pass().await;
    assert_eq!(
        decision_for(&steps, "w2"),
        Decision::Reset { from: Tier::Warned }
    );
    assert_eq!(sched.worker(&id).unwrap().responses, 1);
}

/// Test: Long silence ends in a new session
/// Given a worker that stays silent after being rescued
/// When the rescue cooldown has passed
/// Then it is restarted with onboarding text and gets a fresh grace period
#[tokio::test]
async fn test_restart_after_rescue_cooldown() {
    let env = TestEnv::new();
    let start = env.now();
    let mut sched = env.scheduler(env.config(&["w2"], &[]));
    let id = WorkerId::new("w2");

    for secs in [480, 600] {
        env.at(start, secs);
        sched.monitor_pass().await;
    }
    assert_eq!(sched.escalation().tier(&id), Tier::Rescued);

    env.at(start, 900);
    let steps = sched.monitor_pass().await;
    assert_eq!(decision_for(&steps, "w2"), Decision::Act(Tier::Restarted));

    let restart = env.channel.instructions().pop().unwrap();
    assert_eq!(restart.tag, "restart");
    assert!(restart.new_session);
    let worker = sched.worker(&id).unwrap();
    assert!(!worker.onboarded);
    assert_eq!(sched.escalation().record(&id).unwrap().restarts, 1);

    // Back in onboarding grace: level capped, nothing fires
    env.at(start, 1000);
    let steps = sched.monitor_pass().await;
    assert_eq!(decision_for(&steps, "w2"), Decision::NoOp);
    assert_eq!(sched.worker(&id).unwrap().level, ActivityLevel::Idle);
}

/// Test: Failed escalation delivery
/// Given a worker whose channel rejects every delivery
/// When the warn tier fires
/// Then the failure is reported and the attempt still counts
#[tokio::test]
async fn test_failed_escalation_is_reported_once() {
    let env = TestEnv::new();
    let start = env.now();
    let mut sched = env.scheduler(env.config(&["w2"], &[]));
    let id = WorkerId::new("w2");
    env.channel.fail_for("w2");

    env.at(start, 480);
    let steps = sched.monitor_pass().await;
    let (_, step) = &steps[0];
    assert_eq!(step.decision, Decision::Act(Tier::Warned));
    assert!(step.failure.is_some());
    assert_eq!(sched.health().workers[&id].instruction_failures, 1);
    assert!(env.sink.notices().iter().any(|n| matches!(
        n,
        Notice::InstructionFailed { tag, .. } if tag == "warned"
    )));

    // Cooldown applies to failed attempts too
    env.at(start, 500);
    let steps = sched.monitor_pass().await;
    assert_eq!(decision_for(&steps, "w2"), Decision::NoOp);
    assert_eq!(sched.escalation().record(&id).unwrap().warn_attempts, 1);
}
