//! Scheduler cadence integration tests.
//!
//! Each tick sends every scheduled worker one instruction; which one depends
//! on the tick number and the worker's onboarding state.

use std::collections::BTreeMap;

use warden::capture::{CaptureKind, RawCandidate};
use warden::monitor::{Decision, HealthSummary, Tier};
use warden::notice::Notice;
use warden::WorkerId;

use crate::fixtures::TestEnv;

/// Test: Default phase rotation
/// Given two onboarded workers and the built-in phase list
/// When six ticks run
/// Then each worker sees every phase once, in order, then wraps around
#[tokio::test]
async fn test_phases_rotate_per_tick() {
    let env = TestEnv::new();
    let mut sched = env.scheduler(env.config(&["w1", "w2"], &[]));

    let mut phases = Vec::new();
    for _ in 0..6 {
        let report = sched.tick().await;
        assert_eq!(report.instructed.len(), 2);
        phases.push(report.phase);
    }
    assert_eq!(
        phases,
        vec!["resume", "do_task", "coordinate", "status_sync", "verify", "resume"]
    );
    assert_eq!(env.channel.tags_for("w1"), phases);
    assert_eq!(env.channel.tags_for("w2"), phases);
    assert_eq!(sched.tick_count(), 6);

    // Templates are rendered per worker
    let texts: Vec<String> = env
        .channel
        .instructions()
        .into_iter()
        .filter(|i| i.tag == "do_task")
        .map(|i| i.text)
        .collect();
    assert!(texts[0].starts_with("w1: continue"));
    assert!(texts[1].starts_with("w2: continue"));
    assert!(texts[0].contains("Commit Message:"));
}

/// Test: Onboarding replaces the phase instruction
/// Given a worker that has not onboarded yet
/// When ticks run before and after its first reply
/// Then it gets onboarding text until it replies, then phase instructions
#[tokio::test]
async fn test_onboarding_until_first_reply() {
    let env = TestEnv::new();
    let mut sched = env.scheduler(env.config(&["w1", "w4"], &["w4"]));
    let w4 = WorkerId::new("w4");

    sched.tick().await;
    sched.tick().await;
    assert_eq!(env.channel.tags_for("w4"), vec!["onboarding", "onboarding"]);
    assert_eq!(env.channel.tags_for("w1"), vec!["resume", "do_task"]);
    let onboarding = &env.channel.instructions()[1];
    assert!(onboarding.text.starts_with("You are w4"));
    assert!(onboarding.text.contains("coordinator coordinator"));

    sched
        .ingest(RawCandidate::new(
            &w4,
            CaptureKind::File,
            "Task: Setup\nStatus: working".to_string(),
        ))
        .await;
    assert!(sched.worker(&w4).unwrap().onboarded);

    let report = sched.tick().await;
    assert_eq!(report.phase, "coordinate");
    assert_eq!(
        env.channel.tags_for("w4"),
        vec!["onboarding", "onboarding", "coordinate"]
    );
}

/// Test: Unscheduled workers are monitored but never instructed
/// Given one worker with scheduling turned off
/// When ticks run
/// Then it receives nothing but still appears in the health summary
#[tokio::test]
async fn test_unscheduled_worker_is_not_instructed() {
    let env = TestEnv::new();
    let mut config = env.config(&["w1", "w5"], &[]);
    config.workers[1].scheduled = false;
    let status_path = config.status_path();
    let mut sched = env.scheduler(config);

    for _ in 0..3 {
        let report = sched.tick().await;
        assert_eq!(report.instructed, vec![WorkerId::new("w1")]);
    }
    assert!(env.channel.tags_for("w5").is_empty());

    let summary = HealthSummary::load(&status_path).unwrap().unwrap();
    assert!(summary.workers.contains_key(&WorkerId::new("w5")));
}

/// Test: Custom phases and templates
/// Given a two-phase cycle where one phase has no template
/// When ticks run
/// Then the templated phase is sent and the other is skipped
#[tokio::test]
async fn test_custom_phase_without_template_is_skipped() {
    let env = TestEnv::new();
    let mut config = env.config(&["w1"], &[]);
    config.scheduler.phases = vec!["standup".to_string(), "retro".to_string()];
    config.scheduler.templates = BTreeMap::from([(
        "standup".to_string(),
        "{worker} ({role}): standup, one line".to_string(),
    )]);
    let mut sched = env.scheduler(config);

    let report = sched.tick().await;
    assert_eq!(report.phase, "standup");
    assert_eq!(report.instructed, vec![WorkerId::new("w1")]);
    assert_eq!(
        env.channel.instructions()[0].text,
        format!("w1 ({}): standup, one line", sched.worker(&WorkerId::new("w1")).unwrap().role)
    );

    let report = sched.tick().await;
    assert_eq!(report.phase, "retro");
    assert!(report.instructed.is_empty());
    assert!(report.failed.is_empty());
    assert_eq!(env.channel.instructions().len(), 1);
}

/// Test: Delivery failure is isolated
/// Given one worker whose instructions cannot be delivered
/// When a tick runs
/// Then the others are instructed and the failure is reported and persisted
#[tokio::test]
async fn test_failed_worker_does_not_block_tick() {
    let env = TestEnv::new();
    let config = env.config(&["w1", "w2", "w3"], &[]);
    let status_path = config.status_path();
    let mut sched = env.scheduler(config);
    env.channel.fail_for("w2");

    let report = sched.tick().await;
    assert_eq!(
        report.instructed,
        vec![WorkerId::new("w1"), WorkerId::new("w3")]
    );
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, WorkerId::new("w2"));

    assert!(env.sink.notices().iter().any(|n| matches!(
        n,
        Notice::InstructionFailed { worker, tag, .. } if worker.as_str() == "w2" && tag == "resume"
    )));

    let summary = HealthSummary::load(&status_path).unwrap().unwrap();
    assert!(summary.updated_at.is_some());
    assert_eq!(summary.workers[&WorkerId::new("w2")].instruction_failures, 1);
    assert!(summary.render().contains("1 instruction failures"));
}

/// Test: Ticks run the monitor pass
/// Given a worker that has been silent past the warn threshold
/// When a tick runs
/// Then the report carries the escalation step
#[tokio::test]
async fn test_tick_reports_escalations() {
    let env = TestEnv::new();
    let start = env.now();
    let mut sched = env.scheduler(env.config(&["w1", "w2"], &[]));

    env.at(start, 480);
    env.touch("w1", "scratch.md");
    let report = sched.tick().await;
    assert_eq!(
        report.escalations,
        vec![(WorkerId::new("w2"), Decision::Act(Tier::Warned))]
    );
    assert_eq!(env.channel.clears(), vec![WorkerId::new("w2")]);
    assert!(report.to_string().contains("1 escalation steps"));
}
