//! Cadence scheduler: the coordinating loop.
//!
//! One task owns every worker record. On each tick it sends each scheduled
//! worker the instruction for the current workflow phase, then runs an
//! activity/escalation pass, retries held deliveries, drains bridged queues
//! and writes the health summary. Captured text arrives from the pollers
//! over a channel and is parsed, deduplicated and routed in arrival order.

use futures::future::join_all;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::capture::{spawn_pollers, CaptureEvent, RawCandidate};
use crate::clock::Clock;
use crate::config::Config;
use crate::driver::{Instruction, SharedChannel};
use crate::inbox::{parse, Deduplicator, Delivery, Envelope, QueueDir, RetryPolicy, Router};
use crate::monitor::{
    ActivityMonitor, ActivitySignal, Decision, EscalationController, EscalationStep,
    HealthSummary, SideChannelWatcher,
};
use crate::notice::{Notice, Notices};
use crate::prompts::{self, PromptContext};
use crate::tasks::{SharedBridge, TaskBook, TaskBridge};
use crate::worker::{ActivityLevel, Worker, WorkerId};
use crate::{wlog, wlog_debug, wlog_error, wlog_warn, Error, Result};

const CAPTURE_BUFFER: usize = 256;

/// Built-in workflow phases, in default order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowPhase {
    Resume,
    DoTask,
    Coordinate,
    StatusSync,
    Verify,
}

impl WorkflowPhase {
    pub const ALL: [WorkflowPhase; 5] = [
        WorkflowPhase::Resume,
        WorkflowPhase::DoTask,
        WorkflowPhase::Coordinate,
        WorkflowPhase::StatusSync,
        WorkflowPhase::Verify,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowPhase::Resume => "resume",
            WorkflowPhase::DoTask => "do_task",
            WorkflowPhase::Coordinate => "coordinate",
            WorkflowPhase::StatusSync => "status_sync",
            WorkflowPhase::Verify => "verify",
        }
    }

    pub fn default_template(&self) -> &'static str {
        match self {
            WorkflowPhase::Resume => prompts::RESUME,
            WorkflowPhase::DoTask => prompts::DO_TASK,
            WorkflowPhase::Coordinate => prompts::COORDINATE,
            WorkflowPhase::StatusSync => prompts::STATUS_SYNC,
            WorkflowPhase::Verify => prompts::VERIFY,
        }
    }
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WorkflowPhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        WorkflowPhase::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| Error::Config(format!("unknown workflow phase '{}'", s)))
    }
}

/// What happened to one captured candidate.
#[derive(Debug)]
pub enum IngestOutcome {
    Routed(Delivery),
    /// Written nowhere yet; the router holds it for retry.
    Held(String),
    Duplicate,
    UnknownWorker,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub tick: u64,
    pub phase: String,
    pub instructed: Vec<WorkerId>,
    pub failed: Vec<(WorkerId, String)>,
    pub escalations: Vec<(WorkerId, Decision)>,
    pub redelivered: usize,
    pub dropped: usize,
    pub drained: usize,
}

impl std::fmt::Display for TickReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tick {} [{}]: {} instructed, {} failed, {} escalation steps, {} redelivered, {} dropped, {} drained",
            self.tick,
            self.phase,
            self.instructed.len(),
            self.failed.len(),
            self.escalations.len(),
            self.redelivered,
            self.dropped,
            self.drained
        )
    }
}

pub struct Scheduler {
    config: Config,
    clock: Arc<dyn Clock>,
    channel: SharedChannel,
    workers: BTreeMap<WorkerId, Worker>,
    monitor: ActivityMonitor,
    escalation: EscalationController,
    dedup: Deduplicator,
    router: Router,
    bridge: SharedBridge,
    notices: Notices,
    health: HealthSummary,
    prompts: PromptContext,
    ticks: u64,
}

impl Scheduler {
    /// Build the loop state. The task book is reloaded from the state dir.
    pub fn new(
        config: Config,
        clock: Arc<dyn Clock>,
        channel: SharedChannel,
        notices: Notices,
    ) -> Result<Self> {
        let now = clock.now();
        let book = TaskBook::load(&config.tasks_path())?;
        wlog_debug!("Scheduler::new: {} tasks reloaded", book.tasks.len());
        let bridge = TaskBridge::new(&config.completion).with_book(book).shared();
        let router = Router::new(config.queue_root(), RetryPolicy::from(&config.router))
            .with_bridge(bridge.clone(), &config.router.bridge);

        let workers = config
            .workers
            .iter()
            .map(|wc| {
                let w = Worker::from_config(wc, now);
                (w.id.clone(), w)
            })
            .collect();

        let prompts = PromptContext::from_config(&config);
        let onboarding = config
            .scheduler
            .onboarding_template
            .clone()
            .unwrap_or_else(|| prompts::ONBOARDING.to_string());
        let escalation = EscalationController::new(&config.escalation)
            .with_prompts(prompts.clone(), onboarding);

        Ok(Self {
            monitor: ActivityMonitor::new(&config.activity, config.side_channel_root()),
            dedup: Deduplicator::new(config.capture.dedup_capacity),
            escalation,
            router,
            bridge,
            clock,
            channel,
            workers,
            notices,
            health: HealthSummary::default(),
            prompts,
            ticks: 0,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn worker(&self, id: &WorkerId) -> Option<&Worker> {
        self.workers.get(id)
    }

    pub fn workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    pub fn escalation(&self) -> &EscalationController {
        &self.escalation
    }

    pub fn bridge(&self) -> SharedBridge {
        self.bridge.clone()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn health(&self) -> &HealthSummary {
        &self.health
    }

    pub fn tick_count(&self) -> u64 {
        self.ticks
    }

    /// Phase name used by tick number `tick` (1-based).
    pub fn phase_for(&self, tick: u64) -> &str {
        let phases = &self.config.scheduler.phases;
        if phases.is_empty() {
            return "";
        }
        let idx = ((tick.max(1) - 1) % phases.len() as u64) as usize;
        &phases[idx]
    }

    fn phase_template(&self, phase: &str) -> Option<String> {
        if let Some(t) = self.config.scheduler.templates.get(phase) {
            return Some(t.clone());
        }
        WorkflowPhase::from_str(phase)
            .ok()
            .map(|p| p.default_template().to_string())
    }

    fn onboarding_template(&self) -> &str {
        self.config
            .scheduler
            .onboarding_template
            .as_deref()
            .unwrap_or(prompts::ONBOARDING)
    }

    /// Side-channel activity reported by the watcher. Times past the
    /// clock's now are recorded as now.
    pub fn record_activity(
        &mut self,
        id: &WorkerId,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<bool> {
        let now = self.clock.now();
        let worker = self
            .workers
            .get_mut(id)
            .ok_or_else(|| Error::UnknownWorker(id.to_string()))?;
        Ok(worker.record_activity(at.min(now)))
    }

    /// Parse, deduplicate and route one captured candidate.
    pub async fn ingest(&mut self, candidate: RawCandidate) -> IngestOutcome {
        let now = self.clock.now();
        let Some(worker) = self.workers.get_mut(&candidate.worker) else {
            wlog_warn!(
                "Scheduler: capture from unknown worker {} dropped",
                candidate.worker
            );
            return IngestOutcome::UnknownWorker;
        };
        if !self.dedup.is_new(&candidate.worker, &candidate.text) {
            wlog_debug!(
                "Scheduler: duplicate {} capture from {}",
                candidate.source,
                candidate.worker
            );
            return IngestOutcome::Duplicate;
        }

        let payload = parse(&candidate.text);
        // A blank capture is still delivered, but it is not a reply.
        let blank = payload.is_empty();
        let envelope = Envelope::from_capture(
            &candidate,
            payload,
            &self.config.scheduler.coordinator,
            now,
        );
        if !blank {
            worker.record_response(now);
        }
        wlog_debug!(
            "Scheduler: {} envelope {} from {} ({})",
            envelope.kind.as_str(),
            envelope.id,
            envelope.from,
            envelope.summary
        );

        let from = envelope.from.clone();
        let destination = envelope.to.clone();
        let outcome = match self.router.route(envelope).await {
            Ok(delivery) => IngestOutcome::Routed(delivery),
            Err(e) => {
                let reason = e.to_string();
                self.health.delivery_failed(&from, &reason);
                self.notices.emit(Notice::DeliveryFailed {
                    from,
                    destination,
                    reason: reason.clone(),
                });
                IngestOutcome::Held(reason)
            }
        };
        self.flush_verifications().await;
        outcome
    }

    pub async fn handle_capture(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Candidate(candidate) => {
                self.ingest(candidate).await;
            }
            CaptureEvent::Degraded {
                worker,
                source,
                empty_polls,
            } => {
                self.health.source_degraded(&worker, source.as_str());
                self.notices.emit(Notice::SourceDegraded {
                    worker,
                    source: source.to_string(),
                    empty_polls,
                });
            }
            CaptureEvent::Recovered { worker, source } => {
                self.health.source_recovered(&worker, source.as_str());
                self.notices.emit(Notice::SourceRecovered {
                    worker,
                    source: source.to_string(),
                });
            }
        }
    }

    /// One cadence step: instruct, monitor, retry, drain, persist.
    pub async fn tick(&mut self) -> TickReport {
        self.ticks += 1;
        let phase = self.phase_for(self.ticks).to_string();
        let mut report = TickReport {
            tick: self.ticks,
            phase: phase.clone(),
            ..Default::default()
        };

        let phase_template = self.phase_template(&phase);
        if phase_template.is_none() {
            wlog_warn!("Scheduler: phase '{}' has no template; skipping", phase);
        }
        let onboarding = self.onboarding_template().to_string();
        let channel = self.channel.clone();

        for worker in self.workers.values().filter(|w| w.scheduled) {
            let instruction = if !worker.onboarded {
                Instruction::new(
                    &worker.id,
                    self.prompts.render(&onboarding, worker, &[]),
                    "onboarding",
                )
            } else if let Some(template) = &phase_template {
                Instruction::new(&worker.id, self.prompts.render(template, worker, &[]), &phase)
            } else {
                continue;
            };

            match channel.deliver(worker, &instruction).await {
                Ok(()) => report.instructed.push(worker.id.clone()),
                Err(e) => {
                    let reason = e.to_string();
                    wlog_warn!(
                        "Scheduler: {} [{}] not delivered: {}",
                        worker.id,
                        instruction.tag,
                        reason
                    );
                    self.health.instruction_failed(&worker.id, &reason);
                    self.notices.emit(Notice::InstructionFailed {
                        worker: worker.id.clone(),
                        tag: instruction.tag.clone(),
                        reason: reason.clone(),
                    });
                    report.failed.push((worker.id.clone(), reason));
                }
            }
        }

        report.escalations = self
            .monitor_pass()
            .await
            .into_iter()
            .filter(|(_, step)| step.decision != Decision::NoOp)
            .map(|(id, step)| (id, step.decision))
            .collect();

        let (redelivered, dropped) = self.retry_deliveries().await;
        report.redelivered = redelivered;
        report.dropped = dropped;
        report.drained = self.drain_bridged().await;
        self.flush_verifications().await;

        if let Err(e) = self.persist().await {
            wlog_error!("Scheduler: could not persist state: {}", e);
        }
        wlog!("{}", report);
        report
    }

    /// Refresh activity, classify and escalate every worker.
    pub async fn monitor_pass(&mut self) -> Vec<(WorkerId, EscalationStep)> {
        let now = self.clock.now();
        let channel = self.channel.clone();
        let mut steps = Vec::new();

        for worker in self.workers.values_mut() {
            self.monitor.refresh(worker, now);
            let change = self.monitor.observe(worker, now);
            if change.entered(ActivityLevel::Stall) {
                self.notices.emit(Notice::WorkerStalled {
                    worker: worker.id.clone(),
                    idle_secs: worker.idle(now).as_secs(),
                });
            } else if change.recovered() {
                self.notices.emit(Notice::WorkerRecovered {
                    worker: worker.id.clone(),
                });
            }

            let idle_secs = worker.idle(now).as_secs();
            let step = self.escalation.evaluate(worker, channel.as_ref(), now).await;
            if let Decision::Act(tier) = step.decision {
                self.notices.emit(Notice::EscalationFired {
                    worker: worker.id.clone(),
                    tier,
                    idle_secs,
                });
            }
            if let Some(reason) = &step.failure {
                self.health.instruction_failed(&worker.id, reason);
                self.notices.emit(Notice::InstructionFailed {
                    worker: worker.id.clone(),
                    tag: match step.decision {
                        Decision::Act(tier) => tier.as_str().to_string(),
                        _ => String::new(),
                    },
                    reason: reason.clone(),
                });
            }

            self.health.worker_mut(&worker.id).observe(
                worker,
                self.escalation.record(&worker.id),
                now,
            );
            steps.push((worker.id.clone(), step));
        }
        steps
    }

    /// Returns (redelivered, dropped).
    pub async fn retry_deliveries(&mut self) -> (usize, usize) {
        if self.router.pending_count() == 0 {
            return (0, 0);
        }
        let report = self.router.retry_pending().await;
        for (envelope, reason) in &report.dropped {
            self.notices.emit(Notice::DeliveryDropped {
                from: envelope.from.clone(),
                destination: envelope.to.clone(),
                envelope_id: envelope.id,
                reason: reason.clone(),
            });
        }
        (report.delivered.len(), report.dropped.len())
    }

    /// Apply envelopes other writers left in bridged queues.
    pub async fn drain_bridged(&mut self) -> usize {
        let mut drained = 0;
        for destination in &self.config.router.bridge {
            let queue = QueueDir::new(self.router.queue_dir(destination));
            match self.bridge.write().await.drain(&queue) {
                Ok(outcomes) => drained += outcomes.len(),
                Err(e) => wlog_warn!(
                    "Scheduler: draining {} failed: {}",
                    queue.path().display(),
                    e
                ),
            }
        }
        drained
    }

    async fn flush_verifications(&mut self) {
        let events = self.bridge.write().await.take_verifications();
        for event in events {
            self.notices.emit(Notice::TaskCompleted {
                task_id: event.task_id,
                owner: event.owner,
                commit_ref: event.commit_ref,
            });
        }
    }

    fn refresh_health(&mut self, tasks: BTreeMap<String, usize>, verified: u64) {
        let now = self.clock.now();
        for worker in self.workers.values() {
            self.health
                .worker_mut(&worker.id)
                .observe(worker, self.escalation.record(&worker.id), now);
        }
        self.health.updated_at = Some(now);
        self.health.pending_deliveries = self.router.pending_count();
        self.health.dropped_deliveries = self.router.dropped_total();
        self.health.tasks = tasks;
        self.health.verified = verified;
    }

    /// Write `status.json` and the task book.
    pub async fn persist(&mut self) -> Result<()> {
        let (tasks, verified) = {
            let bridge = self.bridge.read().await;
            bridge.book().save(&self.config.tasks_path())?;
            (bridge.counts(), bridge.verified_total())
        };
        self.refresh_health(tasks, verified);
        self.health.save(&self.config.status_path())
    }

    /// Run until `cancel` fires.
    ///
    /// On shutdown the pollers are stopped, candidates already captured are
    /// routed, and state is written. No worker instruction is sent after
    /// cancellation.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let (capture_tx, mut capture_rx) = mpsc::channel(CAPTURE_BUFFER);
        let pollers = spawn_pollers(&self.config, capture_tx, &cancel);
        wlog!(
            "Scheduler: {} workers, {} capture pollers, tick every {}s",
            self.workers.len(),
            pollers.len(),
            self.config.scheduler.tick_secs
        );

        let (activity_tx, mut activity_rx) = mpsc::unbounded_channel::<ActivitySignal>();
        let _watcher = if self.config.activity.watch {
            match SideChannelWatcher::start(&self.config.side_channel_root(), activity_tx) {
                Ok(w) => Some(w),
                Err(e) => {
                    wlog_warn!("Scheduler: side-channel watcher not started: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let drained = self.drain_bridged().await;
        if drained > 0 {
            wlog!("Scheduler: applied {} queued envelopes at startup", drained);
        }
        self.flush_verifications().await;

        let mut tick = tokio::time::interval(self.config.scheduler.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut monitor = self.config.scheduler.monitor_interval().map(|period| {
            let mut i = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            i.set_missed_tick_behavior(MissedTickBehavior::Delay);
            i
        });

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    wlog!("Scheduler: shutdown requested");
                    break;
                }
                Some(event) = capture_rx.recv() => {
                    self.handle_capture(event).await;
                }
                Some(signal) = activity_rx.recv() => {
                    if let Err(e) = self.record_activity(&signal.worker, signal.at) {
                        wlog_debug!("Scheduler: watcher signal ignored: {}", e);
                    }
                }
                _ = tick.tick() => {
                    self.tick().await;
                }
                _ = next_pass(&mut monitor) => {
                    self.monitor_pass().await;
                    if let Err(e) = self.persist().await {
                        wlog_error!("Scheduler: could not persist state: {}", e);
                    }
                }
            }
        }

        let grace = self.config.capture.read_timeout() * 2 + Duration::from_secs(1);
        if tokio::time::timeout(grace, join_all(pollers)).await.is_err() {
            wlog_warn!("Scheduler: capture pollers still running after {:?}", grace);
        }
        capture_rx.close();
        while let Ok(event) = capture_rx.try_recv() {
            if let CaptureEvent::Candidate(candidate) = event {
                self.ingest(candidate).await;
            }
        }

        self.persist().await?;
        wlog!("Scheduler: stopped after {} ticks", self.ticks);
        Ok(())
    }
}

async fn next_pass(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
