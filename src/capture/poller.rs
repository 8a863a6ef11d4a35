//! Per-source polling actors.
//!
//! One actor runs per (worker, strategy) pair. Each polls on its own
//! interval, bounds every poll with a timeout, and reports candidates and
//! source health transitions over a channel to the scheduler.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::worker::WorkerId;
use crate::{wlog_debug, wlog_error, wlog_warn};

use super::{build_strategy, CaptureKind, CaptureStrategy, RawCandidate};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    Candidate(RawCandidate),
    Degraded {
        worker: WorkerId,
        source: CaptureKind,
        empty_polls: u32,
    },
    Recovered {
        worker: WorkerId,
        source: CaptureKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTransition {
    Degraded { empty_polls: u32 },
    Recovered,
}

/// Counts consecutive polls that could not reach their source.
#[derive(Debug, Clone)]
pub struct SourceHealth {
    threshold: u32,
    misses: u32,
    degraded: bool,
}

impl SourceHealth {
    /// A threshold of zero disables degradation reports.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            misses: 0,
            degraded: false,
        }
    }

    pub fn observe(&mut self, found: usize, available: bool) -> Option<SourceTransition> {
        if found > 0 || available {
            self.misses = 0;
            if self.degraded {
                self.degraded = false;
                return Some(SourceTransition::Recovered);
            }
            return None;
        }

        self.misses = self.misses.saturating_add(1);
        if self.threshold > 0 && !self.degraded && self.misses >= self.threshold {
            self.degraded = true;
            return Some(SourceTransition::Degraded {
                empty_polls: self.misses,
            });
        }
        None
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
}

pub struct CapturePoller {
    worker: WorkerId,
    strategy: Box<dyn CaptureStrategy>,
    interval: Duration,
    poll_timeout: Duration,
    health: SourceHealth,
    tx: mpsc::Sender<CaptureEvent>,
}

impl CapturePoller {
    pub fn new(
        worker: WorkerId,
        strategy: Box<dyn CaptureStrategy>,
        tx: mpsc::Sender<CaptureEvent>,
    ) -> Self {
        Self {
            worker,
            strategy,
            interval: Duration::from_secs(2),
            poll_timeout: Duration::from_secs(3),
            health: SourceHealth::new(30),
            tx,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_degraded_after(mut self, polls: u32) -> Self {
        self.health = SourceHealth::new(polls);
        self
    }

    /// Poll once and translate the result into events.
    pub async fn poll_once(&mut self) -> Vec<CaptureEvent> {
        let kind = self.strategy.kind();
        let (candidates, available) =
            match tokio::time::timeout(self.poll_timeout, self.strategy.poll(&self.worker)).await {
                Ok(found) => {
                    let available = self.strategy.available();
                    (found, available)
                }
                Err(_) => {
                    wlog_debug!("CapturePoller[{}/{}]: poll timed out", self.worker, kind);
                    (Vec::new(), false)
                }
            };

        let mut events = Vec::with_capacity(candidates.len() + 1);
        match self.health.observe(candidates.len(), available) {
            Some(SourceTransition::Degraded { empty_polls }) => {
                wlog_warn!(
                    "CapturePoller[{}/{}]: source degraded after {} empty polls",
                    self.worker,
                    kind,
                    empty_polls
                );
                events.push(CaptureEvent::Degraded {
                    worker: self.worker.clone(),
                    source: kind,
                    empty_polls,
                });
            }
            Some(SourceTransition::Recovered) => {
                events.push(CaptureEvent::Recovered {
                    worker: self.worker.clone(),
                    source: kind,
                });
            }
            None => {}
        }
        events.extend(candidates.into_iter().map(CaptureEvent::Candidate));
        events
    }

    /// Run until `cancel` fires. An in-flight poll finishes or times out first.
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        wlog_debug!(
            "CapturePoller::spawn worker={} source={} interval={:?}",
            self.worker,
            self.strategy.kind(),
            self.interval
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        wlog_debug!("CapturePoller[{}] cancelled", self.worker);
                        break;
                    }
                    _ = interval.tick() => {
                        for event in self.poll_once().await {
                            if self.tx.send(event).await.is_err() {
                                wlog_debug!("CapturePoller[{}]: event channel closed", self.worker);
                                return;
                            }
                        }
                    }
                }
            }
        })
    }
}

/// Start one poller per configured capture source of each worker.
///
/// Sources that fail to build are logged and skipped; the others still run.
pub fn spawn_pollers(
    config: &Config,
    tx: mpsc::Sender<CaptureEvent>,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for worker_cfg in &config.workers {
        let worker = WorkerId::new(&worker_cfg.id);
        for spec in &worker_cfg.capture {
            match build_strategy(spec, &worker, config) {
                Ok(strategy) => {
                    let poller = CapturePoller::new(worker.clone(), strategy, tx.clone())
                        .with_interval(config.capture.poll_interval())
                        .with_poll_timeout(config.capture.read_timeout() * 2)
                        .with_degraded_after(config.capture.degraded_after);
                    handles.push(poller.spawn(cancel.child_token()));
                }
                Err(e) => {
                    wlog_error!(
                        "capture source '{}' for worker {} not started: {}",
                        spec.strategy,
                        worker,
                        e
                    );
                }
            }
        }
    }
    handles
}
