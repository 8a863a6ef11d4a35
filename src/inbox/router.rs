//! Envelope routing into per-destination queue directories.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::RouterConfig;
use crate::tasks::{BridgeOutcome, SharedBridge};
use crate::util::{blocking, write_atomic};
use crate::{wlog_debug, wlog_error, wlog_warn, Error, Result};

use super::envelope::Envelope;
use super::queue::QueueDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each failure.
    pub backoff: Duration,
    /// Retry rounds an undeliverable envelope is held before it is dropped.
    pub pending_ceiling: u32,
}

impl From<&RouterConfig> for RetryPolicy {
    fn from(cfg: &RouterConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            backoff: Duration::from_millis(cfg.backoff_ms),
            pending_ceiling: cfg.pending_ceiling.max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub path: PathBuf,
    /// Present when the destination is bridged.
    pub bridged: Option<BridgeOutcome>,
}

#[derive(Debug, Default)]
pub struct RetryReport {
    pub delivered: Vec<Delivery>,
    /// Envelopes given up on, with the last error seen.
    pub dropped: Vec<(Envelope, String)>,
}

#[derive(Debug)]
struct Pending {
    envelope: Envelope,
    rounds: u32,
    last_error: String,
}

/// Writes envelopes atomically into `<queue_root>/<to>/`.
///
/// A write that keeps failing after the retry policy is exhausted is held in
/// memory and retried once per [`Router::retry_pending`] round until it lands
/// or reaches the pending ceiling. Later envelopes for a destination with
/// held envelopes queue behind them so per-sender order is kept.
pub struct Router {
    queue_root: PathBuf,
    policy: RetryPolicy,
    bridge: Option<SharedBridge>,
    bridged: HashSet<String>,
    pending: VecDeque<Pending>,
    dropped_total: u64,
}

impl Router {
    pub fn new(queue_root: PathBuf, policy: RetryPolicy) -> Self {
        Self {
            queue_root,
            policy,
            bridge: None,
            bridged: HashSet::new(),
            pending: VecDeque::new(),
            dropped_total: 0,
        }
    }

    /// Hand envelopes for `destinations` to the task bridge after writing.
    pub fn with_bridge(mut self, bridge: SharedBridge, destinations: &[String]) -> Self {
        self.bridge = Some(bridge);
        self.bridged = destinations.iter().cloned().collect();
        self
    }

    pub fn queue_dir(&self, destination: &str) -> PathBuf {
        self.queue_root.join(destination)
    }

    pub fn is_bridged(&self, destination: &str) -> bool {
        self.bridge.is_some() && self.bridged.contains(destination)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }

    pub async fn route(&mut self, envelope: Envelope) -> Result<Delivery> {
        if self.pending.iter().any(|p| p.envelope.to == envelope.to) {
            let reason = "queued behind undelivered envelopes".to_string();
            wlog_debug!("Router: {} for '{}'", reason, envelope.to);
            self.pending.push_back(Pending {
                envelope: envelope.clone(),
                rounds: 0,
                last_error: reason.clone(),
            });
            return Err(Error::Delivery {
                destination: envelope.to,
                attempts: 0,
                reason,
            });
        }

        match self.write_with_retry(&envelope).await {
            Ok(path) => Ok(self.handoff(&envelope, path).await),
            Err(e) => {
                wlog_error!("Router: {}; holding envelope {} for retry", e, envelope.id);
                self.pending.push_back(Pending {
                    envelope,
                    rounds: 0,
                    last_error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// One more attempt for each held envelope, in order.
    ///
    /// Once a destination fails in a round, the envelopes behind it are not
    /// tried, but the round still counts against each of them.
    pub async fn retry_pending(&mut self) -> RetryReport {
        let mut report = RetryReport::default();
        let mut blocked: HashMap<String, String> = HashMap::new();

        for _ in 0..self.pending.len() {
            let Some(mut held) = self.pending.pop_front() else {
                break;
            };
            if let Some(reason) = blocked.get(&held.envelope.to) {
                held.last_error = reason.clone();
                self.hold_or_drop(held, &mut report);
                continue;
            }

            match self.write_once(&held.envelope).await {
                Ok(path) => {
                    wlog_debug!("Router: delivered held envelope {}", held.envelope.id);
                    let delivery = self.handoff(&held.envelope, path).await;
                    report.delivered.push(delivery);
                }
                Err(e) => {
                    held.last_error = e.to_string();
                    blocked.insert(held.envelope.to.clone(), held.last_error.clone());
                    self.hold_or_drop(held, &mut report);
                }
            }
        }
        report
    }

    /// Count a failed round against `held`; drop it at the ceiling.
    fn hold_or_drop(&mut self, mut held: Pending, report: &mut RetryReport) {
        held.rounds += 1;
        if held.rounds < self.policy.pending_ceiling {
            self.pending.push_back(held);
            return;
        }
        wlog_error!(
            "Router: dropping envelope {} for '{}' after {} rounds: {}",
            held.envelope.id,
            held.envelope.to,
            held.rounds,
            held.last_error
        );
        self.dropped_total += 1;
        report.dropped.push((held.envelope, held.last_error));
    }

    async fn write_with_retry(&self, envelope: &Envelope) -> Result<PathBuf> {
        let mut delay = self.policy.backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.policy.max_attempts {
            match self.write_once(envelope).await {
                Ok(path) => return Ok(path),
                Err(e) => {
                    wlog_warn!(
                        "Router: write to '{}' failed (attempt {}/{}): {}",
                        envelope.to,
                        attempt,
                        self.policy.max_attempts,
                        e
                    );
                    last_error = e.to_string();
                    if attempt < self.policy.max_attempts {
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                }
            }
        }

        Err(Error::Delivery {
            destination: envelope.to.clone(),
            attempts: self.policy.max_attempts,
            reason: last_error,
        })
    }

    async fn write_once(&self, envelope: &Envelope) -> Result<PathBuf> {
        let dir = self.queue_dir(&envelope.to);
        let envelope = envelope.clone();
        blocking(move || write_envelope(&dir, &envelope)).await
    }

    async fn handoff(&self, envelope: &Envelope, path: PathBuf) -> Delivery {
        let bridged = match &self.bridge {
            Some(bridge) if self.bridged.contains(&envelope.to) => {
                let queue = QueueDir::new(self.queue_dir(&envelope.to));
                Some(bridge.write().await.consume(&queue, envelope, &path))
            }
            _ => None,
        };
        Delivery { path, bridged }
    }
}

/// Serialize `envelope` into `dir` under its own file name.
pub fn write_envelope(dir: &Path, envelope: &Envelope) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(envelope.file_name());
    write_atomic(&path, &serde_json::to_vec_pretty(envelope)?)?;
    Ok(path)
}
