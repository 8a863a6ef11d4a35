//! Tiered escalation for quiet workers.
//!
//! Each worker climbs `none → warned → rescued → restarted` one step per
//! pass. A step is taken only when:
//!
//! - the worker's activity level meets the tier's trigger,
//! - the tier's cooldown has elapsed since it last fired,
//! - the tier's attempt cap is not used up.
//!
//! Climbing past a tier also waits out that tier's cooldown, so each
//! intervention gets a chance to work before a stronger one follows.
//! Any activity newer than the last action drops the worker back to `none`.
//! There is no terminal failure tier: a worker whose caps are exhausted is
//! simply left alone until it produces activity again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::clock::elapsed;
use crate::config::{EscalationConfig, TierConfig};
use crate::driver::{Instruction, InstructionChannel};
use crate::prompts::{self, PromptContext};
use crate::worker::{ActivityLevel, Worker, WorkerId};
use crate::{wlog, wlog_debug, wlog_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    None,
    /// Input cleared.
    Warned,
    /// Asked for a status report in the same session.
    Rescued,
    /// Given a new session.
    Restarted,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::None => "none",
            Tier::Warned => "warned",
            Tier::Rescued => "rescued",
            Tier::Restarted => "restarted",
        }
    }

    /// Tiers strictly above this one, lowest first.
    fn above(&self) -> &'static [Tier] {
        match self {
            Tier::None => &[Tier::Warned, Tier::Rescued, Tier::Restarted],
            Tier::Warned => &[Tier::Rescued, Tier::Restarted],
            Tier::Rescued => &[Tier::Restarted],
            Tier::Restarted => &[],
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Gate for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    /// Lowest activity level at which the tier may fire.
    pub trigger: ActivityLevel,
    pub cooldown: Duration,
    /// Zero disables the tier.
    pub max_attempts: u32,
}

impl TierPolicy {
    fn from_config(trigger: ActivityLevel, cfg: &TierConfig) -> Self {
        Self {
            trigger,
            cooldown: cfg.cooldown(),
            max_attempts: cfg.max_attempts,
        }
    }

    pub fn enabled(&self) -> bool {
        self.max_attempts > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    pub warn: TierPolicy,
    pub rescue: TierPolicy,
    /// Its cap counts over the whole run, not per episode.
    pub restart: TierPolicy,
}

impl From<&EscalationConfig> for EscalationPolicy {
    fn from(cfg: &EscalationConfig) -> Self {
        Self {
            warn: TierPolicy::from_config(ActivityLevel::Warn, &cfg.warn),
            rescue: TierPolicy::from_config(ActivityLevel::Stall, &cfg.rescue),
            restart: TierPolicy::from_config(ActivityLevel::Stall, &cfg.restart),
        }
    }
}

impl EscalationPolicy {
    pub fn tier(&self, tier: Tier) -> Option<&TierPolicy> {
        match tier {
            Tier::None => None,
            Tier::Warned => Some(&self.warn),
            Tier::Rescued => Some(&self.rescue),
            Tier::Restarted => Some(&self.restart),
        }
    }
}

/// Escalation state of one worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub tier: Tier,
    pub last_warned: Option<DateTime<Utc>>,
    pub last_rescued: Option<DateTime<Utc>>,
    pub last_restarted: Option<DateTime<Utc>>,
    pub last_action_at: Option<DateTime<Utc>>,
    /// Since the last reset.
    pub warn_attempts: u32,
    /// Since the last reset.
    pub rescue_attempts: u32,
    /// Over the whole run.
    pub restarts: u32,
}

impl EscalationRecord {
    pub fn last_at(&self, tier: Tier) -> Option<DateTime<Utc>> {
        match tier {
            Tier::None => None,
            Tier::Warned => self.last_warned,
            Tier::Rescued => self.last_rescued,
            Tier::Restarted => self.last_restarted,
        }
    }

    pub fn attempts(&self, tier: Tier) -> u32 {
        match tier {
            Tier::None => 0,
            Tier::Warned => self.warn_attempts,
            Tier::Rescued => self.rescue_attempts,
            Tier::Restarted => self.restarts,
        }
    }

    fn mark(&mut self, tier: Tier, now: DateTime<Utc>) {
        match tier {
            Tier::None => return,
            Tier::Warned => {
                self.last_warned = Some(now);
                self.warn_attempts += 1;
            }
            Tier::Rescued => {
                self.last_rescued = Some(now);
                self.rescue_attempts += 1;
            }
            Tier::Restarted => {
                self.last_restarted = Some(now);
                self.restarts += 1;
            }
        }
        self.tier = tier;
        self.last_action_at = Some(now);
    }

    /// Back to `none`. Cooldown timestamps and the run-wide restart count stay.
    fn reset(&mut self) {
        self.tier = Tier::None;
        self.warn_attempts = 0;
        self.rescue_attempts = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    NoOp,
    /// Activity since the last action; the tier drops to `none`.
    Reset { from: Tier },
    /// Fire this tier now.
    Act(Tier),
}

/// What one escalation pass did for a worker.
#[derive(Debug)]
pub struct EscalationStep {
    pub decision: Decision,
    /// Set when the tier's action could not be delivered.
    pub failure: Option<String>,
}

pub struct EscalationController {
    policy: EscalationPolicy,
    records: HashMap<WorkerId, EscalationRecord>,
    prompts: PromptContext,
    rescue_template: String,
    onboarding_template: String,
}

impl EscalationController {
    pub fn new(config: &EscalationConfig) -> Self {
        Self {
            policy: EscalationPolicy::from(config),
            records: HashMap::new(),
            prompts: PromptContext::default(),
            rescue_template: config
                .rescue_template
                .clone()
                .unwrap_or_else(|| prompts::RESCUE.to_string()),
            onboarding_template: prompts::ONBOARDING.to_string(),
        }
    }

    pub fn with_prompts(mut self, prompts: PromptContext, onboarding_template: String) -> Self {
        self.prompts = prompts;
        self.onboarding_template = onboarding_template;
        self
    }

    pub fn policy(&self) -> &EscalationPolicy {
        &self.policy
    }

    pub fn record(&self, id: &WorkerId) -> Option<&EscalationRecord> {
        self.records.get(id)
    }

    pub fn tier(&self, id: &WorkerId) -> Tier {
        self.records.get(id).map(|r| r.tier).unwrap_or_default()
    }

    /// Decide what to do for `worker` at `now`, using its current level.
    pub fn decide(&self, worker: &Worker, now: DateTime<Utc>) -> Decision {
        let default = EscalationRecord::default();
        let rec = self.records.get(&worker.id).unwrap_or(&default);

        if rec.tier != Tier::None
            && rec
                .last_action_at
                .is_some_and(|acted| worker.last_activity > acted)
        {
            return Decision::Reset { from: rec.tier };
        }

        let level = worker.level;
        let dwelled = match self.policy.tier(rec.tier) {
            None => true,
            Some(current) => self.cooled_down(rec, rec.tier, current, now),
        };
        if dwelled {
            if let Some((next, policy)) = rec
                .tier
                .above()
                .iter()
                .filter_map(|t| self.policy.tier(*t).map(|p| (*t, p)))
                .find(|(_, p)| p.enabled())
            {
                if level >= policy.trigger && self.allowed(rec, next, policy, now) {
                    return Decision::Act(next);
                }
            }
        }

        if let Some(current) = self.policy.tier(rec.tier) {
            if level >= current.trigger && self.allowed(rec, rec.tier, current, now) {
                return Decision::Act(rec.tier);
            }
        }
        Decision::NoOp
    }

    fn cooled_down(
        &self,
        rec: &EscalationRecord,
        tier: Tier,
        policy: &TierPolicy,
        now: DateTime<Utc>,
    ) -> bool {
        rec.last_at(tier)
            .map_or(true, |at| elapsed(at, now) >= policy.cooldown)
    }

    fn allowed(
        &self,
        rec: &EscalationRecord,
        tier: Tier,
        policy: &TierPolicy,
        now: DateTime<Utc>,
    ) -> bool {
        rec.attempts(tier) < policy.max_attempts && self.cooled_down(rec, tier, policy, now)
    }

    /// Record `decision` as taken.
    pub fn commit(&mut self, id: &WorkerId, decision: Decision, now: DateTime<Utc>) {
        match decision {
            Decision::NoOp => {}
            Decision::Reset { from } => {
                wlog!("Escalation: {} active again, {} -> none", id, from);
                self.records.entry(id.clone()).or_default().reset();
            }
            Decision::Act(tier) => {
                self.records.entry(id.clone()).or_default().mark(tier, now);
            }
        }
    }

    /// Decide, commit, and carry out the action through `channel`.
    ///
    /// The attempt is recorded even when delivery fails, so a broken
    /// channel cannot make a tier fire on every pass.
    pub async fn evaluate(
        &mut self,
        worker: &mut Worker,
        channel: &dyn InstructionChannel,
        now: DateTime<Utc>,
    ) -> EscalationStep {
        let decision = self.decide(worker, now);
        self.commit(&worker.id, decision, now);

        let Decision::Act(tier) = decision else {
            return EscalationStep {
                decision,
                failure: None,
            };
        };

        let idle = worker.idle(now).as_secs();
        wlog!(
            "Escalation: {} {} after {}s idle (level {})",
            worker.id,
            tier,
            idle,
            worker.level
        );
        worker.escalation_attempts += 1;

        let result = match tier {
            Tier::None => Ok(()),
            Tier::Warned => channel.clear_input(worker).await,
            Tier::Rescued => {
                let idle_secs = idle.to_string();
                let text =
                    self.prompts
                        .render(&self.rescue_template, worker, &[("idle_secs", &idle_secs)]);
                channel
                    .deliver(worker, &Instruction::new(&worker.id, text, "rescue"))
                    .await
            }
            Tier::Restarted => {
                let text = self.prompts.render(&self.onboarding_template, worker, &[]);
                let result = channel
                    .deliver(
                        worker,
                        &Instruction::new(&worker.id, text, "restart").in_new_session(),
                    )
                    .await;
                worker.restart_onboarding(now);
                result
            }
        };

        let failure = match result {
            Ok(()) => {
                wlog_debug!("Escalation: {} {} delivered", worker.id, tier);
                None
            }
            Err(e) => {
                wlog_warn!("Escalation: {} {} not delivered: {}", worker.id, tier, e);
                Some(e.to_string())
            }
        };
        EscalationStep { decision, failure }
    }
}
