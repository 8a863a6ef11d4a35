//! Worker liveness: activity classification, escalation and health.

pub mod activity;
pub mod escalation;
pub mod health;
pub mod watch;

pub use activity::{ActivityMonitor, LevelChange, Thresholds};
pub use escalation::{
    Decision, EscalationController, EscalationPolicy, EscalationRecord, EscalationStep, Tier,
    TierPolicy,
};
pub use health::{HealthSummary, WorkerHealth};
pub use watch::{ActivitySignal, SideChannelWatcher};
