use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::CaptureKind;
use crate::scheduler::WorkflowPhase;
use crate::{wlog_debug, Error, Result};

/// Top-level configuration, loaded from `~/.warden/warden.toml`.
///
/// The `[activity]` section has no defaults: a deployment must state its
/// thresholds explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_side_channel_root")]
    pub side_channel_root: String,
    #[serde(default = "default_queue_root")]
    pub queue_root: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    pub activity: ActivityConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityConfig {
    pub normal_secs: u64,
    pub warn_secs: u64,
    pub stall_secs: u64,
    #[serde(default = "default_grace_secs")]
    pub onboarding_grace_secs: u64,
    /// Also watch the side-channel root for change events.
    #[serde(default = "default_true")]
    pub watch: bool,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            normal_secs: 120,
            warn_secs: 480,
            stall_secs: 600,
            onboarding_grace_secs: default_grace_secs(),
            watch: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierConfig {
    pub cooldown_secs: u64,
    pub max_attempts: u32,
}

impl TierConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    #[serde(default = "default_warn_tier")]
    pub warn: TierConfig,
    #[serde(default = "default_rescue_tier")]
    pub rescue: TierConfig,
    /// `max_attempts` here caps restarts for the whole run.
    #[serde(default = "default_restart_tier")]
    pub restart: TierConfig,
    #[serde(default)]
    pub rescue_template: Option<String>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            warn: default_warn_tier(),
            rescue: default_rescue_tier(),
            restart: default_restart_tier(),
            rescue_template: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_phases")]
    pub phases: Vec<String>,
    /// Template text per phase name; overrides built-in phase text.
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
    #[serde(default)]
    pub onboarding_template: Option<String>,
    /// Destination for envelopes captured from workers.
    #[serde(default = "default_coordinator")]
    pub coordinator: String,
    /// Extra monitor/escalation passes between ticks; 0 turns them off.
    #[serde(default = "default_monitor_secs")]
    pub monitor_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            phases: default_phases(),
            templates: BTreeMap::new(),
            onboarding_template: None,
            coordinator: default_coordinator(),
            monitor_secs: default_monitor_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn monitor_interval(&self) -> Option<Duration> {
        (self.monitor_secs > 0).then(|| Duration::from_secs(self.monitor_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_router_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Retry rounds a failed envelope is held in memory before being dropped.
    #[serde(default = "default_pending_ceiling")]
    pub pending_ceiling: u32,
    /// Destinations whose envelopes are also handed to the task bridge.
    #[serde(default = "default_bridge_destinations")]
    pub bridge: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_router_attempts(),
            backoff_ms: default_backoff_ms(),
            pending_ceiling: default_pending_ceiling(),
            bridge: default_bridge_destinations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Consecutive empty polls before a source is reported degraded.
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default = "default_evidence_file")]
    pub evidence_file: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            poll_ms: default_poll_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            degraded_after: default_degraded_after(),
            dedup_capacity: default_dedup_capacity(),
            evidence_file: default_evidence_file(),
        }
    }
}

impl CaptureConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompletionRule {
    /// One evidence item carries both a commit reference and a passing marker.
    #[default]
    SameItem,
    /// Commit reference and passing marker may come from different items.
    AcrossItems,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default)]
    pub rule: CompletionRule,
    #[serde(default = "default_passing_markers")]
    pub passing_markers: Vec<String>,
    /// A `done` status is itself a passing marker, and confirms the last
    /// commit its sender reported for the task.
    #[serde(default = "default_true")]
    pub done_counts_as_passing: bool,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            rule: CompletionRule::default(),
            passing_markers: default_passing_markers(),
            done_counts_as_passing: true,
        }
    }
}

/// Which instruction driver delivers text to workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriverConfig {
    Tmux {
        /// Command used to respawn a worker pane for a new session.
        #[serde(default)]
        restart_command: Option<String>,
    },
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Log instructions without delivering them.
    DryRun,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig::Tmux {
            restart_command: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    #[serde(default = "default_role")]
    pub role: String,
    /// Opaque position metadata handed to the driver (e.g. `tmux_target`).
    #[serde(default)]
    pub layout: BTreeMap<String, String>,
    #[serde(default)]
    pub onboarded: bool,
    #[serde(default = "default_true")]
    pub scheduled: bool,
    #[serde(default = "default_capture_specs")]
    pub capture: Vec<CaptureSpec>,
}

impl WorkerConfig {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            role: default_role(),
            layout: BTreeMap::new(),
            onboarded: false,
            scheduled: true,
            capture: default_capture_specs(),
        }
    }
}

/// One capture source for a worker. `strategy` is resolved at validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaptureSpec {
    pub strategy: String,
    /// File strategy: evidence file relative to the worker's side-channel dir.
    #[serde(default)]
    pub path: Option<String>,
    /// Store strategy: database file.
    #[serde(default)]
    pub db: Option<String>,
    /// Store strategy: SQL returning text in column 0; `?1` binds the worker id.
    #[serde(default)]
    pub query: Option<String>,
    /// OCR strategy: screen region as `[x, y, width, height]`.
    #[serde(default)]
    pub region: Option<[u32; 4]>,
}

impl CaptureSpec {
    pub fn file() -> Self {
        Self {
            strategy: "file".to_string(),
            path: None,
            db: None,
            query: None,
            region: None,
        }
    }

    pub fn kind(&self) -> Result<CaptureKind> {
        self.strategy.parse()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            side_channel_root: default_side_channel_root(),
            queue_root: default_queue_root(),
            state_dir: default_state_dir(),
            activity: ActivityConfig::default(),
            escalation: EscalationConfig::default(),
            scheduler: SchedulerConfig::default(),
            router: RouterConfig::default(),
            capture: CaptureConfig::default(),
            completion: CompletionConfig::default(),
            driver: DriverConfig::default(),
            workers: Vec::new(),
        }
    }
}

impl Config {
    pub fn warden_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".warden"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::warden_dir()?.join("warden.toml"))
    }

    pub fn side_channel_root(&self) -> PathBuf {
        expand_tilde(&self.side_channel_root)
    }

    pub fn queue_root(&self) -> PathBuf {
        expand_tilde(&self.queue_root)
    }

    pub fn state_dir(&self) -> PathBuf {
        expand_tilde(&self.state_dir)
    }

    pub fn status_path(&self) -> PathBuf {
        self.state_dir().join("status.json")
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.state_dir().join("tasks.json")
    }

    pub fn notices_path(&self) -> PathBuf {
        self.state_dir().join("notices.log")
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        wlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            return Err(Error::Config(format!(
                "no configuration file at {}",
                path.display()
            )));
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        wlog_debug!(
            "Config loaded: workers={}, tick={}s, thresholds={}/{}/{}",
            config.workers.len(),
            config.scheduler.tick_secs,
            config.activity.normal_secs,
            config.activity.warn_secs,
            config.activity.stall_secs
        );
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reject configurations the loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        let a = &self.activity;
        if a.normal_secs == 0 || a.warn_secs == 0 || a.stall_secs == 0 {
            return Err(Error::Config("activity thresholds must be non-zero".into()));
        }
        if !(a.normal_secs < a.warn_secs && a.warn_secs < a.stall_secs) {
            return Err(Error::Config(format!(
                "activity thresholds must ascend: normal={} warn={} stall={}",
                a.normal_secs, a.warn_secs, a.stall_secs
            )));
        }
        if self.scheduler.tick_secs == 0 {
            return Err(Error::Config("scheduler.tick_secs must be non-zero".into()));
        }
        if self.scheduler.phases.is_empty() {
            return Err(Error::Config("scheduler.phases must not be empty".into()));
        }
        for phase in &self.scheduler.phases {
            if phase.parse::<WorkflowPhase>().is_err()
                && !self.scheduler.templates.contains_key(phase)
            {
                return Err(Error::Config(format!(
                    "phase '{}' is neither built-in nor given a template",
                    phase
                )));
            }
        }
        if self.router.max_attempts == 0 {
            return Err(Error::Config("router.max_attempts must be at least 1".into()));
        }
        if self.capture.dedup_capacity == 0 {
            return Err(Error::Config("capture.dedup_capacity must be non-zero".into()));
        }
        if self.workers.is_empty() {
            return Err(Error::Config("no workers configured".into()));
        }

        let mut seen = HashSet::new();
        for worker in &self.workers {
            validate_worker_id(&worker.id)?;
            if !seen.insert(worker.id.as_str()) {
                return Err(Error::Config(format!("duplicate worker id '{}'", worker.id)));
            }
            for spec in &worker.capture {
                validate_capture_spec(&worker.id, spec)?;
            }
        }
        Ok(())
    }
}

fn validate_worker_id(id: &str) -> Result<()> {
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Config(format!(
            "worker id '{}' must be non-empty [A-Za-z0-9_-]",
            id
        )));
    }
    Ok(())
}

fn validate_capture_spec(worker: &str, spec: &CaptureSpec) -> Result<()> {
    match spec.kind()? {
        CaptureKind::Store if spec.db.is_none() || spec.query.is_none() => Err(Error::Config(
            format!("worker '{}': store capture needs `db` and `query`", worker),
        )),
        CaptureKind::Ocr if spec.region.is_none() => Err(Error::Config(format!(
            "worker '{}': ocr capture needs `region`",
            worker
        ))),
        _ => Ok(()),
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn default_side_channel_root() -> String {
    "~/.warden/workers".to_string()
}

fn default_queue_root() -> String {
    "~/.warden/queues".to_string()
}

fn default_state_dir() -> String {
    "~/.warden".to_string()
}

fn default_grace_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_warn_tier() -> TierConfig {
    TierConfig {
        cooldown_secs: 120,
        max_attempts: 3,
    }
}

fn default_rescue_tier() -> TierConfig {
    TierConfig {
        cooldown_secs: 300,
        max_attempts: 2,
    }
}

fn default_restart_tier() -> TierConfig {
    TierConfig {
        cooldown_secs: 900,
        max_attempts: 2,
    }
}

fn default_tick_secs() -> u64 {
    300
}

fn default_phases() -> Vec<String> {
    WorkflowPhase::ALL.iter().map(|p| p.as_str().to_string()).collect()
}

fn default_monitor_secs() -> u64 {
    60
}

fn default_coordinator() -> String {
    "coordinator".to_string()
}

fn default_router_attempts() -> u32 {
    4
}

fn default_backoff_ms() -> u64 {
    200
}

fn default_pending_ceiling() -> u32 {
    10
}

fn default_bridge_destinations() -> Vec<String> {
    vec![default_coordinator()]
}

fn default_poll_ms() -> u64 {
    2000
}

fn default_read_timeout_ms() -> u64 {
    1500
}

fn default_degraded_after() -> u32 {
    30
}

fn default_dedup_capacity() -> usize {
    500
}

fn default_evidence_file() -> String {
    "response.md".to_string()
}

fn default_passing_markers() -> Vec<String> {
    [
        "tests passed",
        "all tests pass",
        "tests pass",
        "passing",
        "build green",
        "ci green",
        "verified",
        "✅",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_role() -> String {
    "worker".to_string()
}

fn default_capture_specs() -> Vec<CaptureSpec> {
    vec![CaptureSpec::file()]
}
