//! Test fixtures for integration tests.
//!
//! Provides:
//! - A temp directory laid out as side-channel root, queue root and state dir
//! - A manual clock shared with the scheduler
//! - A recording instruction channel and an in-memory notice sink

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use warden::clock::{Clock, ManualClock};
use warden::config::{Config, WorkerConfig};
use warden::driver::{Instruction, InstructionChannel};
use warden::notice::{Notice, NoticeSink, Notices};
use warden::{Error, Result, Scheduler, Worker, WorkerId};

/// Every instruction and input clear the scheduler issued.
#[derive(Default)]
pub struct RecordingChannel {
    instructions: Mutex<Vec<Instruction>>,
    clears: Mutex<Vec<WorkerId>>,
    failing: Mutex<Vec<WorkerId>>,
}

impl RecordingChannel {
    pub fn instructions(&self) -> Vec<Instruction> {
        self.instructions.lock().unwrap().clone()
    }

    pub fn tags_for(&self, worker: &str) -> Vec<String> {
        self.instructions()
            .into_iter()
            .filter(|i| i.worker.as_str() == worker)
            .map(|i| i.tag)
            .collect()
    }

    pub fn clears(&self) -> Vec<WorkerId> {
        self.clears.lock().unwrap().clone()
    }

    pub fn fail_for(&self, worker: &str) {
        self.failing.lock().unwrap().push(WorkerId::new(worker));
    }

    fn check(&self, worker: &WorkerId) -> Result<()> {
        if self.failing.lock().unwrap().contains(worker) {
            return Err(Error::Driver(format!("no pane for {}", worker)));
        }
        Ok(())
    }
}

#[async_trait]
impl InstructionChannel for RecordingChannel {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn deliver(&self, worker: &Worker, instruction: &Instruction) -> Result<()> {
        self.check(&worker.id)?;
        self.instructions.lock().unwrap().push(instruction.clone());
        Ok(())
    }

    async fn clear_input(&self, worker: &Worker) -> Result<()> {
        self.check(&worker.id)?;
        self.clears.lock().unwrap().push(worker.id.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySink {
    notices: Mutex<Vec<Notice>>,
}

impl MemorySink {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.notices().iter().map(|n| n.to_string()).collect()
    }
}

impl NoticeSink for MemorySink {
    fn emit(&self, notice: &Notice) {
        self.notices.lock().unwrap().push(notice.clone());
    }
}

/// One isolated warden environment.
pub struct TestEnv {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub channel: Arc<RecordingChannel>,
    pub sink: Arc<MemorySink>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
            clock: Arc::new(ManualClock::new(Utc::now())),
            channel: Arc::new(RecordingChannel::default()),
            sink: Arc::new(MemorySink::default()),
        }
    }

    pub fn side_root(&self) -> PathBuf {
        self.dir.path().join("side")
    }

    pub fn queue_root(&self) -> PathBuf {
        self.dir.path().join("queue")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    /// Config rooted in the temp dir. Workers are onboarded unless listed
    /// in `onboarding`.
    pub fn config(&self, workers: &[&str], onboarding: &[&str]) -> Config {
        Config {
            side_channel_root: self.side_root().display().to_string(),
            queue_root: self.queue_root().display().to_string(),
            state_dir: self.state_dir().display().to_string(),
            workers: workers
                .iter()
                .map(|id| {
                    let mut wc = WorkerConfig::new(id);
                    wc.onboarded = !onboarding.contains(id);
                    wc
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn scheduler(&self, config: Config) -> Scheduler {
        let notices = Notices::new().with_sink(self.sink.clone());
        Scheduler::new(config, self.clock.clone(), self.channel.clone(), notices)
            .expect("Failed to build scheduler")
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Move the manual clock to `secs` after `start`.
    pub fn at(&self, start: DateTime<Utc>, secs: u64) {
        self.clock.set(start + chrono::Duration::seconds(secs as i64));
    }

    /// Write a side-channel file for `worker` whose mtime is the clock's now.
    pub fn touch(&self, worker: &str, name: &str) -> PathBuf {
        let dir = self.side_root().join(worker);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, "scratch").unwrap();
        set_mtime(&path, self.now());
        path
    }
}

pub fn set_mtime(path: &Path, at: DateTime<Utc>) {
    let secs = at.timestamp().max(0) as u64;
    let time = SystemTime::UNIX_EPOCH + Duration::from_secs(secs) + Duration::from_nanos(at.timestamp_subsec_nanos() as u64);
    let file = File::options().write(true).open(path).unwrap();
    file.set_modified(time).unwrap();
}
