//! Capture strategies: point-in-time extractors for worker output.
//!
//! Each strategy reads one side channel for one worker and returns zero or
//! more raw text candidates. Strategies never fail a poll: an unavailable
//! source yields an empty list and marks itself unavailable, which the
//! poller turns into a degradation report after enough consecutive misses.

mod clipboard;
mod file;
mod ocr;
mod poller;
mod store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::config::{CaptureSpec, Config};
use crate::worker::WorkerId;
use crate::{Error, Result};

pub use clipboard::ClipboardPoll;
pub use file::FileTail;
pub use ocr::ScreenOcr;
pub use poller::{spawn_pollers, CaptureEvent, CapturePoller, SourceHealth, SourceTransition};
pub use store::StoreQuery;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    File,
    Clipboard,
    Ocr,
    Store,
}

impl CaptureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureKind::File => "file",
            CaptureKind::Clipboard => "clipboard",
            CaptureKind::Ocr => "ocr",
            CaptureKind::Store => "store",
        }
    }
}

impl std::fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CaptureKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "file" | "file_tail" => Ok(CaptureKind::File),
            "clipboard" => Ok(CaptureKind::Clipboard),
            "ocr" | "screen_ocr" => Ok(CaptureKind::Ocr),
            "store" | "sqlite" => Ok(CaptureKind::Store),
            _ => Err(Error::UnknownStrategy(s.to_string())),
        }
    }
}

/// Raw text pulled from one source, not yet parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCandidate {
    pub worker: WorkerId,
    pub source: CaptureKind,
    pub text: String,
    pub captured_at: DateTime<Utc>,
}

impl RawCandidate {
    pub fn new(worker: &WorkerId, source: CaptureKind, text: String) -> Self {
        Self {
            worker: worker.clone(),
            source,
            text,
            captured_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait CaptureStrategy: Send {
    fn kind(&self) -> CaptureKind;

    /// Read the source once. Must not fail and must not block unboundedly.
    async fn poll(&mut self, worker: &WorkerId) -> Vec<RawCandidate>;

    /// Whether the most recent poll could reach the source at all.
    fn available(&self) -> bool {
        true
    }
}

/// Build the strategy a capture spec names, for one worker.
pub fn build_strategy(
    spec: &CaptureSpec,
    worker: &WorkerId,
    config: &Config,
) -> Result<Box<dyn CaptureStrategy>> {
    let timeout: Duration = config.capture.read_timeout();
    let strategy: Box<dyn CaptureStrategy> = match spec.kind()? {
        CaptureKind::File => {
            let relative = spec
                .path
                .clone()
                .unwrap_or_else(|| config.capture.evidence_file.clone());
            let path = config
                .side_channel_root()
                .join(worker.as_str())
                .join(relative);
            Box::new(FileTail::new(path, timeout))
        }
        CaptureKind::Clipboard => Box::new(ClipboardPoll::detect(timeout)),
        CaptureKind::Ocr => {
            let region = spec.region.ok_or_else(|| {
                Error::Config(format!("worker '{}': ocr capture needs `region`", worker))
            })?;
            Box::new(ScreenOcr::detect(region, timeout))
        }
        CaptureKind::Store => {
            let (Some(db), Some(query)) = (spec.db.as_ref(), spec.query.as_ref()) else {
                return Err(Error::Config(format!(
                    "worker '{}': store capture needs `db` and `query`",
                    worker
                )));
            };
            Box::new(StoreQuery::new(
                crate::config::expand_tilde(db),
                query.clone(),
                timeout,
            ))
        }
    };
    Ok(strategy)
}
