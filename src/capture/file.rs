//! Tail a worker's evidence file in its side-channel directory.

use async_trait::async_trait;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::util::blocking_with_timeout;
use crate::worker::WorkerId;
use crate::{wlog_debug, wlog_trace, Result};

use super::{CaptureKind, CaptureStrategy, RawCandidate};

/// Bytes compared to tell an appended file from a replaced one.
const HEAD_LEN: u64 = 256;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Cursor {
    offset: u64,
    head: Vec<u8>,
}

/// Reads whatever was appended since the previous poll.
///
/// The first poll of an existing file only records its end, so a restart
/// does not replay output that was already there. A file that appears later
/// is read from the start. A file that shrinks, or whose leading bytes
/// change, is treated as rewritten and read from the start.
pub struct FileTail {
    path: PathBuf,
    timeout: Duration,
    cursor: Option<Cursor>,
    available: bool,
}

impl FileTail {
    pub fn new(path: PathBuf, timeout: Duration) -> Self {
        Self {
            path,
            timeout,
            cursor: None,
            available: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CaptureStrategy for FileTail {
    fn kind(&self) -> CaptureKind {
        CaptureKind::File
    }

    async fn poll(&mut self, worker: &WorkerId) -> Vec<RawCandidate> {
        let path = self.path.clone();
        let cursor = self.cursor.clone();
        let result = blocking_with_timeout(self.timeout, move || read_since(&path, cursor)).await;

        match result {
            Ok(Some((text, cursor))) => {
                self.available = true;
                self.cursor = Some(cursor);
                if text.trim().is_empty() {
                    return Vec::new();
                }
                wlog_trace!(
                    "FileTail: {} new bytes from {}",
                    text.len(),
                    self.path.display()
                );
                vec![RawCandidate::new(worker, CaptureKind::File, text)]
            }
            Ok(None) => {
                // Missing file: anything written later is new output.
                self.available = false;
                self.cursor.get_or_insert_with(Cursor::default);
                Vec::new()
            }
            Err(e) => {
                wlog_debug!("FileTail: read of {} failed: {}", self.path.display(), e);
                self.available = false;
                Vec::new()
            }
        }
    }

    fn available(&self) -> bool {
        self.available
    }
}

/// Read from the cursor to end of file. `None` when the file does not exist.
fn read_since(path: &Path, cursor: Option<Cursor>) -> Result<Option<(String, Cursor)>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata()?.len();

    let mut head = Vec::new();
    (&mut file).take(HEAD_LEN.min(len)).read_to_end(&mut head)?;

    let start = match cursor {
        None => {
            return Ok(Some((String::new(), Cursor { offset: len, head })));
        }
        Some(prev) if len < prev.offset || !head.starts_with(&prev.head) => 0,
        Some(prev) => prev.offset,
    };

    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::new();
    file.take(len - start).read_to_end(&mut buf)?;

    // Leave a trailing partial UTF-8 sequence for the next poll.
    let complete = match std::str::from_utf8(&buf) {
        Ok(_) => buf.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => buf.len(),
    };
    let text = String::from_utf8_lossy(&buf[..complete]).into_owned();

    Ok(Some((
        text,
        Cursor {
            offset: start + complete as u64,
            head,
        },
    )))
}
