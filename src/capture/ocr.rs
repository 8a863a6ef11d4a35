//! Screenshot a screen region and run it through tesseract.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::inbox::dedup::signature;
use crate::util::blocking_with_timeout;
use crate::worker::WorkerId;
use crate::{wlog_debug, Error, Result};

use super::{CaptureKind, CaptureStrategy, RawCandidate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenshotTool {
    /// macOS `screencapture`.
    ScreenCapture,
    /// Wayland `grim`.
    Grim,
    /// ImageMagick `import` on X11.
    Import,
}

impl ScreenshotTool {
    pub fn detect() -> Option<Self> {
        [
            ("screencapture", ScreenshotTool::ScreenCapture),
            ("grim", ScreenshotTool::Grim),
            ("import", ScreenshotTool::Import),
        ]
        .into_iter()
        .find(|(bin, _)| which::which(bin).is_ok())
        .map(|(_, tool)| tool)
    }

    /// Program and arguments capturing `region` into `out`.
    pub fn command(&self, region: [u32; 4], out: &Path) -> (&'static str, Vec<String>) {
        let [x, y, w, h] = region;
        let out = out.to_string_lossy().into_owned();
        match self {
            ScreenshotTool::ScreenCapture => (
                "screencapture",
                vec!["-x".into(), format!("-R{},{},{},{}", x, y, w, h), out],
            ),
            ScreenshotTool::Grim => (
                "grim",
                vec!["-g".into(), format!("{},{} {}x{}", x, y, w, h), out],
            ),
            ScreenshotTool::Import => (
                "import",
                vec![
                    "-window".into(),
                    "root".into(),
                    "-crop".into(),
                    format!("{}x{}+{}+{}", w, h, x, y),
                    out,
                ],
            ),
        }
    }
}

pub struct ScreenOcr {
    region: [u32; 4],
    screenshot: Option<ScreenshotTool>,
    tesseract: bool,
    timeout: Duration,
    last_signature: Option<String>,
    available: bool,
}

impl ScreenOcr {
    pub fn detect(region: [u32; 4], timeout: Duration) -> Self {
        let screenshot = ScreenshotTool::detect();
        let tesseract = which::which("tesseract").is_ok();
        if screenshot.is_none() || !tesseract {
            wlog_debug!(
                "ScreenOcr: tools missing (screenshot={:?}, tesseract={})",
                screenshot,
                tesseract
            );
        }
        Self {
            region,
            available: screenshot.is_some() && tesseract,
            screenshot,
            tesseract,
            timeout,
            last_signature: None,
        }
    }
}

#[async_trait]
impl CaptureStrategy for ScreenOcr {
    fn kind(&self) -> CaptureKind {
        CaptureKind::Ocr
    }

    async fn poll(&mut self, worker: &WorkerId) -> Vec<RawCandidate> {
        let Some(tool) = self.screenshot else {
            return Vec::new();
        };
        if !self.tesseract {
            return Vec::new();
        }

        let region = self.region;
        let image = std::env::temp_dir().join(format!(
            "warden-ocr-{}-{}.png",
            worker,
            uuid::Uuid::new_v4().simple()
        ));
        let result =
            blocking_with_timeout(self.timeout, move || capture_text(tool, region, image)).await;

        let text = match result {
            Ok(text) => {
                self.available = true;
                normalize(&text)
            }
            Err(e) => {
                wlog_debug!("ScreenOcr: capture failed: {}", e);
                self.available = false;
                return Vec::new();
            }
        };
        if text.is_empty() {
            return Vec::new();
        }
        // A static screen reads the same every poll.
        let sig = signature(&text);
        if self.last_signature.as_deref() == Some(sig.as_str()) {
            return Vec::new();
        }
        self.last_signature = Some(sig);
        vec![RawCandidate::new(worker, CaptureKind::Ocr, text)]
    }

    fn available(&self) -> bool {
        self.available
    }
}

fn capture_text(tool: ScreenshotTool, region: [u32; 4], image: PathBuf) -> Result<String> {
    let (program, args) = tool.command(region, &image);
    let shot = Command::new(program).args(&args).output()?;
    if !shot.status.success() {
        let _ = std::fs::remove_file(&image);
        return Err(Error::Driver(format!("{} exited with {}", program, shot.status)));
    }

    let ocr = Command::new("tesseract").arg(&image).arg("stdout").output();
    let _ = std::fs::remove_file(&image);
    let ocr = ocr?;
    if !ocr.status.success() {
        return Err(Error::Driver(format!("tesseract exited with {}", ocr.status)));
    }
    Ok(String::from_utf8_lossy(&ocr.stdout).into_owned())
}

/// Trim each line and drop blank ones; OCR output is full of them.
fn normalize(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
