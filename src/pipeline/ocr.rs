//! Raw OCR pass: page raster → best-effort UTF-8 text.
//!
//! The OCR text is a hint for the model, not the answer: refinement always
//! sends the page image alongside it. Empty output is therefore normal (a
//! figure-only page, a handwriting scan) and never an error. Errors are kept
//! for the cases where the engine could not run at all.
//!
//! [`TesseractExtractor`] pipes the PNG into the `tesseract` binary through
//! `tokio::process`, so the CPU-heavy recognition happens outside the async
//! workers and several pages can be recognised in parallel.

use crate::error::ExtractionError;
use crate::pipeline::encode::PageImage;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Deterministic image → text recognition.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Recognise the text on `image`. Returns `""` when nothing is legible.
    async fn extract(&self, image: &PageImage) -> Result<String, ExtractionError>;
}

/// Runs the `tesseract` command-line engine.
#[derive(Debug, Clone)]
pub struct TesseractExtractor {
    command: String,
    language: String,
}

impl Default for TesseractExtractor {
    fn default() -> Self {
        Self::new("tesseract", "eng")
    }
}

impl TesseractExtractor {
    pub fn new(command: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            language: language.into(),
        }
    }

    /// Arguments for reading the image on stdin and writing text to stdout.
    fn args(&self) -> Vec<String> {
        vec![
            "stdin".to_string(),
            "stdout".to_string(),
            "-l".to_string(),
            self.language.clone(),
        ]
    }
}

#[async_trait]
impl TextExtractor for TesseractExtractor {
    async fn extract(&self, image: &PageImage) -> Result<String, ExtractionError> {
        let mut child = Command::new(&self.command)
            .args(self.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExtractionError::Spawn {
                command: self.command.clone(),
                detail: e.to_string(),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(image.bytes())
                .await
                .map_err(|e| ExtractionError::Io(e.to_string()))?;
            // Dropping stdin closes the pipe so tesseract sees EOF.
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ExtractionError::Io(e.to_string()))?;

        if !output.status.success() {
            return Err(ExtractionError::Failed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let text = normalise_ocr_text(&String::from_utf8_lossy(&output.stdout));
        debug!("OCR produced {} chars", text.len());
        Ok(text)
    }
}

/// Skip OCR entirely; the model works from the image alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExtractor;

#[async_trait]
impl TextExtractor for NoopExtractor {
    async fn extract(&self, _image: &PageImage) -> Result<String, ExtractionError> {
        Ok(String::new())
    }
}

/// Tesseract ends pages with a form feed and pads lines; strip both.
fn normalise_ocr_text(raw: &str) -> String {
    raw.replace('\u{000C}', "")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
