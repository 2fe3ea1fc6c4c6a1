//! Error types for the edgequake-transcribe library.
//!
//! Errors are split by blast radius:
//!
//! * [`TranscribeError`]: **Fatal**: the run cannot start at all (missing
//!   input, unreadable PDF, no completion backend configured). Returned as
//!   `Err(TranscribeError)` from the top-level entry points.
//!
//! * [`PageError`]: **Non-fatal**: one page failed at some stage while the
//!   rest of the document carries on. Stored inside
//!   [`crate::document::PageReport`] so a run always ends in a per-page
//!   outcome summary rather than one opaque failure.
//!
//! The collaborator errors ([`ExtractionError`], [`ServiceError`],
//! [`PersistenceError`]) are what the OCR pass, the completion backend and the
//! output sink return. The engines fold them into a [`PageError`] tagged with
//! the page number and the stage that was running.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Maximum number of characters of a diagnostic kept in logs and reports.
pub const DIAGNOSTIC_MAX_CHARS: usize = 200;

/// All fatal errors returned by the library.
#[derive(Debug, Error)]
pub enum TranscribeError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// The page selection matched no page of the document.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    // ── Backend errors ────────────────────────────────────────────────────
    /// No completion backend could be built from the configuration.
    #[error("Completion backend '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write a combined output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure of the OCR pass (or of the raster it was handed).
#[derive(Debug, Clone, Error)]
pub enum ExtractionError {
    /// The OCR binary could not be started.
    #[error("failed to start OCR engine '{command}': {detail}")]
    Spawn { command: String, detail: String },

    /// Reading from or writing to the OCR process failed.
    #[error("OCR I/O failed: {0}")]
    Io(String),

    /// The OCR engine exited unsuccessfully.
    #[error("OCR engine exited with status {status}: {stderr}")]
    Failed { status: i32, stderr: String },

    /// The page could not be rasterised, or its raster could not be encoded.
    #[error("invalid page image: {0}")]
    InvalidImage(String),
}

/// Failure of a single completion call.
///
/// `RateLimited` and `Timeout` are expected transient conditions and the only
/// kinds a [`crate::pipeline::llm::RetryPolicy`] retries. `Unavailable` and
/// `InvalidResponse` are surfaced immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ServiceError {
    /// Backend unreachable, 5xx, or refused the credentials.
    #[error("completion backend unavailable: {0}")]
    Unavailable(String),

    /// Backend answered 429.
    #[error("completion backend rate limited the request")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Backend answered but the body had no usable text.
    #[error("invalid completion response: {0}")]
    InvalidResponse(String),

    /// The call exceeded its deadline.
    #[error("completion call timed out after {secs}s")]
    Timeout { secs: u64 },
}

impl ServiceError {
    /// Whether the error is a transient condition worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Timeout { .. })
    }

    /// Short machine-friendly name of the kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Timeout { .. } => "timeout",
        }
    }
}

/// Failure of an [`crate::sink::OutputSink`] read or write.
#[derive(Debug, Error)]
#[error("failed to persist '{path}': {source}")]
pub struct PersistenceError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// A non-fatal error for a single page.
///
/// Stored in [`crate::document::PageReport`] when a page fails. The run
/// continues with every other page.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PageError {
    /// OCR failed before any model call was made.
    #[error("Page {page}: text extraction failed: {detail}")]
    Extraction { page: usize, detail: String },

    /// A completion call failed during `stage`.
    #[error("Page {page}: {stage} failed ({kind}): {detail}")]
    Service {
        page: usize,
        stage: String,
        kind: String,
        detail: String,
    },

    /// The final artifact could not be written or read.
    #[error("Page {page}: persistence failed: {detail}")]
    Persistence { page: usize, detail: String },

    /// Translation was requested for a page that has no markdown yet.
    #[error("Page {page}: no markdown transcript to translate")]
    MissingMarkdown { page: usize },
}

impl PageError {
    pub fn extraction(page: usize, err: &ExtractionError) -> Self {
        Self::Extraction {
            page,
            detail: truncate_diagnostic(&err.to_string()),
        }
    }

    pub fn service(page: usize, stage: impl std::fmt::Display, err: &ServiceError) -> Self {
        Self::Service {
            page,
            stage: stage.to_string(),
            kind: err.kind().to_string(),
            detail: truncate_diagnostic(&err.to_string()),
        }
    }

    pub fn persistence(page: usize, err: &PersistenceError) -> Self {
        Self::Persistence {
            page,
            detail: truncate_diagnostic(&err.to_string()),
        }
    }

    /// The page this error belongs to.
    pub fn page(&self) -> usize {
        match self {
            Self::Extraction { page, .. }
            | Self::Service { page, .. }
            | Self::Persistence { page, .. }
            | Self::MissingMarkdown { page } => *page,
        }
    }
}

/// Cut a diagnostic down to [`DIAGNOSTIC_MAX_CHARS`] characters, appending `…`.
///
/// Cuts on a char boundary so multi-byte model output never panics.
pub fn truncate_diagnostic(msg: &str) -> String {
    if msg.chars().count() <= DIAGNOSTIC_MAX_CHARS {
        return msg.to_string();
    }
    let mut out: String = msg.chars().take(DIAGNOSTIC_MAX_CHARS - 1).collect();
    out.push('\u{2026}');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(ServiceError::RateLimited { retry_after_secs: None }.is_transient());
        assert!(ServiceError::Timeout { secs: 30 }.is_transient());
        assert!(!ServiceError::Unavailable("down".into()).is_transient());
        assert!(!ServiceError::InvalidResponse("empty".into()).is_transient());
    }

    #[test]
    fn page_error_service_display() {
        let e = PageError::service(3, "feedback", &ServiceError::Timeout { secs: 60 });
        let msg = e.to_string();
        assert!(msg.contains("Page 3"), "got: {msg}");
        assert!(msg.contains("feedback"), "got: {msg}");
        assert!(msg.contains("timeout"), "got: {msg}");
        assert_eq!(e.page(), 3);
    }

    #[test]
    fn truncate_keeps_short_messages() {
        assert_eq!(truncate_diagnostic("short"), "short");
    }

    #[test]
    fn truncate_long_multibyte_message() {
        let long = "é".repeat(500);
        let cut = truncate_diagnostic(&long);
        assert_eq!(cut.chars().count(), DIAGNOSTIC_MAX_CHARS);
        assert!(cut.ends_with('\u{2026}'));
    }

    #[test]
    fn not_a_pdf_display() {
        let e = TranscribeError::NotAPdf {
            path: PathBuf::from("/tmp/x.txt"),
            magic: *b"abcd",
        };
        assert!(e.to_string().contains("/tmp/x.txt"));
    }

    #[test]
    fn missing_markdown_display() {
        let e = PageError::MissingMarkdown { page: 7 };
        assert!(e.to_string().contains("Page 7"));
    }
}
