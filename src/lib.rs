//! # edgequake-transcribe
//!
//! Digitise scanned or image-only documents into Markdown, one page at a
//! time, by letting a vision-capable model refine raw OCR output over several
//! rounds, then optionally translate the result.
//!
//! ## Why refine instead of a single call?
//!
//! A single "convert this page" request tends to drop lines, invent
//! structure or wrap the answer in chatter. OCR text is faithful but
//! flat. Each page therefore goes through a short chain of requests: an
//! initial conversion seeded with the OCR text, critique-and-revise rounds,
//! an optional reconciliation of alternative readings, and a final
//! distillation that strips anything not on the page.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF / URL
//!  │
//!  ├─ 1. Input      resolve local file or download from URL
//!  ├─ 2. Render     rasterise pages via pdfium (spawn_blocking)
//!  ├─ 3. OCR        tesseract child process, raw text per page
//!  ├─ 4. Refine     initial → feedback × K → [meta-reasoning] → final
//!  ├─ 5. Polish     deterministic Markdown normalisation
//!  ├─ 6. Persist    <out>/<doc>/markdowns/page_<n>.md
//!  └─ 7. Translate  (separate run) <out>/<doc>/translations/<lang>/page_<n>.md
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_transcribe::{transcribe, translate, TranscribeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TranscribeConfig::builder()
//!         .api_key(std::env::var("GROQ_API_KEY")?)
//!         .output_dir("./data")
//!         .build()?;
//!
//!     let run = transcribe("scan.pdf", &config).await?;
//!     eprintln!("{}/{} pages", run.report.stats.succeeded, run.report.stats.total_pages);
//!
//!     let french = translate("scan.pdf", "French", &config).await?;
//!     eprintln!("{} pages translated", french.report.stats.succeeded);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `transcribe` binary (clap + indicatif + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-transcribe = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod document;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod refine;
pub mod sink;
pub mod stream;
pub mod translate;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PageSelection, PageSeparator, TranscribeConfig, TranscribeConfigBuilder};
pub use convert::{
    refine_document, resolve_service, transcribe, transcribe_source, transcribe_sync, translate,
    translate_document, translate_source, write_combined, TranscribeOutput,
};
pub use document::{
    Document, DocumentReport, Page, PageReport, PageStatus, RefinementState, RunStats,
};
pub use error::{ExtractionError, PageError, PersistenceError, ServiceError, TranscribeError};
pub use pipeline::encode::PageImage;
pub use pipeline::llm::{
    ChatCompletionsService, Completion, CompletionRequest, CompletionService, ExponentialBackoff,
    ModelSettings, NoRetry, ProviderService, RetryPolicy, RetryingService,
};
pub use pipeline::messages::{build_messages, build_messages_with_role, Message, MessageContent, Role};
pub use pipeline::ocr::{NoopExtractor, TesseractExtractor, TextExtractor};
pub use pipeline::render::{MemoryPageSource, PageSource, PdfPageSource, RenderedPage};
pub use progress::{NoopProgressCallback, ProgressCallback, TranscribeProgressCallback};
pub use refine::RefinementEngine;
pub use sink::{ArtifactKey, ArtifactKind, FsOutputSink, MemorySink, OutputSink};
pub use stream::{refine_stream, refine_stream_source, PageStream};
pub use translate::TranslationEngine;
