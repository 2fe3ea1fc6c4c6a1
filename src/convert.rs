//! Whole-document entry points.
//!
//! [`transcribe`] resolves the input, renders the selected pages and runs
//! every page through the [`RefinementEngine`]; [`translate`] re-renders the
//! same document, loads each page's persisted Markdown back from the sink and
//! runs it through the [`TranslationEngine`]. Both wait for every page and
//! return a [`TranscribeOutput`]. Use [`crate::stream::refine_stream`] to get
//! page reports as they complete instead.
//!
//! Page failures never abort a run. Only problems that stop the run from
//! starting (unreadable input, no completion backend) are returned as
//! `Err(TranscribeError)`.

use crate::config::TranscribeConfig;
use crate::document::{Document, DocumentReport, PageReport, PageStatus, RefinementState};
use crate::error::{PageError, TranscribeError};
use crate::pipeline::input::{self, ResolvedInput};
use crate::pipeline::llm::{
    ChatCompletionsService, CompletionService, ExponentialBackoff, ProviderService,
    RetryingService,
};
use crate::pipeline::ocr::{NoopExtractor, TesseractExtractor, TextExtractor};
use crate::pipeline::render::{PageSource, PdfPageSource, RenderedPage};
use crate::progress::ProgressCallback;
use crate::refine::RefinementEngine;
use crate::sink::{ArtifactKey, FsOutputSink, OutputSink};
use crate::translate::TranslationEngine;
use async_trait::async_trait;
use edgequake_llm::{LLMProvider, ProviderFactory};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Result of a whole-document run.
#[derive(Debug, Clone)]
pub struct TranscribeOutput {
    /// Pages with their OCR text, markdown and translations filled in.
    pub document: Document,
    pub report: DocumentReport,
}

/// Transcribe a PDF file or URL into per-page Markdown.
///
/// Every finalised page is written to the configured sink under
/// `ArtifactKey::markdown(document_id, page)`.
///
/// # Errors
/// Only fatal errors: file not found, not a PDF, corrupt or encrypted PDF,
/// page selection out of range, no completion backend configured. Failed
/// pages are reported in `output.report`.
pub async fn transcribe(
    input_str: impl AsRef<str>,
    config: &TranscribeConfig,
) -> Result<TranscribeOutput, TranscribeError> {
    let input_str = input_str.as_ref();
    info!("Starting transcription: {}", input_str);

    let service = resolve_service(config).await?;
    let (document_id, source) = open_pdf(input_str, config).await?;
    run_refinement(source.as_ref(), &document_id, service, config).await
}

/// Transcribe pages served by any [`PageSource`].
pub async fn transcribe_source(
    source: &dyn PageSource,
    document_id: &str,
    config: &TranscribeConfig,
) -> Result<TranscribeOutput, TranscribeError> {
    let service = resolve_service(config).await?;
    run_refinement(source, document_id, service, config).await
}

/// Translate the persisted Markdown of a PDF into `language`.
///
/// The document is rendered again so each request carries the page image.
/// Pages with no persisted Markdown are reported as skipped.
pub async fn translate(
    input_str: impl AsRef<str>,
    language: &str,
    config: &TranscribeConfig,
) -> Result<TranscribeOutput, TranscribeError> {
    let input_str = input_str.as_ref();
    info!("Starting translation to {}: {}", language, input_str);

    let service = resolve_service(config).await?;
    let (document_id, source) = open_pdf(input_str, config).await?;
    run_translation(source.as_ref(), &document_id, language, service, config).await
}

/// Translate pages served by any [`PageSource`].
pub async fn translate_source(
    source: &dyn PageSource,
    document_id: &str,
    language: &str,
    config: &TranscribeConfig,
) -> Result<TranscribeOutput, TranscribeError> {
    let service = resolve_service(config).await?;
    run_translation(source, document_id, language, service, config).await
}

/// Synchronous wrapper around [`transcribe`].
///
/// Creates a temporary tokio runtime internally.
pub fn transcribe_sync(
    input_str: impl AsRef<str>,
    config: &TranscribeConfig,
) -> Result<TranscribeOutput, TranscribeError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| TranscribeError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(transcribe(input_str, config))
}

/// Write `contents` to `path` atomically (temp file + rename).
pub async fn write_combined(path: &Path, contents: &str) -> Result<(), TranscribeError> {
    let failed = |source: std::io::Error| TranscribeError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(failed)?;
    }
    let tmp_path = path.with_extension("md.tmp");
    tokio::fs::write(&tmp_path, contents).await.map_err(failed)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(failed)?;
    Ok(())
}

// ── Per-page fan-out ─────────────────────────────────────────────────────

/// Refine every page of `document`, at most `concurrency` at a time.
///
/// Pages are moved into their tasks and put back in index order, with their
/// OCR text and markdown updated. Reports come back sorted by page.
pub async fn refine_document(
    engine: &RefinementEngine,
    document: &mut Document,
    concurrency: usize,
    progress: Option<&ProgressCallback>,
) -> Vec<PageReport> {
    let total_pages = document.pages.len();
    let document_id = document.id.as_str();
    let pages = std::mem::take(&mut document.pages);

    let results: Vec<_> = stream::iter(pages.into_iter().map(|mut page| async move {
        if let Some(cb) = progress {
            cb.on_page_start(page.index, total_pages);
        }
        let report = engine.refine_page(document_id, &mut page).await;
        notify_page_done(progress, &report, total_pages);
        (page, report)
    }))
    .buffer_unordered(concurrency.max(1))
    .collect()
    .await;

    let (mut pages, mut reports): (Vec<_>, Vec<_>) = results.into_iter().unzip();
    pages.sort_by_key(|p| p.index);
    reports.sort_by_key(|r: &PageReport| r.page_num);
    document.pages = pages;
    reports
}

/// Translate every page of `document` into `language`, at most
/// `concurrency` at a time, and record each translation on its page.
pub async fn translate_document(
    engine: &TranslationEngine,
    document: &mut Document,
    language: &str,
    concurrency: usize,
    progress: Option<&ProgressCallback>,
) -> Vec<PageReport> {
    let total_pages = document.pages.len();
    let document_id = document.id.as_str();

    let mut reports: Vec<PageReport> = stream::iter(document.pages.iter().map(|page| async move {
        if let Some(cb) = progress {
            cb.on_page_start(page.index, total_pages);
        }
        let report = engine.translate_page(document_id, page, language).await;
        notify_page_done(progress, &report, total_pages);
        report
    }))
    .buffer_unordered(concurrency.max(1))
    .collect()
    .await;
    reports.sort_by_key(|r| r.page_num);

    for report in &reports {
        if let (Some(text), Some(page)) = (&report.output, document.page_mut(report.page_num)) {
            // Only finalised reports carry output, and those pages have markdown.
            if let Err(e) = page.set_translation(language, text.clone()) {
                warn!("{}", e);
            }
        }
    }
    reports
}

pub(crate) fn notify_page_done(progress: Option<&ProgressCallback>, report: &PageReport, total_pages: usize) {
    let Some(cb) = progress else { return };
    match (&report.status, &report.error) {
        (PageStatus::Finalized, _) => cb.on_page_complete(
            report.page_num,
            total_pages,
            report.output.as_ref().map_or(0, String::len),
        ),
        (_, Some(e)) => cb.on_page_error(report.page_num, total_pages, &e.to_string()),
        (_, None) => cb.on_page_error(report.page_num, total_pages, "unknown error"),
    }
}

// ── Run orchestration ────────────────────────────────────────────────────

async fn run_refinement(
    source: &dyn PageSource,
    document_id: &str,
    service: Arc<dyn CompletionService>,
    config: &TranscribeConfig,
) -> Result<TranscribeOutput, TranscribeError> {
    let started = Instant::now();
    let mut document = load_pages(source, document_id).await?;
    let progress = config.progress_callback.as_ref();
    if let Some(cb) = progress {
        cb.on_run_start(document.pages.len());
    }

    let engine = RefinementEngine::from_config(
        config,
        service,
        resolve_extractor(config),
        resolve_sink(config),
    );
    let reports = refine_document(&engine, &mut document, config.concurrency, progress).await;

    let report = DocumentReport::new(
        document.id.clone(),
        None,
        reports,
        started.elapsed().as_millis() as u64,
    );
    info!(
        "Transcription complete: {}/{} pages, {} calls, {}ms",
        report.stats.succeeded,
        report.stats.total_pages,
        report.stats.completion_calls,
        report.stats.duration_ms
    );
    if let Some(cb) = progress {
        cb.on_run_complete(report.stats.total_pages, report.stats.succeeded);
    }
    Ok(TranscribeOutput { document, report })
}

async fn run_translation(
    source: &dyn PageSource,
    document_id: &str,
    language: &str,
    service: Arc<dyn CompletionService>,
    config: &TranscribeConfig,
) -> Result<TranscribeOutput, TranscribeError> {
    if language.trim().is_empty() {
        return Err(TranscribeError::InvalidConfig(
            "target language must not be empty".into(),
        ));
    }
    let started = Instant::now();
    let sink = resolve_sink(config);
    let mut document = load_pages(source, document_id).await?;

    // Markdown is looked up by typed key; a page whose read fails is reported
    // as failed rather than skipped.
    let mut read_failures: BTreeMap<usize, PageReport> = BTreeMap::new();
    for page in &mut document.pages {
        let key = ArtifactKey::markdown(&document.id, page.index);
        match sink.read(&key).await {
            Ok(markdown) => page.markdown = markdown,
            Err(e) => {
                let err = PageError::persistence(page.index, &e);
                warn!("{}", err);
                let mut report = PageReport::new(page.index);
                report.states.push(RefinementState::Failed(err.to_string()));
                report.error = Some(err);
                read_failures.insert(page.index, report);
            }
        }
    }
    debug!(
        "{} of {} pages have markdown to translate",
        document.pages.iter().filter(|p| p.markdown.is_some()).count(),
        document.pages.len()
    );

    let progress = config.progress_callback.as_ref();
    if let Some(cb) = progress {
        cb.on_run_start(document.pages.len());
    }
    let engine = TranslationEngine::from_config(config, service, sink);
    let reports = translate_document(&engine, &mut document, language, config.concurrency, progress)
        .await
        .into_iter()
        .map(|r| read_failures.remove(&r.page_num).unwrap_or(r))
        .collect();

    let report = DocumentReport::new(
        document.id.clone(),
        Some(language.to_string()),
        reports,
        started.elapsed().as_millis() as u64,
    );
    info!(
        "Translation to {} complete: {}/{} pages ({} skipped)",
        language, report.stats.succeeded, report.stats.total_pages, report.stats.skipped
    );
    if let Some(cb) = progress {
        cb.on_run_complete(report.stats.total_pages, report.stats.succeeded);
    }
    Ok(TranscribeOutput { document, report })
}

pub(crate) async fn load_pages(source: &dyn PageSource, document_id: &str) -> Result<Document, TranscribeError> {
    let render_start = Instant::now();
    let document = Document::from_source(document_id, source).await?;
    info!(
        "Rendered {} pages in {}ms",
        document.pages.len(),
        render_start.elapsed().as_millis()
    );
    Ok(document)
}

/// Resolve the input and prepare a page source over it.
///
/// The returned source owns the resolved input so a downloaded temp file
/// outlives rendering.
pub(crate) async fn open_pdf(
    input_str: &str,
    config: &TranscribeConfig,
) -> Result<(String, Box<dyn PageSource>), TranscribeError> {
    let resolved = input::resolve_input(input_str, config.download_timeout_secs).await?;
    let document_id = config
        .document_id
        .clone()
        .unwrap_or_else(|| resolved.document_id());
    debug!("Document id: {}", document_id);

    let source = PdfPageSource::new(resolved.path())
        .password(config.password.clone())
        .max_rendered_pixels(config.max_rendered_pixels)
        .pages(config.pages.clone());
    Ok((document_id, Box::new(ResolvedPdf { source, _input: resolved })))
}

/// A [`PdfPageSource`] that keeps its resolved input alive.
struct ResolvedPdf {
    source: PdfPageSource,
    _input: ResolvedInput,
}

#[async_trait]
impl PageSource for ResolvedPdf {
    async fn render(&self) -> Result<Vec<RenderedPage>, TranscribeError> {
        self.source.render().await
    }
}

// ── Collaborator resolution ──────────────────────────────────────────────

/// Resolve the completion backend, from most-specific to least-specific.
///
/// 1. **Pre-built service** (`config.service`): used as-is, no retry wrapper.
/// 2. **Pre-built provider** (`config.provider`): wrapped in [`ProviderService`].
/// 3. **Named provider** (`config.provider_name`): built by
///    [`ProviderFactory::create_llm_provider`] with the configured model.
/// 4. **API key** (`config.api_key`): [`ChatCompletionsService`] against
///    `config.base_url`.
///
/// Levels 2–4 are wrapped in a [`RetryingService`] with
/// [`ExponentialBackoff`] unless `max_retries` is 0.
pub async fn resolve_service(
    config: &TranscribeConfig,
) -> Result<Arc<dyn CompletionService>, TranscribeError> {
    if let Some(service) = &config.service {
        return Ok(Arc::clone(service));
    }

    let backend: Arc<dyn CompletionService> = if let Some(provider) = &config.provider {
        Arc::new(ProviderService::new(Arc::clone(provider), config.api_timeout_secs))
    } else if let Some(name) = &config.provider_name {
        let provider = create_provider(name, config.model_id())?;
        Arc::new(ProviderService::new(provider, config.api_timeout_secs))
    } else if let Some(key) = config.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
        Arc::new(ChatCompletionsService::new(
            config.base_url.clone(),
            key,
            config.api_timeout_secs,
        )?)
    } else {
        return Err(TranscribeError::ProviderNotConfigured {
            provider: "chat-completions".to_string(),
            hint: "Provide an API key (--api-key or GROQ_API_KEY) or name a provider with --provider."
                .to_string(),
        });
    };
    debug!("Completion backend: {}", backend.name());

    if config.max_retries == 0 {
        return Ok(backend);
    }
    let policy = ExponentialBackoff {
        max_retries: config.max_retries,
        base_ms: config.retry_backoff_ms,
        ..ExponentialBackoff::default()
    };
    Ok(Arc::new(RetryingService::new(backend, Arc::new(policy))))
}

fn create_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, TranscribeError> {
    ProviderFactory::create_llm_provider(name, model).map_err(|e| {
        TranscribeError::ProviderNotConfigured {
            provider: name.to_string(),
            hint: format!("{e}"),
        }
    })
}

pub(crate) fn resolve_extractor(config: &TranscribeConfig) -> Arc<dyn TextExtractor> {
    match (&config.extractor, config.ocr) {
        (Some(extractor), _) => Arc::clone(extractor),
        (None, true) => Arc::new(TesseractExtractor::new(
            config.ocr_command.clone(),
            config.ocr_language.clone(),
        )),
        (None, false) => Arc::new(NoopExtractor),
    }
}

pub(crate) fn resolve_sink(config: &TranscribeConfig) -> Arc<dyn OutputSink> {
    match &config.sink {
        Some(sink) => Arc::clone(sink),
        None => Arc::new(FsOutputSink::new(config.output_dir.clone())),
    }
}
