//! Document-level tests against scripted collaborators.
//!
//! No network, no tesseract, no pdfium: pages come from a
//! [`MemoryPageSource`], OCR from a lookup table, completions from a service
//! that answers by stage, and artifacts land in a [`MemorySink`].
//!
//! Each test page image is a one-byte PNG stand-in whose byte is the page
//! number, so scripted collaborators can tell pages apart.

use async_trait::async_trait;
use edgequake_transcribe::{
    build_messages, refine_stream_source, transcribe_source, translate_source, ArtifactKey,
    Completion, CompletionRequest, CompletionService, ExponentialBackoff, ExtractionError,
    MemoryPageSource, MemorySink, MessageContent, PageError, PageImage, PageSeparator, PageSource,
    PageStatus, RefinementState, RenderedPage, RetryingService, Role, ServiceError, TextExtractor,
    TranscribeConfig, TranscribeError,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ── Scripted collaborators ───────────────────────────────────────────────

fn page_image(page: u8) -> PageImage {
    PageImage::from_png(vec![page])
}

fn source(pages: u8) -> MemoryPageSource {
    MemoryPageSource::new((1..=pages).map(page_image).collect())
}

/// Renders `pages` pages, except that `broken` has no usable raster.
struct BrokenRaster {
    pages: u8,
    broken: u8,
}

#[async_trait]
impl PageSource for BrokenRaster {
    async fn render(&self) -> Result<Vec<RenderedPage>, TranscribeError> {
        Ok((1..=self.pages)
            .map(|n| {
                let raster = if n == self.broken {
                    Err(ExtractionError::InvalidImage("bitmap allocation failed".into()))
                } else {
                    Ok(page_image(n))
                };
                (usize::from(n), raster)
            })
            .collect())
    }
}

/// Page number carried by the image attached to a request, if any.
fn page_of(request: &CompletionRequest) -> Option<u8> {
    request.messages.iter().find_map(|m| match &m.content {
        MessageContent::Image(img) => img.bytes().first().copied(),
        MessageContent::Text(_) => None,
    })
}

fn stage_of(request: &CompletionRequest) -> &'static str {
    let first = request.messages[0].text().unwrap_or_default();
    if first.starts_with("Convert the following text") {
        "initial"
    } else if first.starts_with("Compare the original text") {
        "feedback"
    } else if first.starts_with("Using the following feedback") {
        "apply"
    } else if first.starts_with("Convert the following page") {
        "alternate"
    } else if first.starts_with("Compare the following markdown versions") {
        "meta"
    } else if first.starts_with("Based on the following optimized") {
        "final"
    } else if first.starts_with("You are a professional translator") {
        "translate"
    } else {
        "unknown"
    }
}

/// Answers every stage deterministically. Initial conversions of the pages
/// in `fail_pages`, and translations of the pages in `fail_translations`,
/// come back `Unavailable`.
#[derive(Default)]
struct ScriptedModel {
    requests: Mutex<Vec<CompletionRequest>>,
    fail_pages: Vec<u8>,
    fail_translations: Vec<u8>,
}

impl ScriptedModel {
    fn failing(pages: &[u8]) -> Self {
        Self {
            fail_pages: pages.to_vec(),
            ..Self::default()
        }
    }

    fn failing_translation(pages: &[u8]) -> Self {
        Self {
            fail_translations: pages.to_vec(),
            ..Self::default()
        }
    }

    fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().expect("lock").clone()
    }

    fn count(&self, stage: &str) -> usize {
        self.requests().iter().filter(|r| stage_of(r) == stage).count()
    }
}

#[async_trait]
impl CompletionService for ScriptedModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ServiceError> {
        self.requests.lock().expect("lock").push(request.clone());
        let content = request.messages[1].text().unwrap_or_default().to_string();
        let page = page_of(request);

        let text = match stage_of(request) {
            "initial" if page.is_some_and(|p| self.fail_pages.contains(&p)) => {
                return Err(ServiceError::Unavailable("scripted outage".into()));
            }
            "initial" => format!("# Page {}\n\n{}", page.unwrap_or(0), content),
            "feedback" => "Use a level one heading.".to_string(),
            "apply" | "meta" | "final" => content,
            "alternate" => format!("# Page {} (read)", page.unwrap_or(0)),
            "translate" if page.is_some_and(|p| self.fail_translations.contains(&p)) => {
                return Err(ServiceError::Unavailable("scripted outage".into()));
            }
            "translate" => format!("# Traduit\n\n{content}"),
            _ => return Err(ServiceError::InvalidResponse("unrecognised prompt".into())),
        };
        Ok(Completion {
            text,
            prompt_tokens: 12,
            completion_tokens: 6,
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// OCR text per page number; pages missing from the table read as "".
struct TableOcr(HashMap<u8, &'static str>);

impl TableOcr {
    fn new(rows: &[(u8, &'static str)]) -> Self {
        Self(rows.iter().copied().collect())
    }
}

#[async_trait]
impl TextExtractor for TableOcr {
    async fn extract(&self, image: &PageImage) -> Result<String, ExtractionError> {
        let page = image.bytes().first().copied().unwrap_or(0);
        Ok(self.0.get(&page).copied().unwrap_or_default().to_string())
    }
}

fn config(
    model: Arc<dyn CompletionService>,
    ocr: TableOcr,
    sink: Arc<MemorySink>,
) -> TranscribeConfig {
    TranscribeConfig::builder()
        .service(model)
        .extractor(Arc::new(ocr))
        .sink(sink)
        .concurrency(2)
        .build()
        .expect("valid config")
}

// ── Refinement ───────────────────────────────────────────────────────────

#[tokio::test]
async fn every_page_finalizes_with_persisted_markdown() {
    let model = Arc::new(ScriptedModel::default());
    let sink = Arc::new(MemorySink::new());
    let config = config(
        model.clone(),
        TableOcr::new(&[(1, "Hello"), (2, "There")]),
        sink.clone(),
    );

    let out = transcribe_source(&source(2), "doc", &config)
        .await
        .expect("run completes");

    assert_eq!(out.report.stats.total_pages, 2);
    assert_eq!(out.report.stats.succeeded, 2);
    for page in &out.document.pages {
        let key = ArtifactKey::markdown("doc", page.index);
        let stored = sink.get(&key).expect("artifact written");
        assert!(!stored.trim().is_empty());
        assert_eq!(page.markdown.as_deref(), Some(stored.as_str()));
        assert_eq!(
            out.report.page(page.index).and_then(|r| r.final_state()),
            Some(&RefinementState::Finalized)
        );
    }
    assert_eq!(
        sink.get(&ArtifactKey::markdown("doc", 1)).as_deref(),
        Some("# Page 1\n\nHello\n")
    );
    assert_eq!(out.report.stats.completion_calls, 8);
    assert_eq!(model.count("final"), 2);
}

#[tokio::test]
async fn failing_page_is_isolated() {
    let model = Arc::new(ScriptedModel::failing(&[3]));
    let sink = Arc::new(MemorySink::new());
    let config = config(model.clone(), TableOcr::new(&[]), sink.clone());

    let out = transcribe_source(&source(4), "doc", &config)
        .await
        .expect("page failures are not fatal");

    assert_eq!(out.report.stats.succeeded, 3);
    assert_eq!(out.report.stats.failed, 1);
    let statuses: Vec<_> = out.report.pages.iter().map(|p| (p.page_num, p.status)).collect();
    assert_eq!(
        statuses,
        vec![
            (1, PageStatus::Finalized),
            (2, PageStatus::Finalized),
            (3, PageStatus::Failed),
            (4, PageStatus::Finalized),
        ]
    );

    let failed = out.report.page(3).expect("page 3 reported");
    assert!(matches!(
        &failed.error,
        Some(PageError::Service { page: 3, stage, .. }) if stage == "initial_conversion"
    ));
    assert!(matches!(failed.final_state(), Some(RefinementState::Failed(_))));
    assert!(sink.get(&ArtifactKey::markdown("doc", 3)).is_none());
    assert!(out.document.page(3).is_some_and(|p| p.markdown.is_none()));
    assert_eq!(sink.len(), 3);
    assert_eq!(out.report.errors().count(), 1);
}

#[tokio::test]
async fn unrenderable_page_is_isolated() {
    let model = Arc::new(ScriptedModel::default());
    let sink = Arc::new(MemorySink::new());
    let config = config(model.clone(), TableOcr::new(&[]), sink.clone());

    let out = transcribe_source(&BrokenRaster { pages: 3, broken: 2 }, "doc", &config)
        .await
        .expect("a bad raster is not fatal");

    let statuses: Vec<_> = out.report.pages.iter().map(|p| (p.page_num, p.status)).collect();
    assert_eq!(
        statuses,
        vec![
            (1, PageStatus::Finalized),
            (2, PageStatus::Failed),
            (3, PageStatus::Finalized),
        ]
    );

    let broken = out.report.page(2).expect("page 2 reported");
    assert!(matches!(
        &broken.error,
        Some(PageError::Extraction { page: 2, detail }) if detail.contains("bitmap allocation failed")
    ));
    assert_eq!(broken.completion_calls, 0);
    assert!(sink.get(&ArtifactKey::markdown("doc", 2)).is_none());
    assert!(model.requests().iter().all(|r| page_of(r) != Some(2)));
    assert_eq!(sink.len(), 2);
}

#[tokio::test]
async fn blank_ocr_page_still_finalizes() {
    let model = Arc::new(ScriptedModel::default());
    let sink = Arc::new(MemorySink::new());
    let config = config(
        model.clone(),
        TableOcr::new(&[(1, "Hello"), (2, ""), (3, "World")]),
        sink.clone(),
    );

    let out = transcribe_source(&source(3), "scan", &config)
        .await
        .expect("run completes");

    assert_eq!(out.report.stats.succeeded, 3);
    assert_eq!(out.document.page(2).and_then(|p| p.ocr_text.as_deref()), Some(""));

    // The initial conversion of the blank page carries empty content and
    // still attaches the image.
    let requests = model.requests();
    let initial = requests
        .iter()
        .find(|r| stage_of(r) == "initial" && page_of(r) == Some(2))
        .expect("initial request for page 2");
    assert_eq!(initial.messages.len(), 3);
    assert_eq!(initial.messages[1].text(), Some(""));
    assert!(initial.messages[2].is_image());

    let combined = out.document.assemble(&PageSeparator::None);
    assert!(combined.contains("Hello"));
    assert!(combined.contains("World"));
}

#[tokio::test]
async fn zero_feedback_iterations_skip_the_loop() {
    let model = Arc::new(ScriptedModel::default());
    let sink = Arc::new(MemorySink::new());
    let config = TranscribeConfig::builder()
        .service(model.clone())
        .extractor(Arc::new(TableOcr::new(&[(1, "Hello")])))
        .sink(sink)
        .feedback_iterations(0)
        .build()
        .expect("valid config");

    let out = transcribe_source(&source(1), "doc", &config)
        .await
        .expect("run completes");

    let report = out.report.page(1).expect("page 1");
    assert!(report.is_success());
    assert_eq!(report.completion_calls, 2);
    assert_eq!(model.count("feedback"), 0);
    assert_eq!(model.count("apply"), 0);
    assert_eq!(
        report.states,
        vec![
            RefinementState::Start,
            RefinementState::OcrExtracted,
            RefinementState::InitialConverted,
            RefinementState::Finalized,
        ]
    );
}

#[tokio::test]
async fn alternate_reading_reconciles_two_candidates() {
    let model = Arc::new(ScriptedModel::default());
    let config = TranscribeConfig::builder()
        .service(model.clone())
        .extractor(Arc::new(TableOcr::new(&[(1, "Hello")])))
        .sink(Arc::new(MemorySink::new()))
        .alternate_reading(true)
        .build()
        .expect("valid config");

    let out = transcribe_source(&source(1), "doc", &config)
        .await
        .expect("run completes");

    let report = out.report.page(1).expect("page 1");
    assert!(report.states.contains(&RefinementState::MetaReasoned(2)));
    assert_eq!(model.count("alternate"), 1);
    assert_eq!(model.count("meta"), 1);
}

#[tokio::test]
async fn stream_yields_one_report_per_page() {
    let model = Arc::new(ScriptedModel::failing(&[2]));
    let sink = Arc::new(MemorySink::new());
    let config = config(model, TableOcr::new(&[]), sink.clone());

    let stream = refine_stream_source(&source(3), "doc", &config)
        .await
        .expect("stream starts");
    let mut reports: Vec<_> = stream.collect().await;
    reports.sort_by_key(|r| r.page_num);

    assert_eq!(reports.len(), 3);
    assert!(reports[0].is_success());
    assert_eq!(reports[1].status, PageStatus::Failed);
    assert!(reports[2].is_success());
    assert_eq!(sink.len(), 2);
}

// ── Translation ──────────────────────────────────────────────────────────

#[tokio::test]
async fn translation_leaves_markdown_untouched() {
    let model = Arc::new(ScriptedModel::default());
    let sink = Arc::new(MemorySink::new());
    let config = config(
        model.clone(),
        TableOcr::new(&[(1, "Hello"), (2, "World")]),
        sink.clone(),
    );

    transcribe_source(&source(2), "doc", &config)
        .await
        .expect("refinement completes");
    let before = sink.get(&ArtifactKey::markdown("doc", 1)).expect("markdown");

    let out = translate_source(&source(2), "doc", "French", &config)
        .await
        .expect("translation completes");

    assert_eq!(out.report.language.as_deref(), Some("French"));
    assert_eq!(out.report.stats.succeeded, 2);
    assert_eq!(sink.get(&ArtifactKey::markdown("doc", 1)), Some(before.clone()));

    let translated = sink
        .get(&ArtifactKey::translation("doc", 1, "French"))
        .expect("translation artifact");
    assert_eq!(translated, format!("# Traduit\n\n{before}"));

    let page = out.document.page(1).expect("page 1");
    assert_eq!(page.markdown.as_deref(), Some(before.as_str()));
    assert_eq!(page.translation("French"), Some(translated.as_str()));

    let request = model
        .requests()
        .into_iter()
        .find(|r| stage_of(r) == "translate")
        .expect("translation request");
    assert_eq!(request.messages[0].role, Role::System);
    assert!(request.messages[2].is_image());
}

#[test]
fn translation_skips_pages_without_markdown() {
    tokio_test::block_on(async {
        let model = Arc::new(ScriptedModel::failing(&[2]));
        let sink = Arc::new(MemorySink::new());
        let config = config(model.clone(), TableOcr::new(&[]), sink.clone());

        transcribe_source(&source(2), "doc", &config)
            .await
            .expect("refinement completes");
        let out = translate_source(&source(2), "doc", "German", &config)
            .await
            .expect("translation completes");

        assert_eq!(out.report.stats.succeeded, 1);
        assert_eq!(out.report.stats.skipped, 1);
        assert_eq!(
            out.report.page(2).and_then(|r| r.error.clone()),
            Some(PageError::MissingMarkdown { page: 2 })
        );
        assert!(sink.get(&ArtifactKey::translation("doc", 2, "German")).is_none());
        assert_eq!(model.count("translate"), 1);
    });
}

#[tokio::test]
async fn failed_translation_is_isolated() {
    let model = Arc::new(ScriptedModel::failing_translation(&[2]));
    let sink = Arc::new(MemorySink::new());
    let config = config(model.clone(), TableOcr::new(&[]), sink.clone());

    transcribe_source(&source(3), "doc", &config)
        .await
        .expect("refinement completes");
    let out = translate_source(&source(3), "doc", "French", &config)
        .await
        .expect("translation failures are not fatal");

    let statuses: Vec<_> = out.report.pages.iter().map(|p| (p.page_num, p.status)).collect();
    assert_eq!(
        statuses,
        vec![
            (1, PageStatus::Finalized),
            (2, PageStatus::Failed),
            (3, PageStatus::Finalized),
        ]
    );
    assert!(matches!(
        &out.report.page(2).expect("page 2 reported").error,
        Some(PageError::Service { page: 2, .. })
    ));

    assert!(sink.get(&ArtifactKey::translation("doc", 2, "French")).is_none());
    assert!(sink.get(&ArtifactKey::markdown("doc", 2)).is_some());
    let page = out.document.page(2).expect("page 2");
    assert!(page.markdown.is_some());
    assert_eq!(page.translation("French"), None);
    for n in [1, 3] {
        assert!(sink.get(&ArtifactKey::translation("doc", n, "French")).is_some());
        assert!(out.document.page(n).and_then(|p| p.translation("French")).is_some());
    }
}

#[tokio::test]
async fn empty_language_is_rejected() {
    let config = config(
        Arc::new(ScriptedModel::default()),
        TableOcr::new(&[]),
        Arc::new(MemorySink::new()),
    );
    let err = translate_source(&source(1), "doc", "  ", &config)
        .await
        .err()
        .expect("empty language");
    assert!(err.to_string().contains("language"));
}

// ── Messages ─────────────────────────────────────────────────────────────

#[test]
fn messages_keep_instruction_content_image_order() {
    let image = page_image(7);
    let messages = build_messages("X", "Y", Some(&image));

    assert_eq!(messages.len(), 3);
    assert_eq!((messages[0].role, messages[0].text()), (Role::User, Some("X")));
    assert_eq!((messages[1].role, messages[1].text()), (Role::User, Some("Y")));
    assert_eq!(messages[2].role, Role::User);
    assert_eq!(messages[2].content, MessageContent::Image(image));

    assert_eq!(build_messages("X", "Y", None).len(), 2);
}

// ── Retries ──────────────────────────────────────────────────────────────

/// Fails the first `failures` calls with `error`, then defers to
/// [`ScriptedModel`].
struct Flaky {
    inner: ScriptedModel,
    error: ServiceError,
    failures: usize,
    attempts: AtomicUsize,
}

impl Flaky {
    fn new(error: ServiceError, failures: usize) -> Self {
        Self {
            inner: ScriptedModel::default(),
            error,
            failures,
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CompletionService for Flaky {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ServiceError> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(self.error.clone());
        }
        self.inner.complete(request).await
    }
}

fn with_retries(flaky: Arc<Flaky>, max_retries: u32) -> Arc<dyn CompletionService> {
    let policy = ExponentialBackoff {
        max_retries,
        base_ms: 1,
        max_delay_ms: 5,
    };
    Arc::new(RetryingService::new(flaky, Arc::new(policy)))
}

async fn run_one_page(service: Arc<dyn CompletionService>) -> PageStatus {
    let config = TranscribeConfig::builder()
        .service(service)
        .extractor(Arc::new(TableOcr::new(&[(1, "Hello")])))
        .sink(Arc::new(MemorySink::new()))
        .build()
        .expect("valid config");
    let out = transcribe_source(&source(1), "doc", &config)
        .await
        .expect("run completes");
    out.report.pages[0].status
}

#[tokio::test]
async fn transient_errors_are_retried() {
    for error in [
        ServiceError::RateLimited {
            retry_after_secs: None,
        },
        ServiceError::Timeout { secs: 1 },
    ] {
        let flaky = Arc::new(Flaky::new(error, 2));
        let status = run_one_page(with_retries(flaky.clone(), 3)).await;

        assert_eq!(status, PageStatus::Finalized);
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 2 + 4);
    }
}

#[tokio::test]
async fn retry_budget_is_bounded() {
    let flaky = Arc::new(Flaky::new(ServiceError::Timeout { secs: 1 }, usize::MAX));
    let status = run_one_page(with_retries(flaky.clone(), 2)).await;

    assert_eq!(status, PageStatus::Failed);
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn permanent_errors_are_not_retried() {
    for error in [
        ServiceError::InvalidResponse("garbled".into()),
        ServiceError::Unavailable("down".into()),
    ] {
        let flaky = Arc::new(Flaky::new(error, 1));
        let status = run_one_page(with_retries(flaky.clone(), 3)).await;

        assert_eq!(status, PageStatus::Failed);
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 1);
    }
}
