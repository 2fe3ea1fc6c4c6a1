//! The refinement engine: one page image in, one finalised Markdown
//! transcript out.
//!
//! ## Stages
//!
//! ```text
//! OCR ──▶ initial conversion ──▶ feedback × K ──▶ [meta-reasoning] ──▶ finalise
//!          (ocr text + image)     critique (text)    candidates + image   (image)
//!                                 apply (image)
//! ```
//!
//! Stages run strictly in sequence; each consumes the previous stage's text.
//! A page that fails at any stage ends in [`RefinementState::Failed`] with
//! the error recorded in its [`PageReport`]; nothing is persisted for it and
//! other pages are unaffected.
//!
//! Meta-reasoning only runs when there is more than one candidate to
//! reconcile: caller-supplied alternates, or the image-only "alternate
//! reading" when it is enabled. Which candidate wins, or how they are merged,
//! is up to the model.

use crate::config::TranscribeConfig;
use crate::document::{Page, PageReport, PageStatus, RefinementState};
use crate::error::{truncate_diagnostic, PageError, ServiceError};
use crate::pipeline::encode::PageImage;
use crate::pipeline::llm::{CompletionService, ModelSettings};
use crate::pipeline::messages::{build_messages, Message};
use crate::pipeline::ocr::TextExtractor;
use crate::pipeline::postprocess::format_markdown;
use crate::progress::ProgressCallback;
use crate::prompts::{
    feedback_content, improve_prompt, meta_reasoning_content, AI_READ_CONTENT, AI_READ_PROMPT,
    FEEDBACK_PROMPT, FINAL_VERSION_PROMPT, INITIAL_CONVERSION_PROMPT, META_REASONING_PROMPT,
};
use crate::sink::{ArtifactKey, OutputSink};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Runs the per-page refinement sequence.
///
/// Cheap to share: every collaborator sits behind an `Arc`, and
/// [`refine_page`](Self::refine_page) takes `&self`, so one engine serves all
/// concurrently processed pages.
pub struct RefinementEngine {
    service: Arc<dyn CompletionService>,
    extractor: Arc<dyn TextExtractor>,
    sink: Arc<dyn OutputSink>,
    model: ModelSettings,
    feedback_iterations: usize,
    alternate_reading: bool,
    progress: Option<ProgressCallback>,
}

impl RefinementEngine {
    pub fn new(
        service: Arc<dyn CompletionService>,
        extractor: Arc<dyn TextExtractor>,
        sink: Arc<dyn OutputSink>,
        model: ModelSettings,
    ) -> Self {
        Self {
            service,
            extractor,
            sink,
            model,
            feedback_iterations: 1,
            alternate_reading: false,
            progress: None,
        }
    }

    /// Engine with the model, iteration and progress settings of `config`.
    pub fn from_config(
        config: &TranscribeConfig,
        service: Arc<dyn CompletionService>,
        extractor: Arc<dyn TextExtractor>,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        Self::new(service, extractor, sink, config.model_settings())
            .feedback_iterations(config.feedback_iterations)
            .alternate_reading(config.alternate_reading)
            .progress(config.progress_callback.clone())
    }

    pub fn feedback_iterations(mut self, k: usize) -> Self {
        self.feedback_iterations = k;
        self
    }

    pub fn alternate_reading(mut self, enabled: bool) -> Self {
        self.alternate_reading = enabled;
        self
    }

    pub fn progress(mut self, callback: Option<ProgressCallback>) -> Self {
        self.progress = callback;
        self
    }

    /// Refine one page and persist its Markdown under
    /// `ArtifactKey::markdown(document_id, page.index)`.
    ///
    /// On success `page.ocr_text` and `page.markdown` are replaced and the
    /// report ends in `Finalized`. On failure the page's markdown is left as
    /// it was and the report ends in `Failed`.
    pub async fn refine_page(&self, document_id: &str, page: &mut Page) -> PageReport {
        self.refine_page_with_candidates(document_id, page, Vec::new())
            .await
    }

    /// Like [`refine_page`](Self::refine_page), with extra candidate
    /// transcripts to reconcile against the refined one.
    pub async fn refine_page_with_candidates(
        &self,
        document_id: &str,
        page: &mut Page,
        candidates: Vec<String>,
    ) -> PageReport {
        let started = Instant::now();
        let mut report = PageReport::new(page.index);

        match self.run(document_id, page, candidates, &mut report).await {
            Ok(markdown) => {
                report.status = PageStatus::Finalized;
                report.output = Some(markdown.clone());
                page.markdown = Some(markdown);
            }
            Err(err) => {
                warn!("Page {} failed: {}", page.index, err);
                self.enter(&mut report, RefinementState::Failed(err.to_string()));
                report.status = PageStatus::Failed;
                report.error = Some(err);
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        report
    }

    async fn run(
        &self,
        document_id: &str,
        page: &mut Page,
        extra_candidates: Vec<String>,
        report: &mut PageReport,
    ) -> Result<String, PageError> {
        let page_num = page.index;
        let image = page
            .image()
            .map_err(|e| PageError::extraction(page_num, e))?
            .clone();

        let ocr_text = self
            .extractor
            .extract(&image)
            .await
            .map_err(|e| PageError::extraction(page_num, &e))?;
        debug!("Page {}: OCR yielded {} chars", page_num, ocr_text.len());
        page.ocr_text = Some(ocr_text.clone());
        self.enter(report, RefinementState::OcrExtracted);

        let initial = self
            .complete(
                report,
                "initial_conversion",
                build_messages(INITIAL_CONVERSION_PROMPT, &ocr_text, Some(&image)),
            )
            .await?;
        self.enter(report, RefinementState::InitialConverted);

        let refined = self
            .feedback_loop(report, &ocr_text, initial, &image)
            .await?;

        let mut candidates = Vec::with_capacity(extra_candidates.len() + 2);
        candidates.push(refined);
        candidates.extend(extra_candidates.into_iter().filter(|c| !c.trim().is_empty()));
        if self.alternate_reading {
            let alternate = self
                .complete(
                    report,
                    "alternate_reading",
                    build_messages(AI_READ_PROMPT, AI_READ_CONTENT, Some(&image)),
                )
                .await?;
            candidates.push(alternate);
        }

        let optimized = if candidates.len() > 1 {
            let count = candidates.len();
            let merged = self
                .complete(
                    report,
                    "meta_reasoning",
                    build_messages(
                        META_REASONING_PROMPT,
                        &meta_reasoning_content(&ocr_text, &candidates),
                        Some(&image),
                    ),
                )
                .await?;
            self.enter(report, RefinementState::MetaReasoned(count));
            merged
        } else {
            candidates.remove(0)
        };

        let raw_final = self
            .complete(
                report,
                "finalization",
                build_messages(FINAL_VERSION_PROMPT, &optimized, Some(&image)),
            )
            .await?;

        let markdown = format_markdown(&raw_final);
        if markdown.trim().is_empty() {
            return Err(PageError::service(
                page_num,
                "finalization",
                &ServiceError::InvalidResponse("no content left after formatting".into()),
            ));
        }

        self.sink
            .write(&ArtifactKey::markdown(document_id, page_num), &markdown)
            .await
            .map_err(|e| PageError::persistence(page_num, &e))?;
        self.enter(report, RefinementState::Finalized);

        Ok(markdown)
    }

    /// Critique-and-revise `markdown` against `ocr_text`, once per configured
    /// iteration.
    ///
    /// Each round asks for feedback on the draft (text only), then applies it
    /// with the page image. Blank feedback leaves the draft as it is and
    /// skips the apply call. With zero iterations the input is returned as-is
    /// and no request is made.
    pub async fn feedback_loop(
        &self,
        report: &mut PageReport,
        ocr_text: &str,
        markdown: String,
        image: &PageImage,
    ) -> Result<String, PageError> {
        let mut current = markdown;
        for k in 1..=self.feedback_iterations {
            let feedback = request_stage(
                self.service.as_ref(),
                &self.model,
                report,
                "feedback",
                build_messages(FEEDBACK_PROMPT, &feedback_content(ocr_text, &current), None),
            )
            .await?;

            if feedback.trim().is_empty() {
                debug!("Page {}: feedback {} empty, draft kept", report.page_num, k);
            } else {
                debug!(
                    "Page {}: feedback {}: {}",
                    report.page_num,
                    k,
                    truncate_diagnostic(&feedback)
                );
                current = self
                    .complete(
                        report,
                        "apply_feedback",
                        build_messages(&improve_prompt(&feedback), &current, Some(image)),
                    )
                    .await?;
            }
            self.enter(report, RefinementState::FeedbackRefined(k));
        }
        Ok(current)
    }

    async fn complete(
        &self,
        report: &mut PageReport,
        stage: &str,
        messages: Vec<Message>,
    ) -> Result<String, PageError> {
        complete_stage(self.service.as_ref(), &self.model, report, stage, messages).await
    }

    fn enter(&self, report: &mut PageReport, state: RefinementState) {
        debug!("Page {} → {}", report.page_num, state);
        if let Some(cb) = &self.progress {
            cb.on_stage(report.page_num, &state.to_string());
        }
        report.states.push(state);
    }
}

/// One completion call on behalf of `stage` whose text must not be blank.
pub(crate) async fn complete_stage(
    service: &dyn CompletionService,
    model: &ModelSettings,
    report: &mut PageReport,
    stage: &str,
    messages: Vec<Message>,
) -> Result<String, PageError> {
    let text = request_stage(service, model, report, stage, messages).await?;
    if text.trim().is_empty() {
        return Err(PageError::service(
            report.page_num,
            stage,
            &ServiceError::InvalidResponse("empty completion".into()),
        ));
    }
    Ok(text)
}

/// One completion call, with its usage added to `report`. Blank text is
/// returned as is.
async fn request_stage(
    service: &dyn CompletionService,
    model: &ModelSettings,
    report: &mut PageReport,
    stage: &str,
    messages: Vec<Message>,
) -> Result<String, PageError> {
    let request = model.request(messages);
    report.completion_calls += 1;

    let completion = service
        .complete(&request)
        .await
        .map_err(|e| PageError::service(report.page_num, stage, &e))?;

    report.input_tokens += completion.prompt_tokens;
    report.output_tokens += completion.completion_tokens;
    Ok(completion.text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExtractionError;
    use crate::pipeline::llm::{Completion, CompletionRequest};
    use crate::pipeline::ocr::NoopExtractor;
    use crate::sink::MemorySink;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers by stage, recognised from the first line of the instruction.
    /// Stages listed in `blank` get whitespace back.
    #[derive(Default)]
    struct StageEcho {
        requests: Mutex<Vec<CompletionRequest>>,
        blank: Vec<&'static str>,
    }

    impl StageEcho {
        fn blank_for(stages: &[&'static str]) -> Self {
            Self {
                blank: stages.to_vec(),
                ..Self::default()
            }
        }

        fn stages(&self) -> Vec<String> {
            self.requests
                .lock()
                .expect("lock")
                .iter()
                .map(|r| stage_of(r).to_string())
                .collect()
        }
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
        } else {
            "unknown"
        }
    }

    #[async_trait]
    impl CompletionService for StageEcho {
        async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ServiceError> {
            self.requests.lock().expect("lock").push(request.clone());
            let text = match stage_of(request) {
                stage if self.blank.contains(&stage) => " \n".to_string(),
                "feedback" => "add a heading".to_string(),
                "final" => format!("# Final\n\n{}", request.messages[1].text().unwrap_or_default()),
                other => format!("{other} draft"),
            };
            Ok(Completion {
                text,
                prompt_tokens: 10,
                completion_tokens: 5,
            })
        }
    }

    struct BrokenOcr;

    #[async_trait]
    impl TextExtractor for BrokenOcr {
        async fn extract(&self, _image: &PageImage) -> Result<String, ExtractionError> {
            Err(ExtractionError::Failed {
                status: 1,
                stderr: "bad image".into(),
            })
        }
    }

    fn engine(service: Arc<StageEcho>, sink: Arc<MemorySink>) -> RefinementEngine {
        RefinementEngine::new(service, Arc::new(NoopExtractor), sink, ModelSettings::default())
    }

    fn page() -> Page {
        Page::new(1, PageImage::from_png(vec![1u8, 2, 3]))
    }

    #[tokio::test]
    async fn default_run_visits_states_in_order() {
        let service = Arc::new(StageEcho::default());
        let sink = Arc::new(MemorySink::new());
        let mut page = page();

        let report = engine(service.clone(), sink.clone()).refine_page("doc", &mut page).await;

        assert_eq!(
            report.states,
            vec![
                RefinementState::Start,
                RefinementState::OcrExtracted,
                RefinementState::InitialConverted,
                RefinementState::FeedbackRefined(1),
                RefinementState::Finalized,
            ]
        );
        assert_eq!(service.stages(), vec!["initial", "feedback", "apply", "final"]);
        assert_eq!(report.completion_calls, 4);
        assert_eq!(report.input_tokens, 40);
        assert_eq!(page.markdown.as_deref(), Some("# Final\n\napply draft\n"));
        assert_eq!(page.ocr_text.as_deref(), Some(""));
        assert_eq!(
            sink.get(&ArtifactKey::markdown("doc", 1)).as_deref(),
            Some("# Final\n\napply draft\n")
        );
    }

    #[tokio::test]
    async fn feedback_request_has_no_image() {
        let service = Arc::new(StageEcho::default());
        let mut page = page();
        engine(service.clone(), Arc::new(MemorySink::new()))
            .refine_page("doc", &mut page)
            .await;

        let requests = service.requests.lock().expect("lock");
        let feedback = requests
            .iter()
            .find(|r| stage_of(r) == "feedback")
            .expect("feedback request");
        assert_eq!(feedback.messages.len(), 2);
        assert!(requests
            .iter()
            .filter(|r| stage_of(r) != "feedback")
            .all(|r| r.messages.last().is_some_and(Message::is_image)));
    }

    #[tokio::test]
    async fn zero_iterations_is_a_pass_through() {
        let service = Arc::new(StageEcho::default());
        let engine = engine(service.clone(), Arc::new(MemorySink::new())).feedback_iterations(0);
        let mut report = PageReport::new(1);

        let draft_page = page();
        let image = draft_page.image().expect("raster");
        let out = engine
            .feedback_loop(&mut report, "ocr", "# Draft".into(), image)
            .await
            .expect("no calls, no errors");

        assert_eq!(out, "# Draft");
        assert_eq!(report.completion_calls, 0);
        assert!(service.stages().is_empty());
    }

    #[tokio::test]
    async fn iterations_are_configurable() {
        let service = Arc::new(StageEcho::default());
        let mut page = page();
        let report = engine(service.clone(), Arc::new(MemorySink::new()))
            .feedback_iterations(3)
            .refine_page("doc", &mut page)
            .await;

        assert!(report.is_success());
        assert_eq!(report.completion_calls, 2 + 3 * 2);
        assert!(report.states.contains(&RefinementState::FeedbackRefined(3)));
    }

    #[tokio::test]
    async fn alternate_reading_triggers_meta_reasoning() {
        let service = Arc::new(StageEcho::default());
        let mut page = page();
        let report = engine(service.clone(), Arc::new(MemorySink::new()))
            .alternate_reading(true)
            .refine_page("doc", &mut page)
            .await;

        assert_eq!(
            service.stages(),
            vec!["initial", "feedback", "apply", "alternate", "meta", "final"]
        );
        assert!(report.states.contains(&RefinementState::MetaReasoned(2)));
        let requests = service.requests.lock().expect("lock");
        let meta = requests.iter().find(|r| stage_of(r) == "meta").expect("meta");
        let content = meta.messages[1].text().unwrap_or_default();
        assert!(content.contains("Version 1:\napply draft"));
        assert!(content.contains("Version 2:\nalternate draft"));
    }

    #[tokio::test]
    async fn caller_candidates_are_reconciled() {
        let service = Arc::new(StageEcho::default());
        let mut page = page();
        let report = engine(service.clone(), Arc::new(MemorySink::new()))
            .refine_page_with_candidates("doc", &mut page, vec!["# Other".into(), "  ".into()])
            .await;

        assert!(report.states.contains(&RefinementState::MetaReasoned(2)));
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn extraction_failure_fails_the_page() {
        let service = Arc::new(StageEcho::default());
        let sink = Arc::new(MemorySink::new());
        let engine = RefinementEngine::new(
            service.clone(),
            Arc::new(BrokenOcr),
            sink.clone(),
            ModelSettings::default(),
        );
        let mut page = page();
        let report = engine.refine_page("doc", &mut page).await;

        assert_eq!(report.status, PageStatus::Failed);
        assert!(matches!(report.error, Some(PageError::Extraction { page: 1, .. })));
        assert!(matches!(report.final_state(), Some(RefinementState::Failed(_))));
        assert!(service.stages().is_empty());
        assert!(sink.is_empty());
        assert!(page.markdown.is_none());
    }

    #[tokio::test]
    async fn missing_raster_fails_before_ocr() {
        let service = Arc::new(StageEcho::default());
        let sink = Arc::new(MemorySink::new());
        let mut page = Page::from_raster(
            4,
            Err(ExtractionError::InvalidImage("truncated stream".into())),
        );
        let report = engine(service.clone(), sink.clone())
            .refine_page("doc", &mut page)
            .await;

        assert_eq!(report.status, PageStatus::Failed);
        assert!(matches!(report.error, Some(PageError::Extraction { page: 4, .. })));
        assert!(page.ocr_text.is_none());
        assert!(service.stages().is_empty());
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn blank_feedback_keeps_the_draft() {
        let service = Arc::new(StageEcho::blank_for(&["feedback"]));
        let sink = Arc::new(MemorySink::new());
        let mut page = page();
        let report = engine(service.clone(), sink.clone())
            .feedback_iterations(2)
            .refine_page("doc", &mut page)
            .await;

        assert!(report.is_success(), "error: {:?}", report.error);
        assert_eq!(service.stages(), vec!["initial", "feedback", "feedback", "final"]);
        assert!(report.states.contains(&RefinementState::FeedbackRefined(2)));
        assert_eq!(page.markdown.as_deref(), Some("# Final\n\ninitial draft\n"));
    }

    #[tokio::test]
    async fn blank_final_answer_fails_the_page() {
        let service = Arc::new(StageEcho::blank_for(&["final"]));
        let sink = Arc::new(MemorySink::new());
        let mut page = page();
        let report = engine(service, sink.clone()).refine_page("doc", &mut page).await;

        assert_eq!(report.status, PageStatus::Failed);
        assert!(matches!(
            &report.error,
            Some(PageError::Service { stage, kind, .. })
                if stage == "finalization" && kind == "invalid_response"
        ));
        assert!(sink.is_empty());
    }
}
