//! The translation engine: a finalised page transcript into a target
//! language, with its structure intact.
//!
//! Each page is one request: the fixed translator rules as a system message,
//! the page Markdown, then the page image for context. The result is
//! formatted and persisted as `TranslatedMarkdown(language)`. The source
//! Markdown and its artifact are never modified.

use crate::config::TranscribeConfig;
use crate::document::{Page, PageReport, PageStatus, RefinementState};
use crate::error::{PageError, ServiceError};
use crate::pipeline::llm::{CompletionService, ModelSettings};
use crate::pipeline::messages::{build_messages_with_role, Role};
use crate::pipeline::postprocess::format_markdown;
use crate::progress::ProgressCallback;
use crate::prompts::translator_instruction;
use crate::refine::complete_stage;
use crate::sink::{ArtifactKey, OutputSink};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

pub struct TranslationEngine {
    service: Arc<dyn CompletionService>,
    sink: Arc<dyn OutputSink>,
    model: ModelSettings,
    progress: Option<ProgressCallback>,
}

impl TranslationEngine {
    pub fn new(
        service: Arc<dyn CompletionService>,
        sink: Arc<dyn OutputSink>,
        model: ModelSettings,
    ) -> Self {
        Self {
            service,
            sink,
            model,
            progress: None,
        }
    }

    pub fn from_config(
        config: &TranscribeConfig,
        service: Arc<dyn CompletionService>,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        Self::new(service, sink, config.model_settings()).progress(config.progress_callback.clone())
    }

    pub fn progress(mut self, callback: Option<ProgressCallback>) -> Self {
        self.progress = callback;
        self
    }

    /// Translate `page.markdown` into `language`.
    ///
    /// A page without markdown is reported as `Skipped` with
    /// [`PageError::MissingMarkdown`]; no request is made. The translated text
    /// is returned in the report's `output`; recording it on the page is the
    /// caller's job.
    pub async fn translate_page(&self, document_id: &str, page: &Page, language: &str) -> PageReport {
        let started = Instant::now();
        let page_num = page.index;

        let Some(markdown) = page.markdown.as_deref() else {
            debug!("Page {}: no markdown, skipping translation", page_num);
            return PageReport::skipped(page_num, PageError::MissingMarkdown { page: page_num });
        };

        let mut report = PageReport::new(page_num);
        let stage = format!("translation({language})");
        match self.run(document_id, page, markdown, language, &stage, &mut report).await {
            Ok(translated) => {
                report.status = PageStatus::Finalized;
                report.output = Some(translated);
                self.enter(&mut report, RefinementState::Finalized);
            }
            Err(err) => {
                warn!("Page {} translation to {} failed: {}", page_num, language, err);
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
        page: &Page,
        markdown: &str,
        language: &str,
        stage: &str,
        report: &mut PageReport,
    ) -> Result<String, PageError> {
        let image = page
            .image()
            .map_err(|e| PageError::extraction(page.index, e))?;
        let messages = build_messages_with_role(
            Role::System,
            &translator_instruction(language),
            markdown,
            Some(image),
        );
        let raw = complete_stage(self.service.as_ref(), &self.model, report, stage, messages).await?;

        let translated = format_markdown(&raw);
        if translated.trim().is_empty() {
            return Err(PageError::service(
                page.index,
                stage,
                &ServiceError::InvalidResponse("no content left after formatting".into()),
            ));
        }

        self.sink
            .write(&ArtifactKey::translation(document_id, page.index, language), &translated)
            .await
            .map_err(|e| PageError::persistence(page.index, &e))?;
        Ok(translated)
    }

    fn enter(&self, report: &mut PageReport, state: RefinementState) {
        if let Some(cb) = &self.progress {
            cb.on_stage(report.page_num, &state.to_string());
        }
        report.states.push(state);
    }
}
