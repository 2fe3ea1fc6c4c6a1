//! Pages, documents, refinement states and run reports.
//!
//! A [`Document`] is an ordered list of [`Page`]s. Page identity is the typed
//! `index` field assigned by the page source; nothing here ever parses a page
//! number back out of a file name.
//!
//! [`PageReport`] and [`DocumentReport`] are what a run hands back: one
//! outcome per page plus aggregate counts, serialisable for `--json` output.

use crate::config::PageSeparator;
use crate::error::{ExtractionError, PageError, TranscribeError};
use crate::pipeline::encode::PageImage;
use crate::pipeline::render::PageSource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One page of a document and everything derived from it.
#[derive(Debug, Clone)]
pub struct Page {
    /// 1-based position in the physical document.
    pub index: usize,
    /// The rendered page, or why it could not be rendered.
    raster: Result<PageImage, ExtractionError>,
    /// Raw OCR output, set once per refinement run.
    pub ocr_text: Option<String>,
    /// Finalised transcript. Replaced wholesale, never edited in place.
    pub markdown: Option<String>,
    /// Translated transcripts keyed by target language.
    translations: BTreeMap<String, String>,
}

impl Page {
    pub fn new(index: usize, image: PageImage) -> Self {
        Self::from_raster(index, Ok(image))
    }

    pub fn from_raster(index: usize, raster: Result<PageImage, ExtractionError>) -> Self {
        Self {
            index,
            raster,
            ocr_text: None,
            markdown: None,
            translations: BTreeMap::new(),
        }
    }

    pub fn image(&self) -> Result<&PageImage, &ExtractionError> {
        self.raster.as_ref()
    }

    pub fn with_markdown(mut self, markdown: impl Into<String>) -> Self {
        self.markdown = Some(markdown.into());
        self
    }

    /// Record a translation. Rejected while the page has no markdown.
    pub fn set_translation(
        &mut self,
        language: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<(), PageError> {
        if self.markdown.is_none() {
            return Err(PageError::MissingMarkdown { page: self.index });
        }
        self.translations.insert(language.into(), text.into());
        Ok(())
    }

    pub fn translation(&self, language: &str) -> Option<&str> {
        self.translations.get(language).map(String::as_str)
    }

    pub fn translations(&self) -> &BTreeMap<String, String> {
        &self.translations
    }
}

/// An identified, ordered collection of pages.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub pages: Vec<Page>,
}

impl Document {
    pub fn new(id: impl Into<String>, pages: Vec<Page>) -> Self {
        let mut pages = pages;
        pages.sort_by_key(|p| p.index);
        Self {
            id: id.into(),
            pages,
        }
    }

    /// Render every page of `source` into a fresh document.
    pub async fn from_source(
        id: impl Into<String>,
        source: &dyn PageSource,
    ) -> Result<Self, TranscribeError> {
        let pages = source
            .render()
            .await?
            .into_iter()
            .map(|(index, raster)| Page::from_raster(index, raster))
            .collect();
        Ok(Self::new(id, pages))
    }

    pub fn page(&self, index: usize) -> Option<&Page> {
        self.pages.iter().find(|p| p.index == index)
    }

    pub fn page_mut(&mut self, index: usize) -> Option<&mut Page> {
        self.pages.iter_mut().find(|p| p.index == index)
    }

    /// Join the markdown of every page in index order.
    ///
    /// Pages without markdown are left out.
    pub fn assemble(&self, separator: &PageSeparator) -> String {
        join_pages(
            self.pages
                .iter()
                .filter_map(|p| p.markdown.as_deref().map(|md| (p.index, md))),
            separator,
        )
    }

    /// Join the `language` translation of every page in index order.
    pub fn assemble_translation(&self, language: &str, separator: &PageSeparator) -> String {
        join_pages(
            self.pages
                .iter()
                .filter_map(|p| p.translation(language).map(|t| (p.index, t))),
            separator,
        )
    }
}

fn join_pages<'a>(
    pages: impl Iterator<Item = (usize, &'a str)>,
    separator: &PageSeparator,
) -> String {
    let mut out = String::new();
    for (i, (index, text)) in pages.enumerate() {
        if i > 0 {
            out.push_str(&separator.render(index));
        }
        out.push_str(text.trim());
    }
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

// ── Refinement state ─────────────────────────────────────────────────────

/// Where a page is in the refinement sequence.
///
/// ```text
/// Start → OcrExtracted → InitialConverted → FeedbackRefined(1..=K)
///       → [MetaReasoned(n)] → Finalized
/// ```
///
/// Any state may move to `Failed`, which is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementState {
    Start,
    OcrExtracted,
    InitialConverted,
    /// The `k`-th feedback round has been applied.
    FeedbackRefined(usize),
    /// `n` candidates were reconciled.
    MetaReasoned(usize),
    Finalized,
    Failed(String),
}

impl RefinementState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Failed(_))
    }
}

impl fmt::Display for RefinementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::OcrExtracted => write!(f, "ocr_extracted"),
            Self::InitialConverted => write!(f, "initial_converted"),
            Self::FeedbackRefined(k) => write!(f, "feedback_refined({k})"),
            Self::MetaReasoned(n) => write!(f, "meta_reasoned({n})"),
            Self::Finalized => write!(f, "finalized"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

// ── Reports ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    /// Artifact persisted.
    Finalized,
    Failed,
    /// Not attempted (translation of a page with no markdown).
    Skipped,
}

/// Outcome of one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageReport {
    /// 1-indexed page number.
    pub page_num: usize,
    pub status: PageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PageError>,
    /// The persisted text (markdown or translation).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub completion_calls: usize,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub duration_ms: u64,
    /// Every state the page visited, in order.
    pub states: Vec<RefinementState>,
}

impl PageReport {
    pub fn new(page_num: usize) -> Self {
        Self {
            page_num,
            status: PageStatus::Failed,
            error: None,
            output: None,
            completion_calls: 0,
            input_tokens: 0,
            output_tokens: 0,
            duration_ms: 0,
            states: vec![RefinementState::Start],
        }
    }

    pub fn skipped(page_num: usize, error: PageError) -> Self {
        Self {
            status: PageStatus::Skipped,
            error: Some(error),
            ..Self::new(page_num)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == PageStatus::Finalized
    }

    pub fn final_state(&self) -> Option<&RefinementState> {
        self.states.last()
    }
}

/// Aggregate counts over a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub total_pages: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub completion_calls: usize,
    pub total_input_tokens: usize,
    pub total_output_tokens: usize,
    pub duration_ms: u64,
}

/// Per-page outcomes of one run over a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentReport {
    pub document_id: String,
    /// Target language for translation runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Sorted by page number.
    pub pages: Vec<PageReport>,
    pub stats: RunStats,
}

impl DocumentReport {
    pub fn new(
        document_id: impl Into<String>,
        language: Option<String>,
        mut pages: Vec<PageReport>,
        duration_ms: u64,
    ) -> Self {
        pages.sort_by_key(|p| p.page_num);
        let count = |s: PageStatus| pages.iter().filter(|p| p.status == s).count();
        let stats = RunStats {
            total_pages: pages.len(),
            succeeded: count(PageStatus::Finalized),
            failed: count(PageStatus::Failed),
            skipped: count(PageStatus::Skipped),
            completion_calls: pages.iter().map(|p| p.completion_calls).sum(),
            total_input_tokens: pages.iter().map(|p| p.input_tokens).sum(),
            total_output_tokens: pages.iter().map(|p| p.output_tokens).sum(),
            duration_ms,
        };
        Self {
            document_id: document_id.into(),
            language,
            pages,
            stats,
        }
    }

    pub fn page(&self, page_num: usize) -> Option<&PageReport> {
        self.pages.iter().find(|p| p.page_num == page_num)
    }

    pub fn errors(&self) -> impl Iterator<Item = &PageError> {
        self.pages.iter().filter_map(|p| p.error.as_ref())
    }
}
