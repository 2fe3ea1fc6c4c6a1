//! Configuration for transcription and translation runs.
//!
//! Every knob lives in [`TranscribeConfig`], built through
//! [`TranscribeConfigBuilder`]. One struct means one place to look when two
//! runs disagree, and it clones cheaply into each page worker.
//!
//! Collaborators can be injected whole (`service`, `extractor`, `sink`); when
//! they are not, the run builds them from the plain fields. Credentials are
//! plain fields too: the library never reads the process environment.

use crate::error::TranscribeError;
use crate::pipeline::llm::{CompletionService, ModelSettings, DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::pipeline::ocr::TextExtractor;
use crate::progress::ProgressCallback;
use crate::sink::OutputSink;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::convert::Infallible;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Configuration for a transcription or translation run.
///
/// # Example
/// ```rust
/// use edgequake_transcribe::TranscribeConfig;
///
/// let config = TranscribeConfig::builder()
///     .api_key("gsk-test")
///     .feedback_iterations(2)
///     .concurrency(2)
///     .build()
///     .unwrap();
/// assert_eq!(config.feedback_iterations, 2);
/// ```
#[derive(Clone)]
pub struct TranscribeConfig {
    /// Longest rendered edge in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// Pages processed at once. Default: 4.
    ///
    /// Each page makes at least three sequential model calls, so four pages
    /// in flight already keep a dozen requests queued at the backend. Lower
    /// it when the backend answers 429; raise it for self-hosted models.
    pub concurrency: usize,

    /// Model identifier sent with every request. Default: [`DEFAULT_MODEL`].
    pub model: Option<String>,

    /// `edgequake-llm` provider name ("openai", "anthropic", "gemini", …).
    /// When set, requests go through that provider instead of the
    /// chat-completions endpoint.
    pub provider_name: Option<String>,

    /// Pre-constructed `edgequake-llm` provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Pre-constructed completion service. Takes precedence over everything
    /// else and is used as-is (no retry wrapper added).
    pub service: Option<Arc<dyn CompletionService>>,

    /// API key for the chat-completions endpoint.
    pub api_key: Option<String>,

    /// Base URL of an OpenAI-compatible API. Default: [`DEFAULT_BASE_URL`].
    pub base_url: String,

    /// Sampling temperature. Default: 0.1.
    ///
    /// Transcription rewards faithfulness over creativity.
    pub temperature: f32,

    /// Maximum generated tokens per call. Default: 8192.
    pub max_tokens: usize,

    /// Retries per call on `RateLimited`/`Timeout`. Default: 3.
    pub max_retries: u32,

    /// First retry delay; doubles each attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Per-call deadline in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Critique-and-revise rounds per page. Default: 1.
    ///
    /// `0` skips the feedback stage entirely: the initial conversion goes
    /// straight to finalisation. Each round costs two model calls.
    pub feedback_iterations: usize,

    /// Also transcribe each page from the image alone and reconcile the two
    /// candidates with a meta-reasoning call. Default: false.
    pub alternate_reading: bool,

    /// Run OCR before the first conversion. Default: true.
    ///
    /// With OCR off, every page is converted from its image alone.
    pub ocr: bool,

    /// Tesseract binary. Default: "tesseract".
    pub ocr_command: String,

    /// Tesseract language(s), e.g. "eng" or "eng+fra". Default: "eng".
    pub ocr_language: String,

    /// Pre-constructed text extractor. Takes precedence over the OCR fields.
    pub extractor: Option<Arc<dyn TextExtractor>>,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Page selection. Default: All pages.
    pub pages: PageSelection,

    /// Separator for combined output. Default: None.
    pub page_separator: PageSeparator,

    /// Root of the on-disk artifact layout. Default: "./data".
    pub output_dir: PathBuf,

    /// Pre-constructed output sink. Takes precedence over `output_dir`.
    pub sink: Option<Arc<dyn OutputSink>>,

    /// Document id used in artifact keys. Default: input file stem.
    pub document_id: Option<String>,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Optional per-page progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for TranscribeConfig {
    fn default() -> Self {
        Self {
            max_rendered_pixels: 2000,
            concurrency: 4,
            model: None,
            provider_name: None,
            provider: None,
            service: None,
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            temperature: 0.1,
            max_tokens: 8192,
            max_retries: 3,
            retry_backoff_ms: 500,
            api_timeout_secs: 120,
            feedback_iterations: 1,
            alternate_reading: false,
            ocr: true,
            ocr_command: "tesseract".to_string(),
            ocr_language: "eng".to_string(),
            extractor: None,
            password: None,
            pages: PageSelection::default(),
            page_separator: PageSeparator::default(),
            output_dir: PathBuf::from("./data"),
            sink: None,
            document_id: None,
            download_timeout_secs: 120,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for TranscribeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranscribeConfig")
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("concurrency", &self.concurrency)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("service", &self.service.as_ref().map(|_| "<dyn CompletionService>"))
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("feedback_iterations", &self.feedback_iterations)
            .field("alternate_reading", &self.alternate_reading)
            .field("ocr", &self.ocr)
            .field("ocr_language", &self.ocr_language)
            .field("pages", &self.pages)
            .field("output_dir", &self.output_dir)
            .field("document_id", &self.document_id)
            .finish()
    }
}

impl TranscribeConfig {
    pub fn builder() -> TranscribeConfigBuilder {
        TranscribeConfigBuilder {
            config: Self::default(),
        }
    }

    /// The model identifier placed in every request.
    pub fn model_id(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    /// Model, token limit and temperature for every request of the run.
    pub fn model_settings(&self) -> ModelSettings {
        ModelSettings {
            model: self.model_id().to_string(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

/// Builder for [`TranscribeConfig`].
#[derive(Debug)]
pub struct TranscribeConfigBuilder {
    config: TranscribeConfig,
}

impl TranscribeConfigBuilder {
    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn service(mut self, service: Arc<dyn CompletionService>) -> Self {
        self.config.service = Some(service);
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs.max(1);
        self
    }

    pub fn feedback_iterations(mut self, k: usize) -> Self {
        self.config.feedback_iterations = k;
        self
    }

    pub fn alternate_reading(mut self, v: bool) -> Self {
        self.config.alternate_reading = v;
        self
    }

    pub fn ocr(mut self, v: bool) -> Self {
        self.config.ocr = v;
        self
    }

    pub fn ocr_command(mut self, cmd: impl Into<String>) -> Self {
        self.config.ocr_command = cmd.into();
        self
    }

    pub fn ocr_language(mut self, lang: impl Into<String>) -> Self {
        self.config.ocr_language = lang.into();
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.config.extractor = Some(extractor);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.config.pages = selection;
        self
    }

    pub fn page_separator(mut self, sep: PageSeparator) -> Self {
        self.config.page_separator = sep;
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.config.sink = Some(sink);
        self
    }

    pub fn document_id(mut self, id: impl Into<String>) -> Self {
        self.config.document_id = Some(id.into());
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<TranscribeConfig, TranscribeError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(TranscribeError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if c.max_tokens == 0 {
            return Err(TranscribeError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        if matches!(c.model.as_deref(), Some(m) if m.trim().is_empty()) {
            return Err(TranscribeError::InvalidConfig("model must not be empty".into()));
        }
        if !c.base_url.starts_with("http://") && !c.base_url.starts_with("https://") {
            return Err(TranscribeError::InvalidConfig(format!(
                "base_url must be an HTTP(S) URL, got '{}'",
                c.base_url
            )));
        }
        if matches!(c.document_id.as_deref(), Some(id) if id.contains(['/', '\\']) || id.trim().is_empty())
        {
            return Err(TranscribeError::InvalidConfig(
                "document_id must be a non-empty name without path separators".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Page selection and separators ────────────────────────────────────────

/// Which pages of the document to process. Page numbers are 1-indexed.
///
/// Parses from `all`, `5`, `3-15` or `1,3,5`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSelection {
    #[default]
    All,
    Single(usize),
    /// Inclusive on both ends.
    Range(usize, usize),
    Set(Vec<usize>),
}

impl PageSelection {
    /// 0-indexed pages of a `total_pages` document, ascending and unique.
    /// Requested pages past the end are dropped.
    pub fn to_indices(&self, total_pages: usize) -> Vec<usize> {
        let exists = |p: &usize| (1..=total_pages).contains(p);
        let wanted: BTreeSet<usize> = match self {
            PageSelection::All => (1..=total_pages).collect(),
            PageSelection::Single(p) => std::iter::once(*p).filter(exists).collect(),
            PageSelection::Range(first, last) => {
                ((*first).max(1)..=(*last).min(total_pages)).collect()
            }
            PageSelection::Set(pages) => pages.iter().copied().filter(exists).collect(),
        };
        wanted.into_iter().map(|p| p - 1).collect()
    }

    /// First page the selection asks for, used in out-of-range errors.
    pub fn first_requested(&self) -> usize {
        match self {
            PageSelection::All => 1,
            PageSelection::Single(p) | PageSelection::Range(p, _) => *p,
            PageSelection::Set(pages) => pages.iter().copied().min().unwrap_or(1),
        }
    }
}

impl FromStr for PageSelection {
    type Err = TranscribeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(PageSelection::All);
        }
        if s.contains(',') {
            return s
                .split(',')
                .map(page_number)
                .collect::<Result<Vec<_>, _>>()
                .map(PageSelection::Set);
        }
        if let Some((first, last)) = s.split_once('-') {
            let (first, last) = (page_number(first)?, page_number(last)?);
            if first > last {
                return Err(TranscribeError::InvalidConfig(format!(
                    "page range {first}-{last} is reversed"
                )));
            }
            return Ok(PageSelection::Range(first, last));
        }
        page_number(s).map(PageSelection::Single)
    }
}

fn page_number(s: &str) -> Result<usize, TranscribeError> {
    match s.trim().parse::<usize>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(TranscribeError::InvalidConfig(format!(
            "'{}' is not a page number (pages start at 1)",
            s.trim()
        ))),
    }
}

/// What goes between pages when they are joined into one file.
///
/// Parses from `none`, `hr` (or `---`), `comment`, or any other text, which
/// becomes a custom separator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSeparator {
    /// A blank line.
    #[default]
    None,
    /// `---`
    HorizontalRule,
    /// `<!-- page N -->` naming the page that follows.
    Comment,
    Custom(String),
}

impl PageSeparator {
    /// Text placed before page `page_num`.
    pub fn render(&self, page_num: usize) -> String {
        let marker = match self {
            PageSeparator::None => return "\n\n".to_string(),
            PageSeparator::HorizontalRule => "---".to_string(),
            PageSeparator::Comment => format!("<!-- page {page_num} -->"),
            PageSeparator::Custom(text) => text.clone(),
        };
        format!("\n\n{marker}\n\n")
    }
}

impl FromStr for PageSeparator {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "none" => PageSeparator::None,
            "hr" | "---" => PageSeparator::HorizontalRule,
            "comment" => PageSeparator::Comment,
            _ => PageSeparator::Custom(s.to_string()),
        })
    }
}
