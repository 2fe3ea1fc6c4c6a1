//! Streaming transcription: page reports as each page finishes.
//!
//! Large documents take minutes. [`refine_stream`] renders every selected
//! page up front, then yields one [`PageReport`] per page as its refinement
//! completes, so callers can show partial results while the rest of the
//! document is still being processed. Reports arrive in completion order;
//! sort by `page_num` if order matters.
//!
//! Markdown is persisted to the sink exactly as in [`crate::convert::transcribe`].

use crate::config::TranscribeConfig;
use crate::convert::{
    load_pages, notify_page_done, open_pdf, resolve_extractor, resolve_service, resolve_sink,
};
use crate::document::PageReport;
use crate::error::TranscribeError;
use crate::pipeline::llm::CompletionService;
use crate::pipeline::render::PageSource;
use crate::refine::RefinementEngine;
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tracing::info;

/// A boxed stream of page reports.
pub type PageStream = Pin<Box<dyn Stream<Item = PageReport> + Send>>;

/// Transcribe a PDF file or URL, streaming page reports as they are ready.
///
/// # Returns
/// - `Ok(PageStream)`: one report per selected page
/// - `Err(TranscribeError)`: fatal error (file not found, not a PDF, no backend)
///
/// # Example
/// ```rust,no_run
/// use edgequake_transcribe::{refine_stream, TranscribeConfig};
/// use futures::StreamExt;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = TranscribeConfig::builder().api_key("gsk-...").build()?;
/// let mut pages = refine_stream("scan.pdf", &config).await?;
/// while let Some(report) = pages.next().await {
///     println!("page {}: {:?}", report.page_num, report.status);
/// }
/// # Ok(())
/// # }
/// ```
pub async fn refine_stream(
    input_str: impl AsRef<str>,
    config: &TranscribeConfig,
) -> Result<PageStream, TranscribeError> {
    let input_str = input_str.as_ref();
    info!("Starting streaming transcription: {}", input_str);

    let service = resolve_service(config).await?;
    let (document_id, source) = open_pdf(input_str, config).await?;
    build_stream(source.as_ref(), document_id, service, config).await
}

/// Streaming equivalent of [`crate::convert::transcribe_source`].
pub async fn refine_stream_source(
    source: &dyn PageSource,
    document_id: &str,
    config: &TranscribeConfig,
) -> Result<PageStream, TranscribeError> {
    let service = resolve_service(config).await?;
    build_stream(source, document_id.to_string(), service, config).await
}

async fn build_stream(
    source: &dyn PageSource,
    document_id: String,
    service: Arc<dyn CompletionService>,
    config: &TranscribeConfig,
) -> Result<PageStream, TranscribeError> {
    // Pages are rendered before the stream is returned, so the source (and a
    // downloaded temp file behind it) can be dropped afterwards.
    let document = load_pages(source, &document_id).await?;
    let total_pages = document.pages.len();
    let progress = config.progress_callback.clone();
    if let Some(cb) = &progress {
        cb.on_run_start(total_pages);
    }

    let engine = Arc::new(RefinementEngine::from_config(
        config,
        service,
        resolve_extractor(config),
        resolve_sink(config),
    ));
    let document_id: Arc<str> = Arc::from(document_id);

    let s = stream::iter(document.pages.into_iter().map(move |mut page| {
        let engine = Arc::clone(&engine);
        let document_id = Arc::clone(&document_id);
        let progress = progress.clone();
        async move {
            if let Some(cb) = &progress {
                cb.on_page_start(page.index, total_pages);
            }
            let report = engine.refine_page(&document_id, &mut page).await;
            notify_page_done(progress.as_ref(), &report, total_pages);
            report
        }
    }))
    .buffer_unordered(config.concurrency.max(1));

    Ok(Box::pin(s))
}
