//! Page sources: a document reference → ordered, 1-indexed page rasters.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and is not safe to drive from async tasks. Rendering runs on the
//! blocking pool so the Tokio workers that carry the model calls never stall.
//!
//! ## Why cap pixels, not DPI?
//!
//! Physical page sizes vary wildly; an A0 poster at 150 DPI is 12 000 px
//! tall. `max_rendered_pixels` caps the longest edge regardless of page size,
//! which keeps memory bounded and lands near the size vision models expect.

use crate::config::PageSelection;
use crate::error::{ExtractionError, TranscribeError};
use crate::pipeline::encode::{encode_page, PageImage};
use async_trait::async_trait;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One rendered page: its 1-based number and its raster, or why there is none.
pub type RenderedPage = (usize, Result<PageImage, ExtractionError>);

/// Yields the pages of one document in physical order.
///
/// A page that cannot be rasterised is still yielded, with an `Err` raster,
/// so it gets its own failed outcome. `Err` from `render` itself means the
/// document could not be opened at all.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// `(page_number, raster)` pairs, 1-indexed and ascending.
    async fn render(&self) -> Result<Vec<RenderedPage>, TranscribeError>;
}

/// Rasterises a PDF file with pdfium.
#[derive(Debug, Clone)]
pub struct PdfPageSource {
    path: PathBuf,
    password: Option<String>,
    max_rendered_pixels: u32,
    pages: PageSelection,
}

impl PdfPageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            password: None,
            max_rendered_pixels: 2000,
            pages: PageSelection::All,
        }
    }

    pub fn password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.max_rendered_pixels = px;
        self
    }

    pub fn pages(mut self, pages: PageSelection) -> Self {
        self.pages = pages;
        self
    }
}

#[async_trait]
impl PageSource for PdfPageSource {
    async fn render(&self) -> Result<Vec<RenderedPage>, TranscribeError> {
        let source = self.clone();
        tokio::task::spawn_blocking(move || source.render_blocking())
            .await
            .map_err(|e| TranscribeError::Internal(format!("Render task panicked: {}", e)))?
    }
}

impl PdfPageSource {
    fn render_blocking(&self) -> Result<Vec<RenderedPage>, TranscribeError> {
        let pdfium = Pdfium::default();
        let document = load_document(&pdfium, &self.path, self.password.as_deref())?;

        let pages = document.pages();
        let total_pages = pages.len() as usize;
        info!("PDF loaded: {} pages", total_pages);

        let indices = self.pages.to_indices(total_pages);
        if indices.is_empty() {
            return Err(TranscribeError::PageOutOfRange {
                page: self.pages.first_requested(),
                total: total_pages,
            });
        }

        let render_config = PdfRenderConfig::new()
            .set_target_width(self.max_rendered_pixels as i32)
            .set_maximum_height(self.max_rendered_pixels as i32);

        let rendered = indices
            .into_iter()
            .map(|idx| {
                let page_num = idx + 1;
                let raster = rasterise(&pages, idx, &render_config);
                if let Err(e) = &raster {
                    warn!("Page {} could not be rasterised: {}", page_num, e);
                }
                (page_num, raster)
            })
            .collect();
        Ok(rendered)
    }
}

fn rasterise(
    pages: &PdfPages<'_>,
    idx: usize,
    render_config: &PdfRenderConfig,
) -> Result<PageImage, ExtractionError> {
    let page = pages
        .get(idx as u16)
        .map_err(|e| ExtractionError::InvalidImage(format!("{:?}", e)))?;
    let bitmap = page
        .render_with_config(render_config)
        .map_err(|e| ExtractionError::InvalidImage(format!("{:?}", e)))?;

    let image = bitmap.as_image();
    debug!(
        "Rendered page {} → {}x{} px",
        idx + 1,
        image.width(),
        image.height()
    );
    encode_page(&image).map_err(|e| ExtractionError::InvalidImage(e.to_string()))
}

fn load_document<'a>(
    pdfium: &'a Pdfium,
    pdf_path: &Path,
    password: Option<&'a str>,
) -> Result<PdfDocument<'a>, TranscribeError> {
    pdfium.load_pdf_from_file(pdf_path, password).map_err(|e| {
        let err_str = format!("{:?}", e);
        if err_str.to_lowercase().contains("password") {
            if password.is_some() {
                TranscribeError::WrongPassword {
                    path: pdf_path.to_path_buf(),
                }
            } else {
                TranscribeError::PasswordRequired {
                    path: pdf_path.to_path_buf(),
                }
            }
        } else {
            TranscribeError::CorruptPdf {
                path: pdf_path.to_path_buf(),
                detail: err_str,
            }
        }
    })
}

/// Serves page images that are already in memory (scans, tests).
#[derive(Debug, Clone, Default)]
pub struct MemoryPageSource {
    images: Vec<PageImage>,
}

impl MemoryPageSource {
    pub fn new(images: Vec<PageImage>) -> Self {
        Self { images }
    }
}

#[async_trait]
impl PageSource for MemoryPageSource {
    async fn render(&self) -> Result<Vec<RenderedPage>, TranscribeError> {
        Ok(self
            .images
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, img)| (i + 1, Ok(img)))
            .collect())
    }
}
