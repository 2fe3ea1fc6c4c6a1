//! Image encoding: `DynamicImage` → PNG bytes wrapped in [`PageImage`].
//!
//! Every consumer of a page raster wants PNG: tesseract reads it from stdin,
//! chat-completion APIs take it as a base64 data URL, and providers behind
//! `edgequake-llm` take it as [`edgequake_llm::ImageData`]. Encoding once at
//! render time and sharing the bytes behind an `Arc` keeps the per-stage cost
//! of attaching the image to a request at a pointer copy.
//!
//! PNG is lossless; JPEG artefacts on rendered glyphs hurt both OCR and
//! vision models.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

/// An encoded page raster.
#[derive(Clone, PartialEq, Eq)]
pub struct PageImage {
    bytes: Arc<[u8]>,
    mime_type: &'static str,
}

impl PageImage {
    /// Wrap already-encoded PNG bytes.
    pub fn from_png(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type: "image/png",
        }
    }

    /// Wrap already-encoded JPEG bytes.
    pub fn from_jpeg(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type: "image/jpeg",
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &'static str {
        self.mime_type
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    /// `data:<mime>;base64,<payload>` as accepted by OpenAI-style `image_url` parts.
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.to_base64())
    }

    /// Convert for providers behind `edgequake-llm`.
    ///
    /// `detail: "high"` asks GPT-4-class models for the full tile budget;
    /// fine print and small tables are lost at the low-detail overview.
    pub fn to_image_data(&self) -> ImageData {
        ImageData::new(self.to_base64(), self.mime_type).with_detail("high")
    }
}

impl fmt::Debug for PageImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageImage")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Encode a rasterised page as PNG.
pub fn encode_page(img: &DynamicImage) -> Result<PageImage, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    debug!("Encoded page image → {} bytes PNG", buf.len());
    Ok(PageImage::from_png(buf))
}
