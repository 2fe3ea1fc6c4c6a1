//! Collaborators of the refinement and translation engines.
//!
//! Each submodule is one boundary the engines depend on. None of them knows
//! about stages, retries across pages, or documents; that lives in
//! [`crate::refine`], [`crate::translate`] and [`crate::convert`].
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ ocr ──▶ messages ──▶ llm ──▶ postprocess
//! (path/URL) (pdfium)   (PNG)   (tesseract) (prompt)  (model)  (cleanup)
//! ```
//!
//! 1. [`input`]: resolve a path or URL to a local PDF
//! 2. [`render`]: rasterise selected pages on the blocking pool
//! 3. [`encode`]: PNG-encode each raster into a shareable [`encode::PageImage`]
//! 4. [`ocr`]: best-effort raw text for each page
//! 5. [`messages`]: assemble instruction / content / image messages
//! 6. [`llm`]: completion backends and retry policy
//! 7. [`postprocess`]: deterministic Markdown normalisation

pub mod encode;
pub mod input;
pub mod llm;
pub mod messages;
pub mod ocr;
pub mod postprocess;
pub mod render;
