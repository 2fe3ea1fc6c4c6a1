//! Input resolution: a user-supplied path or URL → local PDF file.
//!
//! pdfium opens files by path, so URL inputs are downloaded into a `TempDir`
//! that lives as long as the [`ResolvedInput`]; dropping it cleans up, even
//! on panic. The `%PDF` magic bytes are checked up front so a mistyped path
//! yields a readable error instead of a pdfium parse failure.

use crate::error::TranscribeError;
use std::io::Read;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// A local PDF, possibly backed by a temp download.
#[derive(Debug)]
pub enum ResolvedInput {
    Local(PathBuf),
    /// The `TempDir` is held only to delay cleanup.
    Downloaded { path: PathBuf, _temp_dir: TempDir },
}

impl ResolvedInput {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }

    /// Stable document id: the file stem (`report.pdf` → `report`).
    pub fn document_id(&self) -> String {
        document_id_for(self.path())
    }
}

pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// File stem used as the document id when none is configured.
pub fn document_id_for(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "document".to_string())
}

/// Resolve `input` (path or HTTP/HTTPS URL) to a readable local PDF.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, TranscribeError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        resolve_local(input)
    }
}

fn resolve_local(path_str: &str) -> Result<ResolvedInput, TranscribeError> {
    let path = PathBuf::from(path_str);
    if !path.exists() {
        return Err(TranscribeError::FileNotFound { path });
    }

    let mut file = match std::fs::File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(TranscribeError::PermissionDenied { path });
        }
        Err(_) => return Err(TranscribeError::FileNotFound { path }),
    };

    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_ok() {
        check_magic(&path, magic)?;
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

fn check_magic(path: &Path, magic: [u8; 4]) -> Result<(), TranscribeError> {
    if &magic == b"%PDF" {
        Ok(())
    } else {
        Err(TranscribeError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        })
    }
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedInput, TranscribeError> {
    info!("Downloading PDF from: {}", url);
    let failed = |reason: String| TranscribeError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            TranscribeError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;

    let temp_dir = TempDir::new().map_err(|e| TranscribeError::Internal(e.to_string()))?;
    let file_path = temp_dir.path().join(filename_from_url(url));
    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| TranscribeError::Internal(format!("Failed to write temp file: {}", e)))?;

    if bytes.len() >= 4 {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[..4]);
        check_magic(&file_path, magic)?;
    }

    info!("Downloaded to: {}", file_path.display());
    Ok(ResolvedInput::Downloaded {
        path: file_path,
        _temp_dir: temp_dir,
    })
}

/// Last path segment of the URL when it looks like a file name.
fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .filter(|last| !last.is_empty() && last.contains('.'))
        .unwrap_or_else(|| "downloaded.pdf".to_string())
}
