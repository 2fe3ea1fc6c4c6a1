//! Output sinks: where finalised page artifacts are written and read back.
//!
//! Artifacts are addressed by [`ArtifactKey`] (document id, page number,
//! kind). Writing the same key twice overwrites. Keys of different pages
//! never collide, so concurrent page tasks can share one sink.
//!
//! [`FsOutputSink`] lays artifacts out on disk:
//!
//! ```text
//! <root>/<document_id>/markdowns/page_<n>.md
//! <root>/<document_id>/translations/<language>/page_<n>.md
//! ```
//!
//! Each file is written to a temp sibling and renamed into place, so a
//! reader never sees a half-written page.

use crate::error::PersistenceError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Which derived text of a page an artifact holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Markdown,
    /// Translation into the named language.
    TranslatedMarkdown(String),
}

/// Address of one persisted artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub document_id: String,
    /// 1-indexed page number.
    pub page: usize,
    pub kind: ArtifactKind,
}

impl ArtifactKey {
    pub fn markdown(document_id: impl Into<String>, page: usize) -> Self {
        Self {
            document_id: document_id.into(),
            page,
            kind: ArtifactKind::Markdown,
        }
    }

    pub fn translation(
        document_id: impl Into<String>,
        page: usize,
        language: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            page,
            kind: ArtifactKind::TranslatedMarkdown(language.into()),
        }
    }
}

/// Persists and retrieves page artifacts.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Write `text` under `key`, replacing any previous value.
    async fn write(&self, key: &ArtifactKey, text: &str) -> Result<(), PersistenceError>;

    /// Read the artifact under `key`; `Ok(None)` when it was never written.
    async fn read(&self, key: &ArtifactKey) -> Result<Option<String>, PersistenceError>;
}

// ── Filesystem ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FsOutputSink {
    root: PathBuf,
}

impl FsOutputSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk location of `key`.
    pub fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        let doc_dir = self.root.join(sanitise_component(&key.document_id));
        let file = format!("page_{}.md", key.page);
        match &key.kind {
            ArtifactKind::Markdown => doc_dir.join("markdowns").join(file),
            ArtifactKind::TranslatedMarkdown(lang) => doc_dir
                .join("translations")
                .join(sanitise_component(lang))
                .join(file),
        }
    }
}

#[async_trait]
impl OutputSink for FsOutputSink {
    async fn write(&self, key: &ArtifactKey, text: &str) -> Result<(), PersistenceError> {
        let path = self.path_for(key);
        let err = |source: io::Error| PersistenceError {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(err)?;
        }

        let tmp_path = path.with_extension("md.tmp");
        tokio::fs::write(&tmp_path, text).await.map_err(err)?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp_path).await {
                warn!("Could not remove {}: {}", tmp_path.display(), cleanup);
            }
            return Err(err(e));
        }

        debug!("Wrote {} ({} bytes)", path.display(), text.len());
        Ok(())
    }

    async fn read(&self, key: &ArtifactKey) -> Result<Option<String>, PersistenceError> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PersistenceError { path, source }),
        }
    }
}

/// Keep a language or document name to a single safe path component.
fn sanitise_component(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

// ── In-memory ────────────────────────────────────────────────────────────

/// Keeps artifacts in a map. Useful for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySink {
    artifacts: Mutex<HashMap<ArtifactKey, String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one artifact.
    pub fn get(&self, key: &ArtifactKey) -> Option<String> {
        self.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ArtifactKey, String>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.artifacts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn write(&self, key: &ArtifactKey, text: &str) -> Result<(), PersistenceError> {
        self.lock().insert(key.clone(), text.to_string());
        Ok(())
    }

    async fn read(&self, key: &ArtifactKey) -> Result<Option<String>, PersistenceError> {
        Ok(self.lock().get(key).cloned())
    }
}
