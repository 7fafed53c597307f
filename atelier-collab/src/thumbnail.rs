//! Derived-asset cache for document thumbnails.
//!
//! Rendering is delegated to a [`ThumbnailRenderer`] and admitted through a
//! [`TokenGate`], so a burst of requests renders one document at a time.
//! Entries are keyed by document and tagged with the version they were
//! rendered from. A failed render only leaves the cache without an entry;
//! the document itself is never touched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use atelier_core::{Document, DocumentKey, ResourceKind};

use crate::gate::TokenGate;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("no thumbnails for {0}")]
    Unsupported(ResourceKind),
    #[error("rendering {key} failed: {reason}")]
    Failed { key: DocumentKey, reason: String },
}

/// Produces the encoded thumbnail image for a document.
pub trait ThumbnailRenderer: Send + Sync {
    fn render<'a>(&'a self, document: &'a Document) -> BoxFuture<'a, Result<Vec<u8>, RenderError>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub key: DocumentKey,
    pub version: u64,
    pub bytes: Arc<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThumbnailStats {
    pub hits: u64,
    pub renders: u64,
    pub failures: u64,
    pub cancelled: u64,
}

pub struct ThumbnailCache<R: ThumbnailRenderer> {
    renderer: R,
    gate: TokenGate,
    entries: Mutex<HashMap<DocumentKey, Thumbnail>>,
    hits: AtomicU64,
    renders: AtomicU64,
    failures: AtomicU64,
    cancelled: AtomicU64,
}

impl<R: ThumbnailRenderer> ThumbnailCache<R> {
    pub fn new(renderer: R) -> Self {
        Self::with_gate(renderer, TokenGate::default())
    }

    pub fn with_gate(renderer: R, gate: TokenGate) -> Self {
        Self {
            renderer,
            gate,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            renders: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }

    /// Cached thumbnail, whatever version it was rendered from.
    pub async fn get(&self, key: DocumentKey) -> Option<Thumbnail> {
        self.entries.lock().await.get(&key).cloned()
    }

    async fn fresh(&self, document: &Document) -> Option<Thumbnail> {
        let entries = self.entries.lock().await;
        entries
            .get(&document.key)
            .filter(|t| t.version >= document.version)
            .cloned()
    }

    /// Thumbnail for the document's current version, rendering it if needed.
    ///
    /// `Ok(None)` means the request was cancelled.
    pub async fn thumbnail(
        &self,
        document: &Document,
        cancel: &CancellationToken,
    ) -> Result<Option<Thumbnail>, RenderError> {
        if let Some(hit) = self.fresh(document).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(hit));
        }

        let outcome = self
            .gate
            .execute_when_token_is_free(cancel, || async {
                // an earlier request in the same burst may have rendered it
                if let Some(hit) = self.fresh(document).await {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(hit);
                }
                self.renders.fetch_add(1, Ordering::Relaxed);
                let bytes = self.renderer.render(document).await?;
                let thumbnail = Thumbnail {
                    key: document.key,
                    version: document.version,
                    bytes: Arc::new(bytes),
                };
                let mut entries = self.entries.lock().await;
                let newer = entries
                    .get(&document.key)
                    .is_some_and(|t| t.version > thumbnail.version);
                if !newer {
                    entries.insert(document.key, thumbnail.clone());
                }
                Ok(thumbnail)
            })
            .await;

        match outcome {
            None => {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
                log::debug!("thumbnail for {} cancelled", document.key);
                Ok(None)
            }
            Some(Ok(thumbnail)) => Ok(Some(thumbnail)),
            Some(Err(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("{e}");
                Err(e)
            }
        }
    }

    pub async fn invalidate(&self, key: DocumentKey) {
        self.entries.lock().await.remove(&key);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub fn stats(&self) -> ThumbnailStats {
        ThumbnailStats {
            hits: self.hits.load(Ordering::Relaxed),
            renders: self.renders.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}
