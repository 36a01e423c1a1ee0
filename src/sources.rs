//! Document sources: where the indexer gets ordered chunks from.
//!
//! Parsing proprietary formats is out of scope; a source hands over plain
//! text already split into [`SourceChunk`]s.
//!
//! | Source | Backing |
//! |--------|---------|
//! | [`FsDocumentSource`] | Files under `[documents].root`, filtered by globs |
//! | [`StaticDocumentSource`] | In-memory map, for tests and embedding in other apps |

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;
use uuid::Uuid;
use walkdir::WalkDir;

use knowbridge_core::chunk::chunk_text;
use knowbridge_core::models::{ChunkMetadata, SourceChunk, KNOWBRIDGE_NAMESPACE};

use crate::config::DocumentsConfig;

/// A document a source can produce chunks for.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRef {
    pub id: String,
    pub title: String,
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Every document currently available, in a stable order.
    async fn list_documents(&self) -> Result<Vec<DocumentRef>>;

    /// Ordered chunks of a document; `None` if the source does not know it.
    async fn get_chunks(&self, document_id: &str) -> Result<Option<Vec<SourceChunk>>>;
}

/// Document id for a file, derived from its path relative to the root.
pub fn document_id_for_path(relative_path: &str) -> String {
    let name = format!("file:{}", relative_path.replace('\\', "/"));
    Uuid::new_v5(&KNOWBRIDGE_NAMESPACE, name.as_bytes()).to_string()
}

fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("md") | Some("markdown") => "text/markdown",
        Some("html") | Some("htm") => "text/html",
        Some("rs") | Some("py") | Some("ts") | Some("js") | Some("go") | Some("java") => {
            "text/x-source"
        }
        _ => "text/plain",
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

#[derive(Debug, Clone)]
struct FsEntry {
    id: String,
    relative: String,
    path: PathBuf,
}

/// Root and filters of a filesystem source; cheap to move onto a blocking thread.
struct Walker {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

impl Walker {
    fn accepts(&self, relative: &str) -> bool {
        !self.exclude.is_match(relative) && self.include.is_match(relative)
    }

    fn scan(&self) -> Result<Vec<FsEntry>> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(self.follow_symlinks) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");
            if !self.accepts(&rel_str) {
                continue;
            }
            entries.push(FsEntry {
                id: document_id_for_path(&rel_str),
                relative: rel_str,
                path: path.to_path_buf(),
            });
        }
        entries.sort_by(|a, b| a.relative.cmp(&b.relative));
        Ok(entries)
    }
}

/// Reads documents from the local filesystem.
///
/// Document ids are resolved through the listing of the last scan. The
/// tree is walked again only when an id is unknown, and every walk runs on
/// the blocking thread pool.
pub struct FsDocumentSource {
    walker: Arc<Walker>,
    known: RwLock<HashMap<String, FsEntry>>,
    scans: AtomicUsize,
    max_tokens: usize,
}

impl FsDocumentSource {
    pub fn new(config: &DocumentsConfig, max_tokens: usize) -> Result<Self> {
        if !config.root.exists() {
            bail!("documents.root does not exist: {}", config.root.display());
        }
        let mut excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        excludes.extend(config.exclude_globs.iter().cloned());

        Ok(Self {
            walker: Arc::new(Walker {
                root: config.root.clone(),
                include: build_globset(&config.include_globs)?,
                exclude: build_globset(&excludes)?,
                follow_symlinks: config.follow_symlinks,
            }),
            known: RwLock::new(HashMap::new()),
            scans: AtomicUsize::new(0),
            max_tokens,
        })
    }

    /// Walk the root and replace the id → path map.
    async fn rescan(&self) -> Result<Vec<FsEntry>> {
        let walker = self.walker.clone();
        let entries = tokio::task::spawn_blocking(move || walker.scan()).await??;
        self.scans.fetch_add(1, Ordering::Relaxed);
        debug!(root = %self.walker.root.display(), files = entries.len(), "scanned documents root");

        let mut known = self
            .known
            .write()
            .map_err(|_| anyhow!("document source lock poisoned"))?;
        *known = entries.iter().map(|e| (e.id.clone(), e.clone())).collect();
        Ok(entries)
    }

    fn lookup(&self, document_id: &str) -> Result<Option<FsEntry>> {
        let known = self
            .known
            .read()
            .map_err(|_| anyhow!("document source lock poisoned"))?;
        Ok(known.get(document_id).cloned())
    }

    async fn resolve(&self, document_id: &str) -> Result<Option<FsEntry>> {
        if let Some(entry) = self.lookup(document_id)? {
            return Ok(Some(entry));
        }
        self.rescan().await?;
        self.lookup(document_id)
    }

    /// Document id for a path on disk, if it lies under the root and
    /// passes the glob filters.
    pub fn document_id_for(&self, path: &Path) -> Result<String> {
        let canonical_root = self.walker.root.canonicalize()?;
        let canonical = path
            .canonicalize()
            .with_context(|| format!("No such file: {}", path.display()))?;
        let relative = canonical.strip_prefix(&canonical_root).map_err(|_| {
            anyhow!(
                "{} is outside documents.root ({})",
                path.display(),
                self.walker.root.display()
            )
        })?;
        let rel_str = relative.to_string_lossy().replace('\\', "/");
        if !self.walker.accepts(&rel_str) {
            bail!("{} is excluded by the configured globs", rel_str);
        }
        Ok(document_id_for_path(&rel_str))
    }
}

#[async_trait]
impl DocumentSource for FsDocumentSource {
    async fn list_documents(&self) -> Result<Vec<DocumentRef>> {
        Ok(self
            .rescan()
            .await?
            .into_iter()
            .map(|e| DocumentRef {
                id: e.id,
                title: e.relative,
            })
            .collect())
    }

    async fn get_chunks(&self, document_id: &str) -> Result<Option<Vec<SourceChunk>>> {
        let entry = match self.resolve(document_id).await? {
            Some(e) => e,
            None => return Ok(None),
        };
        let body = match tokio::fs::read_to_string(&entry.path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Removed since the last scan.
                self.known
                    .write()
                    .map_err(|_| anyhow!("document source lock poisoned"))?
                    .remove(document_id);
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", entry.path.display()))
            }
        };
        let metadata = ChunkMetadata {
            source_title: Some(entry.relative.clone()),
            page: None,
            offset: None,
            mime_type: mime_for(&entry.path).to_string(),
        };
        Ok(Some(chunk_text(&body, self.max_tokens, &metadata)))
    }
}

struct StaticDocument {
    title: String,
    chunks: Vec<SourceChunk>,
}

/// In-memory document source. Documents can be replaced at any time.
pub struct StaticDocumentSource {
    docs: RwLock<BTreeMap<String, StaticDocument>>,
    max_tokens: usize,
}

impl StaticDocumentSource {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            docs: RwLock::new(BTreeMap::new()),
            max_tokens,
        }
    }

    /// Insert or replace a document, chunking `body` with the paragraph chunker.
    pub fn put_text(&self, document_id: &str, title: &str, body: &str) -> Result<()> {
        let metadata = ChunkMetadata {
            source_title: Some(title.to_string()),
            mime_type: "text/plain".to_string(),
            ..Default::default()
        };
        let chunks = chunk_text(body, self.max_tokens, &metadata);
        self.put_chunks(document_id, title, chunks)
    }

    /// Insert or replace a document with pre-split chunks.
    pub fn put_chunks(&self, document_id: &str, title: &str, chunks: Vec<SourceChunk>) -> Result<()> {
        let mut docs = self
            .docs
            .write()
            .map_err(|_| anyhow!("document source lock poisoned"))?;
        docs.insert(
            document_id.to_string(),
            StaticDocument {
                title: title.to_string(),
                chunks,
            },
        );
        Ok(())
    }

    pub fn remove(&self, document_id: &str) -> Result<bool> {
        let mut docs = self
            .docs
            .write()
            .map_err(|_| anyhow!("document source lock poisoned"))?;
        Ok(docs.remove(document_id).is_some())
    }
}

#[async_trait]
impl DocumentSource for StaticDocumentSource {
    async fn list_documents(&self) -> Result<Vec<DocumentRef>> {
        let docs = self
            .docs
            .read()
            .map_err(|_| anyhow!("document source lock poisoned"))?;
        Ok(docs
            .iter()
            .map(|(id, d)| DocumentRef {
                id: id.clone(),
                title: d.title.clone(),
            })
            .collect())
    }

    async fn get_chunks(&self, document_id: &str) -> Result<Option<Vec<SourceChunk>>> {
        let docs = self
            .docs
            .read()
            .map_err(|_| anyhow!("document source lock poisoned"))?;
        Ok(docs.get(document_id).map(|d| d.chunks.clone()))
    }
}
