//! Component wiring.
//!
//! [`App::build`] selects every backend and provider from [`Config`] and
//! assembles the indexing pipeline, retriever, and orchestrator. The CLI,
//! the HTTP server, and embedders of this crate all start here.
//!
//! `retrieval.backend = "sqlite"` keeps chunks and conversations in the
//! configured database; `"memory"` keeps both in process (nothing
//! survives a restart).

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use knowbridge_core::embedding::EmbeddingProvider;
use knowbridge_core::store::memory::InMemoryBackend;
use knowbridge_core::store::SearchBackend;

use crate::completion::{create_completer, CompletionProvider};
use crate::config::Config;
use crate::conversation::{
    ConversationBackend, ConversationCache, ConversationStore, InMemoryConversations, MemoryCache,
    SqliteConversations,
};
use crate::embedding::create_provider;
use crate::indexer::{IndexSettings, IndexingPipeline};
use crate::orchestrator::{OrchestratorSettings, RagOrchestrator};
use crate::prompt::PromptAssembler;
use crate::retriever::{ContextRetriever, RetrievalSettings};
use crate::sources::{DocumentSource, FsDocumentSource, StaticDocumentSource};
use crate::sqlite_store::SqliteBackend;
use crate::{db, migrate};

/// Providers and backends that can be swapped before assembly.
pub struct Components {
    pub search: Arc<dyn SearchBackend>,
    pub conversations: Arc<dyn ConversationBackend>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub completer: Arc<dyn CompletionProvider>,
    pub source: Arc<dyn DocumentSource>,
}

impl Components {
    /// Build every component from config, running migrations for SQLite.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let (search, conversations): (Arc<dyn SearchBackend>, Arc<dyn ConversationBackend>) =
            match config.retrieval.backend.as_str() {
                "memory" => {
                    let mut backend = InMemoryBackend::new();
                    if config.indexing.backend_batch_limit > 0 {
                        backend = backend.with_max_batch(config.indexing.backend_batch_limit);
                    }
                    (
                        Arc::new(backend),
                        Arc::new(InMemoryConversations::new()),
                    )
                }
                _ => {
                    let pool = db::connect(config).await?;
                    migrate::run_migrations(&pool).await?;
                    (
                        Arc::new(
                            SqliteBackend::new(pool.clone())
                                .with_batch_limit(config.indexing.backend_batch_limit),
                        ),
                        Arc::new(SqliteConversations::new(pool)),
                    )
                }
            };

        let source: Arc<dyn DocumentSource> = match &config.documents {
            Some(docs) => Arc::new(
                FsDocumentSource::new(docs, config.chunking.max_tokens)
                    .context("Failed to open document source")?,
            ),
            None => Arc::new(StaticDocumentSource::new(config.chunking.max_tokens)),
        };

        Ok(Self {
            search,
            conversations,
            embedder: create_provider(&config.embedding)?,
            completer: create_completer(&config.completion)?,
            source,
        })
    }
}

/// A fully assembled Knowbridge instance.
pub struct App {
    pub config: Config,
    pub search: Arc<dyn SearchBackend>,
    pub indexer: Arc<IndexingPipeline>,
    pub retriever: Arc<ContextRetriever>,
    pub orchestrator: Arc<RagOrchestrator>,
}

impl App {
    pub async fn build(config: Config) -> Result<Self> {
        let components = Components::from_config(&config).await?;
        Self::assemble(config, components)
    }

    /// Assemble from explicit components. Fails on invalid prompt templates.
    pub fn assemble(config: Config, components: Components) -> Result<Self> {
        let prompts = PromptAssembler::from_config(&config)?;

        let cache: Option<Arc<dyn ConversationCache>> = if config.conversation.cache_enabled {
            Some(Arc::new(MemoryCache::new(
                Duration::from_secs(config.conversation.cache_ttl_secs),
                config.conversation.cache_window,
            )))
        } else {
            None
        };
        let store = ConversationStore::new(
            components.conversations,
            cache,
            config.conversation.default_user_id.clone(),
        );

        let indexer = IndexingPipeline::new(
            components.source,
            components.search.clone(),
            components.embedder.clone(),
            IndexSettings::from_config(&config),
        );
        let retriever = Arc::new(ContextRetriever::new(
            components.search.clone(),
            components.embedder.clone(),
            RetrievalSettings::from_config(&config),
        ));
        let orchestrator = RagOrchestrator::new(
            retriever.clone(),
            Arc::new(prompts),
            components.completer.clone(),
            Arc::new(store),
            OrchestratorSettings::from_config(&config),
        );

        info!(
            backend = %config.retrieval.backend,
            embedding = components.embedder.model_name(),
            completion = components.completer.model_name(),
            "knowbridge assembled"
        );

        Ok(Self {
            config,
            search: components.search,
            indexer: Arc::new(indexer),
            retriever,
            orchestrator: Arc::new(orchestrator),
        })
    }
}
