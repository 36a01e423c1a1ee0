//! Core data models used throughout Knowbridge.
//!
//! These types represent the chunks that flow through indexing and the
//! conversations and messages that flow through question answering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Namespace for deterministic chunk and document identifiers.
pub const KNOWBRIDGE_NAMESPACE: Uuid = Uuid::from_u128(0x6b6e_6f77_6272_6964_6765_2d6e_7300_0001);

/// Deterministic chunk id for `(document_id, sequence_index)`.
///
/// Re-indexing the same document position always yields the same id, so
/// backend upserts overwrite instead of duplicating.
pub fn chunk_id_for(document_id: &str, sequence_index: i64) -> String {
    let name = format!("{}:{}", document_id, sequence_index);
    Uuid::new_v5(&KNOWBRIDGE_NAMESPACE, name.as_bytes()).to_string()
}

/// SHA-256 hex digest of a chunk's text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Source-level metadata carried by every chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Human-readable title of the originating document.
    pub source_title: Option<String>,
    /// Page number within the source, when the source is paginated.
    pub page: Option<i64>,
    /// Character offset of the chunk within the source body.
    pub offset: Option<i64>,
    /// MIME type of the source document.
    pub mime_type: String,
}

/// A chunk as handed over by a document source, before indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceChunk {
    pub sequence_index: i64,
    pub text: String,
    pub metadata: ChunkMetadata,
}

/// An indexed fragment of a document.
///
/// Immutable once indexed; owned by the search backend and destroyed only
/// when its document is deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub sequence_index: i64,
    pub text: String,
    /// SHA-256 of `text`, used to skip re-embedding unchanged chunks.
    pub hash: String,
    pub metadata: ChunkMetadata,
    /// Unix timestamp (milliseconds) of the last upsert.
    pub indexed_at: i64,
}

impl Chunk {
    /// Build a chunk from a document source entry.
    pub fn from_source(document_id: &str, source: &SourceChunk) -> Self {
        Self {
            id: chunk_id_for(document_id, source.sequence_index),
            document_id: document_id.to_string(),
            sequence_index: source.sequence_index,
            text: source.text.clone(),
            hash: content_hash(&source.text),
            metadata: source.metadata.clone(),
            indexed_at: Utc::now().timestamp_millis(),
        }
    }

    /// Title used in citations: the source title, or the document id.
    pub fn citation_source(&self) -> String {
        self.metadata
            .source_title
            .clone()
            .unwrap_or_else(|| self.document_id.clone())
    }
}

/// A chunk paired with its embedding vector, the unit of a backend upsert.
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => anyhow::bail!("Unknown message role: {}", other),
        }
    }
}

/// A conversation between one user and the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A retrieved source cited by an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextUsed {
    pub source: String,
    pub snippet: String,
    pub score: f64,
}

/// A single turn in a conversation transcript. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub context_used: Vec<ContextUsed>,
}
