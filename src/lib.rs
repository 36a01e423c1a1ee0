//! # Knowbridge
//!
//! An internal knowledge-transfer assistant. Knowbridge indexes
//! organizational documents for hybrid (keyword + vector) retrieval and
//! answers employee questions with a retrieve-augment-generate pipeline
//! that keeps conversational state.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Document  │──▶│   Indexing   │──▶│ SearchBackend │
//! │   Source   │   │ Chunk+Embed  │   │  FTS5 + Vec   │
//! └────────────┘   └──────────────┘   └──────┬───────┘
//!                                            │ hybrid search
//!                  ┌──────────────┐   ┌──────▼───────┐
//!   question ─────▶│ Orchestrator │◀──│  Retriever   │
//!                  │  (a turn)    │   └──────────────┘
//!                  └──┬────────┬──┘
//!           prompt +  │        │ transcript
//!           completion▼        ▼
//!             ┌──────────┐ ┌──────────────┐
//!             │   LLM    │ │ Conversations │
//!             └──────────┘ └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kb init                         # create database
//! kb index --all                  # index [documents].root
//! kb search "vpn setup"
//! kb ask "How do I get VPN access?"
//! kb serve                        # start the REST API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`error`] | Request-level error taxonomy |
//! | [`retry`] | Retry policy with exponential backoff and jitter |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite search backend (FTS5 + vectors) |
//! | [`embedding`] | HTTP embedding providers |
//! | [`completion`] | HTTP chat completion providers |
//! | [`sources`] | Document sources |
//! | [`indexer`] | Indexing pipeline |
//! | [`retriever`] | Query-time context retrieval |
//! | [`prompt`] | Prompt templates and assembly |
//! | [`conversation`] | Two-tier conversation store |
//! | [`orchestrator`] | The question-answering turn |
//! | [`app`] | Component wiring from config |
//! | [`server`] | REST API |

pub mod app;
pub mod completion;
pub mod config;
pub mod conversation;
pub mod db;
pub mod embedding;
pub mod error;
pub mod indexer;
pub mod logging;
pub mod migrate;
pub mod orchestrator;
pub mod prompt;
pub mod retriever;
pub mod retry;
pub mod server;
pub mod sources;
pub mod sqlite_store;
