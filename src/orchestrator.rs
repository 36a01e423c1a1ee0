//! The question-answering turn.
//!
//! [`RagOrchestrator::ask`] drives one turn through these states:
//!
//! ```text
//! Idle → HistoryLoaded → ContextRetrieved → PromptAssembled → Completing → Persisted → Done
//!   └──────────────┴───────────────┴──────────────┴──────────────┴──────────▶ Failed
//! ```
//!
//! Empty context is a normal transition. When a turn fails after the
//! conversation is known, the user message is still persisted (best effort)
//! so the transcript records what was asked.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use knowbridge_core::context::ContextFragment;
use knowbridge_core::models::{ContextUsed, Message, Role};
use knowbridge_core::store::make_snippet;

use crate::completion::{ChatMessage, CompletionProvider};
use crate::config::Config;
use crate::conversation::ConversationStore;
use crate::error::RagError;
use crate::prompt::PromptAssembler;
use crate::retriever::ContextRetriever;
use crate::retry::RetryPolicy;

/// Answer given without calling the model when nothing relevant was found
/// and `on_empty_context = "decline"`.
pub const DECLINE_MESSAGE: &str =
    "I couldn't find anything in the knowledge base about that. Try rephrasing, or ask a colleague who owns this area.";

/// Appended to answers built from degraded retrieval.
pub const DEGRADED_CAVEAT: &str =
    "Note: part of the search index was unavailable, so this answer may be incomplete.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyContextPolicy {
    /// Answer from the model's general knowledge.
    General,
    Decline,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub temperature: f32,
    pub completion_timeout: Duration,
    pub completion_retry: RetryPolicy,
    pub history_turns: usize,
    pub on_empty_context: EmptyContextPolicy,
    pub serialize_turns: bool,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            temperature: config.completion.temperature,
            completion_timeout: Duration::from_secs(config.completion.timeout_secs),
            completion_retry: config.completion.retry.policy(),
            history_turns: config.conversation.history_turns,
            on_empty_context: if config.conversation.on_empty_context == "decline" {
                EmptyContextPolicy::Decline
            } else {
                EmptyContextPolicy::General
            },
            serialize_turns: config.conversation.serialize_turns,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AskResponse {
    pub answer: String,
    pub citations: Vec<ContextUsed>,
    pub conversation_id: String,
    /// Retrieval ran on a single channel.
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    HistoryLoaded,
    ContextRetrieved,
    PromptAssembled,
    Completing,
    Persisted,
    Done,
    Failed,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnState::Idle => "idle",
            TurnState::HistoryLoaded => "history_loaded",
            TurnState::ContextRetrieved => "context_retrieved",
            TurnState::PromptAssembled => "prompt_assembled",
            TurnState::Completing => "completing",
            TurnState::Persisted => "persisted",
            TurnState::Done => "done",
            TurnState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Tracks and logs the state of one turn.
struct Turn<'a> {
    conversation_id: &'a str,
    state: TurnState,
    user_persisted: bool,
}

impl<'a> Turn<'a> {
    fn new(conversation_id: &'a str) -> Self {
        Self {
            conversation_id,
            state: TurnState::Idle,
            user_persisted: false,
        }
    }

    fn advance(&mut self, next: TurnState) {
        debug!(
            conversation_id = self.conversation_id,
            from = %self.state,
            to = %next,
            "turn transition"
        );
        self.state = next;
    }
}

pub struct RagOrchestrator {
    retriever: Arc<ContextRetriever>,
    prompts: Arc<PromptAssembler>,
    completer: Arc<dyn CompletionProvider>,
    conversations: Arc<ConversationStore>,
    settings: OrchestratorSettings,
    turn_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RagOrchestrator {
    pub fn new(
        retriever: Arc<ContextRetriever>,
        prompts: Arc<PromptAssembler>,
        completer: Arc<dyn CompletionProvider>,
        conversations: Arc<ConversationStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            retriever,
            prompts,
            completer,
            conversations,
            settings,
            turn_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    /// Answer `query` within a conversation, creating one when
    /// `conversation_id` is `None`.
    pub async fn ask(
        &self,
        query: &str,
        conversation_id: Option<&str>,
        user_id: Option<&str>,
        template: Option<&str>,
    ) -> Result<AskResponse, RagError> {
        let conversation = match conversation_id {
            Some(id) => self.conversations.get_conversation(id).await?,
            None => {
                self.conversations
                    .create_conversation(user_id, BTreeMap::new())
                    .await?
            }
        };
        let conversation_id = conversation.id.as_str();

        let lock = self.turn_lock(conversation_id);
        let guard = match &lock {
            Some(l) => Some(l.lock().await),
            None => None,
        };

        let mut turn = Turn::new(conversation_id);
        let result = self.run_turn(&mut turn, query, template).await;

        let outcome = match result {
            Ok(response) => Ok(response),
            Err(e) => {
                turn.advance(TurnState::Failed);
                warn!(conversation_id, code = e.code(), error = %e, "turn failed");
                if !turn.user_persisted {
                    if let Err(persist_err) = self
                        .conversations
                        .add_message(conversation_id, Role::User, query, Vec::new())
                        .await
                    {
                        warn!(conversation_id, error = %persist_err, "failed to persist user message");
                    }
                }
                Err(e)
            }
        };

        drop(guard);
        if let Some(l) = lock {
            self.release_turn_lock(conversation_id, l);
        }
        outcome
    }

    async fn run_turn(
        &self,
        turn: &mut Turn<'_>,
        query: &str,
        template: Option<&str>,
    ) -> Result<AskResponse, RagError> {
        let conversation_id = turn.conversation_id;

        let mut history = self
            .conversations
            .get_messages(conversation_id, self.settings.history_turns)
            .await?;
        history.reverse();
        turn.advance(TurnState::HistoryLoaded);

        let retrieved = self.retriever.retrieve(query).await?;
        turn.advance(TurnState::ContextRetrieved);
        let citations = citations_for(&retrieved.fragments);

        let mut answer = if retrieved.fragments.is_empty()
            && self.settings.on_empty_context == EmptyContextPolicy::Decline
        {
            info!(conversation_id, "no relevant context, declining");
            DECLINE_MESSAGE.to_string()
        } else {
            let prompt = self
                .prompts
                .format_prompt(template, &retrieved.fragments, query, &history);
            turn.advance(TurnState::PromptAssembled);

            let messages = [
                ChatMessage::new(Role::System, prompt.system),
                ChatMessage::new(Role::User, prompt.user),
            ];
            turn.advance(TurnState::Completing);
            self.settings
                .completion_retry
                .run("completion", self.settings.completion_timeout, || {
                    self.completer
                        .complete(&messages, self.settings.temperature)
                })
                .await?
        };

        if retrieved.degraded {
            answer.push_str("\n\n");
            answer.push_str(DEGRADED_CAVEAT);
        }

        self.conversations
            .add_message(conversation_id, Role::User, query, Vec::new())
            .await?;
        turn.user_persisted = true;
        self.conversations
            .add_message(conversation_id, Role::Assistant, &answer, citations.clone())
            .await?;
        turn.advance(TurnState::Persisted);

        info!(
            conversation_id,
            fragments = retrieved.fragments.len(),
            degraded = retrieved.degraded,
            "answered"
        );
        turn.advance(TurnState::Done);

        Ok(AskResponse {
            answer,
            citations,
            conversation_id: conversation_id.to_string(),
            degraded: retrieved.degraded,
        })
    }

    /// Up to `limit` most recent messages of a conversation, oldest first.
    pub async fn get_history(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, RagError> {
        let mut messages = self.conversations.get_messages(conversation_id, limit).await?;
        messages.reverse();
        Ok(messages)
    }

    fn turn_lock(&self, conversation_id: &str) -> Option<Arc<tokio::sync::Mutex<()>>> {
        if !self.settings.serialize_turns {
            return None;
        }
        let mut locks = match self.turn_locks.lock() {
            Ok(l) => l,
            Err(poisoned) => poisoned.into_inner(),
        };
        Some(
            locks
                .entry(conversation_id.to_string())
                .or_default()
                .clone(),
        )
    }

    fn release_turn_lock(&self, conversation_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = match self.turn_locks.lock() {
            Ok(l) => l,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Only the map and this turn hold it: nobody is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(conversation_id);
        }
    }
}

fn citations_for(fragments: &[ContextFragment]) -> Vec<ContextUsed> {
    fragments
        .iter()
        .map(|f| ContextUsed {
            source: f.source_title.clone(),
            snippet: make_snippet(&f.text),
            score: f.score,
        })
        .collect()
}
