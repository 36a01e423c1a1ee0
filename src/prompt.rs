//! Prompt templates and assembly.
//!
//! A template is a pair of system and user messages containing
//! placeholders:
//!
//! | Placeholder | Replaced with |
//! |-------------|---------------|
//! | `{context}` | Numbered context fragments, or `No context available.` |
//! | `{history}` | Recent conversation turns (empty when there are none) |
//! | `{query}` | The user's question |
//!
//! `{{` and `}}` produce literal braces. Templates are compiled once when
//! the [`PromptAssembler`] is built; an unknown or unterminated
//! placeholder, a stray `}`, or a template missing `{context}` or
//! `{query}` is a [`RagError::TemplateConfiguration`] at that point, never
//! at request time.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

use knowbridge_core::context::{estimate_tokens, ContextFragment};
use knowbridge_core::models::{Message, Role};

use crate::config::{Config, TemplateConfig};
use crate::error::RagError;

pub const NO_CONTEXT: &str = "No context available.";

const KNOWLEDGE_SYSTEM: &str = "You are Knowbridge, an assistant that helps employees find and understand internal knowledge.
Answer from the numbered context below and cite the sources you use as [n].
If the context is empty or does not cover the question, answer from general knowledge and say that no internal source was found.

Context:
{context}";

const KNOWLEDGE_USER: &str = "{history}Question: {query}";

const CODE_SYSTEM: &str = "You are Knowbridge, an assistant for engineers working in internal codebases.
Use the numbered context (code and documentation excerpts) to answer and cite the sources you use as [n].
Put code in fenced blocks with a language tag. Do not invent APIs that are not shown in the context.

Context:
{context}";

const CODE_USER: &str = "{history}{query}";

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Context,
    History,
    Query,
}

#[derive(Debug, Clone)]
struct CompiledTemplate {
    system: Vec<Segment>,
    user: Vec<Segment>,
}

/// System and user messages ready to send to a completion provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormattedPrompt {
    pub template: String,
    pub system: String,
    pub user: String,
}

fn parse(text: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = text.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            '{' if chars.peek().map(|(_, n)| *n) == Some('{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek().map(|(_, n)| *n) == Some('}') => {
                chars.next();
                literal.push('}');
            }
            '}' => return Err(format!("unmatched '}}' at byte {}", pos)),
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for (_, n) in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                if !closed {
                    return Err(format!("unterminated placeholder at byte {}", pos));
                }
                let segment = match name.as_str() {
                    "context" => Segment::Context,
                    "history" => Segment::History,
                    "query" => Segment::Query,
                    other => return Err(format!("unknown placeholder {{{}}}", other)),
                };
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(segment);
            }
            _ => literal.push(c),
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

/// Check a template and compile it. Errors name the template.
fn compile(name: &str, template: &TemplateConfig) -> Result<CompiledTemplate, RagError> {
    let err = |part: &str, msg: String| {
        RagError::TemplateConfiguration(format!("template '{}' {}: {}", name, part, msg))
    };
    let system = parse(&template.system).map_err(|m| err("system message", m))?;
    let user = parse(&template.user).map_err(|m| err("user message", m))?;

    let all: Vec<&Segment> = system.iter().chain(user.iter()).collect();
    for (required, label) in [(Segment::Context, "{context}"), (Segment::Query, "{query}")] {
        if !all.iter().any(|s| **s == required) {
            return Err(RagError::TemplateConfiguration(format!(
                "template '{}' must contain {}",
                name, label
            )));
        }
    }
    Ok(CompiledTemplate { system, user })
}

/// Validate a single template without building an assembler.
pub fn validate(name: &str, template: &TemplateConfig) -> Result<(), RagError> {
    compile(name, template).map(|_| ())
}

fn builtin_templates() -> BTreeMap<String, TemplateConfig> {
    let mut map = BTreeMap::new();
    map.insert(
        "knowledge".to_string(),
        TemplateConfig {
            system: KNOWLEDGE_SYSTEM.to_string(),
            user: KNOWLEDGE_USER.to_string(),
        },
    );
    map.insert(
        "code".to_string(),
        TemplateConfig {
            system: CODE_SYSTEM.to_string(),
            user: CODE_USER.to_string(),
        },
    );
    map
}

/// Number each fragment as a citation: `[n] <source_title>` then its text.
pub fn render_context(fragments: &[ContextFragment]) -> String {
    if fragments.is_empty() {
        return NO_CONTEXT.to_string();
    }
    fragments
        .iter()
        .enumerate()
        .map(|(i, f)| format!("[{}] {}\n{}", i + 1, f.source_title, f.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Assistant => "Assistant",
        Role::System => "System",
    }
}

/// Render the most recent `max_turns` messages (given oldest first) that
/// fit in `token_budget`, oldest first. Empty history renders as "".
pub fn render_history(history: &[Message], max_turns: usize, token_budget: usize) -> String {
    let start = history.len().saturating_sub(max_turns);
    let mut lines: Vec<String> = Vec::new();
    let mut used = 0usize;
    for msg in history[start..].iter().rev() {
        let line = format!("{}: {}", role_label(msg.role), msg.content);
        let cost = estimate_tokens(&line);
        if used + cost > token_budget {
            break;
        }
        used += cost;
        lines.push(line);
    }
    if lines.is_empty() {
        return String::new();
    }
    lines.reverse();
    format!("Conversation so far:\n{}\n\n", lines.join("\n"))
}

fn render(segments: &[Segment], context: &str, history: &str, query: &str) -> String {
    let mut out = String::new();
    for seg in segments {
        match seg {
            Segment::Literal(s) => out.push_str(s),
            Segment::Context => out.push_str(context),
            Segment::History => out.push_str(history),
            Segment::Query => out.push_str(query),
        }
    }
    out
}

pub struct PromptAssembler {
    templates: BTreeMap<String, CompiledTemplate>,
    default_template: String,
    history_turns: usize,
    history_token_budget: usize,
}

impl PromptAssembler {
    /// Build from built-ins plus `custom` (which may override built-ins),
    /// validating every template.
    pub fn new(
        custom: &BTreeMap<String, TemplateConfig>,
        default_template: &str,
        history_turns: usize,
        history_token_budget: usize,
    ) -> Result<Self, RagError> {
        let mut sources = builtin_templates();
        for (name, t) in custom {
            sources.insert(name.clone(), t.clone());
        }

        let mut templates = BTreeMap::new();
        for (name, t) in &sources {
            templates.insert(name.clone(), compile(name, t)?);
        }
        if !templates.contains_key(default_template) {
            return Err(RagError::TemplateConfiguration(format!(
                "default template '{}' is not defined",
                default_template
            )));
        }

        Ok(Self {
            templates,
            default_template: default_template.to_string(),
            history_turns,
            history_token_budget,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, RagError> {
        Self::new(
            &config.prompts.templates,
            &config.prompts.default_template,
            config.conversation.history_turns,
            config.conversation.history_token_budget,
        )
    }

    pub fn template_names(&self) -> Vec<&str> {
        self.templates.keys().map(|k| k.as_str()).collect()
    }

    /// Render the prompt for `query`. `history` is oldest first.
    ///
    /// An unknown or absent `template_type` falls back to the default
    /// template.
    pub fn format_prompt(
        &self,
        template_type: Option<&str>,
        context: &[ContextFragment],
        query: &str,
        history: &[Message],
    ) -> FormattedPrompt {
        let requested = template_type.unwrap_or(&self.default_template);
        let (name, template) = match self.templates.get_key_value(requested) {
            Some((name, t)) => (name.as_str(), t),
            None => {
                warn!(template = requested, fallback = %self.default_template, "unknown prompt template");
                let t = &self.templates[&self.default_template];
                (self.default_template.as_str(), t)
            }
        };

        let context_block = render_context(context);
        let history_block = render_history(history, self.history_turns, self.history_token_budget);
        FormattedPrompt {
            template: name.to_string(),
            system: render(&template.system, &context_block, &history_block, query),
            user: render(&template.user, &context_block, &history_block, query),
        }
    }
}
