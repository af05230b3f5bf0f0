use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::models::{ChatMessage, ChatRequest, ChatResponse, Quotation, Role, SelectionRequest};
use crate::openrouter::{CompletionClient, CompletionError};
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::selector::QuotationSelector;

pub const MAX_MESSAGE_CHARS: usize = 2_000;
const MAX_EXCLUDE_IDS: usize = 200;
const HISTORY_TURNS: usize = 8;
const FALLBACK_REPLY: &str =
    "I apologize, but I cannot provide a response at this moment. Please try again.";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("too many requests, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: i64 },
    #[error("completion API key not configured")]
    NotConfigured,
    #[error("completion service error: {0}")]
    Upstream(String),
}

impl From<CompletionError> for ChatError {
    fn from(value: CompletionError) -> Self {
        match value {
            CompletionError::NotConfigured => ChatError::NotConfigured,
            other => ChatError::Upstream(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct ChatService {
    selector: QuotationSelector,
    completion: Arc<dyn CompletionClient>,
    limiter: Option<RateLimiter>,
}

impl ChatService {
    pub fn new(
        selector: QuotationSelector,
        completion: Arc<dyn CompletionClient>,
        limiter: Option<RateLimiter>,
    ) -> Self {
        Self {
            selector,
            completion,
            limiter,
        }
    }

    /// Cancelling `cancel` abandons quotation selection; the reply is then
    /// generated without a passage.
    pub async fn answer(
        &self,
        caller: &str,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, ChatError> {
        let started = Instant::now();
        let (selection, history) = validate_request(request)?;

        if let Some(limiter) = &self.limiter {
            if let RateDecision::Limited { retry_after_secs } = limiter.check(caller).await {
                return Err(ChatError::RateLimited { retry_after_secs });
            }
        }

        if !self.completion.is_configured() {
            return Err(ChatError::NotConfigured);
        }

        let quotation = self.selector.select(&selection, cancel).await;
        let messages = build_messages(&selection.message, &history, quotation.as_ref());
        let reply = self.completion.complete(&messages).await?;

        info!(
            quotation = quotation.as_ref().map(|q| q.id.as_str()).unwrap_or("none"),
            excluded = selection.exclude_ids.len(),
            latency_ms = started.elapsed().as_millis() as u64,
            "chat answered"
        );

        Ok(ChatResponse {
            response: if reply.is_empty() {
                FALLBACK_REPLY.to_string()
            } else {
                reply
            },
            hidden_word: quotation,
        })
    }
}

fn validate_request(
    request: ChatRequest,
) -> Result<(SelectionRequest, Vec<ChatMessage>), ChatError> {
    let message = request.message.trim();
    if message.is_empty() {
        return Err(ChatError::InvalidRequest(
            "message must not be empty".to_string(),
        ));
    }
    if message.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ChatError::InvalidRequest(format!(
            "message exceeds {MAX_MESSAGE_CHARS} characters"
        )));
    }

    if request.exclude_ids.len() > MAX_EXCLUDE_IDS {
        return Err(ChatError::InvalidRequest(format!(
            "excludeIds accepts at most {MAX_EXCLUDE_IDS} entries"
        )));
    }
    let mut exclude_ids = HashSet::with_capacity(request.exclude_ids.len());
    for id in request.exclude_ids {
        if Uuid::parse_str(&id).is_err() {
            return Err(ChatError::InvalidRequest(format!(
                "excludeIds contains an invalid id: {id}"
            )));
        }
        exclude_ids.insert(id);
    }

    let selection = SelectionRequest {
        message: message.to_string(),
        exclude_ids,
    };
    Ok((selection, recent_history(request.history)))
}

/// Last few user/assistant turns, each clipped to the message limit.
fn recent_history(history: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let turns: Vec<ChatMessage> = history
        .into_iter()
        .filter(|turn| matches!(turn.role, Role::User | Role::Assistant))
        .filter(|turn| !turn.content.trim().is_empty())
        .map(|turn| ChatMessage {
            role: turn.role,
            content: turn.content.chars().take(MAX_MESSAGE_CHARS).collect(),
        })
        .collect();

    let skip = turns.len().saturating_sub(HISTORY_TURNS);
    turns.into_iter().skip(skip).collect()
}

fn build_system_prompt(quotation: Option<&Quotation>) -> String {
    let mut prompt = String::from(
        "You are a wise spiritual guide offering compassionate guidance and insights \
         based on Bahá'í teachings and the Hidden Words.\n\n",
    );

    if let Some(quotation) = quotation {
        prompt.push_str(&format!(
            "Here is a Hidden Words passage related to the user's question: \"{}\" ({}, {} #{}).\n\n",
            quotation.text,
            quotation.addressee,
            quotation.part.label(),
            quotation.number
        ));
    }

    prompt.push_str(
        "When a passage from the Hidden Words fits the guidance you give, weave it in \
         naturally, for example: \"This reminds me of a beautiful passage from the Hidden \
         Words...\".\n\n\
         Keep your response thoughtful and empathetic, with gentle encouragement. \
         Be concise but meaningful.",
    );
    prompt
}

fn build_messages(
    message: &str,
    history: &[ChatMessage],
    quotation: Option<&Quotation>,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage {
        role: Role::System,
        content: build_system_prompt(quotation),
    });
    messages.extend(history.iter().cloned());
    messages.push(ChatMessage {
        role: Role::User,
        content: message.to_string(),
    });
    messages
}
