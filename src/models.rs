use std::collections::HashSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Part {
    Arabic,
    Persian,
}

impl Part {
    pub fn as_str(self) -> &'static str {
        match self {
            Part::Arabic => "arabic",
            Part::Persian => "persian",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Part::Arabic => "Arabic",
            Part::Persian => "Persian",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "persian" => Part::Persian,
            _ => Part::Arabic,
        }
    }

    /// Position in the store's natural order.
    pub fn ordinal(self) -> i64 {
        match self {
            Part::Arabic => 0,
            Part::Persian => 1,
        }
    }
}

/// A Hidden Words passage. Read-only once stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Quotation {
    pub id: String,
    pub text: String,
    pub addressee: String,
    pub part: Part,
    pub number: i64,
    #[serde(default)]
    pub section_title: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SelectionRequest {
    pub message: String,
    pub exclude_ids: HashSet<String>,
}

impl SelectionRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exclude_ids: HashSet::new(),
        }
    }

    pub fn excluding<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_ids.extend(ids.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default)]
    pub exclude_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub response: String,
    pub hidden_word: Option<Quotation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub quotations: i64,
}
