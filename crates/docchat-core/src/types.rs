use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DocchatError;

// =============================================================================
// Enums
// =============================================================================

/// Author of a conversation message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Question typed by the user.
    User,
    /// Answer produced by the indexing backend.
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = DocchatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(DocchatError::Validation(format!(
                "Invalid role '{}'. Must be one of: user, assistant",
                other
            ))),
        }
    }
}

// =============================================================================
// Store rows
// =============================================================================

/// A crawled documentation source owned by one user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub user_id: Uuid,
    pub url: String,
    /// Identifier assigned by the indexing backend once a crawl was started.
    pub backend_doc_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// Identifier to send to the indexing backend for this document.
    pub fn chat_doc_id(&self) -> String {
        self.backend_doc_id
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// A chat session scoped to one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// One message in a conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Message fields supplied by a caller before insertion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub role: Role,
    pub content: String,
}

impl NewMessage {
    pub fn user(conversation_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(conversation_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A row inserted into the store, as published on the insert feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum RowInserted {
    Documents(Document),
    Conversations(Conversation),
    ConversationMessages(Message),
}
