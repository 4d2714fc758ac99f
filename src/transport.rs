//! Outbound side of the messaging platform
//!
//! The engine never talks to the platform directly; it is handed a
//! [`Transport`] and only uses the two primitives below.

use crate::update::{ChatId, MessageId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Transport failure with a retry classification
#[derive(Debug, Error, Clone)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub retryable: bool,
}

impl TransportError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

/// An inline button carrying callback data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineButton {
    pub text: String,
    pub data: String,
}

impl InlineButton {
    #[must_use]
    pub fn new(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            data: data.into(),
        }
    }
}

/// Keyboard attached to an outbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyMarkup {
    /// Buttons attached to the message itself
    Inline { rows: Vec<Vec<InlineButton>> },
    /// Persistent keyboard replacing the user's input keyboard
    Keyboard { rows: Vec<Vec<String>>, resize: bool },
    /// Remove a persistent keyboard
    RemoveKeyboard,
}

impl ReplyMarkup {
    /// An inline keyboard with no buttons (clears existing buttons on edit)
    #[must_use]
    pub fn empty_inline() -> Self {
        Self::Inline { rows: Vec::new() }
    }

    #[must_use]
    pub fn single_row_keyboard(resize: bool, labels: &[&str]) -> Self {
        Self::Keyboard {
            rows: vec![labels.iter().map(|s| (*s).to_string()).collect()],
            resize,
        }
    }

    #[must_use]
    pub fn single_column_keyboard(resize: bool, labels: &[&str]) -> Self {
        Self::Keyboard {
            rows: labels.iter().map(|s| vec![(*s).to_string()]).collect(),
            resize,
        }
    }
}

/// Text formatting mode understood by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    #[default]
    Html,
    Plain,
}

/// Everything the engine may ask the platform to do in a chat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundMessage {
    Text {
        chat_id: ChatId,
        text: String,
        parse_mode: ParseMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<MessageId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        markup: Option<ReplyMarkup>,
    },
    Photo {
        chat_id: ChatId,
        file_id: String,
        caption: String,
    },
    EditText {
        chat_id: ChatId,
        message_id: MessageId,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        markup: Option<ReplyMarkup>,
    },
    EditMarkup {
        chat_id: ChatId,
        message_id: MessageId,
        markup: ReplyMarkup,
    },
    Delete {
        chat_id: ChatId,
        message_id: MessageId,
    },
}

impl OutboundMessage {
    /// HTML text message without markup
    #[must_use]
    pub fn text(chat_id: ChatId, text: impl Into<String>) -> Self {
        Self::Text {
            chat_id,
            text: text.into(),
            parse_mode: ParseMode::Html,
            reply_to: None,
            markup: None,
        }
    }

    #[must_use]
    pub fn chat_id(&self) -> ChatId {
        match self {
            Self::Text { chat_id, .. }
            | Self::Photo { chat_id, .. }
            | Self::EditText { chat_id, .. }
            | Self::EditMarkup { chat_id, .. }
            | Self::Delete { chat_id, .. } => *chat_id,
        }
    }
}

/// Result of a successful send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SentMessage {
    /// Identifier of the created or edited message (0 when not applicable)
    pub message_id: MessageId,
}

/// Client for the messaging platform
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send, edit or delete a message
    async fn send(&self, message: OutboundMessage) -> Result<SentMessage, TransportError>;

    /// Acknowledge an inline button press
    async fn answer_callback(&self, callback_id: &str) -> Result<(), TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, message: OutboundMessage) -> Result<SentMessage, TransportError> {
        (**self).send(message).await
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), TransportError> {
        (**self).answer_callback(callback_id).await
    }
}
