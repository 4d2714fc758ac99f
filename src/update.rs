//! Inbound event model
//!
//! Updates mirror the shape delivered by the messaging platform: an update
//! carries either a message or a callback query (a button press attached to
//! an earlier bot message). Updates are persisted as the first event of a
//! session, so every type here round-trips through serde.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of the remote chat, supplied by the platform
pub type ChatId = i64;

/// Identifier of a session instance, allocated by the dispatcher
pub type SessionId = u64;

/// Identifier of a message inside a chat
pub type MessageId = i64;

/// Errors raised while resolving where an update belongs
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpdateError {
    #[error("update {update_id} has neither a message nor a callback query")]
    Unroutable { update_id: i64 },
    #[error("callback query {callback_id} is not attached to a message")]
    DetachedCallback { callback_id: String },
}

/// A single inbound event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

/// A chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub chat: Chat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
    #[serde(default = "Utc::now")]
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub photo: Vec<PhotoSize>,
}

impl Message {
    /// The bot command at the start of the text, without the leading slash
    /// and without a `@botname` suffix.
    ///
    /// `"/start@my_bot payload"` yields `Some("start")`.
    #[must_use]
    pub fn command(&self) -> Option<&str> {
        let word = self.text.split_whitespace().next()?;
        let command = word.strip_prefix('/')?;
        let command = command.split('@').next().unwrap_or(command);
        if command.is_empty() {
            None
        } else {
            Some(command)
        }
    }

    /// Arguments following the command, trimmed
    #[must_use]
    pub fn command_arguments(&self) -> &str {
        match self.command() {
            Some(_) => self
                .text
                .trim_start()
                .split_once(char::is_whitespace)
                .map_or("", |(_, rest)| rest.trim()),
            None => "",
        }
    }

    #[must_use]
    pub fn has_photo(&self) -> bool {
        !self.photo.is_empty()
    }
}

/// A press on an inline keyboard button
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default)]
    pub data: String,
}

impl Update {
    /// Resolve the chat this update is addressed to
    ///
    /// # Errors
    ///
    /// `Unroutable` for an update with neither message nor callback query,
    /// `DetachedCallback` for a button press without its message.
    pub fn chat_id(&self) -> Result<ChatId, UpdateError> {
        if let Some(message) = &self.message {
            return Ok(message.chat.id);
        }
        if let Some(callback) = &self.callback_query {
            return callback
                .message
                .as_ref()
                .map(|m| m.chat.id)
                .ok_or_else(|| UpdateError::DetachedCallback {
                    callback_id: callback.id.clone(),
                });
        }
        Err(UpdateError::Unroutable {
            update_id: self.update_id,
        })
    }

    /// Message text, or an empty string for non-message updates
    #[must_use]
    pub fn text(&self) -> &str {
        self.message.as_ref().map_or("", |m| m.text.as_str())
    }

    /// Callback payload, if this update is a button press
    #[must_use]
    pub fn callback_data(&self) -> Option<&str> {
        self.callback_query.as_ref().map(|c| c.data.as_str())
    }

    /// Whether the sender identifies as a bot
    #[must_use]
    pub fn is_from_bot(&self) -> bool {
        let sender = self
            .message
            .as_ref()
            .and_then(|m| m.from.as_ref())
            .or_else(|| self.callback_query.as_ref().and_then(|c| c.from.as_ref()));
        sender.is_some_and(|u| u.is_bot)
    }

    /// Build a plain text message update (used by the demo and tests)
    #[must_use]
    pub fn text_message(update_id: i64, chat_id: ChatId, text: impl Into<String>) -> Self {
        Self {
            update_id,
            message: Some(Message {
                message_id: update_id,
                chat: Chat { id: chat_id },
                from: None,
                date: Utc::now(),
                text: text.into(),
                photo: Vec::new(),
            }),
            callback_query: None,
        }
    }

    /// Build a callback update attached to message `message_id`
    #[must_use]
    pub fn callback(
        update_id: i64,
        chat_id: ChatId,
        message_id: MessageId,
        data: impl Into<String>,
    ) -> Self {
        Self {
            update_id,
            message: None,
            callback_query: Some(CallbackQuery {
                id: format!("cb-{update_id}"),
                from: None,
                message: Some(Message {
                    message_id,
                    chat: Chat { id: chat_id },
                    from: None,
                    date: Utc::now(),
                    text: String::new(),
                    photo: Vec::new(),
                }),
                data: data.into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_id_from_message() {
        let update = Update::text_message(1, 12, "hi");
        assert_eq!(update.chat_id(), Ok(12));
    }

    #[test]
    fn test_chat_id_from_callback() {
        let update = Update::callback(2, 13, 7, "yes");
        assert_eq!(update.chat_id(), Ok(13));
        assert_eq!(update.callback_data(), Some("yes"));
    }

    #[test]
    fn test_unroutable_update() {
        let update = Update {
            update_id: 9,
            message: None,
            callback_query: None,
        };
        assert_eq!(update.chat_id(), Err(UpdateError::Unroutable { update_id: 9 }));
    }

    #[test]
    fn test_detached_callback() {
        let mut update = Update::callback(3, 1, 1, "x");
        if let Some(cb) = update.callback_query.as_mut() {
            cb.message = None;
        }
        assert!(matches!(
            update.chat_id(),
            Err(UpdateError::DetachedCallback { .. })
        ));
    }

    #[test]
    fn test_command_parsing() {
        let update = Update::text_message(1, 1, "/start@my_bot  hello there ");
        let message = update.message.as_ref().unwrap();
        assert_eq!(message.command(), Some("start"));
        assert_eq!(message.command_arguments(), "hello there");

        let plain = Update::text_message(2, 1, "start");
        assert_eq!(plain.message.as_ref().unwrap().command(), None);

        let bare = Update::text_message(3, 1, "/");
        assert_eq!(bare.message.as_ref().unwrap().command(), None);
    }

    #[test]
    fn test_bot_sender_detection() {
        let mut update = Update::text_message(1, 1, "beep");
        assert!(!update.is_from_bot());
        update.message.as_mut().unwrap().from = Some(User {
            id: 5,
            is_bot: true,
            username: None,
        });
        assert!(update.is_from_bot());
    }

    #[test]
    fn test_update_json_shape() {
        let json = r#"{"update_id":4,"message":{"message_id":10,"chat":{"id":77},"text":"/go"}}"#;
        let update: Update = serde_json::from_str(json).unwrap();
        assert_eq!(update.chat_id(), Ok(77));
        assert_eq!(update.text(), "/go");
    }
}
