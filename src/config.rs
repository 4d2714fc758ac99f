//! Engine configuration
//!
//! All limits and user-facing texts are plain data. `from_env` reads the
//! `SWITCHBOARD_*` variables and falls back to defaults for unset ones.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be greater than zero")]
    ZeroCapacity(&'static str),
}

/// The notices the engine may send on its own behalf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKind {
    /// The session mailbox is full
    TooManyMessages,
    /// The open-session cap is reached
    TooManyConversations,
    /// The session was closed by the bot (timeout, shutdown, forced close)
    ClosedByBot,
    /// The session was interrupted by a global command
    ClosedByUser,
    /// A handler failed
    UserError,
    /// A handler finished normally
    ConversationEnded,
}

/// Notice templates. An empty template disables that notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Notices {
    pub too_many_messages: String,
    pub too_many_conversations: String,
    pub closed_by_bot: String,
    pub closed_by_user: String,
    pub user_error: String,
    pub conversation_ended: String,
}

impl Default for Notices {
    fn default() -> Self {
        Self {
            too_many_messages: "Too many unprocessed messages, please wait for a reply.".to_string(),
            too_many_conversations: "The bot is busy right now, please try again later.".to_string(),
            closed_by_bot: "The conversation was closed by the bot.".to_string(),
            closed_by_user: "The previous conversation was cancelled.".to_string(),
            user_error: "Something went wrong while handling your request.".to_string(),
            conversation_ended: String::new(),
        }
    }
}

impl Notices {
    /// Notices that are all disabled
    #[must_use]
    pub fn silent() -> Self {
        Self {
            too_many_messages: String::new(),
            too_many_conversations: String::new(),
            closed_by_bot: String::new(),
            closed_by_user: String::new(),
            user_error: String::new(),
            conversation_ended: String::new(),
        }
    }

    /// Template for `kind`, or `None` when that notice is disabled
    #[must_use]
    pub fn text(&self, kind: NoticeKind) -> Option<&str> {
        let text = match kind {
            NoticeKind::TooManyMessages => &self.too_many_messages,
            NoticeKind::TooManyConversations => &self.too_many_conversations,
            NoticeKind::ClosedByBot => &self.closed_by_bot,
            NoticeKind::ClosedByUser => &self.closed_by_user,
            NoticeKind::UserError => &self.user_error,
            NoticeKind::ConversationEnded => &self.conversation_ended,
        };
        if text.is_empty() {
            None
        } else {
            Some(text.as_str())
        }
    }
}

/// Limits and timings for the dispatcher and its sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Unprocessed updates a session may hold
    pub mailbox_capacity: usize,
    /// Inactivity after which a waiting session is closed by the bot
    pub inactivity_timeout: Duration,
    /// Maximum number of simultaneously open sessions
    pub max_open_sessions: usize,
    /// Poll interval of `send_single_message` while the chat is busy
    pub single_message_retry_interval: Duration,
    /// How long shutdown waits for session loops to finish
    pub shutdown_grace: Duration,
    /// Whether updates sent by other bots are routed
    pub allow_bot_users: bool,
    /// Snapshot file of the session store; in-memory when unset
    pub state_file: Option<PathBuf>,
    pub notices: Notices,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 100,
            inactivity_timeout: Duration::from_secs(600),
            max_open_sessions: 1000,
            single_message_retry_interval: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
            allow_bot_users: false,
            state_file: None,
            notices: Notices::default(),
        }
    }
}

impl EngineConfig {
    /// Build a configuration from `SWITCHBOARD_*` environment variables
    ///
    /// # Errors
    ///
    /// `InvalidValue` for a variable that does not parse, `ZeroCapacity` for a
    /// zero limit.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a configuration from an arbitrary variable lookup
    ///
    /// # Errors
    ///
    /// See [`EngineConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            mailbox_capacity: parse_or(
                &lookup,
                "SWITCHBOARD_MAILBOX_CAPACITY",
                defaults.mailbox_capacity,
            )?,
            inactivity_timeout: secs_or(
                &lookup,
                "SWITCHBOARD_INACTIVITY_TIMEOUT_SECS",
                defaults.inactivity_timeout,
            )?,
            max_open_sessions: parse_or(
                &lookup,
                "SWITCHBOARD_MAX_OPEN_SESSIONS",
                defaults.max_open_sessions,
            )?,
            single_message_retry_interval: secs_or(
                &lookup,
                "SWITCHBOARD_SINGLE_MESSAGE_RETRY_SECS",
                defaults.single_message_retry_interval,
            )?,
            shutdown_grace: secs_or(
                &lookup,
                "SWITCHBOARD_SHUTDOWN_GRACE_SECS",
                defaults.shutdown_grace,
            )?,
            allow_bot_users: parse_or(
                &lookup,
                "SWITCHBOARD_ALLOW_BOT_USERS",
                defaults.allow_bot_users,
            )?,
            state_file: lookup("SWITCHBOARD_STATE_FILE")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            notices: defaults.notices,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject limits the engine cannot operate with
    ///
    /// # Errors
    ///
    /// `ZeroCapacity` when the mailbox capacity or the session cap is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("mailbox_capacity"));
        }
        if self.max_open_sessions == 0 {
            return Err(ConfigError::ZeroCapacity("max_open_sessions"));
        }
        Ok(())
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) if value.trim().is_empty() => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                var,
                value,
                reason: e.to_string(),
            }),
    }
}

fn secs_or(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(lookup, var, default.as_secs()).map(Duration::from_secs)
}
