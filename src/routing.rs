//! Command routing table
//!
//! Maps the first update of a conversation to the factory of the handler
//! that runs it. Global routes are checked first and may interrupt a running
//! conversation; then per-conversation routes; then the default.

use crate::handler::Handler;
use crate::update::Update;
use regex::Regex;
use std::sync::Arc;
use thiserror::Error;

pub use crate::handler::{HandlerArgs, HandlerFactory};

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("invalid selector pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

fn compile(pattern: &str) -> Result<Regex, RoutingError> {
    Regex::new(pattern).map_err(|source| RoutingError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Predicate over an inbound update
#[derive(Clone)]
pub struct Selector(Arc<dyn Fn(&Update) -> bool + Send + Sync>);

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Selector(..)")
    }
}

impl Selector {
    #[must_use]
    pub fn new(predicate: impl Fn(&Update) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    #[must_use]
    pub fn matches(&self, update: &Update) -> bool {
        (self.0)(update)
    }

    /// Matches when either selector does
    #[must_use]
    pub fn or(self, other: Selector) -> Self {
        Self::new(move |u| self.matches(u) || other.matches(u))
    }

    /// Message whose text or bare command matches `pattern`
    ///
    /// # Errors
    ///
    /// `InvalidPattern` when `pattern` is not a valid regex.
    pub fn text_matches(pattern: &str) -> Result<Self, RoutingError> {
        let re = compile(pattern)?;
        Ok(Self::new(move |u| {
            u.message.as_ref().is_some_and(|m| {
                re.is_match(&m.text) || m.command().is_some_and(|c| re.is_match(c))
            })
        }))
    }

    /// Button press whose payload matches `pattern`
    ///
    /// # Errors
    ///
    /// `InvalidPattern` when `pattern` is not a valid regex.
    pub fn callback_matches(pattern: &str) -> Result<Self, RoutingError> {
        let re = compile(pattern)?;
        Ok(Self::new(move |u| u.callback_data().is_some_and(|d| re.is_match(d))))
    }

    /// Command or text matching `command_pattern`, or a button press matching
    /// `callback_pattern`
    ///
    /// # Errors
    ///
    /// `InvalidPattern` when either pattern is not a valid regex.
    pub fn command_or_callback(command_pattern: &str, callback_pattern: &str) -> Result<Self, RoutingError> {
        Ok(Self::text_matches(command_pattern)?.or(Self::callback_matches(callback_pattern)?))
    }

    /// Bot command, compared without slash and `@botname`
    #[must_use]
    pub fn command(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(move |u| {
            u.message
                .as_ref()
                .and_then(|m| m.command())
                .is_some_and(|c| c == name)
        })
    }

    #[must_use]
    pub fn exact_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |u| u.message.as_ref().is_some_and(|m| m.text == text))
    }

    /// Message carrying a photo
    #[must_use]
    pub fn has_photo() -> Self {
        Self::new(|u| u.message.as_ref().is_some_and(crate::update::Message::has_photo))
    }
}

/// A selector paired with the factory it routes to
#[derive(Clone)]
pub struct Route {
    pub selector: Selector,
    pub factory: HandlerFactory,
}

/// Ordered routing table with a default
#[derive(Clone)]
pub struct CommandRouter {
    global: Vec<Route>,
    routes: Vec<Route>,
    default: HandlerFactory,
}

impl CommandRouter {
    #[must_use]
    pub fn new(default: HandlerFactory) -> Self {
        Self {
            global: Vec::new(),
            routes: Vec::new(),
            default,
        }
    }

    /// Add a route that may interrupt any running conversation of the chat
    #[must_use]
    pub fn global(mut self, selector: Selector, factory: HandlerFactory) -> Self {
        self.global.push(Route { selector, factory });
        self
    }

    /// Add a route that only starts conversations
    #[must_use]
    pub fn route(mut self, selector: Selector, factory: HandlerFactory) -> Self {
        self.routes.push(Route { selector, factory });
        self
    }

    #[must_use]
    pub fn is_global(&self, update: &Update) -> bool {
        self.global.iter().any(|r| r.selector.matches(update))
    }

    /// Factory for the conversation started by `update`
    #[must_use]
    pub fn resolve(&self, update: &Update) -> &HandlerFactory {
        self.global
            .iter()
            .chain(&self.routes)
            .find(|r| r.selector.matches(update))
            .map_or(&self.default, |r| &r.factory)
    }

    /// Build the handler for a conversation
    #[must_use]
    pub fn build(&self, args: HandlerArgs) -> Box<dyn Handler> {
        let factory = self.resolve(&args.first_event).clone();
        factory(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::message_handler;
    use crate::update::{Chat, Message, PhotoSize};

    fn photo_update() -> Update {
        let mut update = Update::text_message(3, 1, "");
        if let Some(m) = update.message.as_mut() {
            m.photo.push(PhotoSize {
                file_id: "f".to_string(),
                width: 10,
                height: 10,
            });
        }
        update
    }

    #[test]
    fn test_text_matches_text_or_command() {
        let selector = Selector::text_matches("^start$").unwrap();
        assert!(selector.matches(&Update::text_message(1, 1, "/start@bot hello")));
        assert!(selector.matches(&Update::text_message(1, 1, "start")));
        assert!(!selector.matches(&Update::text_message(1, 1, "restart")));
        assert!(!selector.matches(&Update::callback(1, 1, 5, "start")));
    }

    #[test]
    fn test_callback_and_combined() {
        let callback = Selector::callback_matches("^menu:").unwrap();
        assert!(callback.matches(&Update::callback(1, 1, 5, "menu:open")));
        assert!(!callback.matches(&Update::text_message(1, 1, "menu:open")));

        let either = Selector::command_or_callback("^/menu", "^menu$").unwrap();
        assert!(either.matches(&Update::text_message(1, 1, "/menu")));
        assert!(either.matches(&Update::callback(1, 1, 5, "menu")));
        assert!(!either.matches(&Update::callback(1, 1, 5, "menus")));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(
            Selector::text_matches("(unclosed"),
            Err(RoutingError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_simple_selectors() {
        assert!(Selector::has_photo().matches(&photo_update()));
        assert!(!Selector::has_photo().matches(&Update::text_message(1, 1, "x")));
        assert!(Selector::exact_text("Yes").matches(&Update::text_message(1, 1, "Yes")));
        assert!(!Selector::exact_text("Yes").matches(&Update::text_message(1, 1, "Yes!")));
        assert!(Selector::command("name").matches(&Update::text_message(1, 1, "/name Ada")));

        let no_text = Update {
            update_id: 1,
            message: Some(Message {
                message_id: 1,
                chat: Chat { id: 1 },
                from: None,
                date: chrono::Utc::now(),
                text: String::new(),
                photo: Vec::new(),
            }),
            callback_query: None,
        };
        assert!(!Selector::command("name").matches(&no_text));
    }

    #[test]
    fn test_resolution_order() {
        let global = message_handler("global");
        let local = message_handler("local");
        let default = message_handler("default");
        let router = CommandRouter::new(default.clone())
            .route(Selector::command("cancel"), local.clone())
            .global(Selector::command("cancel"), global.clone())
            .route(Selector::command("order"), local.clone());

        let cancel = Update::text_message(1, 1, "/cancel");
        assert!(router.is_global(&cancel));
        assert!(Arc::ptr_eq(router.resolve(&cancel), &global));
        assert!(Arc::ptr_eq(router.resolve(&Update::text_message(1, 1, "/order")), &local));
        assert!(Arc::ptr_eq(router.resolve(&Update::text_message(1, 1, "hello")), &default));
        assert!(!router.is_global(&Update::text_message(1, 1, "/order")));
    }
}
