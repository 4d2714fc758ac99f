//! Switchboard - conversation orchestration for chat bots
//!
//! Routes inbound updates to one actor per chat, runs each conversation as
//! a resumable step machine and persists enough state to pick in-flight
//! conversations up again after a restart.

pub mod config;
pub mod dispatcher;
pub mod handler;
pub mod routing;
pub mod session;
pub mod store;
pub mod transport;
pub mod update;

#[cfg(test)]
pub mod testing;

pub use config::{ConfigError, EngineConfig, NoticeKind, Notices};
pub use dispatcher::{DispatchError, Dispatcher};
pub use handler::{Handler, HandlerArgs, HandlerError, HandlerFactory, Step, StepAction, StepContext, StepError, StepMachine};
pub use routing::{CommandRouter, Selector};
pub use session::{Session, SessionError};
pub use store::{SessionStore, StoreError};
pub use transport::{OutboundMessage, ReplyMarkup, Transport, TransportError};
pub use update::{ChatId, SessionId, Update};
