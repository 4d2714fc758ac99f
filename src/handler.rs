//! Conversation handlers
//!
//! A handler runs one conversation inside a [`Session`]. The usual handler is
//! a [`StepMachine`]: an ordered list of named steps that checkpoints its
//! position into the [`SessionStore`] so it can resume after a restart.

mod steps;

pub use steps::{Step, StepAction, StepContext, StepMachine};

use crate::session::{Session, SessionError};
use crate::store::SessionStore;
use crate::update::{SessionId, Update};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Error returned by a step's action
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl StepError {
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("step {step:?} failed: {source}")]
    Step {
        step: String,
        #[source]
        source: StepError,
    },
    #[error("resumed step index {index} is out of range ({len} steps)")]
    ResumeOutOfRange { index: usize, len: usize },
    #[error("step index {index} is out of range ({len} steps)")]
    StepOutOfRange { index: isize, len: usize },
    #[error("no step named {0:?}")]
    UnknownStep(String),
    #[error("step name {0:?} is used twice")]
    DuplicateStep(String),
    #[error("cannot restore step data: {0}")]
    DataRestore(String),
    #[error("cannot serialize step data: {0}")]
    DataSerialize(String),
    /// The conversation ended with a forced close
    #[error("conversation closed")]
    Closed,
}

impl HandlerError {
    /// Errors caused by the step table or an incompatible resume state
    /// rather than by a step at run time
    #[must_use]
    pub fn is_fatal_configuration(&self) -> bool {
        matches!(
            self,
            Self::ResumeOutOfRange { .. }
                | Self::StepOutOfRange { .. }
                | Self::UnknownStep(_)
                | Self::DuplicateStep(_)
                | Self::DataRestore(_)
        )
    }
}

/// Runs one conversation to completion
#[async_trait]
pub trait Handler: Send {
    async fn execute(&mut self, session_id: SessionId, store: &SessionStore) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T: Handler + ?Sized> Handler for Box<T> {
    async fn execute(&mut self, session_id: SessionId, store: &SessionStore) -> Result<(), HandlerError> {
        (**self).execute(session_id, store).await
    }
}

/// What a factory gets to build a handler
#[derive(Clone)]
pub struct HandlerArgs {
    pub session: Arc<Session>,
    /// The update that started the conversation
    pub first_event: Update,
}

/// Builds the handler for a conversation
pub type HandlerFactory = Arc<dyn Fn(HandlerArgs) -> Box<dyn Handler> + Send + Sync>;

// ============================================================================
// Factory helpers
// ============================================================================

/// Handler with a single step running `action`, then ending normally
#[must_use]
pub fn one_step<F, Fut>(action: F) -> HandlerFactory
where
    F: Fn(StepContext<()>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), StepError>> + Send + 'static,
{
    let action = Arc::new(action);
    Arc::new(move |args: HandlerArgs| {
        let action = action.clone();
        let step = Step::new("main", move |cx| {
            let action = action.clone();
            async move {
                action(cx).await?;
                Ok(StepAction::End)
            }
        });
        Box::new(StepMachine::stateless(args, vec![step])) as Box<dyn Handler>
    })
}

/// Send a fixed text
#[must_use]
pub fn message_handler(text: impl Into<String>) -> HandlerFactory {
    let text: Arc<str> = Arc::from(text.into());
    one_step(move |cx| {
        let text = text.clone();
        async move {
            cx.session().send_text(&*text).await?;
            Ok(())
        }
    })
}

/// Reply to the message that started the conversation
#[must_use]
pub fn reply_handler(text: impl Into<String>) -> HandlerFactory {
    let text: Arc<str> = Arc::from(text.into());
    one_step(move |cx| {
        let text = text.clone();
        async move {
            match cx.first_event().message.as_ref().map(|m| m.message_id) {
                Some(message_id) => cx.session().reply_with_text(&*text, message_id).await?,
                None => cx.session().send_text(&*text).await?,
            };
            Ok(())
        }
    })
}

/// A handler whose only step fails with `message`
#[must_use]
pub fn report_error_handler(message: impl Into<String>) -> HandlerFactory {
    let message: Arc<str> = Arc::from(message.into());
    one_step(move |_cx| {
        let message = message.clone();
        async move { Err(StepError::msg(&*message)) }
    })
}
