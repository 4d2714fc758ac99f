//! Resumable step machine

use super::{Handler, HandlerArgs, HandlerError, StepError};
use crate::session::Session;
use crate::store::{SessionStore, StoreError};
use crate::update::{SessionId, Update};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

/// Control transfer returned by a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Advance to the following step
    Next,
    /// Go back one step
    Prev,
    /// Run the current step again
    Repeat,
    /// Restart from the first step
    Begin,
    /// Jump to the step with this name
    GoTo(String),
    /// Finish normally
    End,
    /// Finish and close the conversation from the bot side
    Close,
}

impl StepAction {
    #[must_use]
    pub fn go_to(name: impl Into<String>) -> Self {
        Self::GoTo(name.into())
    }
}

type StepFn<D> = Arc<dyn Fn(StepContext<D>) -> BoxFuture<'static, Result<StepAction, StepError>> + Send + Sync>;

/// A named step
pub struct Step<D> {
    name: String,
    action: StepFn<D>,
}

impl<D> Clone for Step<D> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            action: self.action.clone(),
        }
    }
}

impl<D: 'static> Step<D> {
    #[must_use]
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(StepContext<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepAction, StepError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: Arc::new(move |cx: StepContext<D>| -> BoxFuture<'static, Result<StepAction, StepError>> {
                Box::pin(action(cx))
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// What a step sees: the session, the first event and the user data
pub struct StepContext<D> {
    session: Arc<Session>,
    first_event: Arc<Update>,
    data: Arc<Mutex<D>>,
}

impl<D> Clone for StepContext<D> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            first_event: self.first_event.clone(),
            data: self.data.clone(),
        }
    }
}

impl<D> StepContext<D> {
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The update that started the conversation
    #[must_use]
    pub fn first_event(&self) -> &Update {
        &self.first_event
    }

    /// Wait for the user's next update; `None` once the conversation is over
    pub async fn next_event(&self) -> Option<Update> {
        self.session.get_next_event().await
    }

    /// Read or modify the user data
    pub fn with_data<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        f(&mut self.data.lock().unwrap_or_else(PoisonError::into_inner))
    }

    #[must_use]
    pub fn data(&self) -> D
    where
        D: Clone,
    {
        self.with_data(|d| d.clone())
    }

    pub fn set_data(&self, data: D) {
        self.with_data(|d| *d = data);
    }
}

/// Ordered list of named steps run inside a session.
///
/// Before each step the machine writes `(step index, user data)` to the
/// store, so a crash in the middle of a step re-runs that step on resume.
/// A checkpoint equal to the last one written is skipped, which covers the
/// first step after a resume and `Repeat`.
pub struct StepMachine<D> {
    steps: Vec<Step<D>>,
    session: Arc<Session>,
    first_event: Arc<Update>,
    data: Arc<Mutex<D>>,
}

impl StepMachine<()> {
    /// Machine without user data
    #[must_use]
    pub fn stateless(args: HandlerArgs, steps: Vec<Step<()>>) -> Self {
        Self::stateful(args, (), steps)
    }
}

impl<D> StepMachine<D>
where
    D: Serialize + DeserializeOwned + Send + 'static,
{
    /// Machine whose user data starts as `data` (or the persisted data on resume)
    #[must_use]
    pub fn stateful(args: HandlerArgs, data: D, steps: Vec<Step<D>>) -> Self {
        Self {
            steps,
            session: args.session,
            first_event: Arc::new(args.first_event),
            data: Arc::new(Mutex::new(data)),
        }
    }

    #[must_use]
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(Step::name).collect()
    }

    fn context(&self) -> StepContext<D> {
        StepContext {
            session: self.session.clone(),
            first_event: self.first_event.clone(),
            data: self.data.clone(),
        }
    }

    fn validate_names(&self) -> Result<(), HandlerError> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(HandlerError::DuplicateStep(step.name.clone()));
            }
        }
        Ok(())
    }

    fn snapshot_data(&self) -> Result<Value, HandlerError> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_value(&*data).map_err(|e| HandlerError::DataSerialize(e.to_string()))
    }

    fn restore_data(&self, value: Value) -> Result<(), HandlerError> {
        let restored: D =
            serde_json::from_value(value).map_err(|e| HandlerError::DataRestore(e.to_string()))?;
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = restored;
        Ok(())
    }

    /// Index the action transfers control to, or `None` when the machine ends
    fn transfer(&self, index: usize, action: StepAction) -> Result<Option<usize>, HandlerError> {
        let len = self.steps.len();
        let out_of_range = |target: isize| HandlerError::StepOutOfRange { index: target, len };
        let signed = isize::try_from(index).unwrap_or(isize::MAX);
        let next = match action {
            StepAction::Next => {
                let target = index + 1;
                if target >= len {
                    return Err(out_of_range(signed + 1));
                }
                target
            }
            StepAction::Prev => index.checked_sub(1).ok_or_else(|| out_of_range(signed - 1))?,
            StepAction::Repeat => index,
            StepAction::Begin => 0,
            StepAction::GoTo(name) => self
                .steps
                .iter()
                .position(|s| s.name == name)
                .ok_or(HandlerError::UnknownStep(name))?,
            StepAction::End => return Ok(None),
            StepAction::Close => return Err(HandlerError::Closed),
        };
        Ok(Some(next))
    }
}

#[async_trait]
impl<D> Handler for StepMachine<D>
where
    D: Serialize + DeserializeOwned + Send + 'static,
{
    async fn execute(&mut self, session_id: SessionId, store: &SessionStore) -> Result<(), HandlerError> {
        let len = self.steps.len();
        if len == 0 {
            return Ok(());
        }
        self.validate_names()?;

        let checkpoint = store.get(session_id);
        let mut index = checkpoint.step;
        if index >= len {
            return Err(HandlerError::ResumeOutOfRange { index, len });
        }
        let mut last_written: Option<(usize, Value)> = None;
        if let Some(data) = checkpoint.data {
            self.restore_data(data.clone())?;
            tracing::info!(session_id, step = %self.steps[index].name, "Resuming step machine");
            last_written = Some((index, data));
        }

        loop {
            let data = self.snapshot_data()?;
            let unchanged = last_written
                .as_ref()
                .is_some_and(|(step, written)| *step == index && *written == data);
            if !unchanged {
                match store.save_step_and_data(session_id, index, data.clone()) {
                    Ok(()) => tracing::debug!(session_id, step = index, "Checkpoint written"),
                    Err(StoreError::Sealed) => {
                        tracing::debug!(session_id, step = index, "Store sealed, checkpoint skipped");
                    }
                    Err(e) => {
                        tracing::warn!(session_id, step = index, error = %e, "Checkpoint failed, continuing without durability");
                    }
                }
                last_written = Some((index, data));
            }

            let step = &self.steps[index];
            tracing::debug!(session_id, step = %step.name, "Running step");
            let action = (step.action)(self.context())
                .await
                .map_err(|source| HandlerError::Step {
                    step: step.name.clone(),
                    source,
                })?;

            match self.transfer(index, action)? {
                Some(next) => index = next,
                None => return Ok(()),
            }
        }
    }
}
