//! Dispatcher: routing and lifecycle authority for all sessions
//!
//! Owns the open-session table and the chat index, decides for every inbound
//! update whether it starts a session, feeds a running one or interrupts it,
//! and drives startup resume and shutdown.

mod conversation_loop;

use crate::config::{EngineConfig, NoticeKind, Notices};
use crate::routing::CommandRouter;
use crate::session::{Closing, Session, SessionEnv, SessionError};
use crate::store::{SessionStore, StoreError};
use crate::transport::{OutboundMessage, ParseMode, ReplyMarkup, SentMessage, Transport, TransportError};
use crate::update::{ChatId, SessionId, Update, UpdateError};
use futures::{Stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Routing(#[from] UpdateError),
    #[error("too many open conversations ({open} of {limit})")]
    TooManySessions { open: usize, limit: usize },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("{remaining} session loops still running after {grace:?}")]
    ShutdownTimeout { remaining: usize, grace: Duration },
}

impl DispatchError {
    /// Capacity errors are expected under load and already notified
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Self::TooManySessions { .. } | Self::Session(SessionError::MailboxFull { .. })
        )
    }
}

/// Persistent keyboard for a chat, attached to every engine notice
pub type GlobalKeyboard = Arc<dyn Fn(ChatId) -> Option<ReplyMarkup> + Send + Sync>;

/// Held while an out-of-band message goes to a chat; a session created
/// meanwhile starts its loop only after the message is out.
type ChatGate = Arc<Mutex<()>>;

/// Open sessions and the chat index. Guarded by one lock, held only for
/// routing decisions.
#[derive(Default)]
struct RoutingTable {
    sessions: HashMap<SessionId, Arc<Session>>,
    by_chat: HashMap<ChatId, SessionId>,
    gates: HashMap<ChatId, ChatGate>,
}

impl RoutingTable {
    fn active(&self, chat_id: ChatId) -> Option<Arc<Session>> {
        self.by_chat
            .get(&chat_id)
            .and_then(|id| self.sessions.get(id))
            .cloned()
    }

    fn insert(&mut self, session: Arc<Session>) {
        self.by_chat.insert(session.chat_id(), session.id());
        self.sessions.insert(session.id(), session);
    }

    /// Remove a session from both indices. The chat entry is only dropped
    /// while it still points at this session.
    fn detach(&mut self, session: &Session) -> bool {
        let removed = self.sessions.remove(&session.id()).is_some();
        if self.by_chat.get(&session.chat_id()) == Some(&session.id()) {
            self.by_chat.remove(&session.chat_id());
        }
        removed
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }

    fn gate(&mut self, chat_id: ChatId) -> ChatGate {
        self.gates.entry(chat_id).or_default().clone()
    }

    /// Forget a gate nobody else holds any more
    fn release_gate(&mut self, chat_id: ChatId, gate: &ChatGate) {
        let idle = self
            .gates
            .get(&chat_id)
            .is_some_and(|g| Arc::ptr_eq(g, gate) && Arc::strong_count(g) <= 2);
        if idle {
            self.gates.remove(&chat_id);
        }
    }
}

/// Router and lifecycle manager for all sessions
pub struct Dispatcher {
    config: EngineConfig,
    notices: Arc<Notices>,
    router: CommandRouter,
    transport: Arc<dyn Transport>,
    store: Arc<SessionStore>,
    keyboard: Option<GlobalKeyboard>,
    table: Mutex<RoutingTable>,
    next_session_id: AtomicU64,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        config: EngineConfig,
        router: CommandRouter,
        transport: Arc<dyn Transport>,
        store: Arc<SessionStore>,
    ) -> Self {
        Self {
            notices: Arc::new(config.notices.clone()),
            config,
            router,
            transport,
            store,
            keyboard: None,
            table: Mutex::new(RoutingTable::default()),
            next_session_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Attach a per-chat keyboard to every notice
    #[must_use]
    pub fn with_global_keyboard(
        mut self,
        keyboard: impl Fn(ChatId) -> Option<ReplyMarkup> + Send + Sync + 'static,
    ) -> Self {
        self.keyboard = Some(Arc::new(keyboard));
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn open_sessions(&self) -> usize {
        self.table.lock().await.len()
    }

    /// The session currently bound to a chat
    pub async fn active_session(&self, chat_id: ChatId) -> Option<Arc<Session>> {
        self.table.lock().await.active(chat_id)
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Load the store and relaunch every persisted session.
    ///
    /// A snapshot that cannot be loaded is logged and the engine starts
    /// cold. Returns the number of resumed sessions.
    pub async fn start(self: &Arc<Self>) -> usize {
        if let Err(e) = self.store.load_all() {
            tracing::warn!(error = %e, "Cannot load session snapshot, starting cold");
        }
        if let Some(max) = self.store.max_session_id() {
            self.next_session_id.fetch_max(max + 1, Ordering::SeqCst);
        }

        let live = self.store.list_session_ids();
        self.prune_superseded(&live);

        let mut resumed = Vec::with_capacity(live.len());
        {
            let mut table = self.table.lock().await;
            for id in live {
                let Some(record) = self.store.record(id) else {
                    continue;
                };
                let env = self.session_env(record.chat_id);
                let session = Arc::new(Session::resume(id, record.chat_id, record.first_event, env));
                tracing::info!(
                    session_id = id,
                    chat_id = record.chat_id,
                    step = record.step,
                    "Resuming session"
                );
                table.insert(session.clone());
                resumed.push(session);
            }
        }

        let count = resumed.len();
        for session in resumed {
            self.spawn_loop(session, None);
        }
        tracing::info!(resumed = count, "Dispatcher started");
        count
    }

    fn prune_superseded(&self, live: &[SessionId]) {
        let live: HashSet<SessionId> = live.iter().copied().collect();
        for id in self.store.all_session_ids() {
            if live.contains(&id) {
                continue;
            }
            tracing::warn!(session_id = id, "Dropping superseded session record");
            if let Err(e) = self.store.remove(id) {
                tracing::error!(session_id = id, error = %e, "Failed to drop superseded record");
            }
        }
    }

    // ========================================================================
    // Ingress
    // ========================================================================

    /// Consume inbound updates until the stream ends or shutdown begins
    pub async fn run<S>(self: &Arc<Self>, updates: S)
    where
        S: Stream<Item = Update> + Unpin,
    {
        let mut updates = updates;
        loop {
            let update = tokio::select! {
                () = self.shutdown.cancelled() => break,
                next = updates.next() => match next {
                    Some(update) => update,
                    None => break,
                },
            };

            if update.is_from_bot() && !self.config.allow_bot_users {
                tracing::debug!(update_id = update.update_id, "Skipping update from bot user");
                continue;
            }

            let update_id = update.update_id;
            match self.dispatch(update).await {
                Ok(()) => {}
                Err(DispatchError::ShuttingDown) => break,
                Err(DispatchError::Routing(e)) => {
                    tracing::warn!(update_id, error = %e, "Dropping unroutable update");
                }
                Err(e) if e.is_capacity() => {
                    tracing::warn!(update_id, error = %e, "Update rejected");
                }
                Err(e) => {
                    tracing::error!(update_id, error = %e, "Dispatch failed");
                }
            }
        }
        tracing::info!("Ingress loop stopped");
    }

    /// Route one inbound update.
    ///
    /// A global command interrupts the chat's session and starts a new one.
    /// The interrupted session's closing notice is sent after the routing
    /// lock is released but before the new session's loop starts.
    ///
    /// # Errors
    ///
    /// `ShuttingDown` once shutdown began, `Routing` for an update without a
    /// chat, `TooManySessions` at the open-session cap and `Session` when the
    /// target mailbox rejects the update.
    pub async fn dispatch(self: &Arc<Self>, update: Update) -> Result<(), DispatchError> {
        if self.is_shutting_down() {
            return Err(DispatchError::ShuttingDown);
        }
        let chat_id = update.chat_id()?;
        let global = self.router.is_global(&update);

        let mut table = self.table.lock().await;
        let mut interrupted: Option<(Arc<Session>, Closing)> = None;
        if let Some(existing) = table.active(chat_id) {
            if global {
                table.detach(&existing);
                tracing::info!(
                    session_id = existing.id(),
                    chat_id,
                    "Global command interrupts session"
                );
                interrupted = existing.interrupt().map(|closing| (existing, closing));
            } else {
                let pushed = existing.push_event(update.clone());
                if !matches!(pushed, Err(SessionError::Closed { .. })) {
                    tracing::debug!(session_id = existing.id(), chat_id, "Forwarding update");
                    return pushed.map_err(DispatchError::from);
                }
                // its loop is on the way out
                tracing::debug!(session_id = existing.id(), chat_id, "Session closed, starting a new one");
                table.detach(&existing);
            }
        }

        let open = table.len();
        let limit = self.config.max_open_sessions;
        if open >= limit {
            drop(table);
            Self::notify_interrupted(interrupted).await;
            tracing::warn!(chat_id, open, limit, "Open session cap reached");
            self.notify(chat_id, NoticeKind::TooManyConversations).await;
            return Err(DispatchError::TooManySessions { open, limit });
        }

        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(Session::new(id, chat_id, self.session_env(chat_id)));
        session.push_event(update)?;
        table.insert(session.clone());
        let gate = table.gates.get(&chat_id).cloned();
        drop(table);

        Self::notify_interrupted(interrupted).await;
        tracing::info!(session_id = id, chat_id, "Session created");
        self.spawn_loop(session, gate);
        Ok(())
    }

    async fn notify_interrupted(interrupted: Option<(Arc<Session>, Closing)>) {
        let Some((session, closing)) = interrupted else {
            return;
        };
        if let Err(e) = session.complete_close(closing).await {
            tracing::warn!(session_id = session.id(), error = %e, "Failed to send closing notice");
        }
    }

    /// Send a message outside of any conversation.
    ///
    /// Waits, polling every `single_message_retry_interval`, until the chat
    /// has no active session. While the message is in flight the chat's gate
    /// is held, so a session started in between runs only after it.
    ///
    /// # Errors
    ///
    /// `ShuttingDown` when shutdown begins before the message could be sent,
    /// `Transport` when delivery fails.
    pub async fn send_single_message(
        &self,
        chat_id: ChatId,
        text: impl Into<String>,
    ) -> Result<SentMessage, DispatchError> {
        let text = text.into();
        loop {
            if self.is_shutting_down() {
                return Err(DispatchError::ShuttingDown);
            }
            if let Some(result) = self.try_send_single(chat_id, &text).await {
                return result;
            }
            tracing::debug!(chat_id, "Chat busy, single message postponed");
            tokio::select! {
                () = self.shutdown.cancelled() => return Err(DispatchError::ShuttingDown),
                () = tokio::time::sleep(self.config.single_message_retry_interval) => {}
            }
        }
    }

    /// One attempt of `send_single_message`; `None` while the chat is busy
    async fn try_send_single(&self, chat_id: ChatId, text: &str) -> Option<Result<SentMessage, DispatchError>> {
        let (gate, guard) = {
            let mut table = self.table.lock().await;
            if table.active(chat_id).is_some() {
                return None;
            }
            let gate = table.gate(chat_id);
            let Ok(guard) = gate.clone().try_lock_owned() else {
                // another single message to this chat is in flight
                return None;
            };
            (gate, guard)
        };

        let message = OutboundMessage::Text {
            chat_id,
            text: text.to_string(),
            parse_mode: ParseMode::Html,
            reply_to: None,
            markup: self.keyboard_for(chat_id),
        };
        let result = self.transport.send(message).await.map_err(DispatchError::from);
        drop(guard);
        self.table.lock().await.release_gate(chat_id, &gate);
        Some(result)
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop accepting updates, cancel every session and wait for their loops.
    ///
    /// The store is sealed first, so sessions cancelled here keep their
    /// records and resume on the next start.
    ///
    /// # Errors
    ///
    /// `ShutdownTimeout` when session loops are still running after
    /// `shutdown_grace`.
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        if let Err(e) = self.store.close() {
            tracing::warn!(error = %e, "Session store already sealed");
        }
        self.shutdown.cancel();
        self.tracker.close();

        let grace = self.config.shutdown_grace;
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            let remaining = self.tracker.len();
            tracing::error!(remaining, ?grace, "Session loops did not stop in time");
            return Err(DispatchError::ShutdownTimeout { remaining, grace });
        }
        tracing::info!("Dispatcher stopped");
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn session_env(&self, chat_id: ChatId) -> SessionEnv {
        SessionEnv {
            transport: self.transport.clone(),
            notices: self.notices.clone(),
            keyboard: self.keyboard_for(chat_id),
            mailbox_capacity: self.config.mailbox_capacity,
            inactivity_timeout: self.config.inactivity_timeout,
            cancel: self.shutdown.child_token(),
        }
    }

    fn keyboard_for(&self, chat_id: ChatId) -> Option<ReplyMarkup> {
        self.keyboard.as_ref().and_then(|k| k(chat_id))
    }

    /// Notice to a chat without a session; failures are only logged
    async fn notify(&self, chat_id: ChatId, kind: NoticeKind) {
        let Some(text) = self.notices.text(kind) else {
            return;
        };
        let message = OutboundMessage::Text {
            chat_id,
            text: text.to_string(),
            parse_mode: ParseMode::Html,
            reply_to: None,
            markup: self.keyboard_for(chat_id),
        };
        if let Err(e) = self.transport.send(message).await {
            tracing::warn!(chat_id, error = %e, ?kind, "Failed to deliver notice");
        }
    }
}
