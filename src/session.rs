//! Per-chat conversation actor
//!
//! A session owns a bounded mailbox of updates for one chat, an inactivity
//! deadline and its close state. Outbound sends go through a single ordering
//! lock that also guards the close transition, so nothing is sent from two
//! tasks at once and nothing is sent after the closing notice.

use crate::config::{NoticeKind, Notices};
use crate::transport::{OutboundMessage, ParseMode, ReplyMarkup, SentMessage, Transport, TransportError};
use crate::update::{ChatId, MessageId, SessionId, Update, UpdateError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("conversation with chat {chat_id} is already closed")]
    Closed { chat_id: ChatId },
    #[error("update for chat {got} pushed to the conversation with chat {expected}")]
    ChatMismatch { expected: ChatId, got: ChatId },
    #[error("too many unprocessed messages in the conversation with chat {chat_id} (capacity {capacity})")]
    MailboxFull { chat_id: ChatId, capacity: usize },
    #[error(transparent)]
    Routing(#[from] UpdateError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Why a session left the open state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The loop ran out of work
    Completed,
    /// Timeout, shutdown or a forced close by a step
    CancelledByBot,
    /// A global command switched the chat to a new session
    CancelledByUser,
}

/// A close that already took effect and still owes the chat its notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Closing {
    reason: CloseReason,
    notice: Option<NoticeKind>,
}

/// The update that starts a conversation
#[derive(Debug, Clone, PartialEq)]
pub enum FirstEvent {
    /// Read from the mailbox
    Fresh(Update),
    /// Restored from the session store after a restart
    Resumed(Update),
}

impl FirstEvent {
    #[must_use]
    pub fn update(&self) -> &Update {
        match self {
            Self::Fresh(u) | Self::Resumed(u) => u,
        }
    }

    #[must_use]
    pub fn into_update(self) -> Update {
        match self {
            Self::Fresh(u) | Self::Resumed(u) => u,
        }
    }

    #[must_use]
    pub fn is_resumed(&self) -> bool {
        matches!(self, Self::Resumed(_))
    }
}

/// Everything a session needs from its dispatcher
#[derive(Clone)]
pub struct SessionEnv {
    pub transport: Arc<dyn Transport>,
    pub notices: Arc<Notices>,
    /// Persistent keyboard attached to notices
    pub keyboard: Option<ReplyMarkup>,
    pub mailbox_capacity: usize,
    pub inactivity_timeout: Duration,
    /// Child of the dispatcher's shutdown token
    pub cancel: CancellationToken,
}

pub struct Session {
    id: SessionId,
    chat_id: ChatId,
    mailbox_tx: mpsc::Sender<Update>,
    mailbox_rx: tokio::sync::Mutex<mpsc::Receiver<Update>>,
    mailbox_capacity: usize,
    resumed_first: Mutex<Option<Update>>,
    inactivity_timeout: Duration,
    deadline: Mutex<Instant>,
    /// Send-ordering lock; the closing notice is sent under it too
    send_lock: tokio::sync::Mutex<()>,
    /// Set once; pushes check it under the same lock
    close_reason: Mutex<Option<CloseReason>>,
    active: AtomicBool,
    cancel: CancellationToken,
    transport: Arc<dyn Transport>,
    notices: Arc<Notices>,
    keyboard: Option<ReplyMarkup>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("chat_id", &self.chat_id)
            .field("close_reason", &self.close_reason())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// A fresh, empty session
    #[must_use]
    pub fn new(id: SessionId, chat_id: ChatId, env: SessionEnv) -> Self {
        let capacity = env.mailbox_capacity.max(1);
        let (mailbox_tx, mailbox_rx) = mpsc::channel(capacity);
        Self {
            id,
            chat_id,
            mailbox_tx,
            mailbox_rx: tokio::sync::Mutex::new(mailbox_rx),
            mailbox_capacity: capacity,
            resumed_first: Mutex::new(None),
            inactivity_timeout: env.inactivity_timeout,
            deadline: Mutex::new(Instant::now() + env.inactivity_timeout),
            send_lock: tokio::sync::Mutex::new(()),
            close_reason: Mutex::new(None),
            active: AtomicBool::new(false),
            cancel: env.cancel,
            transport: env.transport,
            notices: env.notices,
            keyboard: env.keyboard,
        }
    }

    /// A session restored from the store. Its first event is the persisted
    /// one and always precedes anything pushed to the mailbox.
    #[must_use]
    pub fn resume(id: SessionId, chat_id: ChatId, first_event: Update, env: SessionEnv) -> Self {
        let session = Self::new(id, chat_id, env);
        *session.lock_resumed() = Some(first_event);
        session.active.store(true, Ordering::SeqCst);
        session
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.close_reason().is_some()
    }

    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the user has interacted with the current conversation
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Forget activity once a conversation is over
    pub fn mark_idle(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn global_keyboard(&self) -> Option<&ReplyMarkup> {
        self.keyboard.as_ref()
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Updates waiting in the mailbox
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.mailbox_capacity - self.mailbox_tx.capacity()
    }

    #[must_use]
    pub fn mailbox_capacity(&self) -> usize {
        self.mailbox_capacity
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Queue an update without blocking.
    ///
    /// A full mailbox rejects the update, leaves the queue untouched and
    /// notifies the chat in the background.
    ///
    /// # Errors
    ///
    /// `ChatMismatch` or `Routing` for an update that does not belong to this
    /// chat, `Closed` once the session has started closing (nothing would
    /// ever read the update) and `MailboxFull` when the mailbox is at capacity.
    pub fn push_event(&self, update: Update) -> Result<(), SessionError> {
        let chat_id = update.chat_id()?;
        if chat_id != self.chat_id {
            return Err(SessionError::ChatMismatch {
                expected: self.chat_id,
                got: chat_id,
            });
        }

        let sent = {
            let close_reason = self.close_reason.lock().unwrap_or_else(PoisonError::into_inner);
            if close_reason.is_some() {
                return Err(SessionError::Closed {
                    chat_id: self.chat_id,
                });
            }
            self.mailbox_tx.try_send(update)
        };

        match sent {
            Ok(()) => {
                self.extend_deadline();
                self.active.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(session_id = self.id, chat_id = self.chat_id, "Mailbox full, update rejected");
                self.notify_in_background(NoticeKind::TooManyMessages);
                Err(SessionError::MailboxFull {
                    chat_id: self.chat_id,
                    capacity: self.mailbox_capacity,
                })
            }
            Err(TrySendError::Closed(_)) => Err(SessionError::Closed {
                chat_id: self.chat_id,
            }),
        }
    }

    /// The update that starts the next conversation, without waiting.
    ///
    /// `None` means the loop should exit: the session is closed, cancelled,
    /// or has nothing queued.
    #[must_use]
    pub fn get_first_event(&self) -> Option<FirstEvent> {
        if self.cancel.is_cancelled() || self.is_closed() {
            return None;
        }
        if let Some(update) = self.lock_resumed().take() {
            return Some(FirstEvent::Resumed(update));
        }
        let mut rx = self.mailbox_rx.try_lock().ok()?;
        rx.try_recv().ok().map(FirstEvent::Fresh)
    }

    /// Wait for the next update of the running conversation.
    ///
    /// Returns `None` when the session is cancelled or stays inactive past
    /// its deadline; both close the session from the bot side first.
    pub async fn get_next_event(&self) -> Option<Update> {
        if self.is_closed() {
            return None;
        }
        self.extend_deadline();
        let mut rx = self.mailbox_rx.lock().await;
        loop {
            let deadline = self.current_deadline();
            tokio::select! {
                maybe = rx.recv() => return maybe,
                () = self.cancel.cancelled() => {
                    drop(rx);
                    tracing::debug!(session_id = self.id, "Session cancelled while waiting");
                    self.cancel_by_bot_logged().await;
                    return None;
                }
                () = tokio::time::sleep_until(deadline) => {
                    if Instant::now() < self.current_deadline() {
                        // an update extended the deadline meanwhile
                        continue;
                    }
                    drop(rx);
                    tracing::info!(session_id = self.id, chat_id = self.chat_id, "Session timed out");
                    self.cancel_by_bot_logged().await;
                    return None;
                }
            }
        }
    }

    // ========================================================================
    // Close transitions
    // ========================================================================

    /// Close because the user switched to another conversation.
    ///
    /// Returns `Ok(true)` for the call that performed the close. The
    /// closed-by-user notice is sent only if the session saw activity.
    ///
    /// # Errors
    ///
    /// `Transport` when the closing notice cannot be delivered. The session
    /// is closed either way.
    pub async fn cancel_by_user(&self) -> Result<bool, SessionError> {
        let Some(closing) = self.interrupt() else {
            return Ok(false);
        };
        self.complete_close(closing).await.map(|()| true)
    }

    /// Close from the bot side (timeout, shutdown, forced close)
    ///
    /// # Errors
    ///
    /// `Transport` when the closing notice cannot be delivered. The session
    /// is closed either way.
    pub async fn cancel_by_bot(&self) -> Result<bool, SessionError> {
        let notice = Some(NoticeKind::ClosedByBot);
        let Some(closing) = self.begin_close(CloseReason::CancelledByBot, notice) else {
            return Ok(false);
        };
        self.complete_close(closing).await.map(|()| true)
    }

    /// Close without a notice once the loop has no more work
    pub async fn finish(&self) -> bool {
        let Some(closing) = self.begin_close(CloseReason::Completed, None) else {
            return false;
        };
        // no notice, so no transport error is possible
        let _ = self.complete_close(closing).await;
        true
    }

    /// First half of `cancel_by_user`, usable under the routing lock: the
    /// session stops accepting updates and sends right away, the notice is
    /// left to [`Session::complete_close`].
    pub(crate) fn interrupt(&self) -> Option<Closing> {
        let notice = self.is_active().then_some(NoticeKind::ClosedByUser);
        self.begin_close(CloseReason::CancelledByUser, notice)
    }

    /// Wait for in-flight sends, then deliver the closing notice
    pub(crate) async fn complete_close(&self, closing: Closing) -> Result<(), SessionError> {
        let _send = self.send_lock.lock().await;
        let result = match closing.notice.and_then(|kind| self.notice_message(kind)) {
            Some(message) => self.transport.send(message).await.map(|_| ()),
            None => Ok(()),
        };
        tracing::debug!(session_id = self.id, chat_id = self.chat_id, reason = ?closing.reason, "Session closed");
        result.map_err(SessionError::from)
    }

    async fn cancel_by_bot_logged(&self) {
        if let Err(e) = self.cancel_by_bot().await {
            tracing::error!(session_id = self.id, error = %e, "Failed to send closing notice");
        }
    }

    /// The one transition out of the open state. `None` when another close
    /// got there first.
    fn begin_close(&self, reason: CloseReason, notice: Option<NoticeKind>) -> Option<Closing> {
        {
            let mut close_reason = self.close_reason.lock().unwrap_or_else(PoisonError::into_inner);
            if close_reason.is_some() {
                return None;
            }
            *close_reason = Some(reason);
        }
        self.cancel.cancel();
        Some(Closing { reason, notice })
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Send any outbound message addressed to this chat
    ///
    /// # Errors
    ///
    /// `ChatMismatch` for a message addressed elsewhere, `Closed` once the
    /// session is closing and `Transport` when delivery fails.
    pub async fn send(&self, message: OutboundMessage) -> Result<SentMessage, SessionError> {
        if message.chat_id() != self.chat_id {
            return Err(SessionError::ChatMismatch {
                expected: self.chat_id,
                got: message.chat_id(),
            });
        }
        let send = self.send_lock.lock().await;
        self.ensure_open()?;
        let sent = self.transport.send(message).await?;
        drop(send);
        Ok(sent)
    }

    /// Send an HTML text message
    ///
    /// # Errors
    ///
    /// See [`Session::send`].
    pub async fn send_text(&self, text: impl Into<String>) -> Result<MessageId, SessionError> {
        self.send(OutboundMessage::text(self.chat_id, text))
            .await
            .map(|m| m.message_id)
    }

    /// # Errors
    ///
    /// See [`Session::send`].
    pub async fn send_text_with_markup(
        &self,
        text: impl Into<String>,
        markup: ReplyMarkup,
    ) -> Result<MessageId, SessionError> {
        self.send(OutboundMessage::Text {
            chat_id: self.chat_id,
            text: text.into(),
            parse_mode: ParseMode::Html,
            reply_to: None,
            markup: Some(markup),
        })
        .await
        .map(|m| m.message_id)
    }

    /// Reply to an existing message
    ///
    /// # Errors
    ///
    /// See [`Session::send`].
    pub async fn reply_with_text(
        &self,
        text: impl Into<String>,
        reply_to: MessageId,
    ) -> Result<MessageId, SessionError> {
        self.send(OutboundMessage::Text {
            chat_id: self.chat_id,
            text: text.into(),
            parse_mode: ParseMode::Html,
            reply_to: Some(reply_to),
            markup: None,
        })
        .await
        .map(|m| m.message_id)
    }

    /// Share an already uploaded photo
    ///
    /// # Errors
    ///
    /// See [`Session::send`].
    pub async fn send_photo(
        &self,
        file_id: impl Into<String>,
        caption: impl Into<String>,
    ) -> Result<MessageId, SessionError> {
        self.send(OutboundMessage::Photo {
            chat_id: self.chat_id,
            file_id: file_id.into(),
            caption: caption.into(),
        })
        .await
        .map(|m| m.message_id)
    }

    /// Replace the text of a message (its inline keyboard is dropped)
    ///
    /// # Errors
    ///
    /// See [`Session::send`].
    pub async fn edit_message_text(
        &self,
        message_id: MessageId,
        text: impl Into<String>,
    ) -> Result<(), SessionError> {
        self.send(OutboundMessage::EditText {
            chat_id: self.chat_id,
            message_id,
            text: text.into(),
            markup: None,
        })
        .await
        .map(|_| ())
    }

    /// # Errors
    ///
    /// See [`Session::send`].
    pub async fn edit_text_and_markup(
        &self,
        message_id: MessageId,
        text: impl Into<String>,
        markup: ReplyMarkup,
    ) -> Result<(), SessionError> {
        self.send(OutboundMessage::EditText {
            chat_id: self.chat_id,
            message_id,
            text: text.into(),
            markup: Some(markup),
        })
        .await
        .map(|_| ())
    }

    /// # Errors
    ///
    /// See [`Session::send`].
    pub async fn edit_reply_markup(
        &self,
        message_id: MessageId,
        markup: ReplyMarkup,
    ) -> Result<(), SessionError> {
        self.send(OutboundMessage::EditMarkup {
            chat_id: self.chat_id,
            message_id,
            markup,
        })
        .await
        .map(|_| ())
    }

    /// Drop the inline buttons of a message
    ///
    /// # Errors
    ///
    /// See [`Session::send`].
    pub async fn remove_reply_markup(&self, message_id: MessageId) -> Result<(), SessionError> {
        self.edit_reply_markup(message_id, ReplyMarkup::empty_inline())
            .await
    }

    /// # Errors
    ///
    /// See [`Session::send`].
    pub async fn delete_message(&self, message_id: MessageId) -> Result<(), SessionError> {
        self.send(OutboundMessage::Delete {
            chat_id: self.chat_id,
            message_id,
        })
        .await
        .map(|_| ())
    }

    /// Acknowledge a button press
    ///
    /// # Errors
    ///
    /// `Closed` once the session is closing, `Transport` when the
    /// acknowledgement fails.
    pub async fn answer_callback(&self, callback_id: &str) -> Result<(), SessionError> {
        let send = self.send_lock.lock().await;
        self.ensure_open()?;
        self.transport.answer_callback(callback_id).await?;
        drop(send);
        Ok(())
    }

    /// Send a notice unless the session is closed. Used by the loop for the
    /// user-error and conversation-ended notices.
    ///
    /// # Errors
    ///
    /// See [`Session::send`].
    pub async fn send_notice(&self, kind: NoticeKind) -> Result<(), SessionError> {
        match self.notice_message(kind) {
            Some(message) => self.send(message).await.map(|_| ()),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed {
                chat_id: self.chat_id,
            });
        }
        Ok(())
    }

    fn notice_message(&self, kind: NoticeKind) -> Option<OutboundMessage> {
        let text = self.notices.text(kind)?;
        Some(OutboundMessage::Text {
            chat_id: self.chat_id,
            text: text.to_string(),
            parse_mode: ParseMode::Html,
            reply_to: None,
            markup: self.keyboard.clone(),
        })
    }

    fn notify_in_background(&self, kind: NoticeKind) {
        let Some(message) = self.notice_message(kind) else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(session_id = self.id, "No runtime to deliver notice on");
            return;
        };
        let transport = self.transport.clone();
        let session_id = self.id;
        handle.spawn(async move {
            if let Err(e) = transport.send(message).await {
                tracing::warn!(session_id, error = %e, "Failed to deliver notice");
            }
        });
    }

    fn extend_deadline(&self) {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) =
            Instant::now() + self.inactivity_timeout;
    }

    fn current_deadline(&self) -> Instant {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_resumed(&self) -> std::sync::MutexGuard<'_, Option<Update>> {
        self.resumed_first.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{session_env, MockTransport};

    const CHAT: ChatId = 100;

    fn session_with(transport: &Arc<MockTransport>, capacity: usize, timeout: Duration) -> Session {
        let mut env = session_env(transport.clone());
        env.mailbox_capacity = capacity;
        env.inactivity_timeout = timeout;
        Session::new(1, CHAT, env)
    }

    #[tokio::test]
    async fn test_push_rejects_other_chat() {
        let transport = Arc::new(MockTransport::new());
        let session = session_with(&transport, 4, Duration::from_secs(60));
        let err = session
            .push_event(Update::text_message(1, CHAT + 1, "hi"))
            .unwrap_err();
        assert!(matches!(err, SessionError::ChatMismatch { .. }));
        assert_eq!(session.pending_events(), 0);
    }

    #[tokio::test]
    async fn test_mailbox_full_scenario() {
        let transport = Arc::new(MockTransport::new());
        let session = session_with(&transport, 1, Duration::from_secs(60));

        session.push_event(Update::text_message(1, CHAT, "A")).unwrap();
        let err = session
            .push_event(Update::text_message(2, CHAT, "B"))
            .unwrap_err();
        assert!(matches!(err, SessionError::MailboxFull { capacity: 1, .. }));
        assert_eq!(session.pending_events(), 1);
        assert!(
            transport
                .wait_for_text(CHAT, &Notices::default().too_many_messages, Duration::from_secs(1))
                .await
        );

        let first = session.get_first_event().unwrap();
        assert_eq!(first.update().text(), "A");
        session.push_event(Update::text_message(3, CHAT, "C")).unwrap();
    }

    #[tokio::test]
    async fn test_first_event_is_non_blocking() {
        let transport = Arc::new(MockTransport::new());
        let session = session_with(&transport, 2, Duration::from_secs(60));
        assert!(session.get_first_event().is_none());
    }

    #[tokio::test]
    async fn test_resumed_event_precedes_mailbox() {
        let transport = Arc::new(MockTransport::new());
        let session = Session::resume(
            7,
            CHAT,
            Update::text_message(1, CHAT, "persisted"),
            session_env(transport.clone()),
        );
        session.push_event(Update::text_message(2, CHAT, "live")).unwrap();

        let first = session.get_first_event().unwrap();
        assert!(first.is_resumed());
        assert_eq!(first.update().text(), "persisted");
        assert_eq!(session.get_next_event().await.unwrap().text(), "live");
    }

    #[tokio::test]
    async fn test_next_event_times_out() {
        let transport = Arc::new(MockTransport::new());
        let session = session_with(&transport, 2, Duration::from_millis(30));

        assert!(session.get_next_event().await.is_none());
        assert_eq!(session.close_reason(), Some(CloseReason::CancelledByBot));
        assert_eq!(transport.texts_for(CHAT), vec![Notices::default().closed_by_bot]);
    }

    #[tokio::test]
    async fn test_push_extends_deadline() {
        let transport = Arc::new(MockTransport::new());
        let session = Arc::new(session_with(&transport, 4, Duration::from_millis(80)));

        let pusher = {
            let session = session.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                session.push_event(Update::text_message(1, CHAT, "late")).unwrap();
            })
        };
        let update = session.get_next_event().await;
        pusher.await.unwrap();
        assert_eq!(update.unwrap().text(), "late");
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_cancellation_wakes_waiter() {
        let transport = Arc::new(MockTransport::new());
        let session = Arc::new(session_with(&transport, 2, Duration::from_secs(60)));

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.get_next_event().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.cancellation_token().cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
        assert_eq!(transport.texts_for(CHAT), vec![Notices::default().closed_by_bot]);
    }

    #[tokio::test]
    async fn test_cancel_by_user_is_idempotent() {
        let transport = Arc::new(MockTransport::new());
        let session = session_with(&transport, 2, Duration::from_secs(60));
        session.push_event(Update::text_message(1, CHAT, "x")).unwrap();

        assert!(session.cancel_by_user().await.unwrap());
        assert!(!session.cancel_by_user().await.unwrap());
        assert!(!session.cancel_by_bot().await.unwrap());
        assert_eq!(transport.texts_for(CHAT), vec![Notices::default().closed_by_user]);
    }

    #[tokio::test]
    async fn test_cancel_by_bot_is_idempotent() {
        let transport = Arc::new(MockTransport::new());
        let session = session_with(&transport, 2, Duration::from_secs(60));

        assert!(session.cancel_by_bot().await.unwrap());
        assert!(!session.cancel_by_bot().await.unwrap());
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_push_after_close_is_rejected() {
        let transport = Arc::new(MockTransport::new());
        let session = session_with(&transport, 4, Duration::from_secs(60));
        session.cancel_by_bot().await.unwrap();

        let err = session
            .push_event(Update::text_message(1, CHAT, "lost"))
            .unwrap_err();
        assert!(matches!(err, SessionError::Closed { chat_id: CHAT }));
        assert_eq!(session.pending_events(), 0);
        assert!(session.get_first_event().is_none());
    }

    #[tokio::test]
    async fn test_push_after_finish_is_rejected() {
        let transport = Arc::new(MockTransport::new());
        let session = session_with(&transport, 4, Duration::from_secs(60));
        assert!(session.finish().await);

        assert!(matches!(
            session.push_event(Update::text_message(1, CHAT, "late")),
            Err(SessionError::Closed { .. })
        ));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_closes_before_notice() {
        let transport = Arc::new(MockTransport::new());
        let session = session_with(&transport, 4, Duration::from_secs(60));
        session.push_event(Update::text_message(1, CHAT, "x")).unwrap();

        let closing = session.interrupt().unwrap();
        assert!(session.is_closed());
        assert!(session.cancellation_token().is_cancelled());
        assert!(session.interrupt().is_none());
        assert!(matches!(
            session.push_event(Update::text_message(2, CHAT, "y")),
            Err(SessionError::Closed { .. })
        ));
        assert!(transport.sent().is_empty());

        session.complete_close(closing).await.unwrap();
        assert_eq!(transport.texts_for(CHAT), vec![Notices::default().closed_by_user]);
        assert_eq!(session.close_reason(), Some(CloseReason::CancelledByUser));
    }

    #[tokio::test]
    async fn test_inactive_session_cancelled_silently() {
        let transport = Arc::new(MockTransport::new());
        let session = session_with(&transport, 2, Duration::from_secs(60));
        assert!(session.cancel_by_user().await.unwrap());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_sends_fail_after_close() {
        let transport = Arc::new(MockTransport::new());
        let session = session_with(&transport, 2, Duration::from_secs(60));

        let id = session.send_text("hello").await.unwrap();
        session.edit_message_text(id, "hello again").await.unwrap();
        session.finish().await;

        assert!(matches!(
            session.send_text("too late").await,
            Err(SessionError::Closed { .. })
        ));
        assert!(matches!(
            session.answer_callback("cb-1").await,
            Err(SessionError::Closed { .. })
        ));
        assert_eq!(transport.sent().len(), 2);
        assert_eq!(session.close_reason(), Some(CloseReason::Completed));
    }

    #[tokio::test]
    async fn test_sends_are_serialized() {
        let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(10)));
        let session = Arc::new(session_with(&transport, 2, Duration::from_secs(60)));

        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let session = session.clone();
                tokio::spawn(async move { session.send_text(format!("m{i}")).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(transport.max_concurrent_sends(), 1);
    }

    #[tokio::test]
    async fn test_answer_callback_and_markup_edits() {
        let transport = Arc::new(MockTransport::new());
        let session = session_with(&transport, 2, Duration::from_secs(60));

        session.answer_callback("cb-7").await.unwrap();
        session.remove_reply_markup(55).await.unwrap();
        session.delete_message(55).await.unwrap();

        assert_eq!(transport.answered(), vec!["cb-7".to_string()]);
        assert_eq!(
            transport.sent(),
            vec![
                OutboundMessage::EditMarkup {
                    chat_id: CHAT,
                    message_id: 55,
                    markup: ReplyMarkup::empty_inline(),
                },
                OutboundMessage::Delete {
                    chat_id: CHAT,
                    message_id: 55,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_send_to_other_chat_rejected() {
        let transport = Arc::new(MockTransport::new());
        let session = session_with(&transport, 2, Duration::from_secs(60));
        assert!(matches!(
            session.send(OutboundMessage::text(CHAT + 1, "wrong")).await,
            Err(SessionError::ChatMismatch { .. })
        ));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_closing_notice_failure_still_closes() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_sends(true);
        let session = session_with(&transport, 2, Duration::from_secs(60));

        assert!(matches!(
            session.cancel_by_bot().await,
            Err(SessionError::Transport(_))
        ));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_notice_carries_global_keyboard() {
        let transport = Arc::new(MockTransport::new());
        let mut env = session_env(transport.clone());
        env.keyboard = Some(ReplyMarkup::single_row_keyboard(true, &["/menu"]));
        let session = Session::new(1, CHAT, env);

        session.cancel_by_bot().await.unwrap();
        match &transport.sent()[0] {
            OutboundMessage::Text { markup, .. } => assert!(markup.is_some()),
            other => panic!("unexpected message {other:?}"),
        }
    }
}
