//! Per-session handling loop

use super::{ChatGate, Dispatcher};
use crate::config::NoticeKind;
use crate::handler::{HandlerArgs, HandlerError};
use crate::session::{FirstEvent, Session};
use crate::store::StoreError;
use crate::update::SessionId;
use std::sync::Arc;

impl Dispatcher {
    /// Start the handling loop of a session. With a gate, the loop waits
    /// for the out-of-band message holding it.
    pub(super) fn spawn_loop(self: &Arc<Self>, session: Arc<Session>, gate: Option<ChatGate>) {
        let dispatcher = Arc::clone(self);
        self.tracker.spawn(async move {
            if let Some(gate) = gate {
                drop(gate.lock().await);
                dispatcher.table.lock().await.release_gate(session.chat_id(), &gate);
            }
            dispatcher.handle_session(session).await;
        });
    }

    /// Run conversations until the session has nothing left to do.
    ///
    /// The "mailbox empty, so detach" decision is taken under the routing
    /// lock, so a concurrent dispatch either lands in the mailbox before it
    /// or starts a new session after it.
    async fn handle_session(self: Arc<Self>, session: Arc<Session>) {
        let id = session.id();
        let chat_id = session.chat_id();
        tracing::debug!(session_id = id, chat_id, "Session loop started");

        loop {
            let first = {
                let mut table = self.table.lock().await;
                let Some(first) = session.get_first_event() else {
                    table.detach(&session);
                    break;
                };
                first
            };
            self.run_conversation(&session, first).await;
        }

        session.finish().await;
        self.clear_record(id);
        tracing::info!(session_id = id, chat_id, reason = ?session.close_reason(), "Session finished");
    }

    async fn run_conversation(&self, session: &Arc<Session>, first: FirstEvent) {
        let id = session.id();
        let resumed = first.is_resumed();
        let first_event = first.into_update();

        if !resumed {
            match self.store.start_with_event(id, session.chat_id(), &first_event) {
                Ok(()) => {}
                Err(StoreError::Sealed) => {
                    tracing::debug!(session_id = id, "Store sealed, conversation not persisted");
                }
                Err(e) => {
                    tracing::error!(session_id = id, error = %e, "Cannot persist conversation start");
                }
            }
        }

        let mut handler = self.router.build(HandlerArgs {
            session: session.clone(),
            first_event,
        });
        let result = handler.execute(id, &self.store).await;

        match &result {
            Ok(()) => {}
            Err(HandlerError::Closed) => {
                if let Err(e) = session.cancel_by_bot().await {
                    tracing::warn!(session_id = id, error = %e, "Failed to send closing notice");
                }
            }
            Err(e) => {
                tracing::error!(
                    session_id = id,
                    error = %e,
                    fatal = e.is_fatal_configuration(),
                    "Handler failed"
                );
                self.notice_unless_closed(session, NoticeKind::UserError).await;
            }
        }

        self.clear_record(id);

        if result.is_ok() {
            self.notice_unless_closed(session, NoticeKind::ConversationEnded)
                .await;
        }
        session.mark_idle();
    }

    async fn notice_unless_closed(&self, session: &Session, kind: NoticeKind) {
        if session.is_closed() {
            return;
        }
        if let Err(e) = session.send_notice(kind).await {
            tracing::warn!(session_id = session.id(), error = %e, ?kind, "Failed to send notice");
        }
    }

    /// Drop the persisted state of a session. A sealed store keeps it so
    /// the session resumes after a restart.
    fn clear_record(&self, id: SessionId) {
        match self.store.remove(id) {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(StoreError::Sealed) => {
                tracing::debug!(session_id = id, "Store sealed, record kept for resume");
            }
            Err(e) => tracing::error!(session_id = id, error = %e, "Cannot clear session record"),
        }
    }
}
