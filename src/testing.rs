//! Mock implementations for testing
//!
//! These mocks let the engine run end to end without a real platform.

use crate::config::Notices;
use crate::session::SessionEnv;
use crate::transport::{OutboundMessage, SentMessage, Transport, TransportError};
use crate::update::{ChatId, MessageId};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Mock Transport
// ============================================================================

/// Transport that records everything it is asked to send
pub struct MockTransport {
    sent: Mutex<Vec<OutboundMessage>>,
    answered: Mutex<Vec<String>>,
    fail: AtomicBool,
    next_message_id: AtomicI64,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            answered: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            next_message_id: AtomicI64::new(1000),
            delay: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every send takes this long
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make subsequent sends fail
    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn answered(&self) -> Vec<String> {
        self.answered.lock().unwrap().clone()
    }

    /// Texts of the plain text messages sent to a chat, in order
    pub fn texts_for(&self, chat: ChatId) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                OutboundMessage::Text { chat_id, text, .. } if chat_id == chat => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Highest number of sends observed running at the same time
    pub fn max_concurrent_sends(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Poll until `text` was sent to `chat` or the timeout elapses
    pub async fn wait_for_text(&self, chat: ChatId, text: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.texts_for(chat).iter().any(|t| t == text) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, message: OutboundMessage) -> Result<SentMessage, TransportError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::retryable("mock transport failure"));
        }
        self.sent.lock().unwrap().push(message);
        let message_id: MessageId = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        Ok(SentMessage { message_id })
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::new("mock transport failure"));
        }
        self.answered.lock().unwrap().push(callback_id.to_string());
        Ok(())
    }
}

/// Session environment with default notices and generous limits
pub fn session_env(transport: Arc<MockTransport>) -> SessionEnv {
    SessionEnv {
        transport,
        notices: Arc::new(Notices::default()),
        keyboard: None,
        mailbox_capacity: 8,
        inactivity_timeout: Duration::from_secs(60),
        cancel: CancellationToken::new(),
    }
}

// ============================================================================
// Step log
// ============================================================================

/// Shared, ordered record of which steps ran
#[derive(Clone, Default)]
pub struct StepLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl StepLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }
}
