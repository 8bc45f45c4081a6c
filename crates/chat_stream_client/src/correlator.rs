//! Exchange correlator: routes inbound frames to the exchange whose
//! correlation token they carry, and settles each exchange exactly once.
//!
//! Frames are never broadcast. A frame whose token is unknown (already
//! settled, timed out, or never issued) is dropped without touching any
//! other exchange.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ClientError, Result};
use crate::messages::{RequestFrame, ServerFrame};

/// Sink invoked with `(cumulative content, conversation id)` for every chunk of one exchange.
pub type UpdateSink = Box<dyn FnMut(&str, Option<i64>) + Send>;

/// Final result of a successful exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub content: String,
    pub conversation_id: Option<i64>,
}

/// Progress of an exchange that has not settled yet. Completed and failed
/// exchanges leave the correlator as they settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Pending,
    Streaming,
}

struct Exchange {
    state: ExchangeState,
    latest_content: String,
    conversation_id: Option<i64>,
    on_update: Option<UpdateSink>,
    settle: oneshot::Sender<Result<Reply>>,
    started: Instant,
    last_activity: Instant,
}

impl Exchange {
    fn deadline(&self, idle_timeout: Duration, total_timeout: Duration) -> Instant {
        (self.last_activity + idle_timeout).min(self.started + total_timeout)
    }
}

/// Table of in-flight exchanges keyed by correlation token.
pub struct Correlator {
    exchanges: HashMap<String, Exchange>,
    idle_timeout: Duration,
    total_timeout: Duration,
}

impl Correlator {
    /// `idle_timeout` bounds the silence between frames of one exchange,
    /// `total_timeout` bounds its whole lifetime.
    pub fn new(idle_timeout: Duration, total_timeout: Duration) -> Self {
        Self {
            exchanges: HashMap::new(),
            idle_timeout,
            total_timeout,
        }
    }

    /// Register a pending exchange under a fresh token and return the request
    /// frame to send for it. `settle` receives the final outcome.
    pub fn register(
        &mut self,
        prompt: String,
        conversation_id: Option<i64>,
        on_update: Option<UpdateSink>,
        settle: oneshot::Sender<Result<Reply>>,
    ) -> RequestFrame {
        let mut token = Uuid::new_v4().to_string();
        while self.exchanges.contains_key(&token) {
            token = Uuid::new_v4().to_string();
        }
        let now = Instant::now();
        self.exchanges.insert(
            token.clone(),
            Exchange {
                state: ExchangeState::Pending,
                latest_content: String::new(),
                conversation_id,
                on_update,
                settle,
                started: now,
                last_activity: now,
            },
        );
        debug!(token = %token, "exchange registered");
        RequestFrame::new(token, prompt, conversation_id)
    }

    /// Parse one inbound text frame and apply it. Malformed frames are ignored.
    pub fn handle_text(&mut self, text: &str) {
        match ServerFrame::parse(text) {
            Ok(frame) => self.handle_frame(frame),
            Err(e) => debug!(error = %e, "ignoring unparsable frame"),
        }
    }

    pub fn handle_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::Chunk {
                token,
                content,
                conversation_id,
            } => {
                let Some(exchange) = self.exchanges.get_mut(&token) else {
                    debug!(token = %token, "chunk for unknown exchange");
                    return;
                };
                exchange.state = ExchangeState::Streaming;
                exchange.last_activity = Instant::now();
                exchange.latest_content = content;
                if conversation_id.is_some() {
                    exchange.conversation_id = conversation_id;
                }
                if let Some(on_update) = exchange.on_update.as_mut() {
                    on_update(&exchange.latest_content, exchange.conversation_id);
                }
            }
            ServerFrame::Complete {
                token,
                conversation_id,
            } => {
                let Some(exchange) = self.exchanges.remove(&token) else {
                    debug!(token = %token, "completion for unknown exchange");
                    return;
                };
                debug!(token = %token, "exchange completed");
                let reply = Reply {
                    content: exchange.latest_content,
                    conversation_id: conversation_id.or(exchange.conversation_id),
                };
                let _ = exchange.settle.send(Ok(reply));
            }
            ServerFrame::Error {
                token: Some(token),
                detail,
            } => {
                if !self.fail(&token, ClientError::StreamFailed(detail)) {
                    debug!(token = %token, "error for unknown exchange");
                }
            }
            ServerFrame::Error { token: None, detail } => {
                warn!(detail = %detail, "server error not tied to any exchange");
            }
        }
    }

    /// Reject one exchange. Returns `false` if the token is not active.
    pub fn fail(&mut self, token: &str, error: ClientError) -> bool {
        let Some(exchange) = self.exchanges.remove(token) else {
            return false;
        };
        debug!(token = %token, error = %error, "exchange failed");
        let _ = exchange.settle.send(Err(error));
        true
    }

    /// Reject every active exchange with `reason` and clear the table.
    pub fn fail_all(&mut self, reason: ClientError) -> usize {
        let count = self.exchanges.len();
        for (token, exchange) in self.exchanges.drain() {
            debug!(token = %token, error = %reason, "exchange failed");
            let _ = exchange.settle.send(Err(reason.clone()));
        }
        count
    }

    /// Reject every active exchange except `keep` with `reason`.
    pub fn fail_all_except(&mut self, keep: &str, reason: ClientError) -> usize {
        let tokens: Vec<String> = self
            .exchanges
            .keys()
            .filter(|token| token.as_str() != keep)
            .cloned()
            .collect();
        for token in &tokens {
            self.fail(token, reason.clone());
        }
        tokens.len()
    }

    /// Earliest instant at which some exchange times out.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.exchanges
            .values()
            .map(|exchange| exchange.deadline(self.idle_timeout, self.total_timeout))
            .min()
    }

    /// Reject exchanges whose deadline has passed at `now` with `Timeout`, and
    /// drop exchanges whose caller stopped waiting. Returns how many timed out.
    pub fn expire(&mut self, now: Instant) -> usize {
        let (idle_timeout, total_timeout) = (self.idle_timeout, self.total_timeout);
        self.exchanges
            .retain(|_, exchange| !exchange.settle.is_closed());

        let expired: Vec<String> = self
            .exchanges
            .iter()
            .filter(|(_, exchange)| exchange.deadline(idle_timeout, total_timeout) <= now)
            .map(|(token, _)| token.clone())
            .collect();
        for token in &expired {
            warn!(token = %token, "exchange timed out");
            self.fail(token, ClientError::Timeout);
        }
        expired.len()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.exchanges.contains_key(token)
    }

    pub fn state(&self, token: &str) -> Option<ExchangeState> {
        self.exchanges.get(token).map(|exchange| exchange.state)
    }

    pub fn latest_content(&self, token: &str) -> Option<&str> {
        self.exchanges
            .get(token)
            .map(|exchange| exchange.latest_content.as_str())
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}
