//! Connection manager: owns the single WebSocket, authenticates it, and
//! reconnects with exponential backoff after an unexpected close.
//!
//! The manager is driven by the client's event loop. Everything that touches
//! the network runs in spawned tasks that report back as [`TransportEvent`]s,
//! so the manager's own methods never block.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ClientError, Result};
use crate::messages::RequestFrame;

/// Lifecycle of the duplex connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Delay schedule for reconnecting after an unexpected close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    /// Ceiling applied to any single delay.
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based): `base_delay * 2^(attempt-1)`.
    /// `None` once the attempt cap is exceeded.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}

/// Report from a connection task or reconnect timer. `generation` ties the
/// event to the attempt that produced it; stale events are dropped.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    Opened {
        generation: u64,
        writer: mpsc::UnboundedSender<Message>,
    },
    OpenFailed {
        generation: u64,
        error: ClientError,
    },
    Frame {
        generation: u64,
        text: String,
    },
    Closed {
        generation: u64,
        code: Option<u16>,
        reason: String,
    },
    ReconnectDue {
        generation: u64,
    },
}

/// What the event loop has to do after the manager applied a [`TransportEvent`].
#[derive(Debug)]
pub(crate) enum Transition {
    Nothing,
    Opened,
    OpenFailed(ClientError),
    /// Inbound text frame, passed through unparsed.
    Frame(String),
    /// The open connection was lost.
    Dropped,
}

pub(crate) struct ConnectionManager {
    url: Url,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: ConnectionState,
    credential: Option<String>,
    reconnect_attempt: u32,
    /// Whether the in-flight handshake was started by the reconnect timer.
    reconnecting: bool,
    generation: u64,
    writer: Option<mpsc::UnboundedSender<Message>>,
    io_task: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl ConnectionManager {
    pub(crate) fn new(
        url: Url,
        policy: ReconnectPolicy,
        connect_timeout: Duration,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            url,
            policy,
            connect_timeout,
            events,
            state: ConnectionState::Disconnected,
            credential: None,
            reconnect_attempt: 0,
            reconnecting: false,
            generation: 0,
            writer: None,
            io_task: None,
            reconnect_timer: None,
            waiters: Vec::new(),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    /// Open a connection authenticated with `credential`, resolving `waiter`
    /// once the outcome is known. Joins an in-flight attempt with the same
    /// credential. Returns `true` if an open connection was torn down.
    pub(crate) fn connect(
        &mut self,
        credential: String,
        waiter: Option<oneshot::Sender<Result<()>>>,
    ) -> bool {
        let same_credential = self.credential.as_deref() == Some(credential.as_str());
        match self.state {
            ConnectionState::Open if same_credential => {
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(()));
                }
                return false;
            }
            ConnectionState::Connecting if same_credential => {
                self.waiters.extend(waiter);
                return false;
            }
            _ => {}
        }

        let dropped = self.state == ConnectionState::Open;
        self.teardown();
        self.resolve_waiters(Err(ClientError::ConnectionFailed(
            "superseded by a connection with a different credential".into(),
        )));
        self.credential = Some(credential);
        self.waiters.extend(waiter);
        self.start_handshake(false);
        dropped
    }

    /// Write one request frame to the open connection.
    pub(crate) fn send(&mut self, frame: &RequestFrame) -> Result<()> {
        if self.state != ConnectionState::Open {
            return Err(ClientError::NotConnected);
        }
        let writer = self.writer.as_ref().ok_or(ClientError::NotConnected)?;
        let json = frame.to_json()?;
        if writer.send(Message::Text(json)).is_err() {
            warn!(generation = self.generation, "writer task gone; dropping connection");
            self.teardown();
            return Err(ClientError::NotConnected);
        }
        Ok(())
    }

    /// Close the connection and cancel any pending reconnect. Idempotent.
    pub(crate) fn disconnect(&mut self) {
        self.cancel_reconnect();
        self.reconnecting = false;
        match self.state {
            ConnectionState::Open => {
                info!("closing connection");
                // Dropping the writer makes the writer task send a close frame;
                // the reader stays alive to observe the server's close reply.
                self.writer = None;
                self.state = ConnectionState::Closing;
            }
            ConnectionState::Connecting => {
                self.teardown();
            }
            ConnectionState::Disconnected | ConnectionState::Closing => {}
        }
        self.resolve_waiters(Err(ClientError::Disconnected));
    }

    /// Stop all tasks without waiting for the server.
    pub(crate) fn shutdown(&mut self) {
        self.cancel_reconnect();
        self.teardown();
        self.resolve_waiters(Err(ClientError::Disconnected));
    }

    pub(crate) fn handle_event(&mut self, event: TransportEvent) -> Transition {
        match event {
            TransportEvent::Opened { generation, writer } if generation == self.generation => {
                info!(generation, "connection open");
                self.state = ConnectionState::Open;
                self.writer = Some(writer);
                self.reconnect_attempt = 0;
                self.reconnecting = false;
                self.resolve_waiters(Ok(()));
                Transition::Opened
            }
            TransportEvent::OpenFailed { generation, error } if generation == self.generation => {
                warn!(generation, error = %error, "connection attempt failed");
                self.state = ConnectionState::Disconnected;
                self.io_task = None;
                self.resolve_waiters(Err(error.clone()));
                if self.reconnecting {
                    self.schedule_reconnect();
                }
                Transition::OpenFailed(error)
            }
            TransportEvent::Frame { generation, text } if generation == self.generation => {
                Transition::Frame(text)
            }
            TransportEvent::Closed {
                generation,
                code,
                reason,
            } if generation == self.generation => self.handle_close(code, reason),
            TransportEvent::ReconnectDue { generation } if generation == self.generation => {
                self.reconnect_timer = None;
                if self.state == ConnectionState::Disconnected && self.credential.is_some() {
                    info!(attempt = self.reconnect_attempt, "reconnecting");
                    self.start_handshake(true);
                }
                Transition::Nothing
            }
            stale => {
                debug!(?stale, "ignoring event from a previous connection");
                Transition::Nothing
            }
        }
    }

    fn handle_close(&mut self, code: Option<u16>, reason: String) -> Transition {
        self.writer = None;
        self.io_task = None;
        let previous = self.state;
        self.state = ConnectionState::Disconnected;
        if previous == ConnectionState::Closing {
            debug!("connection closed");
            return Transition::Nothing;
        }

        warn!(?code, reason = %reason, "connection lost");
        if code == Some(u16::from(CloseCode::Policy)) {
            warn!("server rejected the credential; not reconnecting");
        } else {
            self.schedule_reconnect();
        }
        Transition::Dropped
    }

    fn schedule_reconnect(&mut self) {
        let attempt = self.reconnect_attempt + 1;
        let Some(delay) = self.policy.delay_for(attempt) else {
            warn!(
                attempts = self.reconnect_attempt,
                "reconnect attempts exhausted; waiting for an explicit connect"
            );
            self.reconnecting = false;
            return;
        };
        self.reconnect_attempt = attempt;
        self.generation += 1;
        let generation = self.generation;
        info!(attempt, ?delay, "scheduling reconnect");

        let events = self.events.clone();
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(TransportEvent::ReconnectDue { generation });
        }));
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
            // The timer may have fired with its event still queued.
            self.generation += 1;
        }
    }

    fn start_handshake(&mut self, reconnecting: bool) {
        let Some(credential) = self.credential.clone() else {
            return;
        };
        self.cancel_reconnect();
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        self.reconnecting = reconnecting;

        let url = authenticated_url(&self.url, &credential);
        debug!(generation = self.generation, endpoint = %self.url, "opening connection");
        self.io_task = Some(tokio::spawn(run_connection(
            url,
            self.generation,
            self.connect_timeout,
            self.events.clone(),
        )));
    }

    /// Treat the manager as holding an open socket that writes into `writer`.
    #[cfg(test)]
    pub(crate) fn assume_open(&mut self, credential: &str, writer: mpsc::UnboundedSender<Message>) {
        self.credential = Some(credential.to_string());
        self.generation += 1;
        self.state = ConnectionState::Open;
        self.writer = Some(writer);
    }

    /// Abort the current connection (if any) without a close handshake.
    fn teardown(&mut self) {
        if let Some(task) = self.io_task.take() {
            task.abort();
        }
        self.writer = None;
        self.generation += 1;
        self.state = ConnectionState::Disconnected;
    }

    fn resolve_waiters(&mut self, outcome: Result<()>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// `base` with the credential attached as the `token` query parameter.
pub(crate) fn authenticated_url(base: &Url, credential: &str) -> Url {
    let retained: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(key, _)| key != "token")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    let mut url = base.clone();
    url.set_query(None);
    url.query_pairs_mut()
        .extend_pairs(retained)
        .append_pair("token", credential);
    url
}

/// Handshake, then pump inbound frames until the socket closes.
async fn run_connection(
    url: Url,
    generation: u64,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let handshake = tokio::time::timeout(
        connect_timeout,
        tokio_tungstenite::connect_async(url.as_str()),
    )
    .await;
    let ws_stream = match handshake {
        Ok(Ok((ws_stream, _))) => ws_stream,
        Ok(Err(e)) => {
            let _ = events.send(TransportEvent::OpenFailed {
                generation,
                error: ClientError::from(e),
            });
            return;
        }
        Err(_) => {
            let _ = events.send(TransportEvent::OpenFailed {
                generation,
                error: ClientError::ConnectionFailed(format!(
                    "handshake timed out after {:?}",
                    connect_timeout
                )),
            });
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();
    let (writer, mut outbound) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if write.send(message).await.is_err() {
                return;
            }
        }
        let _ = write.close().await;
    });

    if events
        .send(TransportEvent::Opened { generation, writer })
        .is_err()
    {
        return;
    }

    let mut code = None;
    let mut reason = String::new();
    while let Some(item) = read.next().await {
        match item {
            Ok(Message::Text(text)) => {
                if events.send(TransportEvent::Frame { generation, text }).is_err() {
                    return;
                }
            }
            Ok(Message::Close(frame)) => {
                if let Some(frame) = frame {
                    code = Some(u16::from(frame.code));
                    reason = frame.reason.into_owned();
                }
                break;
            }
            Ok(_) => {}
            Err(e) => {
                reason = e.to_string();
                break;
            }
        }
    }
    let _ = events.send(TransportEvent::Closed {
        generation,
        code,
        reason,
    });
}
