//! Caller-facing client handle and the event loop behind it.
//!
//! One spawned task owns the [`ConnectionManager`] and the [`Correlator`].
//! Caller commands, transport events and exchange deadlines are handled one
//! at a time on that task, so neither component needs a lock.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::ClientSettings;
use crate::connection::{ConnectionManager, ConnectionState, TransportEvent, Transition};
use crate::correlator::{Correlator, Reply, UpdateSink};
use crate::credentials::CredentialSource;
use crate::error::{ClientError, Result};
use crate::messages::RequestFrame;

/// Longest prompt the server accepts, in characters.
pub const MAX_PROMPT_CHARS: usize = 5000;

/// Snapshot of the connection for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub reconnect_attempt: u32,
    pub active_exchanges: usize,
}

enum Command {
    Connect {
        credential: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Submit {
        prompt: String,
        conversation_id: Option<i64>,
        on_update: Option<UpdateSink>,
        reply: oneshot::Sender<Result<Reply>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<ConnectionStatus>,
    },
}

/// Handle to a running client. Cheap to clone; the event loop stops when the
/// last handle is dropped, failing any pending exchange with `Disconnected`.
#[derive(Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
}

impl Client {
    /// Spawn the event loop on the current tokio runtime.
    pub fn new<C>(settings: ClientSettings, credentials: C) -> Self
    where
        C: CredentialSource + 'static,
    {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let session = Session {
            connection: ConnectionManager::new(
                settings.url,
                settings.reconnect,
                settings.connect_timeout,
                events,
            ),
            correlator: Correlator::new(settings.idle_timeout, settings.total_timeout),
            credentials: Arc::new(credentials),
            awaiting_open: Vec::new(),
        };
        tokio::spawn(session.run(command_rx, event_rx));
        Self { commands }
    }

    /// Open (or reuse) the connection authenticated with `credential`.
    pub async fn connect(&self, credential: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Connect {
            credential: credential.into(),
            reply,
        })?;
        rx.await.map_err(|_| ClientError::Shutdown)?
    }

    /// Send a prompt and wait for the final reply.
    pub async fn submit(&self, prompt: &str, conversation_id: Option<i64>) -> Result<Reply> {
        self.submit_inner(prompt, conversation_id, None).await
    }

    /// Like [`submit`](Self::submit), calling `on_update` with the cumulative
    /// content and conversation id for every chunk of this exchange.
    pub async fn submit_with_updates<F>(
        &self,
        prompt: &str,
        conversation_id: Option<i64>,
        on_update: F,
    ) -> Result<Reply>
    where
        F: FnMut(&str, Option<i64>) + Send + 'static,
    {
        self.submit_inner(prompt, conversation_id, Some(Box::new(on_update)))
            .await
    }

    /// Close the connection and fail every pending exchange with `Disconnected`.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send_command(Command::Disconnect { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn status(&self) -> Result<ConnectionStatus> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Status { reply })?;
        rx.await.map_err(|_| ClientError::Shutdown)
    }

    async fn submit_inner(
        &self,
        prompt: &str,
        conversation_id: Option<i64>,
        on_update: Option<UpdateSink>,
    ) -> Result<Reply> {
        let prompt = validate_prompt(prompt)?;
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Submit {
            prompt,
            conversation_id,
            on_update,
            reply,
        })?;
        rx.await.map_err(|_| ClientError::Shutdown)?
    }

    fn send_command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::Shutdown)
    }
}

/// Trim the prompt and enforce the server's length limits.
pub fn validate_prompt(prompt: &str) -> Result<String> {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return Err(ClientError::InvalidPrompt("Message cannot be empty".into()));
    }
    if trimmed.chars().count() > MAX_PROMPT_CHARS {
        return Err(ClientError::InvalidPrompt("Message is too long".into()));
    }
    Ok(trimmed.to_string())
}

struct Session {
    connection: ConnectionManager,
    correlator: Correlator,
    credentials: Arc<dyn CredentialSource>,
    /// Requests registered while the connection was not yet open.
    awaiting_open: Vec<RequestFrame>,
}

impl Session {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            let deadline = self.correlator.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
                _ = sleep_until(deadline) => {
                    self.correlator.expire(Instant::now());
                }
            }
        }

        debug!("all client handles dropped; shutting down");
        self.connection.shutdown();
        self.awaiting_open.clear();
        self.correlator.fail_all(ClientError::Disconnected);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { credential, reply } => {
                if self.connection.connect(credential, Some(reply)) {
                    self.connection_lost();
                }
            }
            Command::Submit {
                prompt,
                conversation_id,
                on_update,
                reply,
            } => {
                let frame = self
                    .correlator
                    .register(prompt, conversation_id, on_update, reply);
                self.dispatch(frame);
            }
            Command::Disconnect { reply } => {
                self.connection.disconnect();
                self.awaiting_open.clear();
                let failed = self.correlator.fail_all(ClientError::Disconnected);
                info!(failed, "disconnected");
                let _ = reply.send(());
            }
            Command::Status { reply } => {
                let _ = reply.send(ConnectionStatus {
                    state: self.connection.state(),
                    reconnect_attempt: self.connection.reconnect_attempt(),
                    active_exchanges: self.correlator.len(),
                });
            }
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match self.connection.handle_event(event) {
            Transition::Nothing => {}
            Transition::Frame(text) => self.correlator.handle_text(&text),
            Transition::Opened => {
                for frame in std::mem::take(&mut self.awaiting_open) {
                    if self.correlator.contains(&frame.request_id) {
                        self.dispatch(frame);
                    }
                }
            }
            Transition::OpenFailed(error) => {
                for frame in std::mem::take(&mut self.awaiting_open) {
                    self.correlator.fail(&frame.request_id, error.clone());
                }
            }
            Transition::Dropped => self.connection_lost(),
        }
    }

    /// Send `frame` now, or open the connection first and send it once open.
    fn dispatch(&mut self, frame: RequestFrame) {
        match self.connection.state() {
            ConnectionState::Open => match self.connection.send(&frame) {
                Ok(()) => return,
                Err(ClientError::NotConnected) => {
                    // Exchanges already written to the dead socket will never settle.
                    let failed = self
                        .correlator
                        .fail_all_except(&frame.request_id, ClientError::Disconnected);
                    info!(failed, "connection lost while sending; reconnecting");
                }
                Err(e) => {
                    self.correlator.fail(&frame.request_id, e);
                    return;
                }
            },
            ConnectionState::Connecting => {
                self.awaiting_open.push(frame);
                return;
            }
            ConnectionState::Disconnected | ConnectionState::Closing => {}
        }

        match self.credentials.credential() {
            Ok(credential) => {
                if self.connection.connect(credential, None) {
                    self.connection_lost();
                }
                self.awaiting_open.push(frame);
            }
            Err(e) => {
                self.correlator.fail(&frame.request_id, e);
            }
        }
    }

    fn connection_lost(&mut self) {
        self.awaiting_open.clear();
        let failed = self.correlator.fail_all(ClientError::Disconnected);
        if failed > 0 {
            info!(failed, "pending exchanges failed after connection loss");
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ReconnectPolicy;
    use crate::credentials::StaticCredential;
    use std::time::Duration;

    #[tokio::test]
    async fn submit_on_dead_socket_reconnects_and_parks_the_request() {
        let (events, _event_rx) = mpsc::unbounded_channel();
        let mut connection = ConnectionManager::new(
            "ws://127.0.0.1:9/ws".parse().unwrap(),
            ReconnectPolicy::default(),
            Duration::from_secs(1),
            events,
        );
        let (writer, outbound) = mpsc::unbounded_channel();
        drop(outbound);
        connection.assume_open("t", writer);

        let mut session = Session {
            connection,
            correlator: Correlator::new(Duration::from_secs(60), Duration::from_secs(300)),
            credentials: Arc::new(StaticCredential::new("t")),
            awaiting_open: Vec::new(),
        };
        let (earlier_reply, mut earlier) = oneshot::channel();
        let sent = session
            .correlator
            .register("first".into(), None, None, earlier_reply);

        let (reply, _rx) = oneshot::channel();
        session.handle_command(Command::Submit {
            prompt: "second".into(),
            conversation_id: None,
            on_update: None,
            reply,
        });

        assert_eq!(session.connection.state(), ConnectionState::Connecting);
        assert_eq!(session.awaiting_open.len(), 1);
        let parked = &session.awaiting_open[0];
        assert_eq!(parked.message, "second");
        assert!(session.correlator.contains(&parked.request_id));
        assert!(!session.correlator.contains(&sent.request_id));
        assert!(matches!(earlier.try_recv(), Ok(Err(ClientError::Disconnected))));
    }
}
