//! Streaming chat client: many prompt/response exchanges multiplexed over one
//! authenticated WebSocket, each routed by its correlation token.
//! Used by the `chat-stream` CLI.

pub mod client;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod credentials;
pub mod error;
pub mod messages;

pub use client::{validate_prompt, Client, ConnectionStatus, MAX_PROMPT_CHARS};
pub use config::{default_config_path, ClientSettings, Config};
pub use connection::{ConnectionState, ReconnectPolicy};
pub use correlator::{Correlator, ExchangeState, Reply, UpdateSink};
pub use credentials::{CredentialSource, EnvCredential, StaticCredential};
pub use error::{ClientError, ConfigError, Result};
pub use messages::{RequestFrame, ServerFrame};
