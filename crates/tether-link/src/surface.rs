//! [`SurfaceSession`] – request/response exchange with the control station.
//!
//! One session serves one accepted connection.  Each inbound read is treated
//! as exactly one msgpack map of commands; each reply is exactly one msgpack
//! map holding the current surface-owned telemetry.  The transport does not
//! frame messages, so this relies on the client sending one map per write and
//! waiting for the reply before sending the next.
//!
//! ```text
//! Listening ──accept──▶ Connected ──▶ Exchanging ──close/error──▶ Disconnecting ──▶ Listening
//! ```
//!
//! Undecodable input is logged and skipped; the reply is still sent.  The
//! session ends when the peer closes, on a transport error, or when a decoded
//! command names a key no peripheral owns.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tether_store::StateStore;
use tether_types::{DeviceId, StateMap, TetherError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::codec;

/// Lifecycle of the surface link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    /// Waiting for a client to connect.
    Listening,
    /// A client was accepted.
    Connected,
    /// Commands and telemetry are flowing.
    Exchanging,
    /// Cleanup is running; peripheral commands are being reset.
    Disconnecting,
}

/// Where the surface listener binds and how much it reads per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum size of one inbound message.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    50_000
}
fn default_buffer_size() -> usize {
    4_096
}

impl SurfaceConfig {
    /// `host:port` string suitable for `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// One accepted surface connection.
pub struct SurfaceSession<S> {
    stream: S,
    peer: String,
    store: Arc<StateStore>,
    buffer: Vec<u8>,
    state: Arc<watch::Sender<SurfaceState>>,
}

impl<S> SurfaceSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an accepted `stream` and report [`SurfaceState::Connected`].
    pub fn new(
        stream: S,
        peer: impl Into<String>,
        store: Arc<StateStore>,
        buffer_size: usize,
        state: Arc<watch::Sender<SurfaceState>>,
    ) -> Self {
        state.send_replace(SurfaceState::Connected);
        Self {
            stream,
            peer: peer.into(),
            store,
            buffer: vec![0u8; buffer_size.max(1)],
            state,
        }
    }

    /// Exchange messages until the peer closes (`Ok`) or a failure ends the
    /// session (`Err`).  Always follow with [`cleanup`][Self::cleanup].
    ///
    /// # Errors
    ///
    /// * [`TetherError::Transport`] – reading or writing the socket failed.
    /// * [`TetherError::Schema`] – a command named a key no peripheral owns
    ///   or carried the wrong value type.
    pub async fn run(&mut self) -> Result<(), TetherError> {
        self.state.send_replace(SurfaceState::Exchanging);
        loop {
            let n = self.stream.read(&mut self.buffer).await?;
            if n == 0 {
                info!(peer = %self.peer, "connection closed by client");
                return Ok(());
            }

            match codec::decode_state(&self.buffer[..n]) {
                Ok(commands) if commands.is_empty() => {}
                Ok(commands) => self.store.set(DeviceId::Surface, false, commands)?,
                Err(e) => {
                    warn!(peer = %self.peer, bytes = n, error = %e, "failed to decode surface message");
                }
            }

            let telemetry = self.store.snapshot(DeviceId::Surface)?;
            let reply = codec::encode_state(&telemetry)?;
            self.stream.write_all(&reply).await?;
            self.stream.flush().await?;
        }
    }

    /// Reset every peripheral command map to its defaults, then shut the
    /// connection down.  Errors are logged, never returned.
    pub async fn cleanup(mut self) {
        self.state.send_replace(SurfaceState::Disconnecting);
        if let Err(e) = self.store.set(DeviceId::Surface, true, StateMap::new()) {
            error!(peer = %self.peer, error = %e, "failed to reset peripheral commands");
        }
        if let Err(e) = self.stream.shutdown().await {
            debug!(peer = %self.peer, error = %e, "ignoring an error while closing the connection");
        }
    }
}
