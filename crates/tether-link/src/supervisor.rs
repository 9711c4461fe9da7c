//! [`Supervisor`] – keeps every link alive for the life of the process.
//!
//! One task serves the surface listener and one task drives each configured
//! serial port.  Each task runs its session to completion, cleans up, and
//! starts over; a failure in one never touches the others.  Failed accepts and
//! connects are retried forever with a capped exponential [`Backoff`].
//!
//! ```text
//! surface task:     accept  → SurfaceSession::run    → cleanup → accept …
//! peripheral task:  connect → PeripheralSession::run → cleanup → connect …
//!                                    │
//!                                    ▼
//!                               StateStore (shared)
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tether_store::StateStore;
use tether_types::TetherError;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::backoff::{Backoff, BackoffConfig};
use crate::peripheral::{PeripheralSession, PeripheralState};
use crate::surface::{SurfaceConfig, SurfaceSession, SurfaceState};
use crate::transport::{Connector, SerialConfig};

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Everything needed to start the bridge.
pub struct Supervisor<C> {
    store: Arc<StateStore>,
    surface: SurfaceConfig,
    serial: SerialConfig,
    backoff: BackoffConfig,
    connectors: Vec<C>,
}

impl<C: Connector> Supervisor<C> {
    /// Build a supervisor with one peripheral loop per connector.
    pub fn new(
        store: Arc<StateStore>,
        surface: SurfaceConfig,
        serial: SerialConfig,
        backoff: BackoffConfig,
        connectors: Vec<C>,
    ) -> Self {
        Self {
            store,
            surface,
            serial,
            backoff,
            connectors,
        }
    }

    /// Bind the surface listener and spawn every loop.  Returns as soon as the
    /// tasks are running.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Transport`] if the surface listener cannot bind.
    /// Nothing after startup is reported here; session failures are logged and
    /// retried by their loops.
    pub async fn start(self) -> Result<SupervisorHandle, TetherError> {
        let listener = TcpListener::bind(self.surface.bind_addr()).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "surface listener bound");

        let mut tasks = JoinSet::new();

        let surface_state = Arc::new(watch::Sender::new(SurfaceState::Listening));
        tasks.spawn(
            surface_loop(
                listener,
                Arc::clone(&self.store),
                self.surface.buffer_size,
                self.backoff,
                Arc::clone(&surface_state),
            )
            .instrument(info_span!("surface", addr = %local_addr)),
        );

        let mut peripheral_states = Vec::with_capacity(self.connectors.len());
        for connector in self.connectors {
            let port = connector.port().to_string();
            let state = Arc::new(watch::Sender::new(PeripheralState::Connecting));
            tasks.spawn(
                peripheral_loop(
                    connector,
                    Arc::clone(&self.store),
                    self.serial.clone(),
                    self.backoff,
                    Arc::clone(&state),
                )
                .instrument(info_span!("peripheral", port = %port)),
            );
            peripheral_states.push((port, state));
        }

        info!(peripherals = peripheral_states.len(), "supervisor started");
        Ok(SupervisorHandle {
            local_addr,
            surface_state,
            peripheral_states,
            tasks,
        })
    }
}

// ---------------------------------------------------------------------------
// SupervisorHandle
// ---------------------------------------------------------------------------

/// Observes and controls the running loops.  Dropping the handle aborts them.
pub struct SupervisorHandle {
    local_addr: SocketAddr,
    surface_state: Arc<watch::Sender<SurfaceState>>,
    peripheral_states: Vec<(String, Arc<watch::Sender<PeripheralState>>)>,
    tasks: JoinSet<()>,
}

impl SupervisorHandle {
    /// Address the surface listener actually bound (useful with port `0`).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn surface_state(&self) -> SurfaceState {
        *self.surface_state.borrow()
    }

    pub fn subscribe_surface(&self) -> watch::Receiver<SurfaceState> {
        self.surface_state.subscribe()
    }

    /// Current state of every serial port, in configuration order.
    pub fn peripheral_states(&self) -> Vec<(String, PeripheralState)> {
        self.peripheral_states
            .iter()
            .map(|(port, state)| (port.clone(), state.borrow().clone()))
            .collect()
    }

    pub fn subscribe_peripheral(&self, port: &str) -> Option<watch::Receiver<PeripheralState>> {
        self.peripheral_states
            .iter()
            .find(|(p, _)| p == port)
            .map(|(_, state)| state.subscribe())
    }

    /// Wait for every loop to finish.  The loops never return on their own,
    /// so this only resolves after [`abort`][Self::abort] or a panic.
    ///
    /// # Errors
    ///
    /// Returns the [`JoinError`] of the first loop that panicked.
    pub async fn wait(mut self) -> Result<(), JoinError> {
        while let Some(result) = self.tasks.join_next().await {
            match result {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Stop every loop.  Sessions in flight are dropped without cleanup.
    pub fn abort(&mut self) {
        self.tasks.abort_all();
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

async fn surface_loop(
    listener: TcpListener,
    store: Arc<StateStore>,
    buffer_size: usize,
    backoff: BackoffConfig,
    state: Arc<watch::Sender<SurfaceState>>,
) {
    let mut backoff = Backoff::new(backoff);
    loop {
        state.send_replace(SurfaceState::Listening);
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => {
                backoff.reset();
                accepted
            }
            Err(e) => {
                warn!(error = %e, "failed to accept a surface connection");
                backoff.wait().await;
                continue;
            }
        };
        info!(%peer, "surface client connected");

        let mut session = SurfaceSession::new(
            stream,
            peer.to_string(),
            Arc::clone(&store),
            buffer_size,
            Arc::clone(&state),
        );
        match session.run().await {
            Ok(()) => {}
            Err(e @ TetherError::Schema { .. }) => {
                error!(%peer, error = %e, "surface sent a command outside the schema");
            }
            Err(e) => warn!(%peer, error = %e, "surface session failed"),
        }
        session.cleanup().await;
        info!(%peer, "surface client disconnected, peripheral commands reset");
    }
}

async fn peripheral_loop<C: Connector>(
    connector: C,
    store: Arc<StateStore>,
    serial: SerialConfig,
    backoff: BackoffConfig,
    state: Arc<watch::Sender<PeripheralState>>,
) {
    let mut backoff = Backoff::new(backoff);
    loop {
        state.send_replace(PeripheralState::Connecting);
        let link = match connector.connect().await {
            Ok(link) => {
                backoff.reset();
                link
            }
            Err(e) => {
                debug!(error = %e, "failed to open serial port");
                backoff.wait().await;
                continue;
            }
        };
        info!("serial port opened");

        let mut session = PeripheralSession::new(
            connector.port(),
            link,
            Arc::clone(&store),
            &serial,
            Arc::clone(&state),
        );
        let reason = session.run().await;
        let device = store.roster().label(session.identity());
        warn!(%device, error = %reason, "peripheral session ended");
        session.cleanup();
        backoff.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::test_support::{A, frame, store};
    use async_trait::async_trait;
    use std::io;
    use tether_types::{DeviceId, StateMap, Value};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::net::TcpStream;
    use tokio::sync::{Mutex, mpsc};

    const PORT: &str = "/dev/ttyTEST0";

    /// Hands out links pushed through a channel, one per connect.
    struct ChannelConnector {
        links: Mutex<mpsc::Receiver<DuplexStream>>,
    }

    impl ChannelConnector {
        fn new() -> (Self, mpsc::Sender<DuplexStream>) {
            let (tx, rx) = mpsc::channel(4);
            (
                Self {
                    links: Mutex::new(rx),
                },
                tx,
            )
        }
    }

    #[async_trait]
    impl Connector for ChannelConnector {
        type Link = DuplexStream;

        fn port(&self) -> &str {
            PORT
        }

        async fn connect(&self) -> io::Result<DuplexStream> {
            self.links
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no more links"))
        }
    }

    fn loopback() -> SurfaceConfig {
        SurfaceConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..SurfaceConfig::default()
        }
    }

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            initial_backoff_ms: 0,
            max_backoff_ms: 10,
        }
    }

    async fn start(
        store: Arc<StateStore>,
        connectors: Vec<ChannelConnector>,
    ) -> SupervisorHandle {
        Supervisor::new(
            store,
            loopback(),
            SerialConfig::default(),
            fast_backoff(),
            connectors,
        )
        .start()
        .await
        .unwrap()
    }

    // Plug a new in-memory device into the connector and identify it as A_A.
    async fn plug_in(links: &mpsc::Sender<DuplexStream>) -> BufReader<DuplexStream> {
        let (device, link) = tokio::io::duplex(4_096);
        links.send(link).await.unwrap();
        let mut device = BufReader::new(device);
        let mut hello = frame(Some("A_A"), &[]);
        hello.push(b'\n');
        device.get_mut().write_all(&hello).await.unwrap();
        device
    }

    async fn recv_commands(device: &mut BufReader<DuplexStream>) -> StateMap {
        let mut line = Vec::new();
        device.read_until(b'\n', &mut line).await.unwrap();
        line.pop();
        codec::decode_state(&line).unwrap()
    }

    async fn surface_exchange(client: &mut TcpStream, commands: &StateMap) -> StateMap {
        client
            .write_all(&codec::encode_state(commands).unwrap())
            .await
            .unwrap();
        let mut buf = vec![0u8; 4_096];
        let n = client.read(&mut buf).await.unwrap();
        codec::decode_state(&buf[..n]).unwrap()
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let surface = SurfaceConfig {
            host: "127.0.0.1".to_string(),
            port: taken.local_addr().unwrap().port(),
            ..SurfaceConfig::default()
        };
        let result = Supervisor::<ChannelConnector>::new(
            store(),
            surface,
            SerialConfig::default(),
            fast_backoff(),
            Vec::new(),
        )
        .start()
        .await;
        assert!(matches!(result, Err(TetherError::Transport(_))));
    }

    #[tokio::test]
    async fn surface_command_reaches_the_device() {
        let store = store();
        let (connector, links) = ChannelConnector::new();
        let handle = start(Arc::clone(&store), vec![connector]).await;

        let mut device = plug_in(&links).await;
        recv_commands(&mut device).await;

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        let command = StateMap::from([("T_HFP".to_string(), Value::Int(1600))]);
        let reply = surface_exchange(&mut client, &command).await;

        assert_eq!(reply["A_A"], Value::Bool(true));
        assert_eq!(store.get(A, &["T_HFP"]).unwrap()["T_HFP"], Value::Int(1502));

        let mut report = frame(Some("A_A"), &[("S_A", 3)]);
        report.push(b'\n');
        device.get_mut().write_all(&report).await.unwrap();
        let commands = recv_commands(&mut device).await;
        assert_eq!(commands["T_HFP"], Value::Int(1502));
    }

    #[tokio::test]
    async fn surface_disconnect_resets_peripheral_commands() {
        let store = store();
        let handle = start(Arc::clone(&store), Vec::new()).await;
        let mut state = handle.subscribe_surface();

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        let command = StateMap::from([("T_HFP".to_string(), Value::Int(1600))]);
        let reply = surface_exchange(&mut client, &command).await;
        assert_eq!(reply, store.snapshot(DeviceId::Surface).unwrap());
        assert_eq!(handle.surface_state(), SurfaceState::Exchanging);

        drop(client);
        state
            .wait_for(|s| *s == SurfaceState::Listening)
            .await
            .unwrap();
        assert_eq!(store.snapshot(A).unwrap(), *store.defaults(A).unwrap());

        // The listener serves the next client.
        let mut again = TcpStream::connect(handle.local_addr()).await.unwrap();
        let reply = surface_exchange(&mut again, &StateMap::new()).await;
        assert_eq!(reply, *store.defaults(DeviceId::Surface).unwrap());
    }

    #[tokio::test]
    async fn peripheral_reconnects_after_link_loss() {
        let store = store();
        let (connector, links) = ChannelConnector::new();
        let handle = start(Arc::clone(&store), vec![connector]).await;
        let mut state = handle.subscribe_peripheral(PORT).unwrap();
        let presence = |store: &StateStore| store.get(DeviceId::Surface, &["A_A"]).unwrap()["A_A"];

        let mut first = plug_in(&links).await;
        recv_commands(&mut first).await;
        assert_eq!(presence(&store), Value::Bool(true));

        drop(first);
        state
            .wait_for(|s| *s == PeripheralState::Connecting)
            .await
            .unwrap();
        assert_eq!(presence(&store), Value::Bool(false));

        let mut second = plug_in(&links).await;
        recv_commands(&mut second).await;
        assert_eq!(presence(&store), Value::Bool(true));
        assert_eq!(
            handle.peripheral_states(),
            vec![(PORT.to_string(), PeripheralState::Exchanging("A_A".to_string()))]
        );
    }

    #[tokio::test]
    async fn abort_ends_wait() {
        let mut handle = start(store(), Vec::new()).await;
        handle.abort();
        assert!(handle.wait().await.is_ok());
    }
}
