//! [`PeripheralSession`] – handshake and exchange with one microcontroller.
//!
//! Inbound frames are msgpack maps terminated by `\n`.  The first non-empty
//! frame must carry an [`IDENTITY_FIELD`][codec::IDENTITY_FIELD] naming a
//! configured peripheral; that binds the session to the device and raises its
//! presence flag in the surface map.  From then on every frame must repeat the
//! same identity, its remaining fields are written into the surface map, and
//! each frame (or read timeout) is answered with the device's current command
//! map.
//!
//! A session is single-use.  Any failure ends it, [`PeripheralSession::cleanup`]
//! lowers the presence flag and releases the link, and the supervisor builds a
//! fresh session on a new link, which repeats the handshake.

use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tether_store::StateStore;
use tether_types::{DeviceId, PeripheralId, StateMap, TetherError, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::codec::{self, PeripheralFrame};
use crate::transport::{SerialConfig, SerialLink};

/// Lifecycle of one serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralState {
    /// Opening the port (or waiting to retry).
    Connecting,
    /// Port open, waiting for the device to identify itself.
    Handshaking,
    /// Identified as the device with this code and exchanging data.
    Exchanging(String),
}

// Identity resolved by a successful handshake.
#[derive(Debug, Clone)]
struct Binding {
    id: PeripheralId,
    code: String,
    presence_key: String,
}

/// One connection attempt to one serial port.
pub struct PeripheralSession<L> {
    port: String,
    link: BufReader<L>,
    line: Vec<u8>,
    store: Arc<StateStore>,
    binding: Option<Binding>,
    read_timeout: Duration,
    write_timeout: Duration,
    state: Arc<watch::Sender<PeripheralState>>,
}

impl<L: SerialLink> PeripheralSession<L> {
    pub fn new(
        port: impl Into<String>,
        link: L,
        store: Arc<StateStore>,
        serial: &SerialConfig,
        state: Arc<watch::Sender<PeripheralState>>,
    ) -> Self {
        Self {
            port: port.into(),
            link: BufReader::new(link),
            line: Vec::new(),
            store,
            binding: None,
            read_timeout: serial.read_timeout(),
            write_timeout: serial.write_timeout(),
            state,
        }
    }

    /// Identity bound by the handshake, [`DeviceId::Unassigned`] before it.
    pub fn identity(&self) -> DeviceId {
        match &self.binding {
            Some(binding) => DeviceId::Peripheral(binding.id),
            None => DeviceId::Unassigned,
        }
    }

    /// Run the handshake and then exchange frames until something fails.
    ///
    /// Returns the error that ended the session:
    ///
    /// * [`TetherError::Transport`] – the link failed, closed, or a write
    ///   timed out.
    /// * [`TetherError::Decode`] – a frame was not valid msgpack, or the
    ///   handshake frame had no identity.
    /// * [`TetherError::UnknownDevice`] – the handshake named no configured
    ///   peripheral.
    /// * [`TetherError::IdentityMismatch`] – a later frame omitted or changed
    ///   its identity.
    /// * [`TetherError::Schema`] – telemetry named a key outside the surface
    ///   schema.
    pub async fn run(&mut self) -> TetherError {
        match self.exchange().await {
            Ok(never) => match never {},
            Err(e) => e,
        }
    }

    /// Lower the presence flag (if the device was identified) and release the
    /// link.
    pub fn cleanup(self) {
        if let Some(binding) = &self.binding {
            let absent = StateMap::from([(binding.presence_key.clone(), Value::Bool(false))]);
            match self.store.set(DeviceId::Peripheral(binding.id), false, absent) {
                Ok(()) => info!(port = %self.port, device = %binding.code, "device marked absent"),
                Err(e) => {
                    error!(port = %self.port, device = %binding.code, error = %e, "failed to clear presence flag");
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Protocol
    // ------------------------------------------------------------------------

    async fn exchange(&mut self) -> Result<Infallible, TetherError> {
        let mut pending = Some(self.handshake().await?);
        loop {
            match pending.take() {
                Some(frame) => self.apply(frame)?,
                None => {
                    debug!(port = %self.port, "timed out reading, clearing the output buffer");
                    self.link.get_mut().clear_output()?;
                }
            }

            self.send_commands().await?;

            pending = match self.read_frame().await? {
                Some(bytes) => Some(codec::decode_peripheral_frame(&bytes)?),
                None => None,
            };
        }
    }

    // Returns the identifying frame so it is applied and answered like any
    // other.
    async fn handshake(&mut self) -> Result<PeripheralFrame, TetherError> {
        self.state.send_replace(PeripheralState::Handshaking);
        let bytes = loop {
            if let Some(bytes) = self.read_frame().await? {
                break bytes;
            }
        };

        let frame = codec::decode_peripheral_frame(&bytes)?;
        let code = frame.identity.clone().ok_or_else(|| {
            TetherError::Decode("handshake frame carries no identity field".to_string())
        })?;
        let roster = self.store.roster();
        let peripheral = roster
            .resolve_code(&code)
            .and_then(|id| roster.peripheral(id))
            .ok_or_else(|| TetherError::UnknownDevice(code.clone()))?;
        let binding = Binding {
            id: peripheral.id,
            code: peripheral.code.clone(),
            presence_key: peripheral.presence_key.clone(),
        };

        info!(port = %self.port, device = %binding.code, "detected a valid device");
        let present = StateMap::from([(binding.presence_key.clone(), Value::Bool(true))]);
        self.store.set(DeviceId::Peripheral(binding.id), false, present)?;
        self.state
            .send_replace(PeripheralState::Exchanging(binding.code.clone()));
        self.binding = Some(binding);
        Ok(frame)
    }

    fn apply(&mut self, frame: PeripheralFrame) -> Result<(), TetherError> {
        let Some(binding) = &self.binding else {
            return Err(TetherError::InvalidOperation {
                device: "unassigned".to_string(),
                details: "telemetry received before the handshake".to_string(),
            });
        };
        if frame.identity.as_deref() != Some(binding.code.as_str()) {
            return Err(TetherError::IdentityMismatch {
                expected: binding.code.clone(),
                received: frame.identity.unwrap_or_else(|| "<missing>".to_string()),
            });
        }
        debug!(port = %self.port, fields = frame.fields.len(), "received telemetry");
        self.store
            .set(DeviceId::Peripheral(binding.id), false, frame.fields)
    }

    async fn send_commands(&mut self) -> Result<(), TetherError> {
        let commands = self.store.snapshot(self.identity())?;
        let mut payload = codec::encode_state(&commands)?;
        payload.push(b'\n');

        let link = &mut self.link;
        let write = async {
            link.write_all(&payload).await?;
            link.flush().await
        };
        match timeout(self.write_timeout, write).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TetherError::Transport(io::Error::new(
                io::ErrorKind::TimedOut,
                "serial write timed out",
            ))),
        }
    }

    // `None` when the read timed out or the frame was blank.  Bytes of a frame
    // cut off by the timeout stay in `self.line` and are completed by the next
    // read.
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, TetherError> {
        let read = self.link.read_until(b'\n', &mut self.line);
        match timeout(self.read_timeout, read).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => Err(TetherError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "serial link closed",
            ))),
            Ok(Ok(_)) => {
                let mut frame = std::mem::take(&mut self.line);
                trim_line_ending(&mut frame);
                Ok((!frame.is_empty()).then_some(frame))
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }
}

// Only the delimiter is removed; the payload is binary.
fn trim_line_ending(frame: &mut Vec<u8>) {
    if frame.last() == Some(&b'\n') {
        frame.pop();
        if frame.last() == Some(&b'\r') {
            frame.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{A, frame, store};
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream, ReadBuf};
    use tokio::task::JoinHandle;

    type Device = BufReader<DuplexStream>;

    /// In-memory link that counts output-buffer clears.
    struct CountingLink {
        inner: DuplexStream,
        clears: Arc<AtomicUsize>,
    }

    impl AsyncRead for CountingLink {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for CountingLink {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    impl SerialLink for CountingLink {
        fn clear_output(&mut self) -> io::Result<()> {
            self.clears.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn serial(read_timeout_ms: u64) -> SerialConfig {
        SerialConfig {
            read_timeout_ms,
            ..SerialConfig::default()
        }
    }

    fn start(
        store: Arc<StateStore>,
        read_timeout_ms: u64,
    ) -> (
        Device,
        watch::Receiver<PeripheralState>,
        JoinHandle<TetherError>,
    ) {
        let (device, link) = tokio::io::duplex(4_096);
        let (tx, rx) = watch::channel(PeripheralState::Connecting);
        let mut session =
            PeripheralSession::new("/dev/test", link, store, &serial(read_timeout_ms), Arc::new(tx));
        let task = tokio::spawn(async move {
            let reason = session.run().await;
            session.cleanup();
            reason
        });
        (BufReader::new(device), rx, task)
    }

    async fn send(device: &mut Device, bytes: &[u8]) {
        let stream = device.get_mut();
        stream.write_all(bytes).await.unwrap();
        stream.write_all(b"\n").await.unwrap();
    }

    async fn recv(device: &mut Device) -> StateMap {
        let mut line = Vec::new();
        device.read_until(b'\n', &mut line).await.unwrap();
        trim_line_ending(&mut line);
        codec::decode_state(&line).unwrap()
    }

    fn presence(store: &StateStore) -> Value {
        store.get(DeviceId::Surface, &["A_A"]).unwrap()["A_A"]
    }

    #[tokio::test]
    async fn handshake_binds_identity_and_answers_immediately() {
        let store = store();
        let (mut device, mut state, task) = start(Arc::clone(&store), 5_000);

        send(&mut device, &frame(Some("A_A"), &[])).await;
        let commands = recv(&mut device).await;

        assert_eq!(commands, store.snapshot(A).unwrap());
        assert_eq!(presence(&store), Value::Bool(true));
        state
            .wait_for(|s| *s == PeripheralState::Exchanging("A_A".to_string()))
            .await
            .unwrap();

        drop(device);
        assert!(matches!(task.await.unwrap(), TetherError::Transport(_)));
        assert_eq!(presence(&store), Value::Bool(false));
    }

    #[tokio::test]
    async fn telemetry_lands_in_the_surface_map() {
        let store = store();
        let (mut device, _state, task) = start(Arc::clone(&store), 5_000);

        send(&mut device, &frame(Some("A_A"), &[("S_A", 3)])).await;
        recv(&mut device).await;
        send(&mut device, &frame(Some("A_A"), &[("S_A", 7), ("S_B", 9)])).await;
        recv(&mut device).await;

        let surface = store.snapshot(DeviceId::Surface).unwrap();
        assert_eq!(surface["S_A"], Value::Int(7));
        assert_eq!(surface["S_B"], Value::Int(9));
        task.abort();
    }

    #[tokio::test]
    async fn reply_carries_dispatched_commands() {
        let store = store();
        let (mut device, _state, task) = start(Arc::clone(&store), 5_000);

        send(&mut device, &frame(Some("A_A"), &[])).await;
        recv(&mut device).await;
        store
            .set(
                DeviceId::Surface,
                false,
                StateMap::from([("T_HFP".to_string(), Value::Int(1600))]),
            )
            .unwrap();
        send(&mut device, &frame(Some("A_A"), &[])).await;
        let commands = recv(&mut device).await;
        assert_eq!(commands["T_HFP"], Value::Int(1502));
        task.abort();
    }

    #[tokio::test]
    async fn identity_change_aborts_and_clears_presence() {
        let store = store();
        let (mut device, _state, task) = start(Arc::clone(&store), 5_000);

        send(&mut device, &frame(Some("A_A"), &[])).await;
        recv(&mut device).await;
        assert_eq!(presence(&store), Value::Bool(true));

        send(&mut device, &frame(Some("A_B"), &[])).await;
        let reason = task.await.unwrap();
        assert!(matches!(reason, TetherError::IdentityMismatch { .. }));
        assert_eq!(presence(&store), Value::Bool(false));
    }

    #[tokio::test]
    async fn missing_identity_aborts_and_clears_presence() {
        let store = store();
        let (mut device, _state, task) = start(Arc::clone(&store), 5_000);

        send(&mut device, &frame(Some("A_A"), &[])).await;
        recv(&mut device).await;

        send(&mut device, &frame(None, &[("S_A", 1)])).await;
        let reason = task.await.unwrap();
        match reason {
            TetherError::IdentityMismatch { expected, received } => {
                assert_eq!(expected, "A_A");
                assert_eq!(received, "<missing>");
            }
            other => panic!("unexpected reason: {other}"),
        }
        assert_eq!(presence(&store), Value::Bool(false));
        assert_eq!(
            store.get(DeviceId::Surface, &["S_A"]).unwrap()["S_A"],
            Value::Int(0)
        );
    }

    #[tokio::test]
    async fn unknown_identity_fails_the_handshake() {
        let store = store();
        let (mut device, _state, task) = start(Arc::clone(&store), 5_000);

        send(&mut device, &frame(Some("A_Z"), &[])).await;
        assert!(matches!(task.await.unwrap(), TetherError::UnknownDevice(code) if code == "A_Z"));
        assert_eq!(store.snapshot(DeviceId::Surface).unwrap(), *store.defaults(DeviceId::Surface).unwrap());
    }

    #[tokio::test]
    async fn undecodable_frame_aborts() {
        let store = store();
        let (mut device, _state, task) = start(Arc::clone(&store), 5_000);

        send(&mut device, &frame(Some("A_A"), &[])).await;
        recv(&mut device).await;
        send(&mut device, &[0xc1]).await;
        assert!(matches!(task.await.unwrap(), TetherError::Decode(_)));
        assert_eq!(presence(&store), Value::Bool(false));
    }

    #[tokio::test]
    async fn blank_lines_are_ignored_during_handshake() {
        let store = store();
        let (mut device, mut state, task) = start(Arc::clone(&store), 5_000);

        device.get_mut().write_all(b"\n\r\n").await.unwrap();
        state
            .wait_for(|s| *s == PeripheralState::Handshaking)
            .await
            .unwrap();
        send(&mut device, &frame(Some("A_A"), &[])).await;
        recv(&mut device).await;
        assert_eq!(presence(&store), Value::Bool(true));
        task.abort();
    }

    #[tokio::test]
    async fn read_timeout_still_sends_commands() {
        let store = store();
        let (mut device, _state, task) = start(Arc::clone(&store), 30);

        send(&mut device, &frame(Some("A_A"), &[])).await;
        let first = recv(&mut device).await;
        // Nothing more is sent; the session answers again once the read times out.
        let second = recv(&mut device).await;
        assert_eq!(first, second);
        task.abort();
    }

    #[tokio::test]
    async fn read_timeout_clears_pending_output() {
        let store = store();
        let (device, inner) = tokio::io::duplex(4_096);
        let clears = Arc::new(AtomicUsize::new(0));
        let link = CountingLink {
            inner,
            clears: Arc::clone(&clears),
        };
        let (tx, _rx) = watch::channel(PeripheralState::Connecting);
        let mut session = PeripheralSession::new("/dev/test", link, store, &serial(30), Arc::new(tx));
        let task = tokio::spawn(async move { session.run().await });
        let mut device = BufReader::new(device);

        send(&mut device, &frame(Some("A_A"), &[])).await;
        recv(&mut device).await;
        // The second reply only follows a read timeout, which clears first.
        recv(&mut device).await;
        assert!(clears.load(Ordering::SeqCst) >= 1);
        task.abort();
    }

    #[tokio::test]
    async fn stalled_write_times_out_and_clears_presence() {
        let store = store();
        // Far smaller than one command reply, and the device never reads.
        let (device, link) = tokio::io::duplex(8);
        let (tx, _rx) = watch::channel(PeripheralState::Connecting);
        let serial = SerialConfig {
            read_timeout_ms: 5_000,
            write_timeout_ms: 50,
            ..SerialConfig::default()
        };
        let mut session =
            PeripheralSession::new("/dev/test", link, Arc::clone(&store), &serial, Arc::new(tx));
        let task = tokio::spawn(async move {
            let reason = session.run().await;
            session.cleanup();
            reason
        });
        let mut device = BufReader::new(device);

        send(&mut device, &frame(Some("A_A"), &[])).await;
        match task.await.unwrap() {
            TetherError::Transport(e) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("unexpected reason: {other}"),
        }
        assert_eq!(presence(&store), Value::Bool(false));
        drop(device);
    }

    #[tokio::test]
    async fn partial_frame_survives_a_timeout() {
        let store = store();
        let (mut device, _state, task) = start(Arc::clone(&store), 30);

        send(&mut device, &frame(Some("A_A"), &[])).await;
        recv(&mut device).await;

        let bytes = frame(Some("A_A"), &[("S_B", 5)]);
        let (head, tail) = bytes.split_at(3);
        device.get_mut().write_all(head).await.unwrap();
        // Let at least one read time out with the head buffered.
        recv(&mut device).await;
        send(&mut device, tail).await;

        // Timeout replies may interleave; keep reading until the frame lands.
        let mut applied = false;
        for _ in 0..50 {
            recv(&mut device).await;
            if store.get(DeviceId::Surface, &["S_B"]).unwrap()["S_B"] == Value::Int(5) {
                applied = true;
                break;
            }
        }
        assert!(applied);
        assert!(!task.is_finished());
        task.abort();
    }

    #[test]
    fn trim_removes_only_the_delimiter() {
        let mut frame = vec![0x81, b' ', b'\r', b'\n'];
        trim_line_ending(&mut frame);
        assert_eq!(frame, vec![0x81, b' ']);

        let mut bare = vec![0x20];
        trim_line_ending(&mut bare);
        assert_eq!(bare, vec![0x20]);
    }

    #[tokio::test]
    async fn unbound_cleanup_releases_the_link() {
        let store = store();
        let (mut device, link) = tokio::io::duplex(64);
        let (tx, _rx) = watch::channel(PeripheralState::Connecting);
        let session =
            PeripheralSession::new("/dev/test", link, Arc::clone(&store), &serial(10), Arc::new(tx));
        assert_eq!(session.identity(), DeviceId::Unassigned);

        session.cleanup();
        let mut buf = [0u8; 1];
        assert_eq!(device.read(&mut buf).await.unwrap(), 0);
        assert_eq!(presence(&store), Value::Bool(false));
    }
}
