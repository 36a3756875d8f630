//! # Connection Manager
//!
//! Owns at most one [`ActiveConnection`]: the cipher-wrapped transport, its writer
//! task, and the cancellation token of its receive loop.
//!
//! ## Publication discipline
//! A connection is assembled entirely in locals by [`ConnectionManager::connect`] and
//! only stored in the shared slot once every step has succeeded. A failed attempt
//! drops its partial resources and never touches the slot. Only this type writes the
//! slot; callers that want to send take an owned [`PacketSender`] up front instead of
//! reading the slot again mid-operation.
//!
//! ## Teardown
//! [`ConnectionManager::disconnect`] cancels the receive loop, asks the writer to
//! flush and close, then waits (bounded) for both tasks to acknowledge by finishing
//! before [`ConnectionManager::cleanup`] empties the slot and disposes the snapshot.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::TimeoutConfig;
use crate::core::codec::PacketCodec;
use crate::error::{ProtocolError, Result};
use crate::transport::cipher::{BoxedStream, CipherPipeline};
use crate::utils::metrics::{Metrics, Timer};
use crate::utils::timeout::with_timeout_error;

type FrameReader = FramedRead<ReadHalf<BoxedStream>, PacketCodec>;
type FrameWriter = FramedWrite<WriteHalf<BoxedStream>, PacketCodec>;

/// Receives the output of a connection's receive loop.
pub trait PacketSink: Send + 'static {
    /// A complete frame arrived on connection `generation`
    fn on_packet(&mut self, generation: u64, packet: Bytes);

    /// The loop ended without being cancelled: the peer closed the stream
    /// (`reason` is `None`) or framing failed.
    fn on_closed(&mut self, generation: u64, reason: Option<ProtocolError>);
}

enum WriterCommand {
    Frame(Bytes),
    Shutdown,
}

/// Cloneable fire-and-forget handle to one connection's writer
#[derive(Clone)]
pub struct PacketSender {
    generation: u64,
    tx: mpsc::UnboundedSender<WriterCommand>,
}

impl PacketSender {
    /// Queue a frame for writing. Returns immediately.
    ///
    /// # Errors
    /// `ProtocolError::ConnectionClosed` once the writer has stopped.
    pub fn send(&self, frame: Bytes) -> Result<()> {
        self.tx
            .send(WriterCommand::Frame(frame))
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Connection this sender belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(WriterCommand::Shutdown);
    }
}

impl std::fmt::Debug for PacketSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketSender")
            .field("generation", &self.generation)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// The live connection: transport pipe halves, writer, and receive cancellation
struct ActiveConnection {
    generation: u64,
    peer: SocketAddr,
    encrypted: bool,
    sender: PacketSender,
    /// Taken by `start_receiving`
    reader: Option<FrameReader>,
    cancel: CancellationToken,
    receive_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

/// Owner of the single active connection
pub struct ConnectionManager {
    cipher: Arc<dyn CipherPipeline>,
    timeouts: TimeoutConfig,
    metrics: Arc<Metrics>,
    active: Mutex<Option<ActiveConnection>>,
    generations: AtomicU64,
}

impl ConnectionManager {
    pub fn new(cipher: Arc<dyn CipherPipeline>, timeouts: TimeoutConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            cipher,
            timeouts,
            metrics,
            active: Mutex::new(None),
            generations: AtomicU64::new(0),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<ActiveConnection>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.slot().is_some()
    }

    /// Generation of the active connection
    pub fn generation(&self) -> Option<u64> {
        self.slot().as_ref().map(|c| c.generation)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.slot().as_ref().map(|c| c.peer)
    }

    pub fn is_encrypted(&self) -> bool {
        self.slot().as_ref().is_some_and(|c| c.encrypted)
    }

    /// Owned send handle for the active connection
    pub fn sender(&self) -> Option<PacketSender> {
        self.slot().as_ref().map(|c| c.sender.clone())
    }

    /// Resolve, connect and (optionally) wrap in the cipher pipeline.
    ///
    /// Refuses while a connection is active. Returns `false` on resolution failure,
    /// socket error, timeout or cancellation; the active slot is untouched then.
    #[instrument(skip(self, cancel))]
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        use_encryption: bool,
        cancel: &CancellationToken,
    ) -> bool {
        if self.is_connected() {
            warn!(error = %ProtocolError::AlreadyConnected, "Connect refused");
            return false;
        }

        let _timer = Timer::start("connect");
        let connection = match self.open(host, port, use_encryption, cancel).await {
            Ok(connection) => connection,
            Err(e) => {
                self.metrics.connection_failed();
                warn!(error = %e, "Connect failed");
                return false;
            }
        };

        let mut slot = self.slot();
        if slot.is_some() {
            // Another connect published first
            drop(slot);
            warn!("Connect lost a race with a concurrent connect, discarding");
            dispose(connection);
            return false;
        }

        info!(
            peer = %connection.peer,
            generation = connection.generation,
            encrypted = connection.encrypted,
            "Connection established"
        );
        *slot = Some(connection);
        self.metrics.connection_opened();
        true
    }

    /// Build a complete connection in locals. Anything created before a failing
    /// step is dropped on return.
    async fn open(
        &self,
        host: &str,
        port: u16,
        use_encryption: bool,
        cancel: &CancellationToken,
    ) -> Result<ActiveConnection> {
        let connect = with_timeout_error(connect_any(host, port), self.timeouts.connect);
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return Err(ProtocolError::Cancelled),
            result = connect => result?,
        };
        stream.set_nodelay(true)?;

        let raw: BoxedStream = Box::new(stream);
        let pipe = if use_encryption {
            debug!(cipher = self.cipher.name(), "Wrapping transport in cipher pipeline");
            self.cipher.wrap(raw)?
        } else {
            raw
        };

        if cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled);
        }

        let (read_half, write_half) = tokio::io::split(pipe);
        let reader = FramedRead::new(read_half, PacketCodec);
        let writer = FramedWrite::new(write_half, PacketCodec);

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_loop(writer, rx, Arc::clone(&self.metrics), generation));

        Ok(ActiveConnection {
            generation,
            peer,
            encrypted: use_encryption,
            sender: PacketSender { generation, tx },
            reader: Some(reader),
            cancel: CancellationToken::new(),
            receive_task: None,
            writer_task: Some(writer_task),
        })
    }

    /// Start the receive loop of the active connection.
    ///
    /// The loop stops when either the connection's own token or `external` is
    /// cancelled. Each complete frame goes to `sink`.
    ///
    /// # Errors
    /// `ProtocolError::NotConnected` without an active connection, `ProtocolError::Custom`
    /// if the loop was already started.
    pub fn start_receiving<S>(&self, external: &CancellationToken, sink: S) -> Result<u64>
    where
        S: PacketSink,
    {
        let mut slot = self.slot();
        let active = slot.as_mut().ok_or(ProtocolError::NotConnected)?;
        let reader = active
            .reader
            .take()
            .ok_or_else(|| ProtocolError::Custom("receive loop already running".to_string()))?;

        let generation = active.generation;
        let task = tokio::spawn(receive_loop(
            reader,
            active.cancel.clone(),
            external.clone(),
            generation,
            sink,
        ));
        active.receive_task = Some(task);
        debug!(generation, "Receive loop started");
        Ok(generation)
    }

    /// Cancel, close gracefully, wait up to the grace period, then clean up.
    /// Does nothing without an active connection.
    pub async fn disconnect(&self) {
        let (generation, receive_task, writer_task) = {
            let mut slot = self.slot();
            let Some(active) = slot.as_mut() else {
                trace!("Disconnect with no active connection");
                return;
            };
            active.cancel.cancel();
            active.sender.shutdown();
            (
                active.generation,
                active.receive_task.take(),
                active.writer_task.take(),
            )
        };

        let grace = self.timeouts.disconnect_grace;
        let mut tasks: Vec<JoinHandle<()>> = receive_task.into_iter().chain(writer_task).collect();
        let settled = tokio::time::timeout(grace, async {
            for task in tasks.iter_mut() {
                let _ = task.await;
            }
        })
        .await;

        if settled.is_err() {
            warn!(generation, grace_ms = grace.as_millis() as u64, "Connection tasks did not stop within grace period");
            for task in &tasks {
                task.abort();
            }
        }

        self.cleanup_generation(generation);
        info!(generation, "Disconnected");
    }

    /// Empty the slot and dispose whatever was in it. Idempotent.
    pub fn cleanup(&self) {
        let snapshot = self.slot().take();
        if let Some(connection) = snapshot {
            self.metrics.connection_closed();
            dispose(connection);
        }
    }

    /// Clean up only if `generation` is still the active connection
    pub fn cleanup_generation(&self, generation: u64) {
        let snapshot = {
            let mut slot = self.slot();
            if slot.as_ref().map(|c| c.generation) == Some(generation) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(connection) = snapshot {
            self.metrics.connection_closed();
            dispose(connection);
        }
    }

    /// Grace period used by `disconnect`
    pub fn disconnect_grace(&self) -> Duration {
        self.timeouts.disconnect_grace
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Release a connection that is no longer reachable from the slot.
/// Order: cancellation first, then the cipher pipe halves, then the writer's transport.
fn dispose(connection: ActiveConnection) {
    let ActiveConnection {
        generation,
        peer,
        sender,
        reader,
        cancel,
        receive_task,
        writer_task,
        ..
    } = connection;

    cancel.cancel();
    if let Some(task) = receive_task {
        task.abort();
    }
    drop(reader);
    drop(sender);
    if let Some(task) = writer_task {
        task.abort();
    }
    debug!(generation, peer = %peer, "Connection resources released");
}

async fn connect_any(host: &str, port: u16) -> Result<(TcpStream, SocketAddr)> {
    let addrs = lookup_host((host, port))
        .await
        .map_err(|e| ProtocolError::AddressResolution(format!("{host}:{port}: {e}")))?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok((stream, addr)),
            Err(e) => {
                debug!(addr = %addr, error = %e, "Connect attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(match last_error {
        Some(e) => ProtocolError::Io(e),
        None => ProtocolError::AddressResolution(format!("{host}:{port}: no addresses")),
    })
}

enum LoopExit {
    Cancelled,
    PeerClosed,
    Failed(ProtocolError),
}

async fn receive_loop<S>(
    mut reader: FrameReader,
    own: CancellationToken,
    external: CancellationToken,
    generation: u64,
    mut sink: S,
) where
    S: PacketSink,
{
    let exit = loop {
        tokio::select! {
            biased;
            _ = own.cancelled() => break LoopExit::Cancelled,
            _ = external.cancelled() => break LoopExit::Cancelled,
            frame = reader.next() => match frame {
                Some(Ok(packet)) => {
                    trace!(generation, len = packet.len(), "Frame received");
                    sink.on_packet(generation, packet);
                }
                Some(Err(e)) => break LoopExit::Failed(e),
                None => break LoopExit::PeerClosed,
            },
        }
    };

    match exit {
        LoopExit::Cancelled => debug!(generation, "Receive loop cancelled"),
        LoopExit::PeerClosed => {
            info!(generation, "Peer closed the connection");
            sink.on_closed(generation, None);
        }
        LoopExit::Failed(e) => {
            warn!(generation, error = %e, "Receive loop failed");
            sink.on_closed(generation, Some(e));
        }
    }
}

async fn write_loop(
    mut writer: FrameWriter,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    metrics: Arc<Metrics>,
    generation: u64,
) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Frame(frame) => {
                let len = frame.len() as u64;
                if let Err(e) = writer.send(frame).await {
                    warn!(generation, error = %e, "Write failed, stopping writer");
                    break;
                }
                metrics.packet_sent(len);
            }
            WriterCommand::Shutdown => {
                if let Err(e) = writer.close().await {
                    debug!(generation, error = %e, "Graceful close failed");
                }
                break;
            }
        }
    }
    trace!(generation, "Writer stopped");
}
