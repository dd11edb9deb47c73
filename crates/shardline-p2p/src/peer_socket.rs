//! Acknowledged peer socket.
//!
//! SAFETY INVARIANTS:
//! 1. At most one data frame per socket is unacknowledged at any time
//! 2. Only the head of `outbound` may be in flight
//! 3. `Received` frames bypass the outbound buffer, otherwise two sockets
//!    waiting on each other would never drain
//! 4. A read error of any kind ends the reader and closes only this socket
//! 5. Packets of one socket reach the handler in the order they were read

use crate::frame_codec::{FrameCodec, FrameError};
use crate::packet::{Packet, PacketError};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, error, warn};
use parking_lot::Mutex;
use shardline_core::{NodeId, ShardId};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// How long an acceptor waits for the dialer's `Hello`.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("connection closed before hello")]
    Closed,

    #[error("timed out waiting for hello")]
    Timeout,

    #[error("expected hello, got {0}")]
    UnexpectedPacket(&'static str),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// Receives decoded packets from a socket's reader loop.
pub trait PacketHandler: Send + Sync + 'static {
    /// Called for every data packet, in arrival order, from the socket's
    /// dispatch task. Never called concurrently for the same socket.
    fn handle_packet(&self, from: NodeId, packet: Packet);

    /// Called once when the reader loop ends.
    fn connection_closed(&self, socket: &Arc<PeerSocket>);
}

#[derive(Debug, Default)]
struct Outbound {
    queue: VecDeque<Bytes>,
    in_flight: bool,
}

pub struct PeerSocket {
    id: NodeId,
    writer: tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, FrameCodec>>,
    outbound: Mutex<Outbound>,
    closed: CancellationToken,
}

/// Read half of a connection, handed to [`run_reader`].
pub struct SocketReader {
    frames: FramedRead<OwnedReadHalf, FrameCodec>,
}

impl PeerSocket {
    /// Wraps a connected stream whose remote end is `id`.
    pub fn from_stream(id: NodeId, stream: TcpStream, codec: FrameCodec) -> (Arc<Self>, SocketReader) {
        let (read_half, write_half) = stream.into_split();
        Self::from_parts(
            id,
            FramedRead::new(read_half, codec),
            FramedWrite::new(write_half, codec),
        )
    }

    fn from_parts(
        id: NodeId,
        frames: FramedRead<OwnedReadHalf, FrameCodec>,
        writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    ) -> (Arc<Self>, SocketReader) {
        let socket = Arc::new(PeerSocket {
            id,
            writer: tokio::sync::Mutex::new(writer),
            outbound: Mutex::new(Outbound::default()),
            closed: CancellationToken::new(),
        });
        (socket, SocketReader { frames })
    }

    /// Dials `addr`, announces `local` for `shard_id` and returns the socket
    /// for the remote node `peer`.
    pub async fn dial<A: ToSocketAddrs>(
        addr: A,
        peer: NodeId,
        local: NodeId,
        shard_id: ShardId,
        codec: FrameCodec,
    ) -> Result<(Arc<Self>, SocketReader), HandshakeError> {
        let stream = TcpStream::connect(addr).await.map_err(FrameError::from)?;
        stream.set_nodelay(true).map_err(FrameError::from)?;
        let (read_half, write_half) = stream.into_split();
        let mut writer = FramedWrite::new(write_half, codec);
        let hello = Packet::Hello {
            node_id: local,
            shard_id,
        };
        writer.send(hello.encode()?).await?;
        Ok(Self::from_parts(peer, FramedRead::new(read_half, codec), writer))
    }

    /// Reads the dialer's `Hello` from an accepted stream.
    pub async fn accept(
        stream: TcpStream,
        codec: FrameCodec,
    ) -> Result<(ShardId, Arc<Self>, SocketReader), HandshakeError> {
        stream.set_nodelay(true).map_err(FrameError::from)?;
        let (read_half, write_half) = stream.into_split();
        let mut frames = FramedRead::new(read_half, codec);
        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, frames.next())
            .await
            .map_err(|_| HandshakeError::Timeout)?
            .ok_or(HandshakeError::Closed)??;
        match Packet::decode(&first)? {
            Packet::Hello { node_id, shard_id } => {
                let (socket, reader) =
                    Self::from_parts(node_id, frames, FramedWrite::new(write_half, codec));
                Ok((shard_id, socket, reader))
            }
            other => Err(HandshakeError::UnexpectedPacket(other.name())),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Queues a frame payload. Sends it right away if nothing is in flight.
    pub fn send(self: &Arc<Self>, frame: Bytes) {
        let head = {
            let mut outbound = self.outbound.lock();
            outbound.queue.push_back(frame);
            if outbound.in_flight {
                None
            } else {
                outbound.in_flight = true;
                outbound.queue.front().cloned()
            }
        };
        if let Some(head) = head {
            self.spawn_write(head);
        }
    }

    pub fn send_packet(self: &Arc<Self>, packet: &Packet) -> Result<(), PacketError> {
        self.send(packet.encode()?);
        Ok(())
    }

    /// The peer received the head frame: drop it and send the next one.
    pub fn on_ack(self: &Arc<Self>) {
        let next = {
            let mut outbound = self.outbound.lock();
            outbound.queue.pop_front();
            match outbound.queue.front() {
                Some(frame) => Some(frame.clone()),
                None => {
                    outbound.in_flight = false;
                    None
                }
            }
        };
        if let Some(frame) = next {
            self.spawn_write(frame);
        }
    }

    /// Frames queued, including the one in flight.
    pub fn queued(&self) -> usize {
        self.outbound.lock().queue.len()
    }

    pub fn is_awaiting_ack(&self) -> bool {
        self.outbound.lock().in_flight
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn spawn_write(self: &Arc<Self>, frame: Bytes) {
        let socket = Arc::clone(self);
        tokio::spawn(async move {
            if socket.is_closed() {
                return;
            }
            if let Err(e) = socket.write_frame(frame).await {
                warn!("[PeerSocket {}] write failed, will retry on next send: {}", socket.id, e);
                socket.outbound.lock().in_flight = false;
            }
        });
    }

    async fn write_frame(&self, frame: Bytes) -> Result<(), FrameError> {
        let mut writer = self.writer.lock().await;
        writer.send(frame).await
    }

    /// Half-closes the write side so the remote reader sees EOF.
    async fn shutdown_writer(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.get_mut().shutdown().await {
            debug!("[PeerSocket {}] shutdown: {}", self.id, e);
        }
    }

    async fn send_received(&self) -> Result<(), FrameError> {
        let frame = Bytes::from_static(&[crate::packet::TAG_RECEIVED]);
        self.write_frame(frame).await
    }
}

impl std::fmt::Debug for PeerSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSocket")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Reader loop: acknowledges every data frame and queues it for the
/// socket's dispatch task until the connection fails or the socket is closed.
pub async fn run_reader(socket: Arc<PeerSocket>, mut reader: SocketReader, handler: Arc<dyn PacketHandler>) {
    let dispatch = spawn_dispatcher(socket.id.clone(), Arc::clone(&handler));
    loop {
        let next = tokio::select! {
            _ = socket.closed.cancelled() => break,
            next = reader.frames.next() => next,
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!("[PeerSocket {}] read failed: {}", socket.id, e);
                break;
            }
            None => {
                debug!("[PeerSocket {}] connection closed by peer", socket.id);
                break;
            }
        };

        match Packet::decode(&frame) {
            Ok(Packet::Received) => socket.on_ack(),
            Ok(packet) => {
                if let Err(e) = socket.send_received().await {
                    warn!("[PeerSocket {}] failed to acknowledge frame: {}", socket.id, e);
                    break;
                }
                if dispatch.send(packet).is_err() {
                    warn!("[PeerSocket {}] dispatch task is gone", socket.id);
                    break;
                }
            }
            Err(e) => {
                // The frame itself arrived intact; ack it so the sender's queue drains.
                warn!("[PeerSocket {}] dropping malformed packet: {}", socket.id, e);
                if let Err(e) = socket.send_received().await {
                    warn!("[PeerSocket {}] failed to acknowledge frame: {}", socket.id, e);
                    break;
                }
            }
        }
    }
    drop(dispatch);
    socket.close();
    socket.shutdown_writer().await;
    handler.connection_closed(&socket);
}

/// Hands packets to `handler` one at a time, off the reader loop. Ends when
/// the sender is dropped.
fn spawn_dispatcher(from: NodeId, handler: Arc<dyn PacketHandler>) -> mpsc::UnboundedSender<Packet> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
    tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            let name = packet.name();
            let handled = panic::catch_unwind(AssertUnwindSafe(|| handler.handle_packet(from.clone(), packet)));
            if handled.is_err() {
                error!("[PeerSocket {}] handler panicked on {} packet", from, name);
            }
        }
    });
    tx
}
