//! The dual-transport endpoint: a TCP listener for the reliable stream and
//! a UDP socket on the same port for the unreliable datagrams. Reliable
//! frames are length-prefixed with two big-endian bytes and fixed-size
//! after the prefix; datagrams carry exactly one frame each.
//!
//! Each accepted connection gets a reader and a writer task; when either
//! finishes the other is aborted and the server core is told about the
//! disconnect.

pub mod rate_limit;

use crate::server::ServerCore;
use bytes::Bytes;
use protocol::{LENGTH_PREFIX_SIZE, PACKET_SIZE, Packet, Payload, PlayerId, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

/// Buffer size of the per-connection outbound channel.
const CHANNEL_BUFFER_SIZE: usize = 256;

/// A reliable frame longer than this is a protocol violation, not padding.
const MAX_FRAME_LEN: usize = 4 * PACKET_SIZE;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one reliable connection. Cloneable; the sender feeds the
/// connection's writer task.
#[derive(Clone)]
pub struct ClientHandle {
    pub conn_id: u64,
    pub addr: SocketAddr,
    sender: mpsc::Sender<Bytes>,
}

impl ClientHandle {
    /// Queues a frame without blocking. A full or closed queue drops the
    /// frame; the heartbeat timeout cleans up truly dead connections.
    pub fn send_frame(&self, frame: Bytes) -> bool {
        match self.sender.try_send(frame) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(conn = self.conn_id, ?err, "Dropping outbound frame.");
                false
            }
        }
    }
}

/// Builds and routes outgoing packets. Sequence numbers are per transport
/// and strictly monotone, so every receiver sees an increasing stream.
pub struct Outbound {
    udp: Arc<UdpSocket>,
    reliable_seq: AtomicU32,
    unreliable_seq: AtomicU32,
}

impl Outbound {
    pub fn new(udp: Arc<UdpSocket>) -> Outbound {
        Outbound {
            udp,
            reliable_seq: AtomicU32::new(0),
            unreliable_seq: AtomicU32::new(0),
        }
    }

    fn next_seq(&self, transport: Transport) -> u32 {
        let counter = match transport {
            Transport::Reliable => &self.reliable_seq,
            Transport::Unreliable => &self.unreliable_seq,
        };
        counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Serializes an outgoing packet with a fresh sequence number. The
    /// sender field carries the subject of the packet: zero for
    /// server-originated events, a player identity for rebroadcast player
    /// state so receivers know whom the update describes.
    pub fn build(&self, sender: PlayerId, payload: Payload) -> Bytes {
        let transport = payload.packet_type().transport();
        Packet {
            sequence: self.next_seq(transport),
            sender,
            timestamp: crate::clock::wire_timestamp(),
            payload,
        }
        .serialize()
    }

    /// Sends one pre-built frame to a player over the given transport,
    /// snapshotting the bindings once.
    pub async fn send_frame(
        &self,
        player: &crate::game::registry::PlayerState,
        transport: Transport,
        frame: &Bytes,
    ) {
        let bindings = player.bindings();
        match transport {
            Transport::Reliable => {
                if let Some(handle) = bindings.reliable {
                    handle.send_frame(frame.clone());
                }
            }
            Transport::Unreliable => {
                if let Some(addr) = bindings.unreliable
                    && let Err(err) = self.udp.send_to(frame, addr).await
                {
                    tracing::warn!(%addr, ?err, "UDP send failed.");
                }
            }
        }
    }

    /// Builds and sends one payload to one player.
    pub async fn send_to_player(
        &self,
        player: &crate::game::registry::PlayerState,
        sender: PlayerId,
        payload: Payload,
    ) {
        let transport = payload.packet_type().transport();
        let frame = self.build(sender, payload);
        self.send_frame(player, transport, &frame).await;
    }

    /// Builds once and fans the frame out to every listed player.
    pub async fn broadcast(
        &self,
        players: &[Arc<crate::game::registry::PlayerState>],
        sender: PlayerId,
        payload: Payload,
    ) {
        let transport = payload.packet_type().transport();
        let frame = self.build(sender, payload);
        for player in players {
            self.send_frame(player, transport, &frame).await;
        }
    }

    /// Reliable send straight to a connection, for replies that precede a
    /// registry entry (auth responses, lobby lists).
    pub fn send_to_conn(&self, handle: &ClientHandle, payload: Payload) {
        debug_assert_eq!(
            payload.packet_type().transport(),
            Transport::Reliable,
            "only reliable types may go to a bare connection"
        );
        let frame = self.build(PlayerId::ZERO, payload);
        handle.send_frame(frame);
    }
}

/// Accept loop plus the UDP receive loop. Runs until the tasks are
/// aborted at shutdown.
pub async fn run_endpoint(core: Arc<ServerCore>, listener: TcpListener, udp: Arc<UdpSocket>) {
    let udp_core = core.clone();
    let udp_socket = udp.clone();
    tokio::spawn(async move {
        udp_loop(udp_core, udp_socket).await;
    });

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if !core
                    .limiter
                    .allow_connection(addr.ip(), crate::clock::now_ms())
                {
                    tracing::warn!(%addr, "Connection rate exceeded, refusing.");
                    continue;
                }
                let conn_core = core.clone();
                tokio::spawn(async move {
                    handle_connection(conn_core, stream, addr).await;
                });
            }
            Err(err) => {
                tracing::error!(?err, "Accept failed.");
            }
        }
    }
}

/// One datagram per frame; short datagrams are dropped on the floor.
async fn udp_loop(core: Arc<ServerCore>, udp: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_FRAME_LEN];
    loop {
        let (len, addr) = match udp.recv_from(&mut buf).await {
            Ok(read) => read,
            Err(err) => {
                tracing::warn!(?err, "UDP receive failed.");
                continue;
            }
        };
        if len < PACKET_SIZE {
            continue;
        }
        match Packet::deserialize(&buf[..len]) {
            Ok(packet) => core.handle_unreliable(addr, packet).await,
            Err(err) => {
                tracing::debug!(%addr, %err, "Dropping malformed datagram.");
            }
        }
    }
}

/// Full lifecycle of one reliable connection: register, pump frames in
/// both directions, deregister.
async fn handle_connection(core: Arc<ServerCore>, stream: TcpStream, addr: SocketAddr) {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::AcqRel);
    let (read_half, write_half) = stream.into_split();
    let (sender, receiver) = mpsc::channel::<Bytes>(CHANNEL_BUFFER_SIZE);
    let handle = ClientHandle {
        conn_id,
        addr,
        sender,
    };
    core.register_conn(handle.clone());
    tracing::info!(conn = conn_id, %addr, "Connection established.");

    let mut write_task = tokio::spawn(async move { write_loop(write_half, receiver).await });
    let read_core = core.clone();
    let mut read_task = tokio::spawn(async move { read_loop(read_core, conn_id, read_half).await });

    // If any one of the tasks runs to completion, we abort the other.
    tokio::select! {
        _ = &mut write_task => { read_task.abort(); },
        _ = &mut read_task => { write_task.abort(); },
    };

    core.on_disconnect(conn_id).await;
    tracing::info!(conn = conn_id, %addr, "Connection closed.");
}

/// Drains the outbound channel into the socket, with the length prefix in
/// front of every frame.
async fn write_loop(mut write_half: OwnedWriteHalf, mut receiver: mpsc::Receiver<Bytes>) {
    while let Some(frame) = receiver.recv().await {
        debug_assert_eq!(frame.len(), PACKET_SIZE);
        let prefix = (frame.len() as u16).to_be_bytes();
        if write_half.write_all(&prefix).await.is_err()
            || write_half.write_all(&frame).await.is_err()
        {
            return;
        }
    }
}

/// Reads length-prefixed frames and dispatches them into the server core.
/// Undersized frames are skipped to stay in stream sync; oversized lengths
/// end the connection as a protocol violation.
async fn read_loop(core: Arc<ServerCore>, conn_id: u64, mut read_half: OwnedReadHalf) {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    let mut frame = vec![0u8; MAX_FRAME_LEN];
    loop {
        if read_half.read_exact(&mut prefix).await.is_err() {
            return;
        }
        let len = u16::from_be_bytes(prefix) as usize;
        if len > MAX_FRAME_LEN {
            tracing::warn!(conn = conn_id, len, "Oversized frame, closing connection.");
            return;
        }
        if read_half.read_exact(&mut frame[..len]).await.is_err() {
            return;
        }
        if len < PACKET_SIZE {
            // Short frames are dropped, the stream itself stays usable.
            continue;
        }
        match Packet::deserialize(&frame[..len]) {
            Ok(packet) => core.handle_reliable(conn_id, packet).await,
            Err(err) => {
                tracing::debug!(conn = conn_id, %err, "Dropping malformed frame.");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn outbound() -> Outbound {
        let udp = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        Outbound::new(Arc::new(udp))
    }

    #[tokio::test]
    async fn sequence_numbers_are_strictly_monotone_per_transport() {
        let outbound = outbound().await;
        let mut last_reliable = 0;
        let mut last_unreliable = 0;
        for _ in 0..5 {
            let reliable = Packet::deserialize(&outbound.build(PlayerId::ZERO, Payload::PlayerLeave))
                .expect("own frames decode");
            assert!(reliable.sequence > last_reliable);
            last_reliable = reliable.sequence;

            let unreliable = Packet::deserialize(&outbound.build(PlayerId::ZERO, Payload::Heartbeat))
                .expect("own frames decode");
            assert!(unreliable.sequence > last_unreliable);
            last_unreliable = unreliable.sequence;
        }
    }

    #[tokio::test]
    async fn built_frames_carry_the_subject_identity() {
        let outbound = outbound().await;
        let subject = PlayerId(9 << 64 | 3);
        let frame = outbound.build(subject, Payload::PlayerLeave);
        assert_eq!(frame.len(), PACKET_SIZE);
        let decoded = Packet::deserialize(&frame).expect("own frames decode");
        assert_eq!(decoded.sender, subject);
    }
}
