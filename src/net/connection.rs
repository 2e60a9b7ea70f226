//! Per-connection protocol state and per-tick drive
//!
//! A `Connection` is constructed on an I/O task, handed to the tick thread
//! through the registry's pending queue, and from then on touched only by the
//! tick thread. The socket tasks keep feeding the inbound channel and
//! draining the outbound channel; they never see protocol state.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, trace};

use crate::constants::net as net_limits;
use crate::net::chunk_stream::{ChunkStreamController, FlowControlError};
use crate::net::keepalive::{KeepAliveAction, KeepAliveError, KeepAliveMonitor, TimeoutPolicy};
use crate::net::protocol::{ChunkPos, ClientMessage, ServerMessage};

/// Protocol phase of a connection. Transitions flow one way:
/// Handshaking → Connected → Closing → Disconnected (phases may be skipped,
/// never revisited).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Accepted but not yet identified; skipped by the per-tick protocol drive
    Handshaking { since: Instant },
    /// Fully established; keepalive and chunk streaming run every tick
    Connected,
    /// Close requested; awaiting the socket side to finish
    Closing { since: Instant },
    /// Terminal; removed from the live set on the next sweep
    Disconnected,
}

/// Per-connection failures surfaced at the tick boundary. Every variant is a
/// client protocol violation; the registry decides whether it disconnects the
/// peer or (for loopback peers) escalates fatally.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("flow control: {0}")]
    FlowControl(#[from] FlowControlError),
    #[error("keepalive: {0}")]
    KeepAlive(#[from] KeepAliveError),
    #[error("unexpected {got} during {phase}")]
    UnexpectedMessage {
        got: &'static str,
        phase: &'static str,
    },
}

/// One live peer, owned by the tick thread.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    name: Option<String>,
    remote_addr: SocketAddr,
    /// In-process/loopback peers get trusted keepalive and fatal escalation
    local: bool,
    state: ProtocolState,
    inbound: Receiver<ClientMessage>,
    outbound: UnboundedSender<ServerMessage>,
    keepalive: KeepAliveMonitor,
    chunks: ChunkStreamController,
    messages_sent: u64,
    messages_received: u64,
    chunk_batches_sent: u64,
}

impl Connection {
    pub fn new(
        id: u64,
        remote_addr: SocketAddr,
        inbound: Receiver<ClientMessage>,
        outbound: UnboundedSender<ServerMessage>,
        now: Instant,
    ) -> Self {
        let local = remote_addr.ip().is_loopback();
        let policy = if local {
            TimeoutPolicy::Trusted
        } else {
            TimeoutPolicy::Enforced
        };
        Self {
            id,
            name: None,
            remote_addr,
            local,
            state: ProtocolState::Handshaking { since: now },
            inbound,
            outbound,
            keepalive: KeepAliveMonitor::with_defaults(policy, now),
            chunks: ChunkStreamController::new(),
            messages_sent: 0,
            messages_received: 0,
            chunk_batches_sent: 0,
        }
    }

    /// Override the keepalive cadence from config. Resets the monitor;
    /// call before the connection is handed to the tick thread.
    pub fn set_keepalive_timing(&mut self, interval: Duration, timeout: Duration, now: Instant) {
        let policy = if self.local {
            TimeoutPolicy::Trusted
        } else {
            TimeoutPolicy::Enforced
        };
        self.keepalive = KeepAliveMonitor::new(policy, interval, timeout, now);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ProtocolState::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.state == ProtocolState::Disconnected
    }

    pub fn latency_ms(&self) -> u32 {
        self.keepalive.latency_ms()
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    pub fn chunk_batches_sent(&self) -> u64 {
        self.chunk_batches_sent
    }

    /// Queue a chunk for streaming to this peer.
    pub fn mark_chunk_pending(&mut self, pos: ChunkPos) {
        self.chunks.mark_pending(pos);
    }

    /// Retract a chunk; emits the Forget notice when the unit already left
    /// the pending set.
    pub fn drop_chunk(&mut self, pos: ChunkPos) {
        if self.chunks.drop_chunk(pos) {
            self.send(ServerMessage::ForgetChunk { pos });
        }
    }

    /// Move the nearest-first streaming reference point.
    pub fn set_stream_center(&mut self, center: ChunkPos) {
        self.chunks.set_center(center);
    }

    /// Request an orderly close. Sends the reason best-effort; the record
    /// leaves the live set on a later tick's sweep.
    pub fn disconnect(&mut self, reason: &str, now: Instant) {
        match self.state {
            ProtocolState::Closing { .. } | ProtocolState::Disconnected => {}
            _ => {
                debug!("Disconnecting connection {}: {}", self.id, reason);
                self.send(ServerMessage::Disconnect {
                    reason: reason.to_string(),
                });
                self.state = ProtocolState::Closing { since: now };
            }
        }
    }

    /// Drive one tick of this connection's protocol.
    pub fn tick(&mut self, now: Instant) -> Result<(), ConnectionError> {
        match self.state {
            ProtocolState::Handshaking { since } => self.tick_handshake(since, now),
            ProtocolState::Connected => self.tick_connected(now),
            ProtocolState::Closing { since } => {
                self.tick_closing(since, now);
                Ok(())
            }
            ProtocolState::Disconnected => Ok(()),
        }
    }

    fn tick_handshake(&mut self, since: Instant, now: Instant) -> Result<(), ConnectionError> {
        loop {
            match self.inbound.try_recv() {
                Ok(ClientMessage::Hello { name }) => {
                    self.messages_received += 1;
                    info!(
                        "Connection {} ({}) identified as '{}'",
                        self.id, self.remote_addr, name
                    );
                    self.name = Some(name);
                    self.send(ServerMessage::HelloAck {
                        connection_id: self.id,
                    });
                    self.state = ProtocolState::Connected;
                    return Ok(());
                }
                Ok(other) => {
                    self.messages_received += 1;
                    return Err(ConnectionError::UnexpectedMessage {
                        got: message_name(&other),
                        phase: "handshake",
                    });
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.state = ProtocolState::Disconnected;
                    return Ok(());
                }
            }
        }
        if now.duration_since(since) >= net_limits::HANDSHAKE_TIMEOUT {
            self.disconnect("Took too long to log in", now);
        }
        Ok(())
    }

    fn tick_connected(&mut self, now: Instant) -> Result<(), ConnectionError> {
        match self.keepalive.tick(now, None) {
            KeepAliveAction::SendChallenge(token) => {
                self.send(ServerMessage::KeepAlive { token });
            }
            KeepAliveAction::TimedOut => {
                self.disconnect("Timed out", now);
                return Ok(());
            }
            KeepAliveAction::StuckClosing | KeepAliveAction::None => {}
        }

        loop {
            match self.inbound.try_recv() {
                Ok(msg) => {
                    self.messages_received += 1;
                    self.handle_message(msg, now)?;
                    if self.state != ProtocolState::Connected {
                        return Ok(());
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    // Socket side is gone; nothing left to close politely
                    self.state = ProtocolState::Disconnected;
                    return Ok(());
                }
            }
        }

        let batch = self.chunks.try_send();
        if !batch.is_empty() {
            self.send(ServerMessage::ChunkBatchStart);
            let count = batch.len() as u32;
            for pos in batch {
                self.send(ServerMessage::Chunk { pos });
            }
            self.send(ServerMessage::ChunkBatchFinish { count });
            self.chunk_batches_sent += 1;
            trace!("Connection {}: sent chunk batch of {}", self.id, count);
        }
        Ok(())
    }

    fn tick_closing(&mut self, since: Instant, now: Instant) {
        // Socket teardown normally closes the inbound channel; the grace
        // window catches peers that never finish the close.
        if self.inbound.is_empty()
            && matches!(self.inbound.try_recv(), Err(TryRecvError::Disconnected))
        {
            self.state = ProtocolState::Disconnected;
            return;
        }
        if self.keepalive.tick(now, Some(since)) == KeepAliveAction::StuckClosing {
            debug!("Connection {} stuck in close, dropping", self.id);
            self.state = ProtocolState::Disconnected;
        }
    }

    /// Explicit transition function for messages arriving in Connected state.
    fn handle_message(&mut self, msg: ClientMessage, now: Instant) -> Result<(), ConnectionError> {
        match msg {
            ClientMessage::KeepAlive { token } => {
                let latency = self.keepalive.on_response(token, now)?;
                trace!("Connection {}: latency {}ms", self.id, latency);
                Ok(())
            }
            ClientMessage::ChunkBatchAck { chunks_per_tick } => {
                self.chunks.on_batch_acknowledged(chunks_per_tick)?;
                Ok(())
            }
            ClientMessage::Goodbye => {
                debug!("Connection {} requested leave", self.id);
                self.state = ProtocolState::Closing { since: now };
                Ok(())
            }
            ClientMessage::Hello { .. } => Err(ConnectionError::UnexpectedMessage {
                got: "Hello",
                phase: "play",
            }),
        }
    }

    fn send(&mut self, msg: ServerMessage) {
        if self.outbound.send(msg).is_ok() {
            self.messages_sent += 1;
        } else {
            // Writer task is gone; the socket is already dead
            self.state = ProtocolState::Disconnected;
        }
    }
}

fn message_name(msg: &ClientMessage) -> &'static str {
    match msg {
        ClientMessage::Hello { .. } => "Hello",
        ClientMessage::ChunkBatchAck { .. } => "ChunkBatchAck",
        ClientMessage::KeepAlive { .. } => "KeepAlive",
        ClientMessage::Goodbye => "Goodbye",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::Sender;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn remote_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)), 25565)
    }

    fn local_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 25565)
    }

    fn test_connection(
        addr: SocketAddr,
    ) -> (
        Connection,
        Sender<ClientMessage>,
        UnboundedReceiver<ServerMessage>,
    ) {
        let (in_tx, in_rx) = crossbeam_channel::unbounded();
        let (out_tx, out_rx) = tokio::sync::mpsc::unbounded_channel();
        let conn = Connection::new(1, addr, in_rx, out_tx, Instant::now());
        (conn, in_tx, out_rx)
    }

    fn connected(
        addr: SocketAddr,
    ) -> (
        Connection,
        Sender<ClientMessage>,
        UnboundedReceiver<ServerMessage>,
    ) {
        let (mut conn, in_tx, mut out_rx) = test_connection(addr);
        in_tx
            .send(ClientMessage::Hello {
                name: "peer".to_string(),
            })
            .unwrap();
        conn.tick(Instant::now()).unwrap();
        assert!(conn.is_connected());
        // Swallow the HelloAck
        assert!(matches!(
            out_rx.try_recv().unwrap(),
            ServerMessage::HelloAck { .. }
        ));
        (conn, in_tx, out_rx)
    }

    #[test]
    fn test_handshake_transitions_to_connected() {
        let (mut conn, in_tx, mut out_rx) = test_connection(remote_addr());
        assert!(matches!(conn.state(), ProtocolState::Handshaking { .. }));

        in_tx
            .send(ClientMessage::Hello {
                name: "alice".to_string(),
            })
            .unwrap();
        conn.tick(Instant::now()).unwrap();

        assert!(conn.is_connected());
        match out_rx.try_recv().unwrap() {
            ServerMessage::HelloAck { connection_id } => assert_eq!(connection_id, 1),
            other => panic!("expected HelloAck, got {other:?}"),
        }
    }

    #[test]
    fn test_message_before_hello_is_violation() {
        let (mut conn, in_tx, _out_rx) = test_connection(remote_addr());
        in_tx.send(ClientMessage::Goodbye).unwrap();
        let result = conn.tick(Instant::now());
        assert!(matches!(
            result,
            Err(ConnectionError::UnexpectedMessage { .. })
        ));
    }

    #[test]
    fn test_handshake_timeout_closes() {
        let (mut conn, _in_tx, mut out_rx) = test_connection(remote_addr());
        let later = Instant::now() + net_limits::HANDSHAKE_TIMEOUT;
        conn.tick(later).unwrap();
        assert!(matches!(conn.state(), ProtocolState::Closing { .. }));
        assert!(matches!(
            out_rx.try_recv().unwrap(),
            ServerMessage::Disconnect { .. }
        ));
    }

    #[test]
    fn test_goodbye_enters_closing() {
        let (mut conn, in_tx, _out_rx) = connected(remote_addr());
        in_tx.send(ClientMessage::Goodbye).unwrap();
        conn.tick(Instant::now()).unwrap();
        assert!(matches!(conn.state(), ProtocolState::Closing { .. }));
    }

    #[test]
    fn test_batch_ack_without_batch_is_violation() {
        let (mut conn, in_tx, _out_rx) = connected(remote_addr());
        in_tx
            .send(ClientMessage::ChunkBatchAck {
                chunks_per_tick: 4.0,
            })
            .unwrap();
        let result = conn.tick(Instant::now());
        assert!(matches!(result, Err(ConnectionError::FlowControl(_))));
    }

    #[test]
    fn test_chunk_batch_framing_on_wire() {
        let (mut conn, _in_tx, mut out_rx) = connected(remote_addr());
        for i in 0..3 {
            conn.mark_chunk_pending(ChunkPos::new(i, 0));
        }
        conn.tick(Instant::now()).unwrap();

        assert!(matches!(
            out_rx.try_recv().unwrap(),
            ServerMessage::ChunkBatchStart
        ));
        let mut units = 0;
        loop {
            match out_rx.try_recv().unwrap() {
                ServerMessage::Chunk { .. } => units += 1,
                ServerMessage::ChunkBatchFinish { count } => {
                    assert_eq!(count, units);
                    break;
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert_eq!(units, 3);
    }

    #[test]
    fn test_drop_unsent_chunk_emits_forget() {
        let (mut conn, _in_tx, mut out_rx) = connected(remote_addr());
        conn.drop_chunk(ChunkPos::new(9, 9));
        match out_rx.try_recv().unwrap() {
            ServerMessage::ForgetChunk { pos } => assert_eq!(pos, ChunkPos::new(9, 9)),
            other => panic!("expected ForgetChunk, got {other:?}"),
        }

        // A still-pending chunk is retracted silently
        conn.mark_chunk_pending(ChunkPos::new(3, 3));
        conn.drop_chunk(ChunkPos::new(3, 3));
        assert!(out_rx.try_recv().is_err());
    }

    #[test]
    fn test_loopback_connection_is_local() {
        let (conn, _in_tx, _out_rx) = test_connection(local_addr());
        assert!(conn.is_local());
        let (conn, _in_tx, _out_rx) = test_connection(remote_addr());
        assert!(!conn.is_local());
    }

    #[test]
    fn test_dead_socket_marks_disconnected() {
        let (mut conn, in_tx, _out_rx) = connected(remote_addr());
        drop(in_tx);
        conn.tick(Instant::now()).unwrap();
        assert!(conn.is_disconnected());
    }

    #[test]
    fn test_timed_out_peer_holding_socket_is_swept() {
        let (mut conn, in_tx, _out_rx) = connected(remote_addr());
        let start = Instant::now();

        // Challenge goes out at the interval; the peer never answers
        conn.tick(start + Duration::from_secs(15)).unwrap();
        let timed_out_at = start + Duration::from_secs(46);
        conn.tick(timed_out_at).unwrap();
        assert!(matches!(conn.state(), ProtocolState::Closing { .. }));

        // The peer keeps its socket open (inbound channel stays alive), so
        // only the grace window can evict it
        let mut now = timed_out_at;
        let deadline = timed_out_at + Duration::from_secs(11);
        while now < deadline && !conn.is_disconnected() {
            now += Duration::from_millis(50);
            conn.tick(now).unwrap();
        }
        assert!(conn.is_disconnected());
        drop(in_tx);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (mut conn, _in_tx, mut out_rx) = connected(remote_addr());
        let now = Instant::now();
        conn.disconnect("first", now);
        conn.disconnect("second", now);

        let mut notices = 0;
        while let Ok(msg) = out_rx.try_recv() {
            if matches!(msg, ServerMessage::Disconnect { .. }) {
                notices += 1;
            }
        }
        assert_eq!(notices, 1);
    }
}
