//! TCP accept loop and per-socket I/O tasks
//!
//! Each accepted socket gets a reader task and a writer task on the tokio
//! runtime. They only move bytes: frames in, frames out. All protocol
//! state lives in the `Connection` handed to the tick thread, bridged by
//! an inbound crossbeam channel and an outbound tokio channel.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::net::connection::Connection;
use crate::net::framing::{self, FramingError};
use crate::net::protocol::{self, ClientMessage, ServerMessage};
use crate::net::registry::RegistryHandle;

/// Accept connections until the listener fails or the task is aborted.
pub async fn run_acceptor(
    config: &ServerConfig,
    registry: RegistryHandle,
    metrics: Arc<Metrics>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::new(config.bind_address, config.port);
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    loop {
        let (socket, peer) = listener.accept().await?;
        if let Err(e) = socket.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        accept_one(socket, peer, config, &registry, &metrics).await;
    }
}

/// Wire one socket up to a fresh `Connection` and hand it to the tick
/// thread. If the tick thread is gone the peer gets a goodbye instead.
async fn accept_one(
    mut socket: TcpStream,
    peer: SocketAddr,
    config: &ServerConfig,
    registry: &RegistryHandle,
    metrics: &Arc<Metrics>,
) {
    let id = rand::random::<u64>();
    let now = Instant::now();
    let (in_tx, in_rx) = crossbeam_channel::unbounded();
    let (out_tx, out_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut conn = Connection::new(id, peer, in_rx, out_tx, now);
    conn.set_keepalive_timing(config.keepalive_interval, config.keepalive_timeout, now);

    if registry.submit(conn).is_err() {
        warn!("Rejecting connection from {}: server is shutting down", peer);
        if let Ok(bytes) = protocol::encode(&ServerMessage::Disconnect {
            reason: "Server closed".to_string(),
        }) {
            let _ = framing::write_message(&mut socket, &bytes).await;
        }
        return;
    }

    metrics.connections_accepted.fetch_add(1, Ordering::Relaxed);
    info!("Accepted connection {:016x} from {}", id, peer);

    let (read_half, write_half) = socket.into_split();
    tokio::spawn(read_loop(
        read_half,
        id,
        in_tx,
        metrics.clone(),
    ));
    tokio::spawn(write_loop(write_half, id, out_rx, metrics.clone()));
}

/// Pump frames off the socket into the tick thread's inbound channel.
/// Dropping `in_tx` on exit is what tells the tick thread the peer is gone.
async fn read_loop(
    mut read_half: OwnedReadHalf,
    id: u64,
    in_tx: crossbeam_channel::Sender<ClientMessage>,
    metrics: Arc<Metrics>,
) {
    loop {
        let frame = match framing::read_message(&mut read_half).await {
            Ok(frame) => frame,
            Err(FramingError::ConnectionClosed) => {
                debug!("Connection {:016x} closed by peer", id);
                break;
            }
            Err(e) => {
                debug!("Read error on connection {:016x}: {}", id, e);
                break;
            }
        };
        let message: ClientMessage = match protocol::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Undecodable frame from connection {:016x}: {}", id, e);
                break;
            }
        };
        metrics.messages_received.fetch_add(1, Ordering::Relaxed);
        if in_tx.send(message).is_err() {
            // Tick thread already dropped this connection.
            break;
        }
    }
}

/// Drain the tick thread's outbound channel onto the socket. The channel
/// closing (connection dropped on the tick thread) ends the task.
async fn write_loop(
    mut write_half: OwnedWriteHalf,
    id: u64,
    mut out_rx: tokio::sync::mpsc::UnboundedReceiver<ServerMessage>,
    metrics: Arc<Metrics>,
) {
    while let Some(message) = out_rx.recv().await {
        let bytes = match protocol::encode(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode message for connection {:016x}: {}", id, e);
                continue;
            }
        };
        if let Err(e) = framing::write_message(&mut write_half, &bytes).await {
            debug!("Write error on connection {:016x}: {}", id, e);
            break;
        }
        metrics.messages_sent.fetch_add(1, Ordering::Relaxed);
    }
    let _ = write_half.shutdown().await;
}
