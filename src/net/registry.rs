//! Connection lifecycle management
//!
//! Bridges the many-producer I/O tasks to the single-consumer tick thread.
//! I/O tasks hand fully-constructed connections into the pending queue and
//! return immediately; only the tick thread touches the live set. The live
//! set is swept before it is ticked, so a connection closed during tick N is
//! torn down at the start of tick N+1 and an in-progress tick never mutates
//! the collection it iterates.

use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::net::connection::Connection;
use crate::net::protocol::ChunkPos;

/// A protocol failure on an in-process/loopback peer. A trusted channel
/// misbehaving points at an internal defect, so the registry escalates it to
/// the scheduler instead of dropping the peer.
#[derive(Debug, thiserror::Error)]
#[error("protocol failure on trusted connection {id}: {detail}")]
pub struct TrustedConnectionFailure {
    pub id: u64,
    pub detail: String,
}

/// Cloneable producer handle used by acceptor tasks.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    pending: Sender<Connection>,
}

impl RegistryHandle {
    /// Hand off a new connection to the tick thread. Never blocks; returns
    /// the connection when the registry is gone so the caller can close the
    /// socket politely.
    pub fn submit(&self, conn: Connection) -> Result<(), Connection> {
        match self.pending.try_send(conn) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(conn)) | Err(TrySendError::Disconnected(conn)) => Err(conn),
        }
    }
}

pub struct ConnectionRegistry {
    pending: Receiver<Connection>,
    handle: RegistryHandle,
    live: Vec<Connection>,
    /// Fairness: reorder the live set every this many ticks (0 disables)
    shuffle_interval_ticks: u32,
    ticks: u64,
    /// Batches sent by connections already swept out of the live set
    retired_chunk_batches: u64,
}

impl ConnectionRegistry {
    pub fn new(shuffle_interval_ticks: u32) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            pending: rx,
            handle: RegistryHandle { pending: tx },
            live: Vec::new(),
            shuffle_interval_ticks,
            ticks: 0,
            retired_chunk_batches: 0,
        }
    }

    pub fn handle(&self) -> RegistryHandle {
        self.handle.clone()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Cumulative chunk batches sent across live and retired connections.
    pub fn chunk_batches_sent(&self) -> u64 {
        self.retired_chunk_batches
            + self
                .live
                .iter()
                .map(Connection::chunk_batches_sent)
                .sum::<u64>()
    }

    /// Move every connection accepted since the last tick into the live set.
    /// Tick-thread-only.
    pub fn drain_pending(&mut self) -> usize {
        let mut accepted = 0;
        while let Ok(conn) = self.pending.try_recv() {
            debug!("Connection {} joined live set ({})", conn.id(), conn.remote_addr());
            self.live.push(conn);
            accepted += 1;
        }
        accepted
    }

    /// Sweep out connections that finished closing, then tick the rest.
    /// Tick-thread-only. A per-connection error disconnects that peer with a
    /// descriptive reason; an error on a trusted/loopback peer is returned
    /// for fatal escalation.
    pub fn tick_all(&mut self, now: Instant) -> Result<(), TrustedConnectionFailure> {
        let retired = &mut self.retired_chunk_batches;
        self.live.retain_mut(|conn| {
            if conn.is_disconnected() {
                info!("Connection {} removed ({})", conn.id(), conn.remote_addr());
                *retired += conn.chunk_batches_sent();
                false
            } else {
                true
            }
        });

        self.ticks += 1;
        if self.shuffle_interval_ticks > 0 && self.ticks % self.shuffle_interval_ticks as u64 == 0 {
            self.live.shuffle(&mut rand::thread_rng());
        }

        for conn in &mut self.live {
            if let Err(e) = conn.tick(now) {
                if conn.is_local() {
                    return Err(TrustedConnectionFailure {
                        id: conn.id(),
                        detail: e.to_string(),
                    });
                }
                warn!("Connection {}: {}", conn.id(), e);
                conn.disconnect(&format!("Protocol error: {e}"), now);
            }
        }
        Ok(())
    }

    /// Best-effort disconnect of every live connection (shutdown path).
    pub fn disconnect_all(&mut self, reason: &str, now: Instant) {
        for conn in &mut self.live {
            conn.disconnect(reason, now);
        }
        self.live.clear();
    }

    /// Queue a chunk for every connected peer. Convenience for the world seam.
    pub fn broadcast_chunk(&mut self, pos: ChunkPos) {
        for conn in &mut self.live {
            if conn.is_connected() {
                conn.mark_chunk_pending(pos);
            }
        }
    }

    /// Mutable access for the world tick (mark/drop chunks, move centers).
    pub fn connections_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.live.iter_mut()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.live.iter()
    }
}
