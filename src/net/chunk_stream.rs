//! Adaptive chunk-streaming flow control
//!
//! Paces bulk-data batches per connection using a refillable quota and
//! client-reported throughput. The client governs the rate: a slow renderer
//! cannot be pushed faster, and a fast one is not held below the ceiling.
//! Until the first acknowledgement only one batch may be outstanding, which
//! establishes a safe baseline before pipelining unlocks.

use hashbrown::HashSet;
use smallvec::SmallVec;

use crate::constants::stream;
use crate::net::protocol::ChunkPos;

/// Default send rate before the client has reported anything, chunks/tick.
pub const DEFAULT_RATE: f32 = 9.0;

/// Errors raised by acknowledgement handling; all of them are client
/// protocol violations, not server faults.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FlowControlError {
    #[error("batch acknowledged with no batch outstanding")]
    UnexpectedAck,
}

/// Per-connection batching state. Driven once per tick by the owning
/// connection via [`ChunkStreamController::try_send`].
#[derive(Debug)]
pub struct ChunkStreamController {
    /// Coordinates queued for send; insertion order is irrelevant
    pending: HashSet<ChunkPos>,
    /// Client-governed rate, chunks per tick, clamped to [MIN_RATE, MAX_RATE]
    desired_rate: f32,
    /// Accumulated sendable budget, capped at max(1, desired_rate)
    quota: f32,
    unacked_batches: u32,
    max_unacked_batches: u32,
    /// Reference point for nearest-first selection
    center: ChunkPos,
}

impl ChunkStreamController {
    pub fn new() -> Self {
        Self {
            pending: HashSet::new(),
            desired_rate: DEFAULT_RATE,
            quota: 0.0,
            unacked_batches: 0,
            max_unacked_batches: stream::INITIAL_MAX_UNACKED,
            center: ChunkPos::new(0, 0),
        }
    }

    /// Queue a coordinate for streaming. Idempotent.
    pub fn mark_pending(&mut self, pos: ChunkPos) {
        self.pending.insert(pos);
    }

    /// Retract a coordinate. Returns `true` when the unit was already sent
    /// (or never queued) and the client must receive a Forget notice; a unit
    /// still pending is silently dropped instead.
    pub fn drop_chunk(&mut self, pos: ChunkPos) -> bool {
        !self.pending.remove(&pos)
    }

    /// Move the nearest-first reference point.
    pub fn set_center(&mut self, center: ChunkPos) {
        self.center = center;
    }

    /// Attempt to form one batch for this tick. Returns the selected
    /// coordinates, nearest to the center first; an empty result means no
    /// batch was started (backpressure, no budget, or nothing pending).
    pub fn try_send(&mut self) -> SmallVec<[ChunkPos; 16]> {
        let mut batch = SmallVec::new();

        // Backpressure: the client has not kept up with outstanding batches.
        if self.unacked_batches >= self.max_unacked_batches {
            return batch;
        }

        // Refill, capped so idle time cannot bank unbounded credit.
        let cap = self.desired_rate.max(1.0);
        self.quota = (self.quota + self.desired_rate).min(cap);

        if self.quota < 1.0 || self.pending.is_empty() {
            return batch;
        }

        let count = (self.quota.floor() as usize).min(self.pending.len());
        self.select_nearest(count, &mut batch);
        for pos in &batch {
            self.pending.remove(pos);
        }

        if !batch.is_empty() {
            self.unacked_batches += 1;
            self.quota -= batch.len() as f32;
        }
        batch
    }

    /// Client acknowledged a batch, reporting its measured consumption rate.
    pub fn on_batch_acknowledged(&mut self, chunks_per_tick: f32) -> Result<(), FlowControlError> {
        if self.unacked_batches == 0 {
            return Err(FlowControlError::UnexpectedAck);
        }
        self.unacked_batches -= 1;

        // Non-finite input (NaN from a confused client) falls to the floor
        // rate rather than zero, so progress is always possible.
        self.desired_rate = if chunks_per_tick.is_finite() {
            chunks_per_tick.clamp(stream::MIN_RATE, stream::MAX_RATE)
        } else {
            stream::MIN_RATE
        };

        if self.unacked_batches == 0 {
            self.quota = 1.0;
        }
        // First ack unlocks pipelining; never narrows back down.
        self.max_unacked_batches = stream::PIPELINED_MAX_UNACKED;
        Ok(())
    }

    /// Nearest-to-center selection. A partial selection sort is used when the
    /// candidate pool dwarfs the batch; functionally identical to a full sort.
    fn select_nearest(&self, count: usize, out: &mut SmallVec<[ChunkPos; 16]>) {
        let center = self.center;
        let mut candidates: Vec<ChunkPos> = self.pending.iter().copied().collect();

        if count == 0 || candidates.is_empty() {
            return;
        }
        if count < candidates.len() && candidates.len() > count * stream::PARTIAL_SORT_RATIO {
            candidates.select_nth_unstable_by_key(count - 1, |p| p.dist_sq(center));
            candidates.truncate(count);
        }
        candidates.sort_unstable_by_key(|p| p.dist_sq(center));
        out.extend(candidates.into_iter().take(count));
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, pos: ChunkPos) -> bool {
        self.pending.contains(&pos)
    }

    pub fn desired_rate(&self) -> f32 {
        self.desired_rate
    }

    pub fn unacked_batches(&self) -> u32 {
        self.unacked_batches
    }

    pub fn max_unacked_batches(&self) -> u32 {
        self.max_unacked_batches
    }
}

impl Default for ChunkStreamController {
    fn default() -> Self {
        Self::new()
    }
}
