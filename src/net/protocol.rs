use serde::{Deserialize, Serialize};

/// Chunk coordinate key. Identifies one bulk-data unit on the wire and in the
/// per-connection pending set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Squared distance to another position, in chunk units.
    pub fn dist_sq(&self, other: ChunkPos) -> u64 {
        let dx = (self.x as i64 - other.x as i64).unsigned_abs();
        let dz = (self.z as i64 - other.z as i64).unsigned_abs();
        dx * dx + dz * dz
    }
}

impl std::fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}

/// Messages from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Handshake: identifies the peer and moves it out of the connecting state
    Hello { name: String },
    /// Acknowledges a chunk batch, reporting the client-measured consumption
    /// rate in chunks per tick (may be NaN; treated as the floor rate)
    ChunkBatchAck { chunks_per_tick: f32 },
    /// Echo of a keepalive challenge token
    KeepAlive { token: u64 },
    /// Orderly leave request
    Goodbye,
}

/// Messages from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Handshake accepted; carries the server-assigned connection id
    HelloAck { connection_id: u64 },
    /// Marks the start of a chunk batch; no payload
    ChunkBatchStart,
    /// One bulk-data unit (payload bytes are attached by the world module)
    Chunk { pos: ChunkPos },
    /// Marks the end of a chunk batch; carries the number of units sent
    ChunkBatchFinish { count: u32 },
    /// Retracts a previously-sent or never-queued unit
    ForgetChunk { pos: ChunkPos },
    /// Liveness challenge; the client must echo the token
    KeepAlive { token: u64 },
    /// Server is dropping the connection
    Disconnect { reason: String },
}

/// Encode a message using bincode
/// Uses legacy config for fixed-size integers (stable wire layout for clients)
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, EncodeError> {
    bincode::serde::encode_to_vec(message, bincode::config::legacy())
        .map_err(|e| EncodeError(e.to_string()))
}

/// Decode a message using bincode
/// Uses legacy config for fixed-size integers (stable wire layout for clients)
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, DecodeError> {
    bincode::serde::decode_from_slice(data, bincode::config::legacy())
        .map(|(msg, _)| msg)
        .map_err(|e| DecodeError(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
#[error("Encode error: {0}")]
pub struct EncodeError(String);

#[derive(Debug, thiserror::Error)]
#[error("Decode error: {0}")]
pub struct DecodeError(String);
