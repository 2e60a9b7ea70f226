/// Tick scheduling constants - CRITICAL: the nominal period is 50ms, overload
/// absorption keys off multiples of it.
pub mod tick {
    use std::time::Duration;

    /// Server tick rate in Hz
    pub const TICK_RATE: u32 = 20;
    /// Nominal tick period
    pub const TICK_PERIOD: Duration = Duration::from_millis(1000 / TICK_RATE as u64);
    /// A deferred task older than this many ticks runs even with no spare time
    pub const MAX_TASK_AGE_TICKS: u64 = 3;
    /// Lateness beyond this triggers an overload warning and debt absorption
    pub const OVERLOAD_THRESHOLD: Duration = Duration::from_secs(2);
    /// Minimum interval between overload warnings (log flood guard)
    pub const OVERLOAD_WARNING_INTERVAL: Duration = Duration::from_secs(15);
    /// Ceiling on absorbed lateness; a longer stall is forgotten, not chased
    pub const MAX_CATCHUP_DEBT: Duration = Duration::from_secs(10);
    /// Longest single park inside the managed end-of-tick wait
    pub const MAX_PARK: Duration = Duration::from_millis(50);
}

/// Chunk streaming flow control constants
pub mod stream {
    /// Floor on the client-governed send rate, in chunks per tick
    pub const MIN_RATE: f32 = 0.01;
    /// Ceiling on the client-governed send rate, in chunks per tick
    pub const MAX_RATE: f32 = 64.0;
    /// Outstanding-batch limit before the first acknowledgement
    pub const INITIAL_MAX_UNACKED: u32 = 1;
    /// Outstanding-batch limit once the client has acknowledged a batch
    pub const PIPELINED_MAX_UNACKED: u32 = 10;
    /// Above this pending/batch ratio, selection uses a partial sort
    pub const PARTIAL_SORT_RATIO: usize = 4;
}

/// Keepalive / liveness constants
pub mod keepalive {
    use std::time::Duration;

    /// Interval between liveness challenges
    pub const INTERVAL: Duration = Duration::from_secs(15);
    /// Hard limit for a challenge response before disconnection
    pub const TIMEOUT: Duration = Duration::from_secs(30);
    /// A connection stuck in Closing longer than this is force-dropped
    pub const STUCK_CLOSE_GRACE: Duration = Duration::from_secs(10);
}

/// Network limits
pub mod net {
    /// Maximum framed message size in bytes
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;
    /// Time a connection may sit in the handshaking sub-state
    pub const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
}
