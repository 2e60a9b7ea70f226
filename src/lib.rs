//! Tickhost Server Library
//!
//! The real-time core of a persistent multiplayer simulation server:
//! a fixed-rate tick loop with overload absorption and catch-up sprints,
//! a time-budgeted deferred task queue, and per-connection backpressure
//! for chunk streaming and keepalive.
//!
//! Network I/O runs on the tokio runtime; everything tick-ordered runs
//! on one dedicated thread and the two sides only talk through channels.

pub mod config;
pub mod constants;
pub mod metrics;
pub mod net;
pub mod tick;
pub mod util;
pub mod world;
