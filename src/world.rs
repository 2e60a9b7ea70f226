//! Simulation hook driven by the tick scheduler
//!
//! The scheduler owns everything timing-related; the world only has to
//! advance its own state once per tick. Expensive optional work should
//! consult `have_time` and bail once the slice is spent.

use crate::net::registry::ConnectionRegistry;

/// One tick of simulation, called from the tick thread.
pub trait WorldTick: Send {
    /// Advance the world by one tick.
    ///
    /// `have_time` reports whether budget remains in the current slice;
    /// it only answers truthfully on the tick thread. Returning an error
    /// is fatal and stops the server.
    fn tick_world(
        &mut self,
        connections: &mut ConnectionRegistry,
        have_time: &dyn Fn() -> bool,
    ) -> anyhow::Result<()>;
}

/// World that does nothing per tick. Useful as a scaffold and in tests.
#[derive(Debug, Default)]
pub struct IdleWorld;

impl WorldTick for IdleWorld {
    fn tick_world(
        &mut self,
        _connections: &mut ConnectionRegistry,
        _have_time: &dyn Fn() -> bool,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
