//! Fixed-rate tick loop
//!
//! The scheduler runs on a dedicated thread and drives everything that is
//! tick-ordered: pending connection intake, per-connection protocol work,
//! the world hook and the deferred task queue. Between ticks it parks on
//! the task channel so late submissions still run inside the same cycle.
//!
//! The loop is strictly cooperative: one tick runs to completion before
//! the next begins, and the time budget handed to the world and the task
//! queue only answers truthfully on this thread.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::constants::tick;
use crate::metrics::Metrics;
use crate::net::registry::ConnectionRegistry;
use crate::tick::diagnostics::DiagnosticSnapshot;
use crate::tick::task_queue::{TaskHandle, TaskQueue, TaskRejected};
use crate::util::rolling::RollingAverage;
use crate::world::WorldTick;

const PHASE_RUNNING: u8 = 0;
const PHASE_STOPPING: u8 = 1;
const PHASE_STOPPED: u8 = 2;

/// Lifecycle phase of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Stopping,
    Stopped,
}

/// Shared lifecycle flag. RUNNING -> STOPPING happens at most once.
#[derive(Debug, Clone)]
pub struct SchedulerState(Arc<AtomicU8>);

impl SchedulerState {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(PHASE_RUNNING)))
    }

    pub fn phase(&self) -> Phase {
        match self.0.load(Ordering::Acquire) {
            PHASE_RUNNING => Phase::Running,
            PHASE_STOPPING => Phase::Stopping,
            _ => Phase::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase() == Phase::Running
    }

    /// Request the transition to STOPPING. Returns true only for the call
    /// that actually performed it; repeated failures during shutdown are
    /// absorbed here.
    pub fn begin_stop(&self) -> bool {
        self.0
            .compare_exchange(
                PHASE_RUNNING,
                PHASE_STOPPING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn mark_stopped(&self) {
        self.0.store(PHASE_STOPPED, Ordering::Release);
    }
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable remote control for the tick thread.
///
/// The acceptor and the signal handler hold one of these; the scheduler
/// itself never needs it.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    state: SchedulerState,
    tasks: TaskHandle,
    sprint_requested: Arc<AtomicBool>,
}

impl SchedulerHandle {
    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Queue a closure to run on the tick thread. Rejected once shutdown
    /// has begun.
    pub fn submit_deferred(
        &self,
        action: impl FnOnce() + Send + 'static,
    ) -> Result<(), TaskRejected> {
        self.tasks.submit(action)
    }

    /// Ask the loop to burn accumulated debt by running zero-wait ticks.
    pub fn request_sprint(&self) {
        self.sprint_requested.store(true, Ordering::Release);
    }

    /// Begin a clean shutdown. Task intake closes immediately; the tick
    /// thread finishes its current cycle before winding down. Returns
    /// false if shutdown was already underway.
    pub fn stop(&self) -> bool {
        let first = self.state.begin_stop();
        if first {
            self.tasks.close();
        }
        first
    }
}

/// Outcome of opening a tick cycle.
#[derive(Debug)]
struct CycleStart {
    /// This cycle runs with a zero time slice, consuming one period of debt
    sprinting: bool,
    /// Lateness to report, already rate-limited
    overload: Option<Duration>,
}

/// Deadline and debt bookkeeping for the fixed-rate loop.
///
/// `next_deadline` only ever moves forward: by one period at the end of a
/// normal cycle, or jumping to `now` when an overload is absorbed.
#[derive(Debug)]
struct TickClock {
    period: Duration,
    next_deadline: Instant,
    debt: Duration,
    sprinting: bool,
    last_overload_warning: Option<Instant>,
}

impl TickClock {
    fn new(period: Duration, now: Instant) -> Self {
        Self {
            period,
            next_deadline: now + period,
            debt: Duration::ZERO,
            sprinting: false,
            last_overload_warning: None,
        }
    }

    fn deadline(&self) -> Instant {
        self.next_deadline
    }

    fn debt(&self) -> Duration {
        self.debt
    }

    /// Open a cycle: engage or end a sprint, and absorb overload lateness.
    fn begin_cycle(&mut self, now: Instant, sprint_requested: bool) -> CycleStart {
        if sprint_requested && !self.sprinting && self.debt >= self.period {
            self.sprinting = true;
        }

        if self.sprinting {
            if self.debt >= self.period {
                // Zero time slice: skip the wait and repay one period.
                self.debt -= self.period;
                return CycleStart {
                    sprinting: true,
                    overload: None,
                };
            }
            self.sprinting = false;
        }

        let mut overload = None;
        if now > self.next_deadline {
            let lateness = now - self.next_deadline;
            let warn_due = match self.last_overload_warning {
                Some(at) => now.duration_since(at) >= tick::OVERLOAD_WARNING_INTERVAL,
                None => true,
            };
            if lateness > tick::OVERLOAD_THRESHOLD && warn_due {
                // Stop chasing the backlog: remember it as debt (capped)
                // and restart the cadence from now.
                self.debt = (self.debt + lateness).min(tick::MAX_CATCHUP_DEBT);
                self.next_deadline = now;
                self.last_overload_warning = Some(now);
                overload = Some(lateness);
            }
        }

        CycleStart {
            sprinting: false,
            overload,
        }
    }

    /// Close a cycle by scheduling the next deadline. Sprint cycles keep
    /// the deadline where it is; they exist to eat into it.
    fn finish_cycle(&mut self, sprinted: bool) {
        if !sprinted {
            self.next_deadline += self.period;
        }
    }
}

/// Time budget for one tick slice.
///
/// Answers true only on the owning thread while the deadline has not
/// passed. `forced` overrides the deadline for startup and shutdown
/// phases where everything must run regardless of timing.
fn time_budget(owner: ThreadId, deadline: Instant, forced: bool) -> impl Fn() -> bool {
    move || std::thread::current().id() == owner && (forced || Instant::now() < deadline)
}

/// The tick loop. Owns the connection registry, the deferred task queue
/// and the world; everything it owns is only touched from `run`.
pub struct TickScheduler<W: WorldTick> {
    world: W,
    registry: ConnectionRegistry,
    queue: TaskQueue,
    clock: TickClock,
    state: SchedulerState,
    sprint_requested: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
    tick_rate: u32,
    period: Duration,
    crash_report_dir: PathBuf,
    /// Average tick duration over 1s / 5s / 15s / 60s
    windows: Vec<RollingAverage>,
    tick: u64,
    started_at: Instant,
}

/// Reporting windows for rolling tick-time averages, in seconds
const WINDOW_SECS: [u32; 4] = [1, 5, 15, 60];

impl<W: WorldTick> TickScheduler<W> {
    pub fn new(
        world: W,
        registry: ConnectionRegistry,
        metrics: Arc<Metrics>,
        config: &ServerConfig,
    ) -> Self {
        let tick_rate = config.tick_rate;
        let windows = WINDOW_SECS
            .iter()
            .map(|secs| RollingAverage::new((secs * tick_rate) as usize))
            .collect();
        Self {
            world,
            registry,
            queue: TaskQueue::new(),
            clock: TickClock::new(config.tick_period(), Instant::now()),
            state: SchedulerState::new(),
            sprint_requested: Arc::new(AtomicBool::new(false)),
            metrics,
            tick_rate,
            period: config.tick_period(),
            crash_report_dir: config.crash_report_dir.clone(),
            windows,
            tick: 0,
            started_at: Instant::now(),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            state: self.state.clone(),
            tasks: self.queue.handle(),
            sprint_requested: self.sprint_requested.clone(),
        }
    }

    /// Run the loop until stopped. Consumes the scheduler; call from the
    /// dedicated tick thread.
    pub fn run(mut self) -> anyhow::Result<()> {
        let owner = std::thread::current().id();
        self.started_at = Instant::now();
        self.clock = TickClock::new(self.period, self.started_at);
        info!(
            "Tick loop started at {} Hz ({}ms period)",
            self.tick_rate,
            self.period.as_millis()
        );

        while self.state.is_running() {
            let now = Instant::now();
            let sprint_requested = self.sprint_requested.load(Ordering::Acquire);
            let cycle = self.clock.begin_cycle(now, sprint_requested);
            if !cycle.sprinting {
                self.sprint_requested.store(false, Ordering::Release);
            }
            if let Some(lateness) = cycle.overload {
                let skipped = lateness.as_millis() / self.period.as_millis().max(1);
                warn!(
                    "Can't keep up! Running {}ms behind; absorbing {} tick(s) as debt ({}ms owed)",
                    lateness.as_millis(),
                    skipped,
                    self.clock.debt().as_millis()
                );
                self.metrics.overload_warnings.fetch_add(1, Ordering::Relaxed);
            }

            let tick_start = Instant::now();
            self.tick += 1;
            self.queue.set_current_tick(self.tick);

            if let Err(err) = self.run_one_tick(owner, now) {
                return self.fail(err);
            }

            // Observability: one sample per cycle, weighted uniformly.
            let elapsed = tick_start.elapsed();
            let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
            for window in &mut self.windows {
                window.insert(elapsed_ms, 1.0);
            }
            self.metrics.record_tick_time(elapsed);
            self.metrics
                .connections_active
                .store(self.registry.live_count() as u64, Ordering::Relaxed);
            self.metrics
                .chunk_batches_sent
                .store(self.registry.chunk_batches_sent(), Ordering::Relaxed);
            if self.tick % (self.tick_rate as u64 * 30) == 0 {
                debug!(
                    tick = self.tick,
                    avg_1s_ms = self.windows[0].average(),
                    avg_60s_ms = self.windows[3].average(),
                    connections = self.registry.live_count(),
                    "tick stats"
                );
            }

            // Managed wait: park on the task channel so fresh submissions
            // still run this cycle, but never oversleep the deadline.
            if !cycle.sprinting {
                let deadline = self.clock.deadline();
                loop {
                    match self.queue.recv_deadline(deadline) {
                        Some(item) => {
                            item.run();
                            self.metrics.tasks_executed.fetch_add(1, Ordering::Relaxed);
                        }
                        None if Instant::now() >= deadline => break,
                        // Bounded park expired early; re-arm.
                        None => {}
                    }
                }
            }

            self.clock.finish_cycle(cycle.sprinting);
        }

        self.shutdown(owner);
        Ok(())
    }

    /// One tick of work: connection intake and protocol, the world, then
    /// eligible deferred tasks.
    fn run_one_tick(&mut self, owner: ThreadId, now: Instant) -> anyhow::Result<()> {
        self.registry.drain_pending();
        self.registry
            .tick_all(now)
            .map_err(anyhow::Error::new)
            .map_err(|e| e.context("trusted connection failed"))?;

        let deadline = self.clock.deadline();
        let have_time = time_budget(owner, deadline, false);
        self.world
            .tick_world(&mut self.registry, &have_time)
            .map_err(|e| e.context("world tick failed"))?;

        // Deferred tasks run while budget lasts; anything three ticks old
        // runs regardless so the queue cannot starve.
        let current = self.tick;
        let metrics = &self.metrics;
        let ran = self.queue.run_all_ready(|item| {
            if have_time() {
                return true;
            }
            if item.age(current) >= tick::MAX_TASK_AGE_TICKS {
                metrics.tasks_expired.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            false
        });
        self.metrics
            .tasks_executed
            .fetch_add(ran as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Fatal path: exactly one STOPPING transition, a diagnostic snapshot,
    /// then best-effort teardown.
    fn fail(mut self, err: anyhow::Error) -> anyhow::Result<()> {
        error!("Fatal error on tick {}: {:#}", self.tick, err);
        if self.state.begin_stop() {
            let snapshot = DiagnosticSnapshot::capture(
                &err,
                self.tick,
                self.started_at.elapsed().as_secs(),
                self.windows.iter().map(RollingAverage::average).collect(),
                self.registry.live_count(),
                self.queue.len(),
            );
            snapshot.write_to(&self.crash_report_dir);
        }
        self.queue.close();
        self.registry
            .disconnect_all("Internal server error", Instant::now());
        self.state.mark_stopped();
        Err(err)
    }

    /// Clean shutdown: drain every queued task with a forced budget, then
    /// tell peers goodbye.
    fn shutdown(&mut self, owner: ThreadId) {
        info!(
            "Stopping after tick {}: draining {} deferred task(s)",
            self.tick,
            self.queue.len()
        );
        self.queue.close();
        let forced = time_budget(owner, Instant::now(), true);
        let drained = self.queue.run_all_ready(|_| forced());
        self.metrics
            .tasks_executed
            .fetch_add(drained as u64, Ordering::Relaxed);
        self.registry.disconnect_all("Server closed", Instant::now());
        self.state.mark_stopped();
        info!("Tick loop stopped ({} task(s) drained)", drained);
    }
}
