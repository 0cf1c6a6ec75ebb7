// src/scheduler.rs

//! Cooperative, non-preemptive actor scheduler.
//!
//! A [`SchedulerLoop`] owns every registered [`Actor`] and drives them from a
//! single thread:
//!
//! ```text
//! run():
//!   initialize() each actor, in registration order, once
//!   loop {
//!     status = Idle
//!     for actor in registration order { actor.fire(&mut status) }
//!     if status == Idle { yield }
//!   }
//! ```
//!
//! Whether an actor fires is entirely its own, data-driven decision. The loop
//! never preempts a `fire`, never time-slices, and never stops by itself.
//!
//! # Termination
//!
//! [`Termination`] is a one-shot signal shared by everyone that may end the
//! run (a source that ran out of input, an actor that hit a frame limit) and
//! whoever waits for it (usually `main`). `terminate()` wakes at most one
//! waiter and then parks the calling thread forever. If that thread is the
//! scheduler's, the scan loop stops with it; otherwise scanning carries on.
//! Nothing here joins or cancels the remaining threads.

use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::error::{SchedulerError, ThreadError};
use crate::os::thread::{self, OsThread, Priority, ThreadBuilder};
use crate::os::WaitCondition;

/// Outcome of one scan pass, accumulated across actors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanStatus {
    /// Nothing fired (yet) in this pass.
    #[default]
    Idle,
    /// At least one actor fired.
    Fired,
}

impl ScanStatus {
    /// Called by an actor that did some work in this pass.
    pub fn mark_fired(&mut self) {
        *self = ScanStatus::Fired;
    }

    #[must_use]
    pub fn is_fired(self) -> bool {
        self == ScanStatus::Fired
    }
}

/// A computational unit fired repeatedly by the scheduler.
///
/// `fire` must return promptly. An actor that cannot make progress (no input,
/// no output room) returns without touching `status`.
pub trait Actor: Send {
    /// Called once, before the first `fire`.
    fn initialize(&mut self) {}

    /// Attempt one unit of work. Call `status.mark_fired()` if any was done.
    fn fire(&mut self, status: &mut ScanStatus);

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// What the scheduler does after a pass in which nothing fired.
pub trait Yielder: Send {
    fn yield_now(&mut self);
}

/// Default [`Yielder`]: give up the processor through the OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsYield;

impl Yielder for OsYield {
    fn yield_now(&mut self) {
        thread::yield_now();
    }
}

/// Lifecycle of a [`SchedulerLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Accepting registrations.
    Constructing,
    /// Actors initialized; scanning.
    Running,
    /// `terminate()` was called on the scan thread. Never left.
    Parked,
}

/// Counters kept by the scan loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerStats {
    pub passes: u64,
    pub idle_passes: u64,
    /// Actor `fire` calls that marked the pass as fired.
    pub firings: u64,
}

#[derive(Debug)]
struct TerminationState {
    terminated: bool,
    waiting: usize,
    /// Lifecycle of the scheduler loop that owns this signal.
    scheduler: SchedulerState,
    /// Kernel thread running that loop, once it has started.
    scan_thread: Option<ThreadId>,
}

impl Default for TerminationState {
    fn default() -> Self {
        Self {
            terminated: false,
            waiting: 0,
            scheduler: SchedulerState::Constructing,
            scan_thread: None,
        }
    }
}

/// One-shot shutdown signal. See the module docs.
///
/// Also records the lifecycle of the owning [`SchedulerLoop`], since only
/// `terminate()` knows when the scan thread parks.
#[derive(Debug, Default)]
pub struct Termination {
    state: Mutex<TerminationState>,
    cond: WaitCondition,
}

/// How long a terminated thread sleeps between checks for cancellation.
const PARK_INTERVAL: Duration = Duration::from_secs(3600);

impl Termination {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Marks the run as terminated, wakes at most one waiter, and parks the
    /// calling thread for good.
    ///
    /// An [`OsThread`] parked here can still be reclaimed with
    /// [`OsThread::cancel`].
    pub fn terminate(&self) -> ! {
        {
            let mut state = self.state.lock();
            if state.terminated {
                warn!("terminate() called again; run already terminated");
            }
            state.terminated = true;
            if state.scan_thread == Some(std::thread::current().id()) {
                state.scheduler = SchedulerState::Parked;
                debug!("Scheduler thread parking");
            }
            let woke = self.cond.signal();
            info!(
                "Termination signalled ({} waiter(s) blocked, woke one: {})",
                state.waiting, woke
            );
        }
        loop {
            thread::sleep(PARK_INTERVAL);
        }
    }

    /// Blocks until some thread calls [`terminate`](Self::terminate).
    ///
    /// Returns immediately if that already happened.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        state.waiting += 1;
        while !state.terminated {
            self.cond.wait(&mut state);
        }
        state.waiting -= 1;
    }

    /// Like [`wait`](Self::wait) with a timeout. Returns whether the run has
    /// terminated.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        state.waiting += 1;
        while !state.terminated {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(std::time::Instant::now()),
                None => Duration::MAX,
            };
            if remaining.is_zero() {
                break;
            }
            self.cond.wait_timeout(&mut state, remaining);
        }
        state.waiting -= 1;
        state.terminated
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    /// Threads currently blocked in `wait`/`wait_timeout`.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.state.lock().waiting
    }

    /// Lifecycle of the scheduler loop that owns this signal.
    #[must_use]
    pub fn scheduler_state(&self) -> SchedulerState {
        self.state.lock().scheduler
    }

    /// Moves the owning loop to `Running` and binds it to the calling thread.
    fn begin_scan(&self) {
        let mut state = self.state.lock();
        if state.scheduler == SchedulerState::Constructing {
            state.scheduler = SchedulerState::Running;
            state.scan_thread = Some(std::thread::current().id());
        }
    }
}

/// Registration-ordered set of actors plus the loop that fires them.
pub struct SchedulerLoop<Y = OsYield> {
    actors: Vec<Box<dyn Actor>>,
    started: bool,
    termination: Arc<Termination>,
    yielder: Y,
    stats: SchedulerStats,
}

impl SchedulerLoop<OsYield> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_yielder(OsYield)
    }
}

impl Default for SchedulerLoop<OsYield> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Y: Yielder> SchedulerLoop<Y> {
    pub fn with_yielder(yielder: Y) -> Self {
        Self {
            actors: Vec::new(),
            started: false,
            termination: Termination::new(),
            yielder,
            stats: SchedulerStats::default(),
        }
    }

    /// Appends `actor` to the scan order.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` once the loop has started.
    pub fn register(&mut self, actor: impl Actor + 'static) -> Result<(), SchedulerError> {
        if self.started {
            return Err(SchedulerError::AlreadyRunning);
        }
        debug!(
            "Registered actor #{} '{}'",
            self.actors.len(),
            actor.name()
        );
        self.actors.push(Box::new(actor));
        Ok(())
    }

    /// Handle to the termination signal, for boundary units and `main`.
    #[must_use]
    pub fn termination(&self) -> Arc<Termination> {
        Arc::clone(&self.termination)
    }

    #[must_use]
    pub fn state(&self) -> SchedulerState {
        self.termination.scheduler_state()
    }

    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.actors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.termination.begin_scan();
        info!("Scheduler starting with {} actor(s)", self.actors.len());
        for actor in &mut self.actors {
            debug!("Initializing actor '{}'", actor.name());
            actor.initialize();
        }
    }

    /// One scan pass: fire every actor once, in registration order.
    ///
    /// Initializes the actors first if the loop has not started yet. Does not
    /// yield.
    pub fn scan(&mut self) -> ScanStatus {
        self.start();
        let mut pass = ScanStatus::Idle;
        for actor in &mut self.actors {
            let mut status = ScanStatus::Idle;
            actor.fire(&mut status);
            if status.is_fired() {
                self.stats.firings += 1;
                pass.mark_fired();
            }
        }
        self.stats.passes += 1;
        pass
    }

    fn step(&mut self) {
        if !self.scan().is_fired() {
            self.stats.idle_passes += 1;
            self.yielder.yield_now();
        }
    }

    /// Runs exactly `passes` scan passes, yielding after idle ones.
    pub fn run_for(&mut self, passes: u64) {
        for _ in 0..passes {
            self.step();
        }
    }

    /// Runs forever.
    pub fn run(mut self) -> ! {
        self.start();
        loop {
            self.step();
        }
    }

    /// Runs the loop on its own named thread.
    ///
    /// # Errors
    ///
    /// `ThreadError::Spawn` if the thread cannot be created.
    pub fn spawn(self, priority: Priority) -> Result<OsThread<()>, ThreadError>
    where
        Y: 'static,
    {
        ThreadBuilder::new()
            .name("scheduler")
            .priority(priority)
            .spawn(move || {
                self.run();
            })
    }
}

impl<Y> std::fmt::Debug for SchedulerLoop<Y> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerLoop")
            .field("actors", &self.actors.iter().map(|a| a.name()).collect::<Vec<_>>())
            .field("started", &self.started)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
