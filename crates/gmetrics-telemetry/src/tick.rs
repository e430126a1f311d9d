//! Tick driver: a single monotonic `timerfd` fans periodic ticks out to
//! every registered handler, in the order they were registered.

use std::time::Duration;

use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use parking_lot::Mutex;

struct TickState {
    timer: TimerFd,
    handlers: Vec<Box<dyn FnMut() + Send>>,
}

pub struct TickDriver {
    state: Mutex<TickState>,
}

impl TickDriver {
    /// Creates a monotonic interval timer firing every `interval`.
    ///
    /// Forces the runtime context to initialize here, before any
    /// `SIGUSR1` handler is installed: the handler only ever touches an
    /// already-initialized context, which keeps it async-signal-safe.
    pub fn new(interval: Duration) -> nix::Result<Self> {
        let _ = gmetrics_runtime::context();
        let timer = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::empty())?;
        timer.set(Expiration::Interval(TimeSpec::from_duration(interval)), TimerSetTimeFlags::empty())?;
        Ok(Self { state: Mutex::new(TickState { timer, handlers: Vec::new() }) })
    }

    /// Registers a handler to run on every tick, after those already
    /// registered.
    pub fn start_timeout<F: FnMut() + Send + 'static>(&self, handler: F) {
        self.state.lock().handlers.push(Box::new(handler));
    }

    /// Blocks for the next tick, then runs every handler in insertion
    /// order and clears the flush flag for the next batch.
    pub fn run_timeout_handlers(&self) -> nix::Result<()> {
        let mut state = self.state.lock();
        state.timer.wait()?;
        for handler in state.handlers.iter_mut() {
            handler();
        }
        drop(state);
        gmetrics_runtime::context().clear_flush_requested();
        Ok(())
    }
}
