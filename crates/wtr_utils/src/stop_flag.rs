//! Cooperative cancellation for a pool of test-runner managers.
//!
//! A [StopFlag] pairs a "stop requested" bit, which every long-running loop polls, with a
//! shutdown barrier sized to the number of managers plus their owner. Managers arrive at the
//! barrier exactly once, at the very end of their cleanup; the owner waits on it to learn that
//! every manager has actually finished.
//!
//! The owner side of the barrier may be waited on any number of times. A wait that is abandoned
//! midway (because of a timeout, or because the waiting thread was interrupted) leaves the
//! barrier in a consistent state, and a later wait observes the same arrivals.

use std::sync::{atomic::AtomicBool, Arc};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::atomic::ORDERING;

#[derive(Clone)]
pub struct StopFlag(Arc<StopFlagInner>);

struct StopFlagInner {
    stop_requested: AtomicBool,
    barrier: ShutdownBarrier,
}

impl std::fmt::Debug for StopFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopFlag")
            .field("stop_requested", &self.is_stop_requested())
            .field("managers_done", &self.managers_done())
            .field("num_managers", &self.num_managers())
            .finish()
    }
}

impl StopFlag {
    /// Creates a flag for a pool of `num_managers` managers.
    pub fn new(num_managers: usize) -> Self {
        Self(Arc::new(StopFlagInner {
            stop_requested: AtomicBool::new(false),
            barrier: ShutdownBarrier::new(num_managers),
        }))
    }

    /// Requests that every manager stop. Does not wait for them to do so.
    pub fn stop(&self) {
        tracing::debug!("stop requested");
        self.0.stop_requested.store(true, ORDERING);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.stop_requested.load(ORDERING)
    }

    /// Marks one manager as done with its cleanup, then waits up to `timeout` for the rest of
    /// the pool and the owner to arrive.
    ///
    /// Returns whether every party arrived in time. A manager must call this exactly once.
    pub fn manager_done(&self, timeout: Duration) -> bool {
        self.0.barrier.arrive_manager(timeout)
    }

    /// Waits until every manager has called [StopFlag::manager_done], or `timeout` elapses.
    /// `None` waits indefinitely.
    ///
    /// Returns whether all managers are done. Safe to call again after a timed-out or
    /// abandoned call.
    pub fn wait_all(&self, timeout: Option<Duration>) -> bool {
        self.0.barrier.arrive_owner(timeout)
    }

    /// Number of managers that have finished their cleanup.
    pub fn managers_done(&self) -> usize {
        self.0.barrier.managers_arrived()
    }

    pub fn num_managers(&self) -> usize {
        self.0.barrier.num_managers
    }
}

struct ShutdownBarrier {
    num_managers: usize,
    state: Mutex<BarrierState>,
    arrived: Condvar,
}

#[derive(Default)]
struct BarrierState {
    managers_arrived: usize,
    owner_arrived: bool,
}

impl BarrierState {
    fn all_arrived(&self, num_managers: usize) -> bool {
        self.owner_arrived && self.managers_arrived >= num_managers
    }
}

impl ShutdownBarrier {
    fn new(num_managers: usize) -> Self {
        Self {
            num_managers,
            state: Mutex::new(BarrierState::default()),
            arrived: Condvar::new(),
        }
    }

    fn managers_arrived(&self) -> usize {
        self.state.lock().managers_arrived
    }

    fn arrive_manager(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.managers_arrived >= self.num_managers {
            tracing::error!(
                num_managers = self.num_managers,
                "more managers arrived at the shutdown barrier than it was sized for"
            );
        } else {
            state.managers_arrived += 1;
        }
        self.arrived.notify_all();

        let deadline = Instant::now().checked_add(timeout);
        self.wait_until_all_arrived(&mut state, deadline)
    }

    fn arrive_owner(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.state.lock();
        if !state.owner_arrived {
            state.owner_arrived = true;
            self.arrived.notify_all();
        }

        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        self.wait_until_all_arrived(&mut state, deadline)
    }

    fn wait_until_all_arrived(
        &self,
        state: &mut parking_lot::MutexGuard<'_, BarrierState>,
        deadline: Option<Instant>,
    ) -> bool {
        while !state.all_arrived(self.num_managers) {
            match deadline {
                Some(deadline) => {
                    if self.arrived.wait_until(state, deadline).timed_out() {
                        return state.all_arrived(self.num_managers);
                    }
                }
                None => self.arrived.wait(state),
            }
        }
        true
    }
}
