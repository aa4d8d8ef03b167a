//! One-shot, cancellable timers that run a callback on their own thread.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Fires a callback once after a delay, unless cancelled first.
///
/// The callback runs on the watchdog's own thread, so anything it touches must be safe to use
/// concurrently with the thread that armed it. Typically it just sends a message back to the
/// owner's event queue.
///
/// Dropping a watchdog cancels it.
pub struct Watchdog {
    shared: Arc<WatchdogShared>,
    name: String,
    after: Duration,
}

struct WatchdogShared {
    state: Mutex<WatchdogState>,
    wakeup: Condvar,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum WatchdogState {
    Armed,
    Cancelled,
    Fired,
}

impl Watchdog {
    /// Arms a watchdog that calls `on_fire` after `after` has elapsed.
    pub fn arm<F>(name: impl Into<String>, after: Duration, on_fire: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let shared = Arc::new(WatchdogShared {
            state: Mutex::new(WatchdogState::Armed),
            wakeup: Condvar::new(),
        });

        let deadline = Instant::now().checked_add(after);

        thread::Builder::new().name(name.clone()).spawn({
            let shared = Arc::clone(&shared);
            move || {
                let mut state = shared.state.lock();
                while *state == WatchdogState::Armed {
                    match deadline {
                        Some(deadline) => {
                            if shared.wakeup.wait_until(&mut state, deadline).timed_out() {
                                break;
                            }
                        }
                        // Too far in the future to represent; only a cancellation ends this.
                        None => shared.wakeup.wait(&mut state),
                    }
                }

                if *state != WatchdogState::Armed {
                    return;
                }
                *state = WatchdogState::Fired;
                drop(state);

                on_fire();
            }
        })?;

        Ok(Self { shared, name, after })
    }

    /// Cancels the watchdog. Returns false if it had already fired.
    pub fn cancel(&self) -> bool {
        let mut state = self.shared.state.lock();
        match *state {
            WatchdogState::Armed => {
                *state = WatchdogState::Cancelled;
                self.shared.wakeup.notify_all();
                true
            }
            WatchdogState::Cancelled => true,
            WatchdogState::Fired => false,
        }
    }

    pub fn has_fired(&self) -> bool {
        *self.shared.state.lock() == WatchdogState::Fired
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn duration(&self) -> Duration {
        self.after
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        if !self.cancel() {
            tracing::trace!(name = %self.name, "dropped watchdog that already fired");
        }
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("name", &self.name)
            .field("after", &self.after)
            .field("state", &*self.shared.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::mpsc;
    use std::time::Duration;

    use ntest::timeout;

    use super::Watchdog;

    #[test]
    #[timeout(5000)]
    fn fires_after_delay() {
        let (tx, rx) = mpsc::channel();
        let watchdog = Watchdog::arm("fires", Duration::from_millis(10), move || {
            tx.send(()).unwrap();
        })
        .unwrap();

        rx.recv().unwrap();
        assert!(watchdog.has_fired());
        assert!(!watchdog.cancel());
    }

    #[test]
    #[timeout(5000)]
    fn cancelled_watchdog_never_fires() {
        let (tx, rx) = mpsc::channel::<()>();
        let watchdog = Watchdog::arm("cancelled", Duration::from_millis(50), move || {
            tx.send(()).unwrap();
        })
        .unwrap();

        assert!(watchdog.cancel());
        // The sender is dropped along with the callback once the watchdog thread exits.
        assert!(rx.recv().is_err());
        assert!(!watchdog.has_fired());
    }

    #[test]
    #[timeout(5000)]
    fn drop_cancels() {
        let (tx, rx) = mpsc::channel::<()>();
        let watchdog = Watchdog::arm("dropped", Duration::from_millis(50), move || {
            tx.send(()).unwrap();
        })
        .unwrap();
        drop(watchdog);

        assert!(rx.recv().is_err());
    }

    #[test]
    #[timeout(5000)]
    fn unrepresentable_deadline_waits_for_cancel() {
        let watchdog = Watchdog::arm("forever", Duration::MAX, || {
            unreachable!("a watchdog this far out should never fire")
        })
        .unwrap();
        assert_eq!(watchdog.duration(), Duration::MAX);
        assert!(watchdog.cancel());
    }
}
