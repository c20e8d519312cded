//! Signalling primitives shared between the daemon and its callers

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::TransportError;

/// The daemon's externally observable state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DaemonState {
    /// Running the address handshake; ISO-TP traffic is suspended
    ObtainingAddress,
    /// Address acquired, packets flowing
    Serving,
}

/// Signalable state cell that `connect` blocks on
pub(crate) struct StateCell {
    state: Mutex<DaemonState>,
    changed: Condvar,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(DaemonState::ObtainingAddress),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn get(&self) -> DaemonState {
        *self.state.lock()
    }

    pub(crate) fn set(&self, state: DaemonState) {
        *self.state.lock() = state;
        self.changed.notify_all();
    }

    /// Wait until the cell holds `want`, or `timeout` elapses
    pub(crate) fn wait_for(&self, want: DaemonState, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if *state == want {
                return true;
            }
            match deadline {
                None => {
                    self.changed.wait(&mut state);
                }
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    self.changed.wait_until(&mut state, deadline);
                }
            }
        }
    }
}

/// Single-use completion hand-off from the daemon to a blocked `send` caller
///
/// Completion is set-without-overwrite: a second completion is a daemon bug, logged and
/// discarded so the caller sees the first verdict.
pub(crate) struct CompletionSlot {
    result: Mutex<Option<Result<(), TransportError>>>,
    set: Condvar,
}

impl CompletionSlot {
    pub(crate) fn new() -> Self {
        Self {
            result: Mutex::new(None),
            set: Condvar::new(),
        }
    }

    pub(crate) fn complete(&self, result: Result<(), TransportError>) {
        let mut slot = self.result.lock();
        if slot.is_some() {
            tracing::error!("completion slot already notified; keeping the first verdict");
            return;
        }
        *slot = Some(result);
        drop(slot);
        self.set.notify_all();
    }

    /// Block until the daemon delivers a verdict
    pub(crate) fn wait(&self) -> Result<(), TransportError> {
        let mut slot = self.result.lock();
        loop {
            if let Some(result) = *slot {
                return result;
            }
            self.set.wait(&mut slot);
        }
    }
}

/// Cooperative shutdown flag with an interruptible sleep
pub(crate) struct Stop {
    stopped: Mutex<bool>,
    changed: Condvar,
}

impl Stop {
    pub(crate) fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn requested(&self) -> bool {
        *self.stopped.lock()
    }

    pub(crate) fn request(&self) {
        *self.stopped.lock() = true;
        self.changed.notify_all();
    }

    /// Nap for `duration`, waking early on a stop request
    ///
    /// Returns true when stop was requested.
    pub(crate) fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut stopped = self.stopped.lock();
        loop {
            if *stopped {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.changed.wait_until(&mut stopped, deadline);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_state_cell_wait() {
        let cell = Arc::new(StateCell::new());
        assert_eq!(cell.get(), DaemonState::ObtainingAddress);
        assert!(!cell.wait_for(DaemonState::Serving, Duration::from_millis(10)));

        let waiter = {
            let cell = Arc::clone(&cell);
            std::thread::spawn(move || cell.wait_for(DaemonState::Serving, Duration::from_secs(5)))
        };
        cell.set(DaemonState::Serving);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_completion_slot_keeps_first_verdict() {
        let slot = CompletionSlot::new();
        slot.complete(Ok(()));
        slot.complete(Err(TransportError::Fail));
        assert_eq!(slot.wait(), Ok(()));
    }

    #[test]
    fn test_completion_slot_wakes_waiter() {
        let slot = Arc::new(CompletionSlot::new());
        let waiter = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || slot.wait())
        };
        slot.complete(Err(TransportError::Fail));
        assert_eq!(waiter.join().unwrap(), Err(TransportError::Fail));
    }

    #[test]
    fn test_stop_interrupts_sleep() {
        let stop = Arc::new(Stop::new());
        let sleeper = {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || stop.sleep(Duration::from_secs(30)))
        };
        std::thread::sleep(Duration::from_millis(20));
        stop.request();
        assert!(sleeper.join().unwrap());
        assert!(stop.requested());
    }
}
