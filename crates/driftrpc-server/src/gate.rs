//! The reply gate.
//!
//! Every in-flight handler holds a [`GateGuard`]. Closing the gate rejects
//! new entries and waits for the guards already out, which lets connection
//! teardown await quiescence before stopping the send loop.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

#[derive(Default)]
struct GateState {
    closed: bool,
    active: usize,
}

pub struct Gate {
    state: Mutex<GateState>,
    drained: Notify,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(GateState::default()), drained: Notify::new() })
    }

    /// Enters the gate. Returns `None` once the gate is closed.
    pub fn enter(self: &Arc<Self>) -> Option<GateGuard> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return None;
        }
        state.active += 1;
        Some(GateGuard { gate: self.clone() })
    }

    /// Closes the gate and waits until every guard has been dropped.
    pub async fn close(&self) {
        self.state.lock().unwrap().closed = true;
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            // Register for the notification before re-checking, so a guard
            // dropped in between cannot be missed.
            drained.as_mut().enable();
            if self.state.lock().unwrap().active == 0 {
                return;
            }
            drained.await;
        }
    }

    #[cfg(test)]
    fn active(&self) -> usize {
        self.state.lock().unwrap().active
    }
}

pub struct GateGuard {
    gate: Arc<Gate>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock().unwrap();
        state.active -= 1;
        if state.active == 0 {
            self.gate.drained.notify_waiters();
        }
    }
}
