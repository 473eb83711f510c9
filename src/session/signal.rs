//! signal.rs
//! Single-fire synchronisation between the receive thread and the orchestrator.
//!
//! - completion(): one latch per trial, split into a cloneable setter (receive thread)
//!   and a single owned waiter (orchestrator). Set is idempotent; set-before-wait and
//!   wait-before-set both resolve.
//! - StopSignal: emergency stop broadcast. Triggering drops the only sender, so every
//!   receiver selecting on it wakes with a disconnect, from any thread, any number of times.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

/// Creates a fresh trial completion latch.
pub fn completion() -> (CompletionSetter, CompletionWaiter) {
    let (tx, rx) = bounded(1);
    let fired = Arc::new(AtomicBool::new(false));
    (
        CompletionSetter { fired: fired.clone(), tx },
        CompletionWaiter { fired, rx },
    )
}

#[derive(Debug, Clone)]
pub struct CompletionSetter {
    fired: Arc<AtomicBool>,
    tx: Sender<()>,
}

impl CompletionSetter {
    /// Resolves the latch. Returns true only for the call that actually fired it.
    pub fn set(&self) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // Capacity 1 and a single winner: this cannot be full. A dropped waiter is fine.
        let _ = self.tx.try_send(());
        true
    }

    pub fn is_set(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// The consuming side of a completion latch. Not cloneable: one waiter per trial.
#[derive(Debug)]
pub struct CompletionWaiter {
    fired: Arc<AtomicBool>,
    rx: Receiver<()>,
}

impl CompletionWaiter {
    pub fn is_set(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Blocks until set. Returns false if every setter was dropped unset.
    pub fn wait(self) -> bool {
        self.rx.recv().is_ok()
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<(), CompletionWaiter> {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => Err(self),
        }
    }

    /// Channel view for use inside `select!`.
    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

/// Emergency stop broadcast shared by the operator console and the orchestrator.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<Mutex<Option<Sender<()>>>>,
    rx: Receiver<()>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self { tx: Arc::new(Mutex::new(Some(tx))), rx }
    }

    /// Idempotent; safe from any thread.
    pub fn trigger(&self) {
        self.tx.lock().take();
    }

    pub fn is_triggered(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Never yields a message; becomes ready (disconnected) once triggered.
    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}
