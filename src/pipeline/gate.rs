//! Process-wide serialization of runs.
//!
//! Processing units are not guaranteed to be reentrant (they may drive plotting
//! or database code that is not thread-safe), so only one run may iterate files
//! at a time. Each run holds an [`ExecutionGuard`] for its whole lifetime;
//! dropping the guard (normally, or while unwinding) frees the gate.
//!
//! The busy signal is the slot itself: `is_busy()` asks whether the slot is held,
//! so there is no second flag to keep in step with the lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;
use serde::Serialize;

/// Snapshot of the run currently holding the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveRun {
    pub job_name: String,
    pub row_id: u32,
    /// When the gate was acquired (RFC 3339).
    pub started_at: String,
}

/// Single-slot execution gate.
#[derive(Debug, Default)]
pub struct ExecutionGate {
    slot: Mutex<()>,
    current: Mutex<Option<ActiveRun>>,
}

static GLOBAL: Lazy<Arc<ExecutionGate>> = Lazy::new(|| Arc::new(ExecutionGate::new()));

impl ExecutionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// The gate shared by every controller in the process.
    pub fn global() -> Arc<ExecutionGate> {
        Arc::clone(&GLOBAL)
    }

    /// Block until the gate is free, then hold it until the guard is dropped.
    ///
    /// No timeout: a run that never finishes keeps every later run waiting.
    /// A slot poisoned by a panicking run is taken over, since it guards no data.
    pub fn acquire(&self, job_name: &str, row_id: u32) -> ExecutionGuard<'_> {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        self.set_current(job_name, row_id);
        ExecutionGuard { _slot: slot, gate: self }
    }

    /// Take the gate only if it is free right now.
    pub fn try_acquire(&self, job_name: &str, row_id: u32) -> Option<ExecutionGuard<'_>> {
        let slot = match self.slot.try_lock() {
            Ok(slot) => slot,
            Err(std::sync::TryLockError::Poisoned(p)) => p.into_inner(),
            Err(std::sync::TryLockError::WouldBlock) => return None,
        };
        self.set_current(job_name, row_id);
        Some(ExecutionGuard { _slot: slot, gate: self })
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.slot.try_lock(), Err(std::sync::TryLockError::WouldBlock))
    }

    pub fn current(&self) -> Option<ActiveRun> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_current(&self, job_name: &str, row_id: u32) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(ActiveRun {
            job_name: job_name.to_string(),
            row_id,
            started_at: chrono::Utc::now().to_rfc3339(),
        });
    }

    fn clear_current(&self) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Proof of exclusive execution. Releases the gate on drop.
pub struct ExecutionGuard<'a> {
    _slot: MutexGuard<'a, ()>,
    gate: &'a ExecutionGate,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        // runs before `_slot` is released, so `current` never outlives the hold
        self.gate.clear_current();
    }
}
