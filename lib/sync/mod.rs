//! Synchronization primitives.
//!
//! Shims between loom and std synchronization primitives, so the lane state machine can be
//! model-checked without touching the engine code.
pub mod atomic;

#[cfg(loom)]
pub use loom::sync::{Arc, Mutex, MutexGuard};

#[cfg(not(loom))]
pub use std::sync::{Arc, Mutex, MutexGuard};

/// Lock `mutex`, recovering the guard if a previous holder panicked.
///
/// Lane state is kept consistent at every point where a panic can occur (invariant violations
/// are reported after the state has been restored), so a poisoned lock is safe to reuse.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
