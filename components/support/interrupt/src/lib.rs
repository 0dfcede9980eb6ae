/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Cooperative interruption for long-running operations.
//!
//! Nothing here preempts anything: code that wants to be interruptable must
//! poll `err_if_interrupted()` at its own suspension points (typically before
//! each remote call or between rows of a batch). A sync cycle creates one
//! [`InterruptScope`] from the shared [`InterruptFlag`] and threads it through
//! every step; `interrupt()` can be called from any thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The state of something that may be interrupted. Code that only needs to
/// *check* for interruption takes a `&dyn Interruptee` and stays decoupled
/// from whoever holds the flag.
pub trait Interruptee {
    fn was_interrupted(&self) -> bool;

    fn err_if_interrupted(&self) -> Result<(), Interrupted> {
        if self.was_interrupted() {
            return Err(Interrupted);
        }
        Ok(())
    }
}

/// The error returned by `err_if_interrupted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("The operation was interrupted")]
pub struct Interrupted;

/// The requesting side of interruption. Cheap to clone; typically one per
/// store, with `interrupt()` called from a UI or shutdown path.
///
/// Interruption is generation-based rather than a plain boolean so that a
/// scope created *after* an `interrupt()` call starts un-interrupted - there
/// is nothing to "reset" between operations.
#[derive(Clone, Debug, Default)]
pub struct InterruptFlag {
    generation: Arc<AtomicUsize>,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupt every scope currently in flight.
    pub fn interrupt(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    /// Begin a scope covering one operation.
    pub fn begin_scope(&self) -> InterruptScope {
        InterruptScope {
            generation: Arc::clone(&self.generation),
            start: self.generation.load(Ordering::Relaxed),
        }
    }
}

/// One operation's view of the flag; interrupted iff the flag was poked after
/// the scope was created.
#[derive(Clone, Debug)]
pub struct InterruptScope {
    generation: Arc<AtomicUsize>,
    start: usize,
}

impl Interruptee for InterruptScope {
    #[inline]
    fn was_interrupted(&self) -> bool {
        self.generation.load(Ordering::Relaxed) != self.start
    }
}

/// A convenience implementation, should only be used in tests.
pub struct NeverInterrupts;

impl Interruptee for NeverInterrupts {
    #[inline]
    fn was_interrupted(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_sees_interrupt() {
        let flag = InterruptFlag::new();
        let scope = flag.begin_scope();
        assert!(!scope.was_interrupted());
        assert!(scope.err_if_interrupted().is_ok());
        flag.interrupt();
        assert!(scope.was_interrupted());
        assert_eq!(scope.err_if_interrupted(), Err(Interrupted));
    }

    #[test]
    fn test_new_scope_starts_clean() {
        let flag = InterruptFlag::new();
        flag.interrupt();
        // Scopes created after the interrupt are not considered interrupted.
        let scope = flag.begin_scope();
        assert!(!scope.was_interrupted());
    }

    #[test]
    fn test_never_interrupts() {
        assert!(!NeverInterrupts.was_interrupted());
        assert!(NeverInterrupts.err_if_interrupted().is_ok());
    }
}
