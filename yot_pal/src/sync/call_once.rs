//! Single-flight initialization gate with retry on failure.
//!
//! ```
//! use yot_pal::sync::{CallOnce, CallOnceResult};
//!
//! static INIT: CallOnce = CallOnce::new();
//!
//! if INIT.begin() == CallOnceResult::Proceed {
//!     let succeeded = true; // do the one-time work here
//!     INIT.end(succeeded);
//! }
//! assert!(INIT.is_called());
//! ```

use std::sync::atomic::{AtomicU32, Ordering};

use super::{INFINITE, wait_on_address, wake_by_address_all};

const NOT_CALLED: u32 = 0;
const CALLING: u32 = 1;
const CALLED: u32 = 2;

/// What the caller of [`CallOnce::begin`] must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOnceResult {
    /// This thread owns the action and must finish with [`CallOnce::end`].
    Proceed,
    /// The action already completed successfully.
    AlreadyCalled,
}

/// A `NOT_CALLED → CALLING → CALLED` gate in a single word.
///
/// At most one thread runs the guarded action at a time. A failed attempt returns the gate
/// to `NOT_CALLED`, so a later caller can try again.
#[derive(Debug)]
pub struct CallOnce {
    state: AtomicU32,
}

impl CallOnce {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(NOT_CALLED),
        }
    }

    /// Claims the action, or reports that it already ran.
    ///
    /// Blocks while another thread is inside the action and then re-evaluates.
    pub fn begin(&self) -> CallOnceResult {
        loop {
            match self
                .state
                .compare_exchange(NOT_CALLED, CALLING, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return CallOnceResult::Proceed,
                Err(CALLED) => return CallOnceResult::AlreadyCalled,
                Err(_) => {
                    wait_on_address(&self.state, CALLING, INFINITE);
                }
            }
        }
    }

    /// Publishes the outcome of the action claimed by [`begin`](Self::begin).
    pub fn end(&self, succeeded: bool) {
        let next = if succeeded { CALLED } else { NOT_CALLED };
        self.state.store(next, Ordering::Release);
        wake_by_address_all(&self.state);
    }

    /// Runs `action` unless it already succeeded. Errors reopen the gate.
    pub fn call<E>(&self, action: impl FnOnce() -> Result<(), E>) -> Result<(), E> {
        match self.begin() {
            CallOnceResult::AlreadyCalled => Ok(()),
            CallOnceResult::Proceed => {
                let result = action();
                self.end(result.is_ok());
                result
            }
        }
    }

    pub fn is_called(&self) -> bool {
        self.state.load(Ordering::Acquire) == CALLED
    }
}

impl Default for CallOnce {
    fn default() -> Self {
        Self::new()
    }
}
