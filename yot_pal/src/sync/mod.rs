//! Futex-style wait/wake and the small primitives built on it.
//!
//! [`wait_on_address`] puts the calling thread to sleep only while a word still holds an
//! expected value; [`wake_by_address_single`] and [`wake_by_address_all`] release sleepers.
//! The compare and the sleep are atomic with respect to wakes, so a waker that changes the
//! word *before* waking can never be missed.
//!
//! The backend is chosen per platform:
//!
//! - Linux: the `futex` syscall for 32-bit words, the parking table for 64-bit words.
//! - Windows: `WaitOnAddress` / `WakeByAddress*` for both widths.
//! - Everything else: an address-keyed parking table (`parking_lot_core`).
//!
//! Spurious wakeups are possible; callers re-check their condition in a loop.

mod call_once;
mod spinlock;
mod state;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod futex;
        mod parking;
        use self::futex as word32;
        use self::parking as word64;
    } else if #[cfg(windows)] {
        mod windows;
        use self::windows as word32;
        use self::windows as word64;
    } else {
        mod parking;
        use self::parking as word32;
        use self::parking as word64;
    }
}

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub use call_once::{CallOnce, CallOnceResult};
pub use spinlock::{SpinGuard, SpinLock};
pub use state::{StateCell, StateWord};

/// Timeout value meaning "block until woken".
pub const INFINITE: u32 = u32::MAX;

/// Outcome of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The value differed, a wake arrived, or the thread woke spuriously.
    Ok,
    /// The timeout elapsed while the value still matched.
    Timeout,
}

/// Converts a millisecond timeout into an absolute deadline. `None` means forever.
pub(crate) fn deadline_after(timeout_ms: u32) -> Option<Instant> {
    if timeout_ms == INFINITE {
        None
    } else {
        Some(Instant::now() + Duration::from_millis(u64::from(timeout_ms)))
    }
}

/// Time left until `deadline`, or `None` once it has passed.
pub(crate) fn remaining(deadline: Instant) -> Option<Duration> {
    deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
}

/// Sleeps while `*address == expected`, for at most `timeout_ms` milliseconds.
///
/// Returns [`WaitResult::Ok`] immediately when the value already differs.
pub fn wait_on_address(address: &AtomicU32, expected: u32, timeout_ms: u32) -> WaitResult {
    if address.load(Ordering::SeqCst) != expected {
        return WaitResult::Ok;
    }
    word32::wait32(address, expected, deadline_after(timeout_ms))
}

/// 64-bit counterpart of [`wait_on_address`].
pub fn wait_on_address_64(address: &AtomicU64, expected: u64, timeout_ms: u32) -> WaitResult {
    if address.load(Ordering::SeqCst) != expected {
        return WaitResult::Ok;
    }
    word64::wait64(address, expected, deadline_after(timeout_ms))
}

/// Wakes at most one thread waiting on `address`.
pub fn wake_by_address_single(address: &AtomicU32) {
    word32::wake32(address, false);
}

/// Wakes every thread waiting on `address`.
pub fn wake_by_address_all(address: &AtomicU32) {
    word32::wake32(address, true);
}

/// Wakes at most one thread waiting on `address`.
pub fn wake_by_address_single_64(address: &AtomicU64) {
    word64::wake64(address, false);
}

/// Wakes every thread waiting on `address`.
pub fn wake_by_address_all_64(address: &AtomicU64) {
    word64::wake64(address, true);
}

/// Waits until `*address == value` or the overall timeout elapses.
///
/// Unlike [`wait_on_address`] this swallows spurious wakeups and keeps waiting with the
/// remaining time.
pub fn wait_for_value(address: &AtomicU32, value: u32, timeout_ms: u32) -> WaitResult {
    let deadline = deadline_after(timeout_ms);
    loop {
        let current = address.load(Ordering::SeqCst);
        if current == value {
            return WaitResult::Ok;
        }
        let slice = match deadline {
            None => INFINITE,
            Some(deadline) => match remaining(deadline) {
                None => return WaitResult::Timeout,
                Some(left) => millis_rounded_up(left),
            },
        };
        wait_on_address(address, current, slice);
    }
}

/// 64-bit counterpart of [`wait_for_value`].
pub fn wait_for_value_64(address: &AtomicU64, value: u64, timeout_ms: u32) -> WaitResult {
    let deadline = deadline_after(timeout_ms);
    loop {
        let current = address.load(Ordering::SeqCst);
        if current == value {
            return WaitResult::Ok;
        }
        let slice = match deadline {
            None => INFINITE,
            Some(deadline) => match remaining(deadline) {
                None => return WaitResult::Timeout,
                Some(left) => millis_rounded_up(left),
            },
        };
        wait_on_address_64(address, current, slice);
    }
}

fn millis_rounded_up(d: Duration) -> u32 {
    let ms = d.as_nanos().div_ceil(1_000_000);
    // INFINITE is reserved for "no timeout".
    ms.min(u128::from(INFINITE - 1)) as u32
}
