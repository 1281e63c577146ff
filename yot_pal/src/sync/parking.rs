//! Address-keyed parking table.
//!
//! Used where the OS has no native wait-on-address for a given width. `parking_lot_core`
//! hashes the key into a bucket and runs `validate` under that bucket's lock; a waker takes
//! the same lock before unparking, so a value changed before the wake is always observed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot_core::{DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN, ParkResult};

use super::WaitResult;

fn park(key: usize, still_expected: impl Fn() -> bool, deadline: Option<Instant>) -> WaitResult {
    if let Some(deadline) = deadline {
        if deadline <= Instant::now() {
            return if still_expected() {
                WaitResult::Timeout
            } else {
                WaitResult::Ok
            };
        }
    }
    // Safety: the closures neither park nor panic, and the key is the address of a live
    // atomic owned by the caller for the duration of the call.
    let result = unsafe {
        parking_lot_core::park(
            key,
            || still_expected(),
            || {},
            |_, _| {},
            DEFAULT_PARK_TOKEN,
            deadline,
        )
    };
    match result {
        ParkResult::TimedOut => WaitResult::Timeout,
        ParkResult::Unparked(_) | ParkResult::Invalid => WaitResult::Ok,
    }
}

fn unpark(key: usize, all: bool) {
    // Safety: no callback here parks or panics.
    unsafe {
        if all {
            parking_lot_core::unpark_all(key, DEFAULT_UNPARK_TOKEN);
        } else {
            parking_lot_core::unpark_one(key, |_| DEFAULT_UNPARK_TOKEN);
        }
    }
}

pub(super) fn wait64(address: &AtomicU64, expected: u64, deadline: Option<Instant>) -> WaitResult {
    let key = address as *const AtomicU64 as usize;
    park(key, || address.load(Ordering::SeqCst) == expected, deadline)
}

pub(super) fn wake64(address: &AtomicU64, all: bool) {
    unpark(address as *const AtomicU64 as usize, all);
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(super) fn wait32(
    address: &std::sync::atomic::AtomicU32,
    expected: u32,
    deadline: Option<Instant>,
) -> WaitResult {
    let key = address as *const _ as usize;
    park(key, || address.load(Ordering::SeqCst) == expected, deadline)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(super) fn wake32(address: &std::sync::atomic::AtomicU32, all: bool) {
    unpark(address as *const _ as usize, all);
}
