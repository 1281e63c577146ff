//! Windows `WaitOnAddress` backend for both word widths.

use std::ffi::c_void;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use windows_sys::Win32::Foundation::{ERROR_TIMEOUT, GetLastError};
use windows_sys::Win32::System::Threading::{
    INFINITE, WaitOnAddress, WakeByAddressAll, WakeByAddressSingle,
};

use super::{WaitResult, remaining};

fn wait_raw<T: Copy + PartialEq>(
    address: *const c_void,
    expected: T,
    load: impl Fn() -> T,
    deadline: Option<Instant>,
) -> WaitResult {
    loop {
        let timeout_ms = match deadline {
            None => INFINITE,
            Some(deadline) => match remaining(deadline) {
                None => return WaitResult::Timeout,
                Some(left) => {
                    let ms = left.as_nanos().div_ceil(1_000_000);
                    ms.min(u128::from(INFINITE - 1)) as u32
                }
            },
        };
        let ok = unsafe {
            WaitOnAddress(
                address,
                &expected as *const T as *const c_void,
                size_of::<T>(),
                timeout_ms,
            )
        };
        if ok != 0 {
            return WaitResult::Ok;
        }
        let error = unsafe { GetLastError() };
        if error != ERROR_TIMEOUT {
            log::error!("WaitOnAddress failed with error {error}");
            return WaitResult::Ok;
        }
        // WaitOnAddress may time out slightly early; re-enter until the deadline really passed.
        if load() != expected {
            return WaitResult::Ok;
        }
    }
}

pub(super) fn wait32(address: &AtomicU32, expected: u32, deadline: Option<Instant>) -> WaitResult {
    wait_raw(
        address as *const AtomicU32 as *const c_void,
        expected,
        || address.load(Ordering::SeqCst),
        deadline,
    )
}

pub(super) fn wait64(address: &AtomicU64, expected: u64, deadline: Option<Instant>) -> WaitResult {
    wait_raw(
        address as *const AtomicU64 as *const c_void,
        expected,
        || address.load(Ordering::SeqCst),
        deadline,
    )
}

fn wake_raw(address: *const c_void, all: bool) {
    unsafe {
        if all {
            WakeByAddressAll(address);
        } else {
            WakeByAddressSingle(address);
        }
    }
}

pub(super) fn wake32(address: &AtomicU32, all: bool) {
    wake_raw(address as *const AtomicU32 as *const c_void, all);
}

pub(super) fn wake64(address: &AtomicU64, all: bool) {
    wake_raw(address as *const AtomicU64 as *const c_void, all);
}
