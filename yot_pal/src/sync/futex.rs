//! Linux `futex(2)` backend for 32-bit words.

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use super::{WaitResult, remaining};

const FUTEX_WAIT_PRIVATE: libc::c_int = libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG;
const FUTEX_WAKE_PRIVATE: libc::c_int = libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG;

pub(super) fn wait32(address: &AtomicU32, expected: u32, deadline: Option<Instant>) -> WaitResult {
    loop {
        let timeout = match deadline {
            None => None,
            Some(deadline) => match remaining(deadline) {
                None => return WaitResult::Timeout,
                Some(left) => Some(libc::timespec {
                    tv_sec: left.as_secs() as libc::time_t,
                    tv_nsec: left.subsec_nanos() as libc::c_long,
                }),
            },
        };
        let timeout_ptr = timeout
            .as_ref()
            .map_or(ptr::null(), |t| t as *const libc::timespec);

        // The kernel compares *address with expected under its hash-bucket lock, which is
        // what makes the check-then-sleep atomic with respect to FUTEX_WAKE.
        let r = unsafe {
            libc::syscall(
                libc::SYS_futex,
                address as *const AtomicU32,
                FUTEX_WAIT_PRIVATE,
                expected,
                timeout_ptr,
            )
        };
        if r == 0 {
            return WaitResult::Ok;
        }

        match io::Error::last_os_error().raw_os_error() {
            Some(libc::ETIMEDOUT) => return WaitResult::Timeout,
            Some(libc::EAGAIN) => return WaitResult::Ok,
            Some(libc::EINTR) => {
                if address.load(Ordering::SeqCst) != expected {
                    return WaitResult::Ok;
                }
            }
            other => {
                log::error!("futex wait failed with errno {other:?}");
                return WaitResult::Ok;
            }
        }
    }
}

pub(super) fn wake32(address: &AtomicU32, all: bool) {
    let count: libc::c_int = if all { libc::c_int::MAX } else { 1 };
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            address as *const AtomicU32,
            FUTEX_WAKE_PRIVATE,
            count,
        );
    }
}
