//! Cancelable, restartable timers.
//!
//! A timer moves through
//!
//! ```text
//! None → Starting → Started ⇄ Canceling
//!                   Started ⇄ Starting      (restart)
//!                   Started → Stopping      (last handle dropped)
//! ```
//!
//! Every arm, cancel and stop bumps the timer's *generation*. Deadlines in the driver and
//! firing jobs in the pool queue carry the generation they were armed with and do nothing
//! once it is stale, so no queue ever has to be searched to disarm a timer.
//!
//! Firings of one timer never overlap: a firing holds the timer's `executing` word for the
//! duration of the callback, and a periodic timer is only re-armed after its callback has
//! returned. Cancel and stop wait on that word, which is what lets them promise that no
//! callback is running once they return.

use std::cell::Cell;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::{Condvar, Mutex, MutexGuard};

use super::{Job, PoolShared, ThreadPool};
use crate::error::{PalError, Result};
use crate::thread::spawn_named;
use crate::sync::{INFINITE, StateCell, StateWord, wait_on_address, wake_by_address_all};

thread_local! {
    /// Address of the timer whose callback this thread is running, or 0.
    static FIRING_TIMER: Cell<usize> = const { Cell::new(0) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TimerState {
    None = 0,
    Starting = 1,
    Started = 2,
    Canceling = 3,
    Stopping = 4,
}

impl StateWord for TimerState {
    fn into_word(self) -> u32 {
        self as u32
    }

    fn from_word(word: u32) -> Self {
        match word {
            0 => TimerState::None,
            1 => TimerState::Starting,
            2 => TimerState::Started,
            3 => TimerState::Canceling,
            _ => TimerState::Stopping,
        }
    }
}

pub(crate) struct TimerShared {
    state: StateCell<TimerState>,
    generation: AtomicU64,
    period_ms: AtomicU32,
    /// 1 while a callback for this timer runs.
    executing: AtomicU32,
    callback: Box<dyn Fn() + Send + Sync + 'static>,
    pool: ThreadPool,
}

impl TimerShared {
    fn key(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    fn in_own_callback(self: &Arc<Self>) -> bool {
        FIRING_TIMER.with(|f| f.get()) == self.key()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Installs a new schedule and invalidates every older deadline.
    fn arm(self: &Arc<Self>, start_delay_ms: u32, period_ms: u32) {
        self.period_ms.store(period_ms, Ordering::SeqCst);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let at = Instant::now() + Duration::from_millis(u64::from(start_delay_ms));
        self.pool.timer_driver().arm(self, at, generation);
    }

    fn disarm(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Blocks until no callback of this timer is running, unless the caller *is* that
    /// callback.
    fn wait_for_callback(self: &Arc<Self>) {
        if self.in_own_callback() {
            log::debug!("timer disarmed from inside its own callback");
            return;
        }
        loop {
            let executing = self.executing.load(Ordering::SeqCst);
            if executing == 0 {
                return;
            }
            wait_on_address(&self.executing, executing, INFINITE);
        }
    }

    /// Runs one firing on a pool worker.
    pub(crate) fn fire(self: &Arc<Self>, generation: u64, scheduled_at: Instant) {
        while self
            .executing
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            wait_on_address(&self.executing, 1, INFINITE);
        }

        // Checked after claiming `executing`: a cancel that bumped the generation either
        // sees us running and waits, or we see its bump here and stay quiet.
        let current = self.is_current(generation);
        if current {
            counter!("yot_pal_timer_fired_total").increment(1);
            let previous = FIRING_TIMER.with(|f| f.replace(self.key()));
            if panic::catch_unwind(AssertUnwindSafe(|| (self.callback)())).is_err() {
                log::error!("timer callback panicked");
            }
            FIRING_TIMER.with(|f| f.set(previous));
        }

        self.executing.store(0, Ordering::SeqCst);
        wake_by_address_all(&self.executing);

        if !current {
            return;
        }
        let period_ms = self.period_ms.load(Ordering::SeqCst);
        if period_ms != 0 && self.is_current(generation) {
            let now = Instant::now();
            let next = (scheduled_at + Duration::from_millis(u64::from(period_ms))).max(now);
            self.pool.timer_driver().arm(self, next, generation);
        }
    }
}

struct TimerHandle {
    shared: Arc<TimerShared>,
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        let shared = &self.shared;
        loop {
            match shared.state.transition(TimerState::Started, TimerState::Stopping) {
                Ok(()) => break,
                Err(state @ (TimerState::Starting | TimerState::Canceling)) => {
                    if shared.in_own_callback() {
                        shared.disarm();
                        return;
                    }
                    shared.state.wait_while(state);
                }
                Err(state) => {
                    log::warn!("timer dropped in unexpected state {state:?}");
                    shared.disarm();
                    return;
                }
            }
        }
        shared.disarm();
        shared.wait_for_callback();
    }
}

/// Reference-counted timer handle. Dropping the last handle cancels the timer.
#[derive(Clone)]
pub struct Timer {
    handle: Arc<TimerHandle>,
}

impl Timer {
    pub(super) fn start(
        pool: ThreadPool,
        start_delay_ms: u32,
        period_ms: u32,
        callback: Box<dyn Fn() + Send + Sync + 'static>,
    ) -> Result<Self> {
        let shared = Arc::new(TimerShared {
            state: StateCell::new(TimerState::None),
            generation: AtomicU64::new(0),
            period_ms: AtomicU32::new(period_ms),
            executing: AtomicU32::new(0),
            callback,
            pool,
        });
        shared
            .state
            .transition(TimerState::None, TimerState::Starting)
            .map_err(|_| PalError::InvalidState("timer is already started"))?;
        shared.arm(start_delay_ms, period_ms);
        shared.state.set(TimerState::Started);

        Ok(Self {
            handle: Arc::new(TimerHandle { shared }),
        })
    }

    /// Re-arms the timer in place with a new delay and period.
    ///
    /// A firing already in progress completes undisturbed; the new schedule applies to
    /// every later firing.
    ///
    /// # Errors
    ///
    /// [`PalError::InvalidState`] if the timer is being stopped, or if called from the timer's
    /// own callback while another thread cancels it.
    pub fn restart(&self, start_delay_ms: u32, period_ms: u32) -> Result<()> {
        let shared = &self.handle.shared;
        loop {
            match shared.state.transition(TimerState::Started, TimerState::Starting) {
                Ok(()) => break,
                Err(state @ (TimerState::Starting | TimerState::Canceling)) => {
                    if shared.in_own_callback() {
                        return Err(PalError::InvalidState("timer is being canceled"));
                    }
                    shared.state.wait_while(state);
                }
                Err(_) => return Err(PalError::InvalidState("timer is not restartable")),
            }
        }
        shared.arm(start_delay_ms, period_ms);
        shared.state.set(TimerState::Started);
        Ok(())
    }

    /// Stops future firings and waits for a running callback to return.
    ///
    /// The timer stays usable: [`restart`](Self::restart) arms it again. Canceling twice is
    /// harmless, and a concurrent cancel from another thread waits for this one to finish.
    pub fn cancel(&self) {
        let shared = &self.handle.shared;
        loop {
            match shared.state.transition(TimerState::Started, TimerState::Canceling) {
                Ok(()) => {
                    shared.disarm();
                    shared.wait_for_callback();
                    shared.state.set(TimerState::Started);
                    return;
                }
                Err(TimerState::Canceling) => {
                    if !shared.in_own_callback() {
                        shared.state.wait_while(TimerState::Canceling);
                    }
                    return;
                }
                Err(TimerState::Starting) => {
                    if shared.in_own_callback() {
                        shared.disarm();
                        return;
                    }
                    shared.state.wait_while(TimerState::Starting);
                }
                Err(state) => {
                    log::warn!("cancel on timer in state {state:?}");
                    return;
                }
            }
        }
    }

    pub fn state(&self) -> TimerState {
        self.handle.shared.state.get()
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("state", &self.state())
            .field("period_ms", &self.handle.shared.period_ms.load(Ordering::Relaxed))
            .finish()
    }
}

struct Deadline {
    at: Instant,
    seq: u64,
    generation: u64,
    timer: Weak<TimerShared>,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Deadline {}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

#[derive(Default)]
struct DriverQueue {
    heap: BinaryHeap<Reverse<Deadline>>,
    next_seq: u64,
    shutdown: bool,
}

struct DriverShared {
    queue: Mutex<DriverQueue>,
    cond: Condvar,
    pool: Arc<PoolShared>,
}

/// The per-pool thread that turns due deadlines into firing jobs.
pub(crate) struct TimerDriver {
    shared: Arc<DriverShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerDriver {
    pub(super) fn start(pool_id: u64, pool: Arc<PoolShared>) -> Result<Self> {
        let shared = Arc::new(DriverShared {
            queue: Mutex::new(DriverQueue::default()),
            cond: Condvar::new(),
            pool,
        });
        let driver = shared.clone();
        let thread = spawn_named(format!("yot-pal-{pool_id}-timers"), move || run(driver))?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn arm(&self, timer: &Arc<TimerShared>, at: Instant, generation: u64) {
        let mut queue = self.shared.queue.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(Reverse(Deadline {
            at,
            seq,
            generation,
            timer: Arc::downgrade(timer),
        }));
        drop(queue);
        self.shared.cond.notify_one();
    }

    pub(super) fn shutdown(&self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.cond.notify_one();
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            log::error!("timer driver panicked");
        }
    }
}

fn run(shared: Arc<DriverShared>) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            break;
        }
        let now = Instant::now();
        let next_at = queue.heap.peek().map(|Reverse(d)| d.at);
        match next_at {
            None => shared.cond.wait(&mut queue),
            Some(at) if at > now => {
                shared.cond.wait_until(&mut queue, at);
            }
            Some(_) => {
                if let Some(Reverse(due)) = queue.heap.pop() {
                    // Dispatching may drop the last reference to a timer and with it the pool,
                    // whose teardown takes this lock.
                    MutexGuard::unlocked(&mut queue, || dispatch(&shared.pool, due));
                }
            }
        }
    }
    log::trace!("timer driver exiting");
}

fn dispatch(pool: &PoolShared, due: Deadline) {
    let Some(timer) = due.timer.upgrade() else {
        return;
    };
    if !timer.is_current(due.generation) {
        return;
    }
    let job = Job::Fire {
        timer,
        generation: due.generation,
        scheduled_at: due.at,
    };
    if let Err(e) = pool.enqueue(job) {
        log::debug!("dropping timer firing: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ExecutionEngine, ExecutionEngineParameters};
    use crate::sync::{WaitResult, wait_for_value};

    fn pool() -> ThreadPool {
        let engine = ExecutionEngine::new(ExecutionEngineParameters {
            min_thread_count: 2,
            max_thread_count: 2,
            metrics_port: None,
        })
        .unwrap();
        ThreadPool::create(&engine).unwrap()
    }

    fn counting(pool: &ThreadPool, delay: u32, period: u32) -> (Timer, Arc<AtomicU32>) {
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        let timer = pool
            .timer_start(delay, period, move || {
                f.fetch_add(1, Ordering::SeqCst);
                wake_by_address_all(&f);
            })
            .unwrap();
        (timer, fired)
    }

    #[test]
    fn deadlines_order_by_time_then_sequence() {
        let now = Instant::now();
        let a = Deadline {
            at: now,
            seq: 1,
            generation: 0,
            timer: Weak::new(),
        };
        let b = Deadline {
            at: now,
            seq: 2,
            generation: 0,
            timer: Weak::new(),
        };
        let c = Deadline {
            at: now + Duration::from_millis(1),
            seq: 0,
            generation: 0,
            timer: Weak::new(),
        };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn one_shot_fires_once() {
        let pool = pool();
        let (timer, fired) = counting(&pool, 5, 0);
        assert_eq!(wait_for_value(&fired, 1, 5_000), WaitResult::Ok);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timer.state(), TimerState::Started);
    }

    #[test]
    fn cancel_then_restart_fires_again() {
        let pool = pool();
        let (timer, fired) = counting(&pool, 10_000, 0);
        timer.cancel();
        timer.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timer.restart(0, 0).unwrap();
        assert_eq!(wait_for_value(&fired, 1, 5_000), WaitResult::Ok);
    }

    #[test]
    fn cancel_from_own_callback_does_not_deadlock() {
        let pool = pool();
        let slot: Arc<Mutex<Option<Timer>>> = Arc::new(Mutex::new(None));
        let fired = Arc::new(AtomicU32::new(0));
        let (s, f) = (slot.clone(), fired.clone());
        let timer = pool
            .timer_start(0, 5, move || {
                if let Some(t) = s.lock().as_ref() {
                    t.cancel();
                }
                f.fetch_add(1, Ordering::SeqCst);
                wake_by_address_all(&f);
            })
            .unwrap();
        *slot.lock() = Some(timer.clone());
        // The first firing may run before the slot is filled; any later one cancels.
        assert_eq!(wait_for_value(&fired, 1, 5_000), WaitResult::Ok);
        thread::sleep(Duration::from_millis(50));
        let settled = fired.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), settled);
        slot.lock().take();
    }
}
