//! A thread pool for one-shot work, reusable work items and timers.
//!
//! Work is pushed onto a global injector queue and picked up by a fixed set of workers that
//! balance load by stealing from one another (see [`worker`]). Timers are driven by one
//! dedicated thread per pool which only decides *when* a timer is due; the callback itself
//! always runs on a worker.
//!
//! No pool lock is ever held while user code runs, so callbacks may freely schedule more
//! work or start timers on the same pool.

mod timer;
mod worker;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering, fence};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_queue::SegQueue;
use metrics::{counter, gauge};

use self::timer::{TimerDriver, TimerShared};
use self::worker::{Worker, WorkerHandle};
use crate::engine::ExecutionEngine;
use crate::error::{PalError, Result};

pub use self::timer::{Timer, TimerState};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

/// A unit of work sitting in a pool queue.
pub(crate) enum Job {
    Once(Box<dyn FnOnce() + Send + 'static>),
    Item(WorkItem),
    Fire {
        timer: Arc<TimerShared>,
        generation: u64,
        scheduled_at: Instant,
    },
}

impl Job {
    fn run(self) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match self {
            Job::Once(f) => f(),
            Job::Item(item) => (item.callback)(),
            Job::Fire {
                timer,
                generation,
                scheduled_at,
            } => timer.fire(generation, scheduled_at),
        }));
        gauge!("yot_pal_work_pending_current").decrement(1.0);
        if outcome.is_err() {
            log::error!("thread pool callback panicked");
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Job::Once(_) => f.write_str("Job::Once"),
            Job::Item(_) => f.write_str("Job::Item"),
            Job::Fire { generation, .. } => write!(f, "Job::Fire({generation})"),
        }
    }
}

/// State shared by the pool handle, its workers and its timer driver.
#[derive(Debug)]
pub(crate) struct PoolShared {
    injector: SegQueue<Job>,
    /// Published once every worker has been spawned.
    workers: OnceLock<Vec<WorkerHandle>>,
    shutdown: AtomicBool,
}

impl PoolShared {
    pub(crate) fn enqueue(&self, job: Job) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(PalError::InvalidState("thread pool is shutting down"));
        }
        self.injector.push(job);
        counter!("yot_pal_work_scheduled_total").increment(1);
        gauge!("yot_pal_work_pending_current").increment(1.0);
        // Pairs with the fence a worker issues after raising its idle flag.
        fence(Ordering::SeqCst);
        self.try_unpark_one();
        Ok(())
    }

    fn try_unpark_one(&self) {
        let Some(workers) = self.workers.get() else {
            return;
        };
        for w in workers.iter() {
            if w.idle.swap(false, Ordering::SeqCst) {
                w.wake();
                break;
            }
        }
    }

    fn wake_all(&self) {
        if let Some(workers) = self.workers.get() {
            for w in workers.iter() {
                w.wake();
            }
        }
    }
}

/// A reusable, pre-built unit of work.
///
/// Scheduling a work item does not allocate a new callback, and the same item may be
/// scheduled from several threads at once.
#[derive(Clone)]
pub struct WorkItem {
    callback: Arc<dyn Fn() + Send + Sync + 'static>,
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem").finish_non_exhaustive()
    }
}

struct ThreadPoolInner {
    id: u64,
    shared: Arc<PoolShared>,
    timers: TimerDriver,
    threads: Vec<JoinHandle<()>>,
    _engine: ExecutionEngine,
}

/// Reference-counted thread pool handle.
///
/// Dropping the last handle lets the workers drain what is already queued, then joins them.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<ThreadPoolInner>,
}

impl ThreadPool {
    /// Creates a pool with `engine.worker_count()` workers and a timer driver.
    ///
    /// # Errors
    ///
    /// Returns [`PalError::ThreadSpawn`] if a thread could not be started; any threads that
    /// were already running are stopped and joined first.
    pub fn create(engine: &ExecutionEngine) -> Result<Self> {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let num_workers = engine.worker_count();

        let shared = Arc::new(PoolShared {
            injector: SegQueue::new(),
            workers: OnceLock::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut worker_handles = Vec::with_capacity(num_workers);
        let mut threads = Vec::with_capacity(num_workers + 1);

        for worker_id in 0..num_workers {
            match Worker::start(id, worker_id, shared.clone()) {
                Ok((handle, join)) => {
                    worker_handles.push(handle);
                    threads.push(join);
                }
                Err(e) => {
                    abort_startup(&shared, worker_handles, threads);
                    return Err(e);
                }
            }
        }

        // Workers block on this before touching their siblings' stealers.
        let _ = shared.workers.set(worker_handles);

        let timers = match TimerDriver::start(id, shared.clone()) {
            Ok(timers) => timers,
            Err(e) => {
                shutdown_workers(&shared, threads);
                return Err(e);
            }
        };

        log::debug!("thread pool {id} started with {num_workers} workers");

        Ok(Self {
            inner: Arc::new(ThreadPoolInner {
                id,
                shared,
                timers,
                threads,
                _engine: engine.clone(),
            }),
        })
    }

    /// Schedules `f` to run once on a pool worker.
    pub fn schedule_work<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.shared.enqueue(Job::Once(Box::new(f)))
    }

    /// Builds a work item that can be scheduled repeatedly with
    /// [`schedule_work_item`](Self::schedule_work_item).
    pub fn create_work_item<F>(&self, f: F) -> WorkItem
    where
        F: Fn() + Send + Sync + 'static,
    {
        WorkItem {
            callback: Arc::new(f),
        }
    }

    pub fn schedule_work_item(&self, work_item: &WorkItem) -> Result<()> {
        self.inner.shared.enqueue(Job::Item(work_item.clone()))
    }

    /// Starts a timer that first fires after `start_delay_ms` and then every `period_ms`.
    ///
    /// A `period_ms` of `0` makes the timer one-shot. The returned [`Timer`] keeps this pool
    /// alive; dropping its last handle cancels it.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::sync::atomic::{AtomicU32, Ordering};
    /// use yot_pal::{ExecutionEngine, ExecutionEngineParameters, ThreadPool};
    /// use yot_pal::sync::{wait_for_value, WaitResult};
    ///
    /// let engine = ExecutionEngine::new(ExecutionEngineParameters::default())?;
    /// let pool = ThreadPool::create(&engine)?;
    /// let fired = Arc::new(AtomicU32::new(0));
    /// let counter = fired.clone();
    /// let timer = pool.timer_start(10, 0, move || {
    ///     counter.fetch_add(1, Ordering::SeqCst);
    ///     yot_pal::sync::wake_by_address_all(&counter);
    /// })?;
    /// assert_eq!(wait_for_value(&fired, 1, 5_000), WaitResult::Ok);
    /// drop(timer);
    /// # Ok::<(), yot_pal::PalError>(())
    /// ```
    pub fn timer_start<F>(&self, start_delay_ms: u32, period_ms: u32, callback: F) -> Result<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Timer::start(self.clone(), start_delay_ms, period_ms, Box::new(callback))
    }

    pub(crate) fn timer_driver(&self) -> &TimerDriver {
        &self.inner.timers
    }

    /// Number of worker threads in this pool.
    pub fn worker_count(&self) -> usize {
        self.inner.threads.len()
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("id", &self.inner.id)
            .field("workers", &self.inner.threads.len())
            .finish()
    }
}

impl Drop for ThreadPoolInner {
    fn drop(&mut self) {
        log::debug!("thread pool {} shutting down", self.id);
        self.timers.shutdown();
        shutdown_workers(&self.shared, std::mem::take(&mut self.threads));
    }
}

fn abort_startup(shared: &PoolShared, handles: Vec<WorkerHandle>, threads: Vec<JoinHandle<()>>) {
    shared.shutdown.store(true, Ordering::SeqCst);
    let _ = shared.workers.set(handles);
    shutdown_workers(shared, threads);
}

/// Stops and joins `threads`. A thread never joins itself: when the last pool handle is
/// released from inside one of its own callbacks, that worker exits on its own.
fn shutdown_workers(shared: &PoolShared, threads: Vec<JoinHandle<()>>) {
    shared.shutdown.store(true, Ordering::SeqCst);
    shared.wake_all();
    let me = thread::current().id();
    for t in threads {
        if t.thread().id() == me {
            continue;
        }
        if t.join().is_err() {
            log::error!("thread pool worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExecutionEngineParameters;
    use crate::sync::{WaitResult, wait_for_value, wake_by_address_all};
    use std::sync::atomic::AtomicU32;

    fn pool(workers: u32) -> ThreadPool {
        let engine = ExecutionEngine::new(ExecutionEngineParameters {
            min_thread_count: workers,
            max_thread_count: workers,
            metrics_port: None,
        })
        .unwrap();
        ThreadPool::create(&engine).unwrap()
    }

    #[test]
    fn pool_has_requested_worker_count() {
        assert_eq!(pool(3).worker_count(), 3);
    }

    #[test]
    fn queued_work_drains_before_shutdown() {
        let done = Arc::new(AtomicU32::new(0));
        {
            let pool = pool(1);
            for _ in 0..100 {
                let done = done.clone();
                pool.schedule_work(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }
        assert_eq!(done.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn panicking_callback_does_not_kill_the_worker() {
        let pool = pool(1);
        let done = Arc::new(AtomicU32::new(0));
        pool.schedule_work(|| panic!("boom")).unwrap();
        let d = done.clone();
        pool.schedule_work(move || {
            d.store(1, Ordering::SeqCst);
            wake_by_address_all(&d);
        })
        .unwrap();
        assert_eq!(wait_for_value(&done, 1, 5_000), WaitResult::Ok);
    }

    #[test]
    fn dropping_last_handle_inside_a_callback_does_not_deadlock() {
        let done = Arc::new(AtomicU32::new(0));
        let pool = pool(2);
        let handle = pool.clone();
        let d = done.clone();
        drop(pool);
        handle
            .clone()
            .schedule_work(move || {
                drop(handle);
                d.store(1, Ordering::SeqCst);
                wake_by_address_all(&d);
            })
            .unwrap();
        assert_eq!(wait_for_value(&done, 1, 5_000), WaitResult::Ok);
    }
}
