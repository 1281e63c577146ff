//! Worker threads for the thread pool.
//!
//! Each worker keeps a local FIFO queue and can steal from its siblings. It first runs its
//! own queue, then pulls a batch from the pool's injector, then tries to steal; when all of
//! that comes up empty it parks until an enqueue (or shutdown) unparks it.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering, fence},
};
use std::thread;

use crossbeam_deque::{Steal, Stealer, Worker as DequeWorker};

use super::{Job, PoolShared};
use crate::error::Result;
use crate::thread::spawn_named;

/// Jobs moved from the injector into the local queue per visit.
const INJECTOR_BATCH: usize = 16;

/// A handle other threads use to wake a worker or steal from its queue.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    /// Index of the worker within its pool.
    pub id: usize,
    /// Stealer for this worker's local queue.
    pub stealer: Stealer<Job>,
    /// Set while the worker is parked (or about to park).
    pub idle: Arc<AtomicBool>,
    thread: thread::Thread,
}

impl WorkerHandle {
    pub fn wake(&self) {
        self.thread.unpark();
    }
}

pub(crate) struct Worker {
    id: usize,
    local_q: DequeWorker<Job>,
    shared: Arc<PoolShared>,
    idle: Arc<AtomicBool>,
}

impl Worker {
    /// Spawns a worker thread for the pool behind `shared`.
    ///
    /// The thread blocks until the pool publishes its full worker list, so every worker can
    /// see every stealer.
    pub fn start(
        pool_id: u64,
        id: usize,
        shared: Arc<PoolShared>,
    ) -> Result<(WorkerHandle, thread::JoinHandle<()>)> {
        let local_q: DequeWorker<Job> = DequeWorker::new_fifo();
        let stealer = local_q.stealer();

        let idle_flag = Arc::new(AtomicBool::new(false));
        let idle_flag_clone = idle_flag.clone();

        let join = spawn_named(format!("yot-pal-{pool_id}-worker-{id}"), move || {
            let mut worker = Worker {
                id,
                idle: idle_flag_clone,
                local_q,
                shared,
            };
            worker.run();
        })?;

        let handle = WorkerHandle {
            id,
            idle: idle_flag,
            stealer,
            thread: join.thread().clone(),
        };
        Ok((handle, join))
    }

    fn run(&mut self) {
        let shared = Arc::clone(&self.shared);
        let workers = shared.workers.wait();

        loop {
            if let Some(job) = self.local_q.pop() {
                job.run();
                continue;
            }

            for _ in 0..INJECTOR_BATCH {
                match self.shared.injector.pop() {
                    Some(job) => self.local_q.push(job),
                    None => break,
                }
            }

            if !self.local_q.is_empty() {
                // More than this worker runs next; give a parked sibling something to steal.
                if self.local_q.len() > 1 {
                    self.shared.try_unpark_one();
                }
                continue;
            }

            let num_workers = workers.len();
            if num_workers > 1 {
                let rand_start_idx = rand::random::<u32>() as usize % num_workers;
                for i in 0..num_workers {
                    let idx = (rand_start_idx + i) % num_workers;
                    let victim = &workers[idx];

                    if victim.id == self.id {
                        continue;
                    }

                    match victim.stealer.steal_batch(&self.local_q) {
                        Steal::Success(_) => break,
                        Steal::Retry | Steal::Empty => continue,
                    }
                }
            }

            if !self.local_q.is_empty() {
                if self.local_q.len() > 1 {
                    self.shared.try_unpark_one();
                }
                continue;
            }

            if self.shared.shutdown.load(Ordering::SeqCst) {
                break;
            }

            self.idle.store(true, Ordering::SeqCst);
            // Pairs with the fence in `PoolShared::enqueue`: either we see the new job here
            // or the enqueuer sees our idle flag and unparks us.
            fence(Ordering::SeqCst);

            if !self.shared.injector.is_empty() || self.shared.shutdown.load(Ordering::SeqCst) {
                self.idle.store(false, Ordering::SeqCst);
                continue;
            }

            thread::park();

            self.idle.store(false, Ordering::SeqCst);
        }

        log::trace!("worker {} exiting", self.id);
    }
}
