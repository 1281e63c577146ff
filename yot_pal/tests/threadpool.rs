use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use yot_pal::sync::{WaitResult, wait_for_value, wake_by_address_all};
use yot_pal::{ExecutionEngine, ExecutionEngineParameters, ThreadPool, Timer, TimerState};

/// Scheduling slack allowed on top of a timer's nominal schedule.
const TIMER_TOLERANCE_MS: u32 = 500;
/// Upper bound for anything the tests merely expect to happen "soon".
const COMPLETION_TIMEOUT_MS: u32 = 10_000;

fn pool() -> ThreadPool {
    let engine = ExecutionEngine::new(ExecutionEngineParameters {
        min_thread_count: 4,
        max_thread_count: 4,
        metrics_port: None,
    })
    .unwrap();
    ThreadPool::create(&engine).unwrap()
}

fn bump(counter: &AtomicU32) {
    counter.fetch_add(1, Ordering::SeqCst);
    wake_by_address_all(counter);
}

#[test]
fn thousands_of_work_items_each_run_exactly_once() {
    const K: u32 = 20_000;
    let pool = pool();
    let ran = Arc::new(AtomicU32::new(0));

    for _ in 0..K {
        let ran = ran.clone();
        pool.schedule_work(move || bump(&ran)).unwrap();
    }

    assert_eq!(wait_for_value(&ran, K, COMPLETION_TIMEOUT_MS), WaitResult::Ok);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(ran.load(Ordering::SeqCst), K);
}

#[test]
fn one_work_item_scheduled_from_many_threads() {
    const PER_THREAD: u32 = 1_000;
    const THREADS: u32 = 8;
    let pool = pool();
    let ran = Arc::new(AtomicU32::new(0));
    let item = {
        let ran = ran.clone();
        pool.create_work_item(move || bump(&ran))
    };

    let producers: Vec<_> = (0..THREADS)
        .map(|_| {
            let pool = pool.clone();
            let item = item.clone();
            thread::spawn(move || {
                for _ in 0..PER_THREAD {
                    pool.schedule_work_item(&item).unwrap();
                }
            })
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }

    let total = PER_THREAD * THREADS;
    assert_eq!(wait_for_value(&ran, total, COMPLETION_TIMEOUT_MS), WaitResult::Ok);
}

#[test]
fn periodic_timer_keeps_to_its_schedule() {
    const DELAY_MS: u32 = 200;
    const PERIOD_MS: u32 = 50;
    const FIRINGS: u32 = 5;

    let pool = pool();
    let fired = Arc::new(AtomicU32::new(0));
    let start = Instant::now();
    let timer = {
        let fired = fired.clone();
        pool.timer_start(DELAY_MS, PERIOD_MS, move || bump(&fired))
            .unwrap()
    };

    thread::sleep(Duration::from_millis(u64::from(DELAY_MS / 2)));
    if start.elapsed() < Duration::from_millis(u64::from(DELAY_MS)) {
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    let budget = DELAY_MS + FIRINGS * PERIOD_MS + TIMER_TOLERANCE_MS;
    assert_eq!(wait_for_value(&fired, FIRINGS, budget), WaitResult::Ok);
    assert!(start.elapsed() >= Duration::from_millis(u64::from(DELAY_MS)));
    timer.cancel();
}

#[test]
fn one_shot_timer_fires_once() {
    let pool = pool();
    let fired = Arc::new(AtomicU32::new(0));
    let _timer = {
        let fired = fired.clone();
        pool.timer_start(10, 0, move || bump(&fired)).unwrap()
    };
    assert_eq!(wait_for_value(&fired, 1, COMPLETION_TIMEOUT_MS), WaitResult::Ok);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

/// A callback that parks until released, for checking that cancel and drop wait for it.
struct BlockedCallback {
    entered: AtomicU32,
    release: AtomicU32,
    returned: AtomicBool,
}

impl BlockedCallback {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: AtomicU32::new(0),
            release: AtomicU32::new(0),
            returned: AtomicBool::new(false),
        })
    }

    fn run(&self) {
        bump(&self.entered);
        wait_for_value(&self.release, 1, COMPLETION_TIMEOUT_MS);
        self.returned.store(true, Ordering::SeqCst);
    }

    fn release_later(self: &Arc<Self>) -> thread::JoinHandle<()> {
        let this = self.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            this.release.store(1, Ordering::SeqCst);
            wake_by_address_all(&this.release);
        })
    }
}

fn start_blocked_timer(pool: &ThreadPool, cb: &Arc<BlockedCallback>) -> Timer {
    let timer = {
        let cb = cb.clone();
        pool.timer_start(0, 0, move || cb.run()).unwrap()
    };
    assert_eq!(wait_for_value(&cb.entered, 1, COMPLETION_TIMEOUT_MS), WaitResult::Ok);
    timer
}

#[test]
fn cancel_waits_for_a_running_callback() {
    let pool = pool();
    let cb = BlockedCallback::new();
    let timer = start_blocked_timer(&pool, &cb);

    let releaser = cb.release_later();
    timer.cancel();
    assert!(cb.returned.load(Ordering::SeqCst));
    assert_eq!(timer.state(), TimerState::Started);
    releaser.join().unwrap();
}

#[test]
fn dropping_a_timer_waits_for_a_running_callback() {
    let pool = pool();
    let cb = BlockedCallback::new();
    let timer = start_blocked_timer(&pool, &cb);

    let releaser = cb.release_later();
    drop(timer);
    assert!(cb.returned.load(Ordering::SeqCst));
    releaser.join().unwrap();
}

#[test]
fn cancel_is_idempotent_and_restart_rearms() {
    let pool = pool();
    let fired = Arc::new(AtomicU32::new(0));
    let timer = {
        let fired = fired.clone();
        pool.timer_start(5_000, 0, move || bump(&fired)).unwrap()
    };

    timer.cancel();
    timer.cancel();
    assert_eq!(timer.state(), TimerState::Started);
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    timer.restart(10, 0).unwrap();
    assert_eq!(wait_for_value(&fired, 1, COMPLETION_TIMEOUT_MS), WaitResult::Ok);
}

#[test]
fn concurrent_cancels_all_return_after_the_callback() {
    let pool = pool();
    let cb = BlockedCallback::new();
    let timer = start_blocked_timer(&pool, &cb);

    let releaser = cb.release_later();
    let cancelers: Vec<_> = (0..4)
        .map(|_| {
            let timer = timer.clone();
            let cb = cb.clone();
            thread::spawn(move || {
                timer.cancel();
                assert!(cb.returned.load(Ordering::SeqCst));
            })
        })
        .collect();
    for c in cancelers {
        c.join().unwrap();
    }
    releaser.join().unwrap();
}

#[test]
fn firings_of_one_timer_never_overlap() {
    let pool = pool();
    let inside = Arc::new(AtomicU32::new(0));
    let overlap = Arc::new(AtomicBool::new(false));
    let fired = Arc::new(AtomicU32::new(0));

    let timer = {
        let (inside, overlap, fired) = (inside.clone(), overlap.clone(), fired.clone());
        pool.timer_start(0, 1, move || {
            if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                overlap.store(true, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(5));
            inside.fetch_sub(1, Ordering::SeqCst);
            bump(&fired);
        })
        .unwrap()
    };

    assert_eq!(wait_for_value(&fired, 10, COMPLETION_TIMEOUT_MS), WaitResult::Ok);
    drop(timer);
    assert!(!overlap.load(Ordering::SeqCst));
}

#[test]
fn callbacks_can_start_timers_on_their_own_pool() {
    let pool = pool();
    let fired = Arc::new(AtomicU32::new(0));
    let inner: Arc<Mutex<Option<Timer>>> = Arc::new(Mutex::new(None));

    let _outer = {
        let (pool2, fired, inner) = (pool.clone(), fired.clone(), inner.clone());
        pool.timer_start(0, 0, move || {
            let fired = fired.clone();
            let timer = pool2.timer_start(10, 0, move || bump(&fired)).unwrap();
            *inner.lock() = Some(timer);
        })
        .unwrap()
    };

    assert_eq!(wait_for_value(&fired, 1, COMPLETION_TIMEOUT_MS), WaitResult::Ok);
    inner.lock().take();
}

#[test]
fn work_scheduled_from_work_runs() {
    let pool = pool();
    let ran = Arc::new(AtomicU32::new(0));
    {
        let (pool2, ran) = (pool.clone(), ran.clone());
        pool.schedule_work(move || {
            let ran = ran.clone();
            pool2.schedule_work(move || bump(&ran)).unwrap();
        })
        .unwrap();
    }
    assert_eq!(wait_for_value(&ran, 1, COMPLETION_TIMEOUT_MS), WaitResult::Ok);
}

#[test]
fn restart_during_a_firing_lets_it_finish_then_fires_on_the_new_schedule() {
    let pool = pool();
    let cb = BlockedCallback::new();
    let timer = start_blocked_timer(&pool, &cb);

    timer.restart(10, 0).unwrap();
    assert!(!cb.returned.load(Ordering::SeqCst));
    assert_eq!(timer.state(), TimerState::Started);

    let releaser = cb.release_later();
    assert_eq!(wait_for_value(&cb.entered, 2, COMPLETION_TIMEOUT_MS), WaitResult::Ok);
    assert!(cb.returned.load(Ordering::SeqCst));
    releaser.join().unwrap();

    thread::sleep(Duration::from_millis(100));
    assert_eq!(cb.entered.load(Ordering::SeqCst), 2);
}
