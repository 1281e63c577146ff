use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;

use crate::engine::ExecutionEngine;
use crate::error::Result;
use crate::thread::spawn_named;

/// Reserved for the waker that interrupts `poll` at shutdown.
const WAKE_TOKEN: Token = Token(0);

const EVENTS_CAPACITY: usize = 1024;

/// Something registered with the reactor that wants readiness callbacks.
///
/// A dispatch may still be queued when its source is removed from the table. The handler
/// is kept alive by the dispatch, and `on_ready` has to notice on its own that it no longer
/// has anything to do.
pub(crate) trait ReadyHandler: Send + Sync + 'static {
    fn on_ready(&self, readable: bool, writable: bool);
}

enum Dispatch {
    Ready {
        handler: Arc<dyn ReadyHandler>,
        readable: bool,
        writable: bool,
    },
    Shutdown,
}

/// Token → handler map shared by the poll thread and socket operations.
struct DispatchTable {
    handlers: Mutex<HashMap<Token, Arc<dyn ReadyHandler>>>,
    tx: Sender<Dispatch>,
}

impl DispatchTable {
    /// Hands a readiness event for `token` to a dispatch worker. Returns `false` when nothing
    /// is registered under `token`.
    fn queue(&self, token: Token, readable: bool, writable: bool) -> bool {
        let handlers = self.handlers.lock();
        let Some(handler) = handlers.get(&token) else {
            return false;
        };
        let dispatch = Dispatch::Ready {
            handler: Arc::clone(handler),
            readable,
            writable,
        };
        // Fails only once the workers are gone.
        self.tx.send(dispatch).is_ok()
    }
}

/// The process-wide socket reactor: one `mio::Poll` thread that turns OS readiness into
/// dispatches, and a set of workers that run them.
pub(crate) struct SocketReactor {
    registry: Registry,
    waker: Waker,
    table: Arc<DispatchTable>,
    next_token: AtomicUsize,
    shutdown: Arc<AtomicBool>,
    dispatch_workers: usize,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SocketReactor {
    fn start(dispatch_workers: usize) -> Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let (tx, rx) = unbounded();

        let reactor = Arc::new(Self {
            registry,
            waker,
            table: Arc::new(DispatchTable {
                handlers: Mutex::new(HashMap::new()),
                tx,
            }),
            next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
            shutdown: Arc::new(AtomicBool::new(false)),
            dispatch_workers,
            threads: Mutex::new(Vec::with_capacity(dispatch_workers + 1)),
        });

        if let Err(e) = reactor.spawn_threads(poll, rx) {
            reactor.shutdown();
            return Err(e);
        }

        log::debug!("socket reactor started with {dispatch_workers} dispatch workers");
        Ok(reactor)
    }

    fn spawn_threads(&self, poll: Poll, rx: Receiver<Dispatch>) -> Result<()> {
        let table = Arc::clone(&self.table);
        let shutdown = Arc::clone(&self.shutdown);
        let poller = spawn_named("yot-pal-reactor-poll".to_string(), move || {
            run_poll_loop(poll, &table, &shutdown);
        })?;
        self.threads.lock().push(poller);

        for id in 0..self.dispatch_workers {
            let rx = rx.clone();
            let worker = spawn_named(format!("yot-pal-reactor-worker-{id}"), move || {
                run_dispatch_worker(&rx);
            })?;
            self.threads.lock().push(worker);
        }
        Ok(())
    }

    pub(crate) fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Publishes `handler` under `token`, then registers `source` for read and write
    /// readiness. On failure the handler is removed again.
    pub(crate) fn register<S>(
        &self,
        source: &mut S,
        token: Token,
        handler: Arc<dyn ReadyHandler>,
    ) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.table.handlers.lock().insert(token, handler);
        if let Err(e) = self
            .registry
            .register(source, token, Interest::READABLE | Interest::WRITABLE)
        {
            self.table.handlers.lock().remove(&token);
            return Err(e);
        }
        Ok(())
    }

    /// Stops queueing dispatches for `token`. Dispatches already queued still run.
    pub(crate) fn remove(&self, token: Token) {
        self.table.handlers.lock().remove(&token);
    }

    pub(crate) fn deregister<S>(&self, source: &mut S)
    where
        S: Source + ?Sized,
    {
        if let Err(e) = self.registry.deregister(source) {
            log::error!("socket reactor deregister failed: {e}");
        }
    }

    /// Queues a dispatch for `token` without waiting for the OS to report readiness.
    pub(crate) fn notify(&self, token: Token, readable: bool, writable: bool) -> bool {
        self.table.queue(token, readable, writable)
    }

    /// Stops the poll thread and the dispatch workers and joins them. A dispatch worker
    /// that ends up here (the last socket was destroyed from its own callback) is not
    /// joined; it exits after its current dispatch.
    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            log::error!("failed to wake socket reactor poll thread: {e}");
        }
        for _ in 0..self.dispatch_workers {
            let _ = self.table.tx.send(Dispatch::Shutdown);
        }

        let me = thread::current().id();
        let threads = std::mem::take(&mut *self.threads.lock());
        for t in threads {
            if t.thread().id() == me {
                continue;
            }
            if t.join().is_err() {
                log::error!("socket reactor thread panicked");
            }
        }
        log::debug!("socket reactor stopped");
    }
}

impl std::fmt::Debug for SocketReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketReactor")
            .field("dispatch_workers", &self.dispatch_workers)
            .field("registered", &self.table.handlers.lock().len())
            .finish()
    }
}

/// The background event loop. Blocks in `poll` until the OS reports readiness, and never
/// runs user code itself.
fn run_poll_loop(mut poll: Poll, table: &DispatchTable, shutdown: &AtomicBool) {
    let mut events = Events::with_capacity(EVENTS_CAPACITY);

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("socket reactor poll failed: {e}");
            break;
        }

        for event in events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            let readable = event.is_readable() || event.is_read_closed() || event.is_error();
            let writable = event.is_writable() || event.is_write_closed() || event.is_error();
            table.queue(token, readable, writable);
        }

        if shutdown.load(Ordering::SeqCst) {
            break;
        }
    }

    log::trace!("socket reactor poll thread exiting");
}

fn run_dispatch_worker(rx: &Receiver<Dispatch>) {
    while let Ok(dispatch) = rx.recv() {
        match dispatch {
            Dispatch::Ready {
                handler,
                readable,
                writable,
            } => {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| handler.on_ready(readable, writable)));
                if outcome.is_err() {
                    log::error!("socket completion callback panicked");
                }
            }
            Dispatch::Shutdown => break,
        }
    }
}

struct ReactorSlot {
    refs: usize,
    reactor: Option<Arc<SocketReactor>>,
}

/// The one reactor shared by every live socket in the process.
static SOCKET_REACTOR: Mutex<ReactorSlot> = Mutex::new(ReactorSlot {
    refs: 0,
    reactor: None,
});

/// A counted reference to the process-wide reactor. The first one starts it, dropping the
/// last one stops it.
pub(crate) struct ReactorRef {
    reactor: Arc<SocketReactor>,
}

impl ReactorRef {
    /// Takes a reference on the shared reactor, starting it with `engine.worker_count()`
    /// dispatch workers if no socket currently holds one.
    pub(crate) fn acquire(engine: &ExecutionEngine) -> Result<Self> {
        let mut slot = SOCKET_REACTOR.lock();
        let reactor = match &slot.reactor {
            Some(reactor) => Arc::clone(reactor),
            None => {
                let reactor = SocketReactor::start(engine.worker_count())?;
                slot.reactor = Some(Arc::clone(&reactor));
                reactor
            }
        };
        slot.refs += 1;
        Ok(Self { reactor })
    }

    pub(crate) fn reactor(&self) -> &Arc<SocketReactor> {
        &self.reactor
    }
}

impl Drop for ReactorRef {
    fn drop(&mut self) {
        let mut slot = SOCKET_REACTOR.lock();
        slot.refs -= 1;
        if slot.refs == 0 {
            if let Some(reactor) = slot.reactor.take() {
                reactor.shutdown();
            }
        }
    }
}

impl std::fmt::Debug for ReactorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.reactor.fmt(f)
    }
}
