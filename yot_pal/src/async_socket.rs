//! Non-blocking send and receive over a connected TCP stream.
//!
//! An [`AsyncSocket`] wraps a connected [`std::net::TcpStream`] and moves through
//!
//! ```text
//! Closed → Opening → Open → Closing → Closed
//! ```
//!
//! Sends are attempted immediately on the caller's thread; receives are always completed
//! from a reactor worker. Whatever cannot finish right away waits in a per-socket queue and
//! is retried when the shared reactor reports readiness.
//!
//! [`close`](AsyncSocket::close) (and dropping the socket) blocks until no send or receive
//! call is still inside the socket and no reactor dispatch for it is still running.
//! Anything left queued is completed with `Abandoned` before `close` returns, and nothing
//! for this socket runs afterwards.

use std::cell::Cell;
use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::LocalKey;

use metrics::{counter, gauge};
use mio::Token;
use parking_lot::{Mutex, RwLock};

use crate::engine::ExecutionEngine;
use crate::error::{PalError, Result};
use crate::reactor::{ReactorRef, ReadyHandler, SocketReactor};
use crate::sync::{
    INFINITE, SpinLock, StateCell, StateWord, wait_on_address, wake_by_address_all,
};

thread_local! {
    /// Address of the socket whose reactor dispatch this thread is running, or 0.
    static DISPATCHING_SOCKET: Cell<usize> = const { Cell::new(0) };
    /// Address of the socket whose synchronous send completion this thread is running, or 0.
    static COMPLETING_SEND: Cell<usize> = const { Cell::new(0) };
}

/// Marks this thread as working for one socket until dropped, restoring the previous mark.
struct ThreadMark {
    slot: &'static LocalKey<Cell<usize>>,
    previous: usize,
}

impl ThreadMark {
    fn set(slot: &'static LocalKey<Cell<usize>>, key: usize) -> Self {
        let previous = slot.with(|s| s.replace(key));
        Self { slot, previous }
    }
}

impl Drop for ThreadMark {
    fn drop(&mut self) {
        let previous = self.previous;
        self.slot.with(|s| s.set(previous));
    }
}

fn marked(slot: &'static LocalKey<Cell<usize>>, key: usize) -> u32 {
    u32::from(slot.with(Cell::get) == key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SocketState {
    Closed = 0,
    Opening = 1,
    Open = 2,
    Closing = 3,
}

impl StateWord for SocketState {
    fn into_word(self) -> u32 {
        self as u32
    }

    fn from_word(word: u32) -> Self {
        match word {
            0 => SocketState::Closed,
            1 => SocketState::Opening,
            2 => SocketState::Open,
            _ => SocketState::Closing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenResult {
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    Ok,
    Error,
    /// The peer went away or the socket was closed first.
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveResult {
    Ok,
    Error,
    /// The peer closed or reset the connection, or the socket was closed first.
    Abandoned,
}

/// What a receive completion hands back: the outcome, how many bytes landed, and the
/// caller's buffers (filled front to back).
#[derive(Debug)]
pub struct ReceiveCompletion {
    pub result: ReceiveResult,
    pub bytes_received: usize,
    pub buffers: Vec<Vec<u8>>,
}

type SendCallback = Box<dyn FnOnce(SendResult) + Send + 'static>;
type ReceiveCallback = Box<dyn FnOnce(ReceiveCompletion) + Send + 'static>;

struct SendContext {
    buffers: Vec<Vec<u8>>,
    /// Bytes of `buffers` already written.
    written: usize,
    total: usize,
    on_complete: SendCallback,
}

impl SendContext {
    fn slices(&self) -> Vec<IoSlice<'_>> {
        let mut skip = self.written;
        let mut slices = Vec::with_capacity(self.buffers.len());
        for buffer in &self.buffers {
            if skip >= buffer.len() {
                skip -= buffer.len();
                continue;
            }
            slices.push(IoSlice::new(&buffer[skip..]));
            skip = 0;
        }
        slices
    }
}

struct ReceiveContext {
    buffers: Vec<Vec<u8>>,
    on_complete: ReceiveCallback,
}

impl ReceiveContext {
    fn complete(
        self,
        result: ReceiveResult,
        bytes_received: usize,
    ) -> (ReceiveCallback, ReceiveCompletion) {
        (
            self.on_complete,
            ReceiveCompletion {
                result,
                bytes_received,
                buffers: self.buffers,
            },
        )
    }
}

/// Outcome of pushing a send as far as the socket accepts it right now.
enum WriteProgress {
    Done,
    WouldBlock,
    Failed(io::Error),
}

struct SocketShared {
    token: Token,
    state: StateCell<SocketState>,
    /// Send and receive calls currently inside their synchronous part, including a send
    /// completion that runs before `send_async` returns.
    pending_api_calls: AtomicU32,
    /// Reactor dispatches currently running for this socket. Queued ones are not counted.
    in_flight: AtomicU32,
    stream: RwLock<Option<mio::net::TcpStream>>,
    receives: SpinLock<VecDeque<ReceiveContext>>,
    sends: SpinLock<VecDeque<SendContext>>,
    /// Serializes read attempts, so queued receives complete in order.
    read_io: Mutex<()>,
    /// Serializes write attempts, so queued sends complete in order.
    write_io: Mutex<()>,
    reactor: Arc<SocketReactor>,
}

/// Holds one pending API call for as long as it lives.
struct PendingCall<'a>(&'a AtomicU32);

impl<'a> PendingCall<'a> {
    fn enter(counter: &'a AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
        wake_by_address_all(self.0);
    }
}

fn is_abandoned(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Checks a caller's buffer list and returns its total length.
fn validate_buffers(buffers: &[Vec<u8>]) -> Result<usize> {
    if buffers.is_empty() {
        return Err(PalError::InvalidArgument("buffer list is empty"));
    }
    let mut total: u32 = 0;
    for buffer in buffers {
        if buffer.is_empty() {
            return Err(PalError::InvalidArgument("buffer has zero length"));
        }
        let len = u32::try_from(buffer.len())
            .map_err(|_| PalError::InvalidArgument("total buffer length exceeds u32"))?;
        total = total
            .checked_add(len)
            .ok_or(PalError::InvalidArgument("total buffer length exceeds u32"))?;
    }
    Ok(total as usize)
}

/// One running reactor dispatch, counted in `in_flight` until dropped.
struct RunningDispatch<'a> {
    shared: &'a SocketShared,
    _mark: ThreadMark,
}

impl<'a> RunningDispatch<'a> {
    fn enter(shared: &'a SocketShared) -> Self {
        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            shared,
            _mark: ThreadMark::set(&DISPATCHING_SOCKET, shared.key()),
        }
    }
}

impl Drop for RunningDispatch<'_> {
    fn drop(&mut self) {
        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        wake_by_address_all(&self.shared.in_flight);
    }
}

/// Blocks until `counter` reads `target`.
fn wait_until_count(counter: &AtomicU32, target: u32) {
    loop {
        let current = counter.load(Ordering::SeqCst);
        if current == target {
            return;
        }
        wait_on_address(counter, current, INFINITE);
    }
}

/// Writes as much of `ctx` as the socket takes without blocking.
fn write_pending(mut stream: &mio::net::TcpStream, ctx: &mut SendContext) -> WriteProgress {
    while ctx.written < ctx.total {
        let written = stream.write_vectored(&ctx.slices());
        match written {
            Ok(0) => return WriteProgress::Failed(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                ctx.written += n;
                counter!("yot_pal_socket_bytes_sent_total").increment(n as u64);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return WriteProgress::WouldBlock,
            Err(e) => return WriteProgress::Failed(e),
        }
    }
    WriteProgress::Done
}

impl SocketShared {
    fn key(&self) -> usize {
        self as *const Self as usize
    }

    /// Completes at most one queued receive. Returns `None` once nothing more can be done
    /// until the next readiness event.
    fn receive_one(&self) -> Option<(ReceiveCallback, ReceiveCompletion)> {
        let _io = self.read_io.lock();
        let stream = self.stream.read();
        let mut stream: &mio::net::TcpStream = stream.as_ref()?;
        let mut ctx = self.receives.lock().pop_front()?;

        let outcome = loop {
            let mut slices: Vec<IoSliceMut<'_>> =
                ctx.buffers.iter_mut().map(|b| IoSliceMut::new(b)).collect();
            match stream.read_vectored(&mut slices) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        match outcome {
            Ok(0) => Some(ctx.complete(ReceiveResult::Abandoned, 0)),
            Ok(n) => {
                counter!("yot_pal_socket_bytes_received_total").increment(n as u64);
                Some(ctx.complete(ReceiveResult::Ok, n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.receives.lock().push_front(ctx);
                None
            }
            Err(e) if is_abandoned(&e) => Some(ctx.complete(ReceiveResult::Abandoned, 0)),
            Err(e) => {
                log::error!("socket receive failed: {e}");
                Some(ctx.complete(ReceiveResult::Error, 0))
            }
        }
    }

    /// Pushes the oldest queued send forward and returns its completion once it finished.
    fn send_one(&self) -> Option<(SendCallback, SendResult)> {
        let _io = self.write_io.lock();
        let stream = self.stream.read();
        let stream = stream.as_ref()?;
        let mut ctx = self.sends.lock().pop_front()?;

        match write_pending(stream, &mut ctx) {
            WriteProgress::Done => Some((ctx.on_complete, SendResult::Ok)),
            WriteProgress::WouldBlock => {
                self.sends.lock().push_front(ctx);
                None
            }
            WriteProgress::Failed(e) if is_abandoned(&e) => {
                Some((ctx.on_complete, SendResult::Abandoned))
            }
            WriteProgress::Failed(e) => {
                log::error!("socket send failed: {e}");
                Some((ctx.on_complete, SendResult::Error))
            }
        }
    }

    /// Everything `close` does once it won the `Open → Closing` transition.
    ///
    /// Neither wait counts the caller itself when `close` runs inside one of this socket's
    /// own completions.
    fn shut_down(&self) {
        wait_until_count(&self.pending_api_calls, marked(&COMPLETING_SEND, self.key()));

        self.reactor.remove(self.token);
        if let Some(stream) = self.stream.write().as_mut() {
            self.reactor.deregister(stream);
        }

        // A dispatch that starts from here on finds the socket no longer open and returns.
        wait_until_count(&self.in_flight, marked(&DISPATCHING_SOCKET, self.key()));

        if let Some(stream) = self.stream.write().take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                if e.kind() != io::ErrorKind::NotConnected {
                    log::warn!("socket shutdown failed: {e}");
                }
            }
        }

        let receives = std::mem::take(&mut *self.receives.lock());
        let sends = std::mem::take(&mut *self.sends.lock());
        for ctx in receives {
            let (on_complete, completion) = ctx.complete(ReceiveResult::Abandoned, 0);
            on_complete(completion);
        }
        for ctx in sends {
            (ctx.on_complete)(SendResult::Abandoned);
        }

        gauge!("yot_pal_sockets_open_current").decrement(1.0);
        self.state.set(SocketState::Closed);
    }
}

impl ReadyHandler for SocketShared {
    fn on_ready(&self, readable: bool, writable: bool) {
        // Counted before the state check; `close` moves the state before it reads the count.
        let _running = RunningDispatch::enter(self);
        if self.state.get() != SocketState::Open {
            return;
        }
        // One completion at a time with no lock held, so a callback may close the socket.
        if readable {
            while let Some((on_complete, completion)) = self.receive_one() {
                on_complete(completion);
            }
        }
        if writable {
            while let Some((on_complete, result)) = self.send_one() {
                on_complete(result);
            }
        }
    }
}

/// A socket performing non-blocking sends and receives through the shared reactor.
///
/// Dropping it closes it first if it is still open; see [`close`](Self::close).
pub struct AsyncSocket {
    shared: Arc<SocketShared>,
    _reactor: ReactorRef,
    _engine: ExecutionEngine,
}

impl AsyncSocket {
    /// Wraps a connected stream. The socket starts `Closed`; call
    /// [`open_async`](Self::open_async) before sending or receiving.
    ///
    /// # Errors
    ///
    /// Fails if the stream cannot be made non-blocking or the shared reactor could not be
    /// started.
    pub fn create(engine: &ExecutionEngine, stream: TcpStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        let reactor = ReactorRef::acquire(engine)?;
        let token = reactor.reactor().next_token();

        let shared = Arc::new(SocketShared {
            token,
            state: StateCell::new(SocketState::Closed),
            pending_api_calls: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            stream: RwLock::new(Some(mio::net::TcpStream::from_std(stream))),
            receives: SpinLock::new(VecDeque::new()),
            sends: SpinLock::new(VecDeque::new()),
            read_io: Mutex::new(()),
            write_io: Mutex::new(()),
            reactor: Arc::clone(reactor.reactor()),
        });

        log::trace!("async socket {token:?} created");
        Ok(Self {
            shared,
            _reactor: reactor,
            _engine: engine.clone(),
        })
    }

    /// Registers the socket with the reactor and, on success, calls `on_open_complete`
    /// with [`OpenResult::Ok`] before returning.
    ///
    /// # Errors
    ///
    /// [`PalError::InvalidState`] if the socket is not `Closed`; any registration error.
    /// The callback is not invoked on error and the socket stays `Closed`.
    pub fn open_async<F>(&self, on_open_complete: F) -> Result<()>
    where
        F: FnOnce(OpenResult),
    {
        let shared = &self.shared;
        if shared
            .state
            .transition(SocketState::Closed, SocketState::Opening)
            .is_err()
        {
            return Err(PalError::InvalidState("socket is not closed"));
        }

        let registered = {
            let mut stream = shared.stream.write();
            match stream.as_mut() {
                Some(stream) => shared
                    .reactor
                    .register(stream, shared.token, Arc::clone(shared) as Arc<dyn ReadyHandler>)
                    .map_err(PalError::from),
                None => Err(PalError::InvalidState("socket stream was already shut down")),
            }
        };
        if let Err(e) = registered {
            shared.state.set(SocketState::Closed);
            return Err(e);
        }

        shared.state.set(SocketState::Open);
        gauge!("yot_pal_sockets_open_current").increment(1.0);
        log::trace!("async socket {:?} open", shared.token);
        on_open_complete(OpenResult::Ok);
        Ok(())
    }

    /// Sends `buffers` in order.
    ///
    /// If the whole payload is written right away, `on_send_complete` runs on this thread
    /// before `send_async` returns. Otherwise the rest is queued and completed from a
    /// reactor worker. Sends on one socket complete in the order they were submitted.
    ///
    /// # Errors
    ///
    /// - [`PalError::InvalidArgument`] for an empty list, an empty buffer, or a total
    ///   length that does not fit in a `u32`.
    /// - [`PalError::NotOpen`] if the socket is not open.
    /// - [`PalError::Abandoned`] if the peer reset the connection.
    /// - [`PalError::Io`] for any other error.
    ///
    /// The callback is never invoked when an error is returned.
    pub fn send_async<F>(&self, buffers: Vec<Vec<u8>>, on_send_complete: F) -> Result<()>
    where
        F: FnOnce(SendResult) + Send + 'static,
    {
        let total = validate_buffers(&buffers)?;
        let shared = &self.shared;
        let call = PendingCall::enter(&shared.pending_api_calls);
        if shared.state.get() != SocketState::Open {
            return Err(PalError::NotOpen);
        }

        let mut ctx = SendContext {
            buffers,
            written: 0,
            total,
            on_complete: Box::new(on_send_complete),
        };

        let io = shared.write_io.lock();
        let stream = shared.stream.read();
        let Some(stream_ref) = stream.as_ref() else {
            return Err(PalError::NotOpen);
        };

        if !shared.sends.lock().is_empty() {
            // Earlier sends are still waiting for readiness; this one goes behind them.
            shared.sends.lock().push_back(ctx);
            return Ok(());
        }

        match write_pending(stream_ref, &mut ctx) {
            WriteProgress::Done => {
                drop(stream);
                drop(io);
                // Still a pending call, so a close on another thread waits for the callback.
                let _mark = ThreadMark::set(&COMPLETING_SEND, shared.key());
                (ctx.on_complete)(SendResult::Ok);
                drop(call);
                Ok(())
            }
            WriteProgress::WouldBlock => {
                shared.sends.lock().push_back(ctx);
                Ok(())
            }
            WriteProgress::Failed(e) if is_abandoned(&e) => Err(PalError::Abandoned),
            WriteProgress::Failed(e) => Err(PalError::Io(e)),
        }
    }

    /// Receives into `buffers`, filling them front to back.
    ///
    /// The completion always runs on a reactor worker. A connection closed or reset by the
    /// peer completes with [`ReceiveResult::Abandoned`].
    ///
    /// # Errors
    ///
    /// [`PalError::InvalidArgument`] for invalid buffers, [`PalError::NotOpen`] if the
    /// socket is not open. The callback is never invoked when an error is returned.
    pub fn receive_async<F>(&self, buffers: Vec<Vec<u8>>, on_receive_complete: F) -> Result<()>
    where
        F: FnOnce(ReceiveCompletion) + Send + 'static,
    {
        validate_buffers(&buffers)?;
        let shared = &self.shared;
        let _call = PendingCall::enter(&shared.pending_api_calls);
        if shared.state.get() != SocketState::Open {
            return Err(PalError::NotOpen);
        }

        shared.receives.lock().push_back(ReceiveContext {
            buffers,
            on_complete: Box::new(on_receive_complete),
        });
        // Data may already be buffered and its readiness edge long gone.
        shared.reactor.notify(shared.token, true, false);
        Ok(())
    }

    /// Closes the socket.
    ///
    /// Waits for send and receive calls still inside the socket and for running reactor
    /// dispatches, shuts the stream down, and completes whatever is still queued with
    /// `Abandoned`. No completion for this socket runs after `close` returns. Closing a
    /// socket that is not open only logs a warning.
    pub fn close(&self) {
        if let Err(state) = self
            .shared
            .state
            .transition(SocketState::Open, SocketState::Closing)
        {
            log::warn!("close called on a socket that is {state:?}");
            return;
        }
        self.shared.shut_down();
        log::trace!("async socket {:?} closed", self.shared.token);
    }

    pub fn state(&self) -> SocketState {
        self.shared.state.get()
    }
}

impl std::fmt::Debug for AsyncSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSocket")
            .field("token", &self.shared.token)
            .field("state", &self.shared.state.get())
            .finish()
    }
}

impl Drop for AsyncSocket {
    fn drop(&mut self) {
        loop {
            match self.shared.state.get() {
                SocketState::Closed => break,
                SocketState::Open => {
                    if self
                        .shared
                        .state
                        .transition(SocketState::Open, SocketState::Closing)
                        .is_ok()
                    {
                        self.shared.shut_down();
                    }
                }
                state @ (SocketState::Opening | SocketState::Closing) => {
                    self.shared.state.wait_while(state);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rejects_empty_lists_and_buffers() {
        assert!(matches!(
            validate_buffers(&[]),
            Err(PalError::InvalidArgument(_))
        ));
        assert!(matches!(
            validate_buffers(&[vec![1], vec![]]),
            Err(PalError::InvalidArgument(_))
        ));
        assert_eq!(validate_buffers(&[vec![1, 2], vec![3]]).unwrap(), 3);
    }

    #[test]
    fn send_slices_skip_written_bytes() {
        let ctx = SendContext {
            buffers: vec![vec![1, 2], vec![3, 4, 5]],
            written: 3,
            total: 5,
            on_complete: Box::new(|_| {}),
        };
        let slices = ctx.slices();
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], &[4, 5]);
    }

    #[test]
    fn peer_faults_are_abandoned_not_errors() {
        assert!(is_abandoned(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_abandoned(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!is_abandoned(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[test]
    fn thread_marks_nest_and_restore() {
        {
            let _outer = ThreadMark::set(&COMPLETING_SEND, 7);
            assert_eq!(marked(&COMPLETING_SEND, 7), 1);
            {
                let _inner = ThreadMark::set(&COMPLETING_SEND, 9);
                assert_eq!(marked(&COMPLETING_SEND, 7), 0);
            }
            assert_eq!(marked(&COMPLETING_SEND, 7), 1);
        }
        assert_eq!(COMPLETING_SEND.with(Cell::get), 0);
    }

    proptest! {
        #[test]
        fn valid_lists_report_their_total_length(
            lens in proptest::collection::vec(1usize..64, 1..16)
        ) {
            let buffers: Vec<Vec<u8>> = lens.iter().map(|&n| vec![0u8; n]).collect();
            prop_assert_eq!(validate_buffers(&buffers).unwrap(), lens.iter().sum::<usize>());
        }

        #[test]
        fn any_empty_buffer_is_rejected(
            lens in proptest::collection::vec(1usize..64, 0..8),
            at in 0usize..8,
        ) {
            let mut buffers: Vec<Vec<u8>> = lens.iter().map(|&n| vec![0u8; n]).collect();
            let at = at.min(buffers.len());
            buffers.insert(at, Vec::new());
            prop_assert!(matches!(
                validate_buffers(&buffers),
                Err(PalError::InvalidArgument(_))
            ));
        }
    }
}
