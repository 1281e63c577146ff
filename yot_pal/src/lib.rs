//! Platform concurrency primitives for components that need threads, timers and sockets
//! without an async runtime.
//!
//! The crate is built from the leaves up:
//!
//! - [`sync`]: compare-and-sleep / wake on 32- and 64-bit atomics, plus the small
//!   primitives built on it (a call-once gate, a typed state word, a spin lock)
//! - [`engine`]: the execution engine every pool and socket is created from
//! - [`threadpool`]: one-shot work, reusable work items and cancelable periodic timers
//! - [`async_socket`]: non-blocking send/receive over a process-wide socket reactor
//!
//! Every fallible operation returns [`PalError`].

pub mod async_socket;
pub mod engine;
pub mod error;
mod reactor;
pub mod sync;
mod thread;
pub mod threadpool;

pub use async_socket::{
    AsyncSocket, OpenResult, ReceiveCompletion, ReceiveResult, SendResult, SocketState,
};
pub use engine::{ExecutionEngine, ExecutionEngineParameters};
pub use error::{PalError, Result};
pub use threadpool::{ThreadPool, Timer, TimerState, WorkItem};
