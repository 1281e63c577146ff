//! Event-driven socket reactor.
//!
//! One `mio::Poll` (epoll on Linux, IOCP on Windows) is shared by every socket in the
//! process. A dedicated thread waits on it and forwards readiness to a small set of dispatch
//! workers, which run the socket's send and receive completions.

#[allow(clippy::module_inception)]
mod reactor;

pub(crate) use reactor::{ReactorRef, ReadyHandler, SocketReactor};
