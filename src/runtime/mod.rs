//! Event-loop building blocks shared by the server and the client.
//!
//! - `PagePool`: shared page allocator with reference-counted chains
//! - `DeferredSender`: per-connection non-blocking send queue
//! - `Registry`: ordered, slab-backed connection registry
//! - `PeriodicTimer` / `Deadline`: timers expressed as poll deadlines
//! - `StopHandle`: wakes and stops a running loop from another thread

mod buffer;
mod registry;
mod sender;
mod stop;
mod timer;

pub use buffer::{Message, PageChain, PagePool, PoolError, PoolStats};
pub use registry::{ConnPhase, Registry};
pub use sender::{DeferredSender, FlushStatus};
pub use stop::StopHandle;
pub use timer::{poll_timeout, Deadline, PeriodicTimer};

pub(crate) use stop::WAKER_TOKEN;

use mio::Token;

/// Token reserved for the server's listening socket.
pub(crate) const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Capacity of the per-poll event batch.
pub(crate) const EVENTS_CAPACITY: usize = 1024;
