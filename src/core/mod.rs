//! Core runtime: the readiness reactor and the shared retry policies.

pub mod reactor;
pub mod retry;

pub use reactor::{EventHandler, FdKind, Reactor, StopHandle, Token};
pub use retry::{RetryPolicy, Transient, ACK_WAIT, BUSY_POLL};
