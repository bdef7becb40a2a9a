//! The asynchronous I/O reactor (spec §4.1).
//!
//! A single uniform submit/poll surface over whichever backend the platform
//! gets: `TokioBackend` in production (tokio's own I/O driver already
//! abstracts epoll on Linux and kqueue on macOS/BSD, so one backend serves
//! both rather than hand-rolling separate completion- and readiness-based
//! bindings), and `DeterministicBackend` for tests that need to control
//! exactly when an operation completes.
//!
//! Every operation submitted through [`Reactor::submit`] is assigned an
//! [`OpId`] and completes exactly once: with a success [`Completion`], an
//! [`Error`], or [`Completion::Cancelled`] if [`Reactor::cancel`] raced it.
//! Callbacks never fire after `cancel` returns successfully (spec invariant
//! #2, §8).
//!
//! `Op` covers exactly the operations something in this server actually
//! drives through it today — the frame scheduler's coalescing deadline
//! ([`Op::Timeout`], see `scheduler::FrameScheduler`) and the process
//! supervisor's exit correlation ([`Op::WaitPid`], see
//! `process::ProcessSupervisor`). IPC socket I/O stays on tokio's native
//! `UnixListener`/`UnixStream` (`ipc::server`) rather than being routed
//! through fd-scoped ops nothing else would exercise; see DESIGN.md.

mod deterministic;
mod handle;
mod tokio_backend;

pub use deterministic::DeterministicBackend;
pub use handle::ReactorHandle;
pub use tokio_backend::TokioBackend;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::Error;

/// Opaque identifier for a submitted operation. Unique for the lifetime of
/// the owning reactor; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(u64);

/// Monotonic allocator shared by every backend implementation.
#[derive(Default)]
pub(crate) struct OpIdAllocator(AtomicU64);

impl OpIdAllocator {
    pub(crate) fn next(&self) -> OpId {
        OpId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

impl OpId {
    /// Constructs an id not backed by any allocator, for tests that need to
    /// probe "unknown id" behavior (e.g. cancelling an id never submitted).
    #[cfg(test)]
    pub fn fresh_for_test(raw: u64) -> Self {
        OpId(raw)
    }
}

/// What kind of operation was submitted, carried alongside its id so a
/// dispatcher can match the right [`Completion`] variant without a
/// downcast.
#[derive(Clone)]
pub enum Op {
    Timeout { after: Duration },
    WaitPid { pid: i32 },
}

/// A successful completion, typed per operation kind.
#[derive(Debug, Clone)]
pub enum Completion {
    Timer,
    WaitPid { pid: i32, status: i32 },
    Cancelled,
}

/// One delivered result: either the operation's own id resolved normally,
/// or it failed.
pub struct Event {
    pub id: OpId,
    pub result: Result<Completion, Error>,
}

/// How long [`Reactor::run`] is willing to block waiting for the next
/// event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Block until the pending-operation set is empty.
    UntilDone,
    /// Drain whatever has already completed without blocking.
    Once,
    /// Block indefinitely; only returns if no operations are outstanding
    /// and none can ever arrive.
    Forever,
}

/// The uniform reactor contract implemented by each backend.
///
/// `submit` enqueues an operation and returns its id immediately (on the
/// readiness-style backend, operations that can complete synchronously
/// still go through the same queue so callers never need to special-case
/// them). `run` drains completed operations, invoking `on_event` for each,
/// until `mode` is satisfied. Signal interruptions encountered while
/// polling the underlying OS primitive are absorbed internally and the poll
/// retried — they never surface as an `Event`.
pub trait Reactor {
    /// Submits an operation, returning the id that its eventual completion
    /// will carry.
    fn submit(&mut self, op: Op) -> OpId;

    /// Cancels a pending operation by id. A no-op if the id is unknown or
    /// already completed. Once this returns, the operation's callback is
    /// guaranteed never to fire (it may still appear once in `run`'s event
    /// stream as `Completion::Cancelled` if it was already event-ready, but
    /// no *new* work is scheduled on its behalf).
    fn cancel(&mut self, id: OpId);

    /// Runs the reactor, invoking `on_event` for each completion, until
    /// `mode`'s condition is met.
    fn run(&mut self, mode: RunMode, on_event: &mut dyn FnMut(Event));
}
