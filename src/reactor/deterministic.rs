//! In-memory reactor backend used only by tests.
//!
//! Operations never complete on their own; a test drives them explicitly
//! via [`DeterministicBackend::complete`]. This makes the exactly-once and
//! cancel-then-never-fires invariants (spec §8, properties 1-2) trivial to
//! assert without touching real fds or a kernel.

use std::collections::{HashMap, VecDeque};

use super::{Completion, Event, Op, OpId, OpIdAllocator, Reactor, RunMode};
use crate::error::Error;

pub struct DeterministicBackend {
    ids: OpIdAllocator,
    /// Ops still awaiting a `complete` call, keyed by id.
    pending: HashMap<OpId, Op>,
    /// Ops resolved via `complete` but not yet drained by `run`.
    ready: VecDeque<Event>,
}

impl Default for DeterministicBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeterministicBackend {
    pub fn new() -> Self {
        Self {
            ids: OpIdAllocator::default(),
            pending: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    /// Number of operations submitted but not yet completed or cancelled.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Resolves a still-pending operation. A no-op (the completion is
    /// silently dropped) if `id` was never submitted, already completed, or
    /// was cancelled — matching the "cancellation-after-fire is a no-op"
    /// rule from the opposite direction: completion-after-cancel is also a
    /// no-op.
    pub fn complete(&mut self, id: OpId, result: Result<Completion, Error>) {
        if self.pending.remove(&id).is_some() {
            self.ready.push_back(Event { id, result });
        }
    }
}

impl Reactor for DeterministicBackend {
    fn submit(&mut self, op: Op) -> OpId {
        let id = self.ids.next();
        self.pending.insert(id, op);
        id
    }

    fn cancel(&mut self, id: OpId) {
        // Removing from `pending` is what guarantees the callback can never
        // fire later: `complete` checks membership before queuing an event.
        self.pending.remove(&id);
        self.ready.retain(|ev| ev.id != id);
    }

    fn run(&mut self, _mode: RunMode, on_event: &mut dyn FnMut(Event)) {
        while let Some(ev) = self.ready.pop_front() {
            on_event(ev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_once_completion() {
        let mut r = DeterministicBackend::new();
        let id = r.submit(Op::Timeout { after: std::time::Duration::from_millis(1) });
        r.complete(id, Ok(Completion::Timer));
        // A second completion for the same id is dropped: it's no longer pending.
        r.complete(id, Ok(Completion::Timer));

        let mut count = 0;
        r.run(RunMode::UntilDone, &mut |_| count += 1);
        assert_eq!(count, 1);
    }

    #[test]
    fn cancel_suppresses_callback() {
        let mut r = DeterministicBackend::new();
        let id = r.submit(Op::Timeout { after: std::time::Duration::from_millis(1) });
        r.cancel(id);
        r.complete(id, Ok(Completion::Timer));

        let mut count = 0;
        r.run(RunMode::UntilDone, &mut |_| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn pending_count_drops_after_cancel() {
        let mut r = DeterministicBackend::new();
        let a = r.submit(Op::WaitPid { pid: 123 });
        let _b = r.submit(Op::Timeout { after: std::time::Duration::from_millis(1) });
        assert_eq!(r.pending_count(), 2);
        r.cancel(a);
        assert_eq!(r.pending_count(), 1);
    }

    #[test]
    fn unknown_cancel_is_noop() {
        let mut r = DeterministicBackend::new();
        let id = r.submit(Op::Timeout { after: std::time::Duration::from_millis(1) });
        r.cancel(OpId::fresh_for_test(9999));
        r.complete(id, Ok(Completion::Timer));

        let mut count = 0;
        r.run(RunMode::UntilDone, &mut |_| count += 1);
        assert_eq!(count, 1);
    }
}
