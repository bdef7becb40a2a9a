//! Frame scheduler (spec §4.2): coalesces per-PTY screen mutations into a
//! bounded-rate stream of render ticks.
//!
//! Mirrors the `shutdown: Arc<Notify>` idiom in
//! `core::process_manager::PtySession`/`core::vte_backend::SessionState`
//! but for a signal that fires on every mutation rather than once on
//! teardown. `Notify::notify_one` absorbing a redundant notification when
//! one is already pending is exactly the "would-block is silently absorbed,
//! signal already pending" behavior spec §4.2 asks of the per-PTY pipe, so
//! `tokio::sync::Notify` is a faithful, idiomatic stand-in for a real
//! non-blocking signal pipe without reaching for a raw `pipe(2)` pair.
//!
//! The deadline timer itself is *not* a bare `tokio::time::sleep`: it goes
//! through `Reactor::submit(Op::Timeout)` via an owned `ReactorHandle`, the
//! same pending-map-plus-event-pump shape `process::ProcessSupervisor` uses
//! for `Op::WaitPid`, so both of the reactor's live op kinds are reached the
//! same way.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::reactor::{Completion, Op, OpId, ReactorHandle, TokioBackend};
use crate::session::PtyId;

/// Per-PTY signal the worker fires after any screen-affecting mutation.
#[derive(Clone)]
pub struct FrameSignal {
    notify: Arc<Notify>,
}

impl FrameSignal {
    fn new() -> Self {
        Self { notify: Arc::new(Notify::new()) }
    }

    /// Called from the PTY worker thread after feeding bytes that changed
    /// the screen. Non-blocking; a pending notification is not duplicated.
    pub fn signal(&self) {
        self.notify.notify_one();
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// A render callback invoked at most once per `T_min` per PTY, and at least
/// once within `2*T_min` of the last unrendered mutation (spec §8,
/// properties 3-4).
pub trait Renderer: Send + Sync + 'static {
    fn render(&self, pty: PtyId);
}

struct PtyTiming {
    signal: FrameSignal,
    last_render: Option<Instant>,
    timer_armed: bool,
}

/// Owns one [`FrameSignal`] per subscribed PTY, the reactor thread that
/// carries each PTY's deadline timer, and the single deadline timer (per
/// PTY) the coalescing algorithm needs.
pub struct FrameScheduler {
    t_min: Duration,
    ptys: tokio::sync::Mutex<HashMap<PtyId, PtyTiming>>,
    reactor: ReactorHandle,
    /// Which PTY (and its renderer) a pending `Op::Timeout` belongs to, so
    /// the event pump below can finish the drain-then-decide step once it
    /// fires.
    pending_timers: tokio::sync::Mutex<HashMap<OpId, (PtyId, Arc<dyn Renderer>)>>,
}

impl FrameScheduler {
    pub fn new(t_min_ms: u64) -> Arc<Self> {
        let (reactor, mut reactor_events) = ReactorHandle::spawn(Box::new(TokioBackend::new(tokio::runtime::Handle::current())));
        let scheduler = Arc::new(Self {
            t_min: Duration::from_millis(t_min_ms),
            ptys: tokio::sync::Mutex::new(HashMap::new()),
            reactor,
            pending_timers: tokio::sync::Mutex::new(HashMap::new()),
        });

        let pump_target = Arc::clone(&scheduler);
        tokio::spawn(async move {
            while let Some(event) = reactor_events.recv().await {
                pump_target.handle_reactor_event(event).await;
            }
        });

        scheduler
    }

    /// Drains one fired `Op::Timeout`, finishing the arm step `on_mutation`
    /// started: clears `timer_armed`, stamps `last_render`, and renders.
    async fn handle_reactor_event(&self, event: crate::reactor::Event) {
        let Ok(Completion::Timer) = event.result else { return };
        let Some((pty, renderer)) = self.pending_timers.lock().await.remove(&event.id) else { return };

        let mut ptys = self.ptys.lock().await;
        let Some(timing) = ptys.get_mut(&pty) else { return };
        timing.timer_armed = false;
        timing.last_render = Some(Instant::now());
        drop(ptys);

        renderer.render(pty);
    }

    /// Registers a PTY with the scheduler and returns the signal its worker
    /// thread should fire. Spawns the task that watches that signal and
    /// drives the render-or-arm-timer decision.
    pub async fn register(self: &Arc<Self>, pty: PtyId, renderer: Arc<dyn Renderer>) -> FrameSignal {
        let signal = FrameSignal::new();
        {
            let mut ptys = self.ptys.lock().await;
            ptys.insert(pty, PtyTiming { signal: signal.clone(), last_render: None, timer_armed: false });
        }

        let scheduler = Arc::clone(self);
        let watch_signal = signal.clone();
        tokio::spawn(async move {
            loop {
                watch_signal.wait().await;
                scheduler.clone().on_mutation(pty, renderer.clone()).await;
            }
        });

        signal
    }

    pub async fn unregister(&self, pty: PtyId) {
        self.ptys.lock().await.remove(&pty);
    }

    /// The drain-then-decide step from spec §4.2. `notified()` already
    /// "drains the pipe to empty" in the sense that a single wake collapses
    /// however many redundant `signal()` calls arrived while the task was
    /// off doing other work: `Notify` coalesces them into one wake exactly
    /// as a level-triggered fd would under edge accounting here.
    async fn on_mutation(self: Arc<Self>, pty: PtyId, renderer: Arc<dyn Renderer>) {
        let now = Instant::now();
        let mut ptys = self.ptys.lock().await;
        let Some(timing) = ptys.get_mut(&pty) else { return };

        let elapsed = timing.last_render.map(|t| now.duration_since(t));
        if elapsed.is_none() || elapsed.unwrap() >= self.t_min {
            timing.last_render = Some(now);
            drop(ptys);
            renderer.render(pty);
            return;
        }

        if timing.timer_armed {
            return;
        }
        timing.timer_armed = true;
        let remaining = self.t_min - elapsed.unwrap();
        drop(ptys);

        let op_id = self.reactor.submit(Op::Timeout { after: remaining }).await;
        self.pending_timers.lock().await.insert(op_id, (pty, renderer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRenderer(Arc<AtomicUsize>);
    impl Renderer for CountingRenderer {
        fn render(&self, _pty: PtyId) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn coalesces_within_t_min() {
        let scheduler = FrameScheduler::new(50);
        let count = Arc::new(AtomicUsize::new(0));
        let renderer = Arc::new(CountingRenderer(count.clone()));
        let pty = PtyId::from_raw(1);
        let signal = scheduler.register(pty, renderer).await;

        for _ in 0..10 {
            signal.signal();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        // First mutation renders immediately; the rest coalesce behind the
        // armed timer and have not fired yet.
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
