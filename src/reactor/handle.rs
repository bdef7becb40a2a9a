//! Bridges the synchronous, `&mut self` [`Reactor`] contract onto a
//! dedicated OS thread so async callers (the process supervisor) can submit
//! operations and receive completions without owning the reactor directly.
//!
//! Spec §4.1 describes one reactor per server; this is that reactor's home
//! thread. Submission latency is bounded by the poll interval below rather
//! than true wakeup-on-submit, which is an acceptable tradeoff for the
//! process supervisor's wait-pid correlation (exits are not latency
//! sensitive the way PTY I/O or IPC framing are) — see DESIGN.md.

use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use tokio::sync::mpsc as tokio_mpsc;
use tokio::sync::oneshot;

use super::{Event, Op, OpId, Reactor, RunMode};

const POLL_INTERVAL: Duration = Duration::from_millis(15);

enum Request {
    Submit(Op, oneshot::Sender<OpId>),
    Cancel(OpId),
}

/// Async-friendly front end for a [`Reactor`] running on its own thread.
pub struct ReactorHandle {
    requests: std_mpsc::Sender<Request>,
    events: tokio_mpsc::UnboundedSender<Event>,
}

impl ReactorHandle {
    /// Spawns `reactor`'s home thread. Completions are forwarded onto
    /// `events` as they arrive; the returned handle is the only way to
    /// submit further work to it.
    pub fn spawn(mut reactor: Box<dyn Reactor + Send>) -> (Self, tokio_mpsc::UnboundedReceiver<Event>) {
        let (req_tx, req_rx) = std_mpsc::channel::<Request>();
        let (ev_tx, ev_rx) = tokio_mpsc::unbounded_channel::<Event>();
        let loop_events = ev_tx.clone();

        std::thread::Builder::new()
            .name("reactor".to_string())
            .spawn(move || loop {
                match req_rx.recv_timeout(POLL_INTERVAL) {
                    Ok(Request::Submit(op, reply)) => {
                        let id = reactor.submit(op);
                        let _ = reply.send(id);
                    }
                    Ok(Request::Cancel(id)) => reactor.cancel(id),
                    Err(std_mpsc::RecvTimeoutError::Timeout) => {}
                    Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
                }
                reactor.run(RunMode::Once, &mut |ev| {
                    let _ = loop_events.send(ev);
                });
            })
            .expect("failed to spawn reactor thread");

        (Self { requests: req_tx, events: ev_tx }, ev_rx)
    }

    pub async fn submit(&self, op: Op) -> OpId {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Submit(op, tx))
            .expect("reactor thread gone");
        rx.await.expect("reactor thread dropped reply")
    }

    pub fn cancel(&self, id: OpId) {
        let _ = self.requests.send(Request::Cancel(id));
    }
}
