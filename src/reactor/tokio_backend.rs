//! Production reactor backend.
//!
//! Tokio's own runtime already multiplexes epoll (Linux) and kqueue
//! (macOS/BSD) for the handful of primitives this backend wraps (a sleep
//! timer, a `waitpid` poll loop), so one backend covers both platforms
//! named in spec §4.1 without hand-rolling either kernel interface.
//!
//! Each `submit` spawns a task on an owned tokio runtime that performs the
//! operation and reports its `Event` back over a channel; `run` drains that
//! channel according to `RunMode`. `cancel` aborts the corresponding task's
//! `JoinHandle`, which is how "no callback fires after cancel returns" is
//! enforced: once `abort()` has been called and the task observed aborted,
//! nothing sends on the channel for that id.

use std::collections::HashMap;
use std::sync::mpsc;
use std::time::Duration;

use super::{Completion, Event, Op, OpId, OpIdAllocator, Reactor, RunMode};
use crate::error::Error;

pub struct TokioBackend {
    ids: OpIdAllocator,
    runtime: tokio::runtime::Handle,
    tx: mpsc::Sender<Event>,
    rx: mpsc::Receiver<Event>,
    handles: HashMap<OpId, tokio::task::JoinHandle<()>>,
}

impl TokioBackend {
    /// Builds a backend that spawns its operation tasks onto `runtime` — a
    /// handle to the tokio runtime the server's reactor thread is driving.
    pub fn new(runtime: tokio::runtime::Handle) -> Self {
        let (tx, rx) = mpsc::channel();
        Self { ids: OpIdAllocator::default(), runtime, tx, rx, handles: HashMap::new() }
    }

    fn spawn(&mut self, id: OpId, fut: impl std::future::Future<Output = Result<Completion, Error>> + Send + 'static) {
        let tx = self.tx.clone();
        let join = self.runtime.spawn(async move {
            let result = fut.await;
            // If the receiver is gone the reactor has shut down; dropping
            // the result is correct, not an error.
            let _ = tx.send(Event { id, result });
        });
        self.handles.insert(id, join);
    }
}

impl Reactor for TokioBackend {
    fn submit(&mut self, op: Op) -> OpId {
        let id = self.ids.next();
        match op {
            Op::Timeout { after } => {
                self.spawn(id, async move { timeout(after).await });
            }
            Op::WaitPid { pid } => {
                self.spawn(id, async move { wait_pid(pid).await });
            }
        }
        id
    }

    fn cancel(&mut self, id: OpId) {
        if let Some(join) = self.handles.remove(&id) {
            join.abort();
        }
    }

    fn run(&mut self, mode: RunMode, on_event: &mut dyn FnMut(Event)) {
        match mode {
            RunMode::Once => {
                while let Ok(ev) = self.rx.try_recv() {
                    self.handles.remove(&ev.id);
                    on_event(ev);
                }
            }
            RunMode::UntilDone => {
                while !self.handles.is_empty() {
                    match self.rx.recv() {
                        Ok(ev) => {
                            self.handles.remove(&ev.id);
                            on_event(ev);
                        }
                        Err(_) => break,
                    }
                }
            }
            RunMode::Forever => loop {
                match self.rx.recv() {
                    Ok(ev) => {
                        self.handles.remove(&ev.id);
                        on_event(ev);
                    }
                    Err(_) => break,
                }
            },
        }
    }
}

async fn timeout(after: Duration) -> Result<Completion, Error> {
    tokio::time::sleep(after).await;
    Ok(Completion::Timer)
}

/// Polls for child exit with `waitpid(WNOHANG)` on a slow cadence, exactly
/// mirroring `ProcessManager::kill_session`'s grace-period poll
/// (`libc::kill(pid, 0)` in a `tokio::time::sleep` loop) but checking real
/// exit status instead of liveness.
async fn wait_pid(pid: i32) -> Result<Completion, Error> {
    loop {
        let mut status: i32 = 0;
        let ret = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        if ret == pid {
            return Ok(Completion::WaitPid { pid, status });
        } else if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ECHILD) {
                // Already reaped elsewhere; report a synthetic clean exit.
                return Ok(Completion::WaitPid { pid, status: 0 });
            }
            return Err(Error::transient_io(err.to_string()));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
