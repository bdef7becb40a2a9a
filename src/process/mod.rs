//! Process supervisor (spec §4.6): owns every live [`PtyWorker`], spawns new
//! shells on request, and correlates child exit status back to the session
//! that owns the pane.
//!
//! Grounded on `ProcessManager` (`core::process_manager`): a
//! `DashMap` registry of live children plus a grace-period SIGTERM/SIGKILL
//! escalation, generalized here to register each child's exit with the
//! [`crate::reactor::Reactor`] (`Op::WaitPid`) instead of a one-off polling
//! loop per kill call, so exit status is collected the same way whether the
//! shell exited on its own or was killed.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc::UnboundedSender, Mutex};

use crate::error::Result;
use crate::pty::{PtyEvent, PtyWorker};
use crate::reactor::{Completion, Op, OpId, ReactorHandle, TokioBackend};
use crate::scheduler::{FrameScheduler, Renderer};
use crate::session::{PaneId, PtyId};

/// Reported to the server's event loop when a pane's shell process exits,
/// whether on its own or via [`ProcessSupervisor::kill`].
#[derive(Debug, Clone)]
pub struct ProcessExited {
    pub session: String,
    pub pane: PaneId,
    pub pty: PtyId,
    pub exit_code: i32,
}

struct Location {
    session: String,
    pane: PaneId,
}

/// Owns the live `PtyWorker` set and the reactor thread used to collect
/// child exit status.
pub struct ProcessSupervisor {
    workers: DashMap<PtyId, Arc<PtyWorker>>,
    locations: DashMap<PtyId, Location>,
    reactor: ReactorHandle,
    pending: Mutex<HashMap<OpId, PtyId>>,
    scheduler: Arc<FrameScheduler>,
    renderer: Arc<dyn Renderer>,
    shell: String,
    exits: UnboundedSender<ProcessExited>,
}

impl ProcessSupervisor {
    /// `exits` carries exit notifications out to whatever owns the session
    /// manager and the IPC push channel (the server, §4.6/§4.5).
    pub fn new(
        scheduler: Arc<FrameScheduler>,
        renderer: Arc<dyn Renderer>,
        shell: String,
        exits: UnboundedSender<ProcessExited>,
    ) -> Arc<Self> {
        let (reactor, mut reactor_events) = ReactorHandle::spawn(Box::new(TokioBackend::new(tokio::runtime::Handle::current())));
        let supervisor = Arc::new(Self {
            workers: DashMap::new(),
            locations: DashMap::new(),
            reactor,
            pending: Mutex::new(HashMap::new()),
            scheduler,
            renderer,
            shell,
            exits,
        });

        let pump_target = Arc::clone(&supervisor);
        tokio::spawn(async move {
            while let Some(event) = reactor_events.recv().await {
                pump_target.handle_reactor_event(event).await;
            }
        });

        supervisor
    }

    async fn handle_reactor_event(&self, event: crate::reactor::Event) {
        let Ok(Completion::WaitPid { status, .. }) = event.result else { return };
        let Some(pty) = self.pending.lock().await.remove(&event.id) else { return };
        let Some((_, location)) = self.locations.remove(&pty) else { return };
        self.workers.remove(&pty);
        self.scheduler.unregister(pty).await;

        let exit_code = decode_exit_status(status);
        let _ = self.exits.send(ProcessExited { session: location.session, pane: location.pane, pty, exit_code });
    }

    /// Spawns a shell for a freshly-allocated pane and registers its exit
    /// with the reactor. The caller (session manager's `spawn` already
    /// having run) supplies the pane/PTY ids the layout tree now expects.
    pub async fn spawn_pty(
        &self,
        session: &str,
        pane: PaneId,
        pty: PtyId,
        cwd: Option<&str>,
        env: &[(String, String)],
        cols: u16,
        rows: u16,
    ) -> Result<Arc<PtyWorker>> {
        let frame_signal = self.scheduler.register(pty, Arc::clone(&self.renderer)).await;
        let (io_tx, mut io_rx) = tokio::sync::mpsc::unbounded_channel::<PtyEvent>();

        let worker = PtyWorker::spawn(pty, &self.shell, cwd, env, cols, rows, frame_signal, io_tx)?;
        self.workers.insert(pty, Arc::clone(&worker));
        self.locations.insert(pty, Location { session: session.to_string(), pane });

        let op_id = self.reactor.submit(Op::WaitPid { pid: worker.child_pid }).await;
        self.pending.lock().await.insert(op_id, pty);

        // The worker's own EOF detection can precede the kernel reaping the
        // child; it carries no exit status, so it is only logged here —
        // `handle_reactor_event` above remains the single source of truth
        // for `ProcessExited`.
        tokio::spawn(async move {
            if let Some(PtyEvent::IoClosed { pty }) = io_rx.recv().await {
                log::debug!("pty {} I/O closed", pty.0);
            }
        });

        Ok(worker)
    }

    pub fn get(&self, pty: PtyId) -> Option<Arc<PtyWorker>> {
        self.workers.get(&pty).map(|w| Arc::clone(&w))
    }

    /// Which session owns `pty`, for routing pushes without the caller
    /// needing its own copy of the layout tree.
    pub fn session_of(&self, pty: PtyId) -> Option<String> {
        self.locations.get(&pty).map(|l| l.session.clone())
    }

    /// Every live PTY, for `prise pty list`.
    pub fn list(&self) -> Vec<crate::ipc::protocol::PtySummary> {
        self.locations
            .iter()
            .filter_map(|entry| {
                let pty = *entry.key();
                let worker = self.workers.get(&pty)?;
                Some(crate::ipc::protocol::PtySummary {
                    pty,
                    pane: entry.value().pane,
                    session: entry.value().session.clone(),
                    child_pid: worker.child_pid,
                })
            })
            .collect()
    }

    pub async fn write_input(&self, pty: PtyId, data: &[u8]) -> Result<()> {
        let worker = self.get(pty).ok_or_else(|| crate::error::Error::not_found(format!("pty {} not found", pty.0)))?;
        worker.write_input(data)
    }

    pub async fn resize(&self, pty: PtyId, cols: u16, rows: u16) -> Result<()> {
        let worker = self.get(pty).ok_or_else(|| crate::error::Error::not_found(format!("pty {} not found", pty.0)))?;
        worker.resize(cols, rows)
    }

    /// Terminates a pane's shell directly (a client-requested close rather
    /// than a spontaneous exit); the reactor's pending `WaitPid` still fires
    /// afterward and drives the same `ProcessExited` path.
    pub async fn kill(&self, pty: PtyId) {
        if let Some(worker) = self.get(pty) {
            worker.terminate().await;
        }
    }
}

/// Decodes a `waitpid` status word per POSIX: low 7 bits zero means normal
/// exit with the code in bits 8-15; otherwise the process was killed by the
/// signal named in the low 7 bits, reported shell-style as `128 + signal`.
fn decode_exit_status(status: i32) -> i32 {
    if status & 0x7f == 0 {
        (status >> 8) & 0xff
    } else {
        128 + (status & 0x7f)
    }
}
