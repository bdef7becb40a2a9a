//! IPC server (spec §4.5): accepts connections on the per-user socket,
//! drives the request/response loop, and fans out server-push
//! notifications with per-connection backpressure.
//!
//! Grounded on `core::status_server` (inline `#[cfg(test)]` module
//! exercising a real bound socket, one task per connection) but over
//! `UnixListener` instead of TCP, and with the bounded-queue/lagging logic
//! spec §4.5 asks for that a plain status endpoint never needed.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::ipc::protocol::{
    read_frame, write_frame, ClientCaps, InputEvent, Push, Request, Response, ServerCaps, ServerMessage,
};
use crate::process::{ProcessExited, ProcessSupervisor};
use crate::scheduler::Renderer;
use crate::session::{PaneId, PtyId, Session, SessionManager, SpawnAnchor};

/// Bound on each connection's outgoing queue. Spec §4.5's "bounded write
/// queue" sized generously enough that ordinary terminal output never fills
/// it under a responsive client; only a genuinely stalled reader trips it.
const PUSH_QUEUE_CAPACITY: usize = 256;

struct Connection {
    tx: mpsc::Sender<ServerMessage>,
    session: StdMutex<Option<String>>,
    caps: StdMutex<Option<ClientCaps>>,
    lagging: AtomicBool,
}

/// Implements [`Renderer`] by pushing `ScreenDelta`s to every connection
/// attached to the session that owns the mutated PTY, collapsing to a
/// `FullResync` for any connection whose queue is already full.
pub struct PushRouter {
    connections: DashMap<u64, Arc<Connection>>,
    next_conn_id: AtomicU64,
    session_manager: Arc<SessionManager>,
    supervisor: StdMutex<Option<Arc<ProcessSupervisor>>>,
}

impl PushRouter {
    pub fn new(session_manager: Arc<SessionManager>) -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
            session_manager,
            supervisor: StdMutex::new(None),
        })
    }

    /// The supervisor isn't available until after the router is constructed
    /// (it needs the router as its renderer), so it's wired in once
    /// immediately after both are built.
    pub fn bind_supervisor(&self, supervisor: Arc<ProcessSupervisor>) {
        *self.supervisor.lock().unwrap() = Some(supervisor);
    }

    fn supervisor(&self) -> Option<Arc<ProcessSupervisor>> {
        self.supervisor.lock().unwrap().clone()
    }

    fn register(&self, conn: Arc<Connection>) -> u64 {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(id, conn);
        id
    }

    fn unregister(&self, id: u64) {
        self.connections.remove(&id);
    }

    /// Sends `push` to every connection attached to `session_name`,
    /// guaranteed delivery (blocks the caller briefly if a queue is full) —
    /// used for the low-frequency structural pushes, never for
    /// `ScreenDelta`.
    async fn broadcast(&self, session_name: &str, push: Push) {
        let targets: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|e| e.value().session.lock().unwrap().as_deref() == Some(session_name))
            .map(|e| Arc::clone(e.value()))
            .collect();
        for conn in targets {
            let _ = conn.tx.send(ServerMessage::Push(push.clone())).await;
        }
    }

    fn full_resync(&self, session: &Session) -> Option<Push> {
        let supervisor = self.supervisor()?;
        let mut screens = Vec::new();
        for tab in &session.tabs {
            if let Some(root) = &tab.root {
                collect_panes(root, &mut |pane, pty| {
                    if let Some(worker) = supervisor.get(pty) {
                        screens.push((pane, (*worker.snapshot()).clone()));
                    }
                });
            }
        }
        Some(Push::FullResync { session: session.clone(), screens })
    }
}

fn collect_panes(node: &crate::session::Node, f: &mut dyn FnMut(PaneId, PtyId)) {
    use crate::session::Node;
    match node {
        Node::Pane(p) => f(p.id, p.pty),
        Node::Split(s) => {
            for c in &s.children {
                collect_panes(&c.node, f);
            }
        }
    }
}

impl Renderer for PushRouter {
    fn render(&self, pty: PtyId) {
        let Some(supervisor) = self.supervisor() else { return };
        let Some(worker) = supervisor.get(pty) else { return };
        let Some(session_name) = supervisor.session_of(pty) else { return };

        let pane = match self.session_manager.get(&session_name) {
            Some(session) => find_pane_for_pty(&session, pty),
            None => None,
        };
        let Some(pane) = pane else { return };

        for entry in self.connections.iter() {
            let conn = entry.value();
            let attached = conn.session.lock().unwrap().clone();
            if attached.as_deref() != Some(session_name.as_str()) {
                continue;
            }

            if conn.lagging.load(Ordering::Relaxed) {
                if let Some(session) = self.session_manager.get(&session_name) {
                    if let Some(resync) = self.full_resync(&session) {
                        if conn.tx.try_send(ServerMessage::Push(resync)).is_ok() {
                            conn.lagging.store(false, Ordering::Relaxed);
                        }
                    }
                }
                continue;
            }

            let delta = Push::ScreenDelta { pane, screen: (*worker.snapshot()).clone() };
            if conn.tx.try_send(ServerMessage::Push(delta)).is_err() {
                conn.lagging.store(true, Ordering::Relaxed);
            }
        }
    }
}

fn find_pane_for_pty(session: &Session, pty: PtyId) -> Option<PaneId> {
    for tab in &session.tabs {
        if let Some(root) = &tab.root {
            let mut found = None;
            collect_panes(root, &mut |pane, p| {
                if p == pty {
                    found = Some(pane);
                }
            });
            if found.is_some() {
                return found;
            }
        }
    }
    None
}

/// Owns the listening socket and the shared state every connection handler
/// needs.
pub struct IpcServer {
    socket_path: PathBuf,
    session_manager: Arc<SessionManager>,
    supervisor: Arc<ProcessSupervisor>,
    router: Arc<PushRouter>,
}

impl IpcServer {
    pub fn new(
        socket_path: PathBuf,
        session_manager: Arc<SessionManager>,
        supervisor: Arc<ProcessSupervisor>,
        router: Arc<PushRouter>,
    ) -> Self {
        Self { socket_path, session_manager, supervisor, router }
    }

    /// Binds the socket (removing a stale file first — the caller has
    /// already confirmed via the lock file that no live server owns it) and
    /// sets owner-only permissions per §4.5.
    pub fn bind(&self) -> Result<UnixListener> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .map_err(|e| Error::fatal(format!("cannot remove stale socket: {e}")))?;
        }
        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| Error::fatal(format!("cannot bind socket {}: {e}", self.socket_path.display())))?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::fatal(format!("cannot set socket permissions: {e}")))?;
        Ok(listener)
    }

    /// Accepts connections forever, spawning one handler task per
    /// connection. Also drains `exits` to turn process exits into
    /// `PaneRemoved`/`SessionExit` pushes.
    pub async fn run(self: Arc<Self>, listener: UnixListener, mut exits: mpsc::UnboundedReceiver<ProcessExited>) {
        let exit_router = Arc::clone(&self.router);
        let exit_sessions = Arc::clone(&self.session_manager);
        tokio::spawn(async move {
            while let Some(exit) = exits.recv().await {
                handle_process_exit(&exit_router, &exit_sessions, exit).await;
            }
        });

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move { server.handle_connection(stream).await });
                }
                Err(e) => {
                    log::warn!("accept failed: {e}");
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: UnixStream) {
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<ServerMessage>(PUSH_QUEUE_CAPACITY);

        let conn = Arc::new(Connection {
            tx: tx.clone(),
            session: StdMutex::new(None),
            caps: StdMutex::new(None),
            lagging: AtomicBool::new(false),
        });
        let conn_id = self.router.register(Arc::clone(&conn));

        let writer_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if write_frame(&mut writer, &msg).await.is_err() {
                    break;
                }
            }
        });

        loop {
            let request: Request = match read_frame(&mut reader).await {
                Ok(r) => r,
                Err(e) if e.kind == crate::error::ErrorKind::ProtocolViolation => {
                    let _ = tx.send(ServerMessage::Response(e.into())).await;
                    break;
                }
                Err(_) => break,
            };
            let should_quit = matches!(request, Request::Quit);
            let response = self.handle_request(&conn, request).await;
            if tx.send(ServerMessage::Response(response)).await.is_err() || should_quit {
                break;
            }
        }

        self.router.unregister(conn_id);
        writer_task.abort();
    }

    async fn handle_request(&self, conn: &Arc<Connection>, request: Request) -> Response {
        match self.dispatch(conn, request).await {
            Ok(r) => r,
            Err(e) => e.into(),
        }
    }

    async fn dispatch(&self, conn: &Arc<Connection>, request: Request) -> Result<Response> {
        match request {
            Request::Hello { client_caps } => {
                *conn.caps.lock().unwrap() = Some(client_caps);
                Ok(Response::Hello {
                    server_caps: ServerCaps { version: env!("CARGO_PKG_VERSION").to_string() },
                    session: self.session_manager.attach(None).await?,
                })
            }

            Request::Attach { session } => {
                let session = self.session_manager.attach(session).await?;
                *conn.session.lock().unwrap() = Some(session.name.clone());
                Ok(Response::Hello {
                    server_caps: ServerCaps { version: env!("CARGO_PKG_VERSION").to_string() },
                    session,
                })
            }

            Request::ListSessions => Ok(Response::SessionList { names: self.session_manager.list() }),

            Request::SwitchSession { name } => {
                let session = self.session_manager.attach(Some(name)).await?;
                *conn.session.lock().unwrap() = Some(session.name.clone());
                Ok(Response::Ack)
            }

            Request::Spawn { cwd, split_of, split_direction } => {
                let session_name = conn
                    .session
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or_else(|| Error::invalid_state("no session attached"))?;
                let caps = conn.caps.lock().unwrap().clone();
                let (cols, rows) = caps.map(|c| (c.cols, c.rows)).unwrap_or((80, 24));

                let anchor = match (split_of, split_direction) {
                    (Some(pane), Some(orientation)) => SpawnAnchor::SplitOf { pane, orientation },
                    _ => match self.session_manager.get(&session_name) {
                        Some(s) if !s.is_empty() => SpawnAnchor::NewTab,
                        _ => SpawnAnchor::FirstPane,
                    },
                };

                let (pane, pty) = self.session_manager.spawn(&session_name, anchor).await?;
                let env: Vec<(String, String)> = std::env::vars().collect();
                self.supervisor
                    .spawn_pty(&session_name, pane, pty, cwd.as_deref(), &env, cols, rows)
                    .await?;

                if let Some(session) = self.session_manager.get(&session_name) {
                    self.router.broadcast(&session_name, Push::PaneAdded { pane, session: session.clone() }).await;
                    self.router.broadcast(&session_name, Push::LayoutChanged { session }).await;
                }
                Ok(Response::Ack)
            }

            Request::Input { pane, event } => {
                let session_name = conn
                    .session
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or_else(|| Error::invalid_state("no session attached"))?;
                let pty = self.session_manager.pty_of(&session_name, pane)?;
                match event {
                    InputEvent::Key(bytes) | InputEvent::Mouse(bytes) => {
                        self.supervisor.write_input(pty, &bytes).await?
                    }
                    InputEvent::Paste(text) => self.supervisor.write_input(pty, text.as_bytes()).await?,
                    InputEvent::Resize { cols, rows } => self.supervisor.resize(pty, cols, rows).await?,
                    InputEvent::Focus(_) => {}
                }
                Ok(Response::Ack)
            }

            Request::ResizeSplit { split, child_idx, ratio } => {
                let session_name = conn
                    .session
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or_else(|| Error::invalid_state("no session attached"))?;
                self.session_manager.resize_split(&session_name, split, child_idx, ratio).await?;
                if let Some(session) = self.session_manager.get(&session_name) {
                    self.router.broadcast(&session_name, Push::LayoutChanged { session }).await;
                }
                Ok(Response::Ack)
            }

            Request::RenameSession { name, new_name } => {
                self.session_manager.rename_session(&name, &new_name)?;
                for entry in self.router.connections.iter() {
                    let mut attached = entry.value().session.lock().unwrap();
                    if attached.as_deref() == Some(name.as_str()) {
                        *attached = Some(new_name.clone());
                    }
                }
                self.router.broadcast(&new_name, Push::SessionRenamed { new_name: new_name.clone() }).await;
                Ok(Response::Ack)
            }

            Request::DeleteSession { name } => {
                self.session_manager.delete_session(&name)?;
                self.router.broadcast(&name, Push::SessionExit).await;
                Ok(Response::Ack)
            }

            Request::Detach => {
                *conn.session.lock().unwrap() = None;
                Ok(Response::Ack)
            }

            Request::ListPtys => Ok(Response::PtyList { ptys: self.supervisor.list() }),

            Request::KillPty { pty } => {
                self.supervisor.kill(pty).await;
                Ok(Response::Ack)
            }

            Request::Quit => Ok(Response::Ack),
        }
    }
}

async fn handle_process_exit(router: &Arc<PushRouter>, sessions: &Arc<SessionManager>, exit: ProcessExited) {
    log::info!("pty {} (session {}) exited with code {}", exit.pty.0, exit.session, exit.exit_code);
    let Ok((_, tab_removed, session_removed)) = sessions.pty_exited(&exit.session, exit.pane).await else {
        return;
    };
    router.broadcast(&exit.session, Push::PaneRemoved { pane: exit.pane }).await;
    if session_removed {
        router.broadcast(&exit.session, Push::SessionExit).await;
    } else if tab_removed {
        if let Some(session) = sessions.get(&exit.session) {
            router.broadcast(&exit.session, Push::LayoutChanged { session }).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::Store;

    fn test_manager() -> Arc<SessionManager> {
        let dir = tempfile::tempdir().unwrap().into_path();
        let sessions_dir = dir.join("sessions");
        let store = Store::new(sessions_dir.clone(), dir.join("test.lock"), sessions_dir.join(".most-recent")).unwrap();
        Arc::new(SessionManager::new(Arc::new(store)))
    }

    #[tokio::test]
    async fn hello_then_list_sessions_round_trips() {
        let session_manager = test_manager();
        let router = PushRouter::new(Arc::clone(&session_manager));
        let (_exits_tx, exits_rx) = mpsc::unbounded_channel();

        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        // Supervisor needs a runtime handle; constructing one here exercises
        // the same wiring `Server::run` does, without ever spawning a PTY.
        let renderer: Arc<dyn Renderer> = router.clone();
        let (exit_tx, _exit_rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(crate::scheduler::FrameScheduler::new(16), renderer, "/bin/sh".to_string(), exit_tx);
        router.bind_supervisor(Arc::clone(&supervisor));

        let server = Arc::new(IpcServer::new(socket_path.clone(), Arc::clone(&session_manager), supervisor, router));
        let listener = server.bind().unwrap();
        tokio::spawn(Arc::clone(&server).run(listener, exits_rx));

        let mut client = UnixStream::connect(&socket_path).await.unwrap();
        write_frame(&mut client, &Request::Hello { client_caps: ClientCaps { name: "test".into(), cols: 80, rows: 24 } })
            .await
            .unwrap();
        let resp: Response = read_frame(&mut client).await.unwrap();
        assert!(matches!(resp, Response::Hello { .. }));

        write_frame(&mut client, &Request::ListSessions).await.unwrap();
        let resp: Response = read_frame(&mut client).await.unwrap();
        assert!(matches!(resp, Response::SessionList { .. }));
    }
}
