//! Session registry (spec §4.4): named sessions, each an ordered list of
//! tabs over the layout tree in [`super::layout`].
//!
//! Generalizes the `DashMap<u32, SessionConfig>` registry in
//! `core::session_manager::SessionManager` from a flat id->config map
//! into the full tab/split/pane tree, and adds the debounced-persistence
//! behavior §4.4 requires that the flat version never needed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::persistence::Store;

use super::layout::{Node, Orientation, Pane, PaneId, PtyId, Split, SplitId, Tab, TabId};

/// Which split direction a `Spawn` anchors its new pane on, or a request
/// for a brand new tab.
#[derive(Debug, Clone, Copy)]
pub enum SpawnAnchor {
    SplitOf { pane: PaneId, orientation: Orientation },
    NewTab,
    FirstPane,
}

/// Persisted (and in-memory) state of one named session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub name: String,
    pub tabs: Vec<Tab>,
    pub active_tab: usize,
    pub focused_pane: Option<PaneId>,
    next_pane_id: u32,
    next_split_id: u32,
    next_tab_id: u32,
}

impl Session {
    fn new(name: String) -> Self {
        Self {
            name,
            tabs: Vec::new(),
            active_tab: 0,
            focused_pane: None,
            next_pane_id: 1,
            next_split_id: 1,
            next_tab_id: 1,
        }
    }

    fn alloc_pane(&mut self) -> PaneId {
        let id = PaneId::from_raw(self.next_pane_id);
        self.next_pane_id += 1;
        id
    }

    fn alloc_split(&mut self) -> SplitId {
        let id = SplitId::from_raw(self.next_split_id);
        self.next_split_id += 1;
        id
    }

    fn alloc_tab(&mut self) -> TabId {
        let id = TabId::from_raw(self.next_tab_id);
        self.next_tab_id += 1;
        id
    }

    pub fn active_tab(&self) -> Option<&Tab> {
        self.tabs.get(self.active_tab)
    }

    fn active_tab_mut(&mut self) -> Option<&mut Tab> {
        self.tabs.get_mut(self.active_tab)
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }
}

struct DebounceState {
    dirty: bool,
    deadline: Option<Instant>,
}

/// Thread-safe session registry. `DashMap` gives lock-free concurrent reads
/// across sessions the way `core::session_manager::SessionManager` does;
/// the debounce table is a separate, coarser-grained lock since it is
/// touched far less often than session reads.
pub struct SessionManager {
    sessions: DashMap<String, Session>,
    pty_ids: AtomicU32,
    store: Arc<Store>,
    debounce: Mutex<HashMap<String, DebounceState>>,
}

impl SessionManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            sessions: DashMap::new(),
            pty_ids: AtomicU32::new(1),
            store,
            debounce: Mutex::new(HashMap::new()),
        }
    }

    /// Loads every previously persisted session into memory (called once at
    /// startup before the IPC server accepts connections).
    pub fn load_all(&self) -> Result<()> {
        for session in self.store.load_all()? {
            self.sessions.insert(session.name.clone(), session);
        }
        Ok(())
    }

    fn next_pty_id(&self) -> PtyId {
        PtyId::from_raw(self.pty_ids.fetch_add(1, Ordering::Relaxed))
    }

    /// `attach(client, name?)`: attach to an existing session by name, to
    /// the most-recently-used if `name` is `None`, or create a new empty
    /// session if `name` doesn't exist yet.
    pub async fn attach(&self, name: Option<String>) -> Result<Session> {
        let name = match name {
            Some(n) => n,
            None => self.store.most_recent()?.unwrap_or_else(|| "main".to_string()),
        };

        if let Some(existing) = self.sessions.get(&name) {
            return Ok(existing.clone());
        }

        let session = Session::new(name.clone());
        self.sessions.insert(name.clone(), session.clone());
        self.persist_now(&name).await?;
        Ok(session)
    }

    /// `spawn(session, pane-anchor?, cwd?)`: allocates a PTY id (actual
    /// spawning is done by the process supervisor, which calls back in with
    /// the id this returns) and inserts a pane referencing it.
    pub async fn spawn(&self, session_name: &str, anchor: SpawnAnchor) -> Result<(PaneId, PtyId)> {
        let pty = self.next_pty_id();
        let mut session = self
            .sessions
            .get_mut(session_name)
            .ok_or_else(|| Error::not_found(format!("session {session_name} not found")))?;

        let pane_id = session.alloc_pane();
        let pane = Pane { id: pane_id, pty };

        match anchor {
            SpawnAnchor::FirstPane => {
                let tab_id = session.alloc_tab();
                let mut tab = Tab::new(tab_id);
                tab.root = Some(Node::Pane(pane));
                tab.last_focused_pane = Some(pane_id);
                session.tabs.push(tab);
                session.active_tab = session.tabs.len() - 1;
                session.focused_pane = Some(pane_id);
            }
            SpawnAnchor::NewTab => {
                let tab_id = session.alloc_tab();
                let mut tab = Tab::new(tab_id);
                tab.root = Some(Node::Pane(pane));
                tab.last_focused_pane = Some(pane_id);
                session.tabs.push(tab);
                session.active_tab = session.tabs.len() - 1;
                session.focused_pane = Some(pane_id);
            }
            SpawnAnchor::SplitOf { pane: target, orientation } => {
                let mut next_split_id = session.next_split_id;
                let tab = session
                    .active_tab_mut()
                    .ok_or_else(|| Error::invalid_state("session has no active tab"))?;
                tab.split_pane(target, pane, orientation, &mut || {
                    let id = SplitId::from_raw(next_split_id);
                    next_split_id += 1;
                    id
                })?;
                session.next_split_id = next_split_id;
                tab.last_focused_pane = Some(pane_id);
                session.focused_pane = Some(pane_id);
            }
        }

        drop(session);
        self.persist_now(session_name).await?;
        Ok((pane_id, pty))
    }

    /// Removes a pane and returns `(new_focus, pane's pty, tab_removed,
    /// session_removed)` so the caller can tear down the PTY worker and
    /// notify clients.
    pub async fn close_pane(&self, session_name: &str, pane: PaneId) -> Result<(Option<PaneId>, PtyId, bool, bool)> {
        let mut session = self
            .sessions
            .get_mut(session_name)
            .ok_or_else(|| Error::not_found(format!("session {session_name} not found")))?;

        let tab_idx = session.active_tab;
        let pty = session
            .active_tab()
            .and_then(|t| t.find_pane(pane))
            .map(|p| p.pty)
            .ok_or_else(|| Error::not_found(format!("pane {:?} not found", pane)))?;

        let tab = session.tabs.get_mut(tab_idx).expect("active_tab index valid");
        let focus = tab.remove_pane(pane)?;
        let tab_removed = tab.is_empty();
        if tab_removed {
            session.tabs.remove(tab_idx);
            if session.active_tab >= session.tabs.len() && !session.tabs.is_empty() {
                session.active_tab = session.tabs.len() - 1;
            }
        }
        session.focused_pane = focus;
        let session_removed = session.tabs.is_empty();
        drop(session);

        if session_removed {
            self.sessions.remove(session_name);
            self.store.delete(session_name)?;
        } else {
            self.persist_now(session_name).await?;
        }
        Ok((focus, pty, tab_removed, session_removed))
    }

    /// `resize_split`: debounced per §4.4 (coalesced at most every
    /// [`crate::config::DEBOUNCE_MS`]).
    pub async fn resize_split(&self, session_name: &str, split: SplitId, child_idx: usize, ratio: f32) -> Result<()> {
        {
            let mut session = self
                .sessions
                .get_mut(session_name)
                .ok_or_else(|| Error::not_found(format!("session {session_name} not found")))?;
            let tab = session
                .active_tab_mut()
                .ok_or_else(|| Error::invalid_state("session has no active tab"))?;
            tab.resize_split(split, child_idx, ratio)?;
        }
        self.persist_debounced(session_name).await;
        Ok(())
    }

    pub fn rename_session(&self, old: &str, new: &str) -> Result<()> {
        if old == new {
            return Ok(());
        }
        if self.sessions.contains_key(new) {
            return Err(Error::invalid_state(format!("session {new} already exists")));
        }
        let (_, mut session) = self
            .sessions
            .remove(old)
            .ok_or_else(|| Error::not_found(format!("session {old} not found")))?;
        session.name = new.to_string();
        self.sessions.insert(new.to_string(), session);
        self.store.rename(old, new)?;
        Ok(())
    }

    pub fn delete_session(&self, name: &str) -> Result<()> {
        self.sessions
            .remove(name)
            .ok_or_else(|| Error::not_found(format!("session {name} not found")))?;
        self.store.delete(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Session> {
        self.sessions.get(name).map(|s| s.clone())
    }

    /// Resolves a pane to the PTY it drives, within its session's active
    /// tab — used by the IPC layer to route `Input`/`ResizeSplit` without
    /// its own copy of the layout tree.
    pub fn pty_of(&self, session_name: &str, pane: PaneId) -> Result<PtyId> {
        let session = self
            .sessions
            .get(session_name)
            .ok_or_else(|| Error::not_found(format!("session {session_name} not found")))?;
        session
            .active_tab()
            .and_then(|t| t.find_pane(pane))
            .map(|p| p.pty)
            .ok_or_else(|| Error::not_found(format!("pane {:?} not found", pane)))
    }

    /// Marks the pane's PTY as exited: closes the pane it lives in, exactly
    /// like an explicit `close_pane` request, per §4.3's `pty_exited` event.
    pub async fn pty_exited(&self, session_name: &str, pane: PaneId) -> Result<(Option<PaneId>, bool, bool)> {
        let (focus, _pty, tab_removed, session_removed) = self.close_pane(session_name, pane).await?;
        Ok((focus, tab_removed, session_removed))
    }

    async fn persist_now(&self, session_name: &str) -> Result<()> {
        let Some(session) = self.sessions.get(session_name).map(|s| s.clone()) else {
            return Ok(());
        };
        self.store.save(&session)?;
        let mut debounce = self.debounce.lock().await;
        debounce.remove(session_name);
        Ok(())
    }

    /// Schedules a debounced save: the first call in a quiet window saves
    /// immediately, subsequent calls within [`crate::config::DEBOUNCE_MS`]
    /// only mark the session dirty until a caller's next `persist_now` (a
    /// spawn/close/rename) or the deadline is reached via `flush_debounced`.
    async fn persist_debounced(&self, session_name: &str) {
        let mut debounce = self.debounce.lock().await;
        let now = Instant::now();
        let entry = debounce
            .entry(session_name.to_string())
            .or_insert(DebounceState { dirty: false, deadline: None });
        entry.dirty = true;
        if entry.deadline.is_none() {
            entry.deadline = Some(now + Duration::from_millis(crate::config::DEBOUNCE_MS));
        }
    }

    /// Called periodically (e.g. by the server's timer tick) to flush any
    /// debounced session whose deadline has passed.
    pub async fn flush_debounced(&self) -> Result<()> {
        let due: Vec<String> = {
            let debounce = self.debounce.lock().await;
            let now = Instant::now();
            debounce
                .iter()
                .filter(|(_, s)| s.dirty && s.deadline.map(|d| now >= d).unwrap_or(false))
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in due {
            self.persist_now(&name).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::Store;

    fn test_store() -> Arc<Store> {
        let dir = tempfile::tempdir().unwrap().into_path();
        let sessions_dir = dir.join("sessions");
        Arc::new(Store::new(sessions_dir.clone(), dir.join("test.lock"), sessions_dir.join(".most-recent")).unwrap())
    }

    #[tokio::test]
    async fn attach_creates_new_session() {
        let mgr = SessionManager::new(test_store());
        let session = mgr.attach(Some("work".to_string())).await.unwrap();
        assert_eq!(session.name, "work");
        assert!(mgr.list().contains(&"work".to_string()));
    }

    #[tokio::test]
    async fn spawn_first_pane_then_split() {
        let mgr = SessionManager::new(test_store());
        mgr.attach(Some("work".to_string())).await.unwrap();
        let (pane1, _pty1) = mgr.spawn("work", SpawnAnchor::FirstPane).await.unwrap();
        let (pane2, _pty2) = mgr
            .spawn("work", SpawnAnchor::SplitOf { pane: pane1, orientation: Orientation::Row })
            .await
            .unwrap();

        let session = mgr.get("work").unwrap();
        assert_eq!(session.tabs.len(), 1);
        assert_eq!(session.focused_pane, Some(pane2));
    }

    #[tokio::test]
    async fn closing_last_pane_removes_session() {
        let mgr = SessionManager::new(test_store());
        mgr.attach(Some("work".to_string())).await.unwrap();
        let (pane1, _pty) = mgr.spawn("work", SpawnAnchor::FirstPane).await.unwrap();
        let (_, _pty, tab_removed, session_removed) = mgr.close_pane("work", pane1).await.unwrap();
        assert!(tab_removed);
        assert!(session_removed);
        assert!(mgr.get("work").is_none());
    }
}
