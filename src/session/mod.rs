//! Session persistence model (spec §3, §4.4): layout tree types plus the
//! registry that owns them.

pub mod layout;
pub mod manager;

pub use layout::{Child, Node, Orientation, Pane, PaneId, PtyId, Split, SplitId, Tab, TabId};
pub use manager::{Session, SessionManager, SpawnAnchor};
