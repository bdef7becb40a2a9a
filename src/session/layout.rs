//! Layout tree (spec §3, §4.4): the N-ary Split/Pane/Tab/Session hierarchy a
//! session persists and a client renders.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            pub fn from_raw(raw: u32) -> Self {
                Self(raw)
            }
        }
    };
}

id_type!(PtyId);
id_type!(PaneId);
id_type!(SplitId);
id_type!(TabId);

pub const MIN_RATIO: f32 = 0.05;
pub const MAX_RATIO: f32 = 0.95;

/// Split orientation. `Row` lays children left-to-right; `Column` top-to-bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Orientation {
    Row,
    Column,
}

/// One child slot of a [`Split`]: a node plus its optional explicit share of
/// the parent. Children without a ratio split the remainder equally (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Child {
    pub ratio: Option<f32>,
    pub node: Node,
}

/// Interior or leaf node of a layout tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Node {
    Pane(Pane),
    Split(Split),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pane {
    pub id: PaneId,
    pub pty: PtyId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Split {
    pub id: SplitId,
    pub orientation: Orientation,
    pub children: Vec<Child>,
}

impl Split {
    /// Clamps `ratio` into `[MIN_RATIO, MAX_RATIO]` and renormalizes the
    /// rest of `children` (those that carry an explicit ratio) so the sum
    /// across the whole split stays 1.0, per `resize_split` in §4.4.
    fn resize_child(&mut self, child_idx: usize, new_ratio: f32) -> Result<()> {
        if child_idx >= self.children.len() {
            return Err(Error::invalid_state(format!(
                "split {:?} has no child at index {child_idx}",
                self.id
            )));
        }
        let clamped = new_ratio.clamp(MIN_RATIO, MAX_RATIO);

        let others_total: f32 = self
            .children
            .iter()
            .enumerate()
            .filter(|(i, c)| *i != child_idx && c.ratio.is_some())
            .map(|(_, c)| c.ratio.unwrap())
            .sum();
        let remaining = (1.0 - clamped).max(0.0);

        if others_total > 0.0 {
            let scale = remaining / others_total;
            for (i, c) in self.children.iter_mut().enumerate() {
                if i != child_idx {
                    if let Some(r) = c.ratio.as_mut() {
                        *r *= scale;
                    }
                }
            }
        }
        self.children[child_idx].ratio = Some(clamped);
        Ok(())
    }

    /// Removes the child at `idx`. Returns the node that should be promoted
    /// in its parent's place when exactly one sibling remains (§4.4: a
    /// two-child split collapses, the survivor inheriting this split's own
    /// ratio in the grandparent).
    fn remove_child(&mut self, idx: usize) -> Option<Child> {
        if idx >= self.children.len() {
            return None;
        }
        self.children.remove(idx);
        if self.children.len() == 1 {
            Some(self.children.remove(0))
        } else {
            None
        }
    }
}

/// One tab of a session: a single root layout node plus the last-focused
/// pane within it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tab {
    pub id: TabId,
    pub title: Option<String>,
    pub root: Option<Node>,
    pub last_focused_pane: Option<PaneId>,
}

impl Tab {
    pub fn new(id: TabId) -> Self {
        Self { id, title: None, root: None, last_focused_pane: None }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Splits `target` pane into two, inserting `new_pane` as a sibling
    /// oriented per `orientation`. If `target`'s immediate parent already
    /// has the same orientation, `new_pane` joins it as another child
    /// instead of introducing a redundant nested split.
    pub fn split_pane(&mut self, target: PaneId, new_pane: Pane, orientation: Orientation, next_split_id: &mut dyn FnMut() -> SplitId) -> Result<()> {
        let Some(root) = self.root.as_mut() else {
            return Err(Error::not_found(format!("pane {:?} not found in empty tab", target)));
        };
        if !insert_sibling(root, target, new_pane, orientation, next_split_id) {
            return Err(Error::not_found(format!("pane {:?} not found", target)));
        }
        Ok(())
    }

    /// Removes `pane` from the tree. Returns the pane that should receive
    /// focus next, per the right-sibling / left-sibling / walk-up rule
    /// (§4.4 "Focus after removal").
    pub fn remove_pane(&mut self, pane: PaneId) -> Result<Option<PaneId>> {
        let Some(root) = self.root.take() else {
            return Err(Error::not_found(format!("pane {:?} not found in empty tab", pane)));
        };
        match remove_from_node(root, pane) {
            RemoveOutcome::NotFound(node) => {
                self.root = Some(node);
                Err(Error::not_found(format!("pane {:?} not found", pane)))
            }
            RemoveOutcome::Removed { replacement, focus_next } => {
                self.root = replacement;
                if self.last_focused_pane == Some(pane) {
                    self.last_focused_pane = focus_next;
                }
                Ok(self.last_focused_pane)
            }
        }
    }

    pub fn find_pane(&self, pane: PaneId) -> Option<&Pane> {
        self.root.as_ref().and_then(|n| find_pane_in(n, pane))
    }

    pub fn resize_split(&mut self, split: SplitId, child_idx: usize, ratio: f32) -> Result<()> {
        let Some(root) = self.root.as_mut() else {
            return Err(Error::not_found(format!("split {:?} not found", split)));
        };
        if resize_in_node(root, split, child_idx, ratio)? {
            Ok(())
        } else {
            Err(Error::not_found(format!("split {:?} not found", split)))
        }
    }
}

fn find_pane_in(node: &Node, pane: PaneId) -> Option<&Pane> {
    match node {
        Node::Pane(p) if p.id == pane => Some(p),
        Node::Pane(_) => None,
        Node::Split(s) => s.children.iter().find_map(|c| find_pane_in(&c.node, pane)),
    }
}

fn resize_in_node(node: &mut Node, split: SplitId, child_idx: usize, ratio: f32) -> Result<bool> {
    match node {
        Node::Pane(_) => Ok(false),
        Node::Split(s) if s.id == split => {
            s.resize_child(child_idx, ratio)?;
            Ok(true)
        }
        Node::Split(s) => {
            for c in &mut s.children {
                if resize_in_node(&mut c.node, split, child_idx, ratio)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

fn insert_sibling(node: &mut Node, target: PaneId, new_pane: Pane, orientation: Orientation, next_split_id: &mut dyn FnMut() -> SplitId) -> bool {
    match node {
        Node::Pane(p) if p.id == target => {
            let existing = Child { ratio: None, node: Node::Pane(p.clone()) };
            let added = Child { ratio: None, node: Node::Pane(new_pane) };
            *node = Node::Split(Split { id: next_split_id(), orientation, children: vec![existing, added] });
            true
        }
        Node::Pane(_) => false,
        Node::Split(s) if s.orientation == orientation && s.children.iter().any(|c| matches!(&c.node, Node::Pane(p) if p.id == target)) => {
            s.children.push(Child { ratio: None, node: Node::Pane(new_pane) });
            true
        }
        Node::Split(s) => {
            for c in &mut s.children {
                if insert_sibling(&mut c.node, target, new_pane.clone(), orientation, next_split_id) {
                    return true;
                }
            }
            false
        }
    }
}

enum RemoveOutcome {
    NotFound(Node),
    Removed { replacement: Option<Node>, focus_next: Option<PaneId> },
}

fn remove_from_node(node: Node, pane: PaneId) -> RemoveOutcome {
    match node {
        Node::Pane(p) if p.id == pane => RemoveOutcome::Removed { replacement: None, focus_next: None },
        Node::Pane(p) => RemoveOutcome::NotFound(Node::Pane(p)),
        Node::Split(mut s) => {
            let idx = s.children.iter().position(|c| matches!(&c.node, Node::Pane(p) if p.id == pane));
            if let Some(idx) = idx {
                let focus_next = focus_after_removal(&s, idx);
                let promoted = s.remove_child(idx);
                let replacement = match promoted {
                    Some(child) => Some(child.node),
                    None if s.children.is_empty() => None,
                    None => Some(Node::Split(s)),
                };
                return RemoveOutcome::Removed { replacement, focus_next };
            }
            // Not a direct child; recurse into each sub-split looking for it.
            for i in 0..s.children.len() {
                let child_node = std::mem::replace(&mut s.children[i].node, Node::Pane(Pane { id: PaneId(0), pty: PtyId(0) }));
                match remove_from_node(child_node, pane) {
                    RemoveOutcome::NotFound(restored) => {
                        s.children[i].node = restored;
                    }
                    RemoveOutcome::Removed { replacement, focus_next } => {
                        match replacement {
                            Some(n) => s.children[i].node = n,
                            None => {
                                s.children.remove(i);
                            }
                        }
                        let replacement = if s.children.is_empty() {
                            None
                        } else if s.children.len() == 1 {
                            Some(s.children.remove(0).node)
                        } else {
                            Some(Node::Split(s))
                        };
                        return RemoveOutcome::Removed { replacement, focus_next };
                    }
                }
            }
            RemoveOutcome::NotFound(Node::Split(s))
        }
    }
}

/// Right sibling's first leaf, else left sibling's last leaf, else `None`
/// (the caller walks up by recursing outward through `remove_from_node`).
fn focus_after_removal(split: &Split, removed_idx: usize) -> Option<PaneId> {
    if let Some(right) = split.children.get(removed_idx + 1) {
        return first_leaf(&right.node);
    }
    if removed_idx > 0 {
        if let Some(left) = split.children.get(removed_idx - 1) {
            return last_leaf(&left.node);
        }
    }
    None
}

fn first_leaf(node: &Node) -> Option<PaneId> {
    match node {
        Node::Pane(p) => Some(p.id),
        Node::Split(s) => s.children.first().and_then(|c| first_leaf(&c.node)),
    }
}

fn last_leaf(node: &Node) -> Option<PaneId> {
    match node {
        Node::Pane(p) => Some(p.id),
        Node::Split(s) => s.children.last().and_then(|c| last_leaf(&c.node)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pane(id: u32, pty: u32) -> Pane {
        Pane { id: PaneId(id), pty: PtyId(pty) }
    }

    #[test]
    fn split_then_remove_two_child_promotes_survivor() {
        let mut tab = Tab::new(TabId(1));
        tab.root = Some(Node::Pane(pane(1, 1)));
        tab.last_focused_pane = Some(PaneId(1));

        let mut next_id = 1u32;
        tab.split_pane(PaneId(1), pane(2, 2), Orientation::Row, &mut || {
            next_id += 1;
            SplitId(next_id)
        })
        .unwrap();

        match tab.root.as_mut().unwrap() {
            Node::Split(s) => s.resize_child(0, 0.3).unwrap(),
            _ => panic!("expected split"),
        }

        let focus = tab.remove_pane(PaneId(1)).unwrap();
        assert_eq!(focus, Some(PaneId(2)));
        match tab.root.as_ref().unwrap() {
            Node::Pane(p) => assert_eq!(p.id, PaneId(2)),
            _ => panic!("expected survivor promoted to root"),
        }
    }

    #[test]
    fn remove_from_three_child_split_preserves_other_ratios() {
        let mut split = Split {
            id: SplitId(1),
            orientation: Orientation::Row,
            children: vec![
                Child { ratio: Some(0.2), node: Node::Pane(pane(1, 1)) },
                Child { ratio: Some(0.3), node: Node::Pane(pane(2, 2)) },
                Child { ratio: Some(0.5), node: Node::Pane(pane(3, 3)) },
            ],
        };
        let promoted = split.remove_child(1);
        assert!(promoted.is_none());
        assert_eq!(split.children.len(), 2);
        assert_eq!(split.children[0].ratio, Some(0.2));
        assert_eq!(split.children[1].ratio, Some(0.5));
    }

    #[test]
    fn resize_clamps_and_renormalizes() {
        let mut split = Split {
            id: SplitId(1),
            orientation: Orientation::Row,
            children: vec![
                Child { ratio: Some(0.5), node: Node::Pane(pane(1, 1)) },
                Child { ratio: Some(0.5), node: Node::Pane(pane(2, 2)) },
            ],
        };
        split.resize_child(0, 1.5).unwrap();
        assert_eq!(split.children[0].ratio, Some(MAX_RATIO));
        assert!((split.children[1].ratio.unwrap() - (1.0 - MAX_RATIO)).abs() < 1e-6);
    }

    #[test]
    fn focus_moves_to_right_sibling_first_leaf() {
        let split = Split {
            id: SplitId(1),
            orientation: Orientation::Row,
            children: vec![
                Child { ratio: None, node: Node::Pane(pane(1, 1)) },
                Child { ratio: None, node: Node::Pane(pane(2, 2)) },
                Child { ratio: None, node: Node::Pane(pane(3, 3)) },
            ],
        };
        assert_eq!(focus_after_removal(&split, 0), Some(PaneId(2)));
        assert_eq!(focus_after_removal(&split, 2), Some(PaneId(2)));
    }
}
