use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::entry::Entry;
use crate::extract::{EntryState, Readiness, TemplateNode};

/// Mutable part of a node, guarded by the node's own lock.
#[derive(Debug)]
pub struct NodeInner {
    pub entry: Entry,
    pub parent: Option<u64>,
    pub children: BTreeMap<String, u64>,
    pub location: Option<PathBuf>,
    /// Backed by an image layer rather than created in this instance.
    pub from_layer: bool,
    pub removed: bool,
    state: EntryState,
    history: Vec<EntryState>,
}

impl NodeInner {
    pub fn state(&self) -> EntryState {
        self.state
    }

    /// States this node has been in, oldest first.
    pub fn history(&self) -> &[EntryState] {
        &self.history
    }

    /// Move to `next` if it is ahead of the current state. Returns whether
    /// the state changed.
    pub fn advance(&mut self, next: EntryState) -> bool {
        if next <= self.state {
            return false;
        }
        self.state = next;
        self.history.push(next);
        true
    }
}

/// One file, directory or special file of a filesystem instance.
#[derive(Debug)]
pub struct FsNode {
    inner: Mutex<NodeInner>,
    readiness: Option<Arc<Readiness>>,
}

impl FsNode {
    pub(crate) fn from_template(node: &TemplateNode, parent: Option<u64>, from_layer: bool) -> Self {
        let children = node.children.iter().map(|(name, &id)| (name.clone(), id as u64 + 1)).collect();
        Self {
            inner: Mutex::new(NodeInner {
                entry: node.entry.clone(),
                parent,
                children,
                location: node.location.clone(),
                from_layer,
                removed: false,
                state: node.state,
                history: vec![node.state],
            }),
            readiness: node.readiness.clone(),
        }
    }

    /// A node created by a write operation; it only exists in the writable
    /// directory.
    pub(crate) fn created(entry: Entry, parent: u64) -> Self {
        Self {
            inner: Mutex::new(NodeInner {
                entry,
                parent: Some(parent),
                children: BTreeMap::new(),
                location: None,
                from_layer: false,
                removed: false,
                state: EntryState::Writable,
                history: vec![EntryState::Writable],
            }),
            readiness: None,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, NodeInner> {
        self.inner.lock()
    }

    pub fn readiness(&self) -> Option<&Arc<Readiness>> {
        self.readiness.as_ref()
    }

    pub fn state(&self) -> EntryState {
        self.inner.lock().state
    }
}
