use super::record::{Entry, base_name};
use std::collections::BTreeMap;

/// Stable handle into an [`EntryTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone)]
struct Slot {
    entry: Entry,
    parent: Option<NodeId>,
    children: BTreeMap<String, NodeId>,
    live: bool,
}

/// Arena of entries linked by index.
///
/// Parents and children refer to each other through [`NodeId`]s, so the tree
/// has no ownership cycles and can be navigated in both directions. Detached
/// subtrees are marked dead and never reused.
#[derive(Debug, Clone)]
pub struct EntryTree {
    slots: Vec<Slot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanError(pub String);

impl Default for EntryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryTree {
    pub fn new() -> Self {
        Self::with_root(Entry::root())
    }

    pub fn with_root(root: Entry) -> Self {
        Self { slots: vec![Slot { entry: root, parent: None, children: BTreeMap::new(), live: true }] }
    }

    /// Build a tree from a flat entry table.
    ///
    /// Every entry's parent directory must be present in the table. A
    /// directory's tier is lowered to the most urgent tier among its
    /// descendants.
    pub fn from_entries(entries: Vec<Entry>) -> Result<Self, OrphanError> {
        let mut tree = Self::new();
        let mut sorted: Vec<Entry> = entries.into_iter().filter(|e| !e.is_root()).collect();
        sorted.sort_by(|a, b| depth(&a.name).cmp(&depth(&b.name)).then_with(|| a.name.cmp(&b.name)));

        let mut dirs: BTreeMap<String, NodeId> = BTreeMap::new();
        dirs.insert(Entry::root().name, tree.root());
        for mut entry in sorted {
            if entry.is_dir() {
                entry.num_link = 2;
            }
            let parent = *dirs
                .get(entry.parent_name())
                .ok_or_else(|| OrphanError(entry.name.clone()))?;
            let is_dir = entry.is_dir();
            let name = entry.name.clone();
            let id = tree.attach(parent, entry);
            if is_dir {
                dirs.insert(name, id);
            }
        }

        tree.propagate_landmarks(tree.root());
        Ok(tree)
    }

    fn propagate_landmarks(&mut self, id: NodeId) -> usize {
        let children: Vec<NodeId> = self.slots[id.0].children.values().copied().collect();
        let mut lowest = self.slots[id.0].entry.landmark;
        for child in children {
            lowest = lowest.min(self.propagate_landmarks(child));
        }
        if self.slots[id.0].entry.is_dir() {
            self.slots[id.0].entry.landmark = lowest;
        }
        self.slots[id.0].entry.landmark
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn entry(&self, id: NodeId) -> &Entry {
        &self.slots[id.0].entry
    }

    pub fn entry_mut(&mut self, id: NodeId) -> &mut Entry {
        &mut self.slots[id.0].entry
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.slots[id.0].parent
    }

    pub fn child(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.slots[id.0].children.get(name).copied()
    }

    pub fn has_children(&self, id: NodeId) -> bool {
        !self.slots[id.0].children.is_empty()
    }

    /// Children in name order.
    pub fn children(&self, id: NodeId) -> impl Iterator<Item = (&str, NodeId)> + '_ {
        self.slots[id.0].children.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn child_ids(&self, id: NodeId) -> Vec<NodeId> {
        self.slots[id.0].children.values().copied().collect()
    }

    pub fn is_live(&self, id: NodeId) -> bool {
        self.slots.get(id.0).is_some_and(|s| s.live)
    }

    /// Number of live entries, root included.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.live).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Attach `entry` below `parent`, replacing any child with the same name.
    pub fn attach(&mut self, parent: NodeId, entry: Entry) -> NodeId {
        let key = base_name(&entry.name).to_string();
        self.detach(parent, &key);

        if entry.is_dir() {
            self.slots[parent.0].entry.num_link += 1;
        }
        let id = NodeId(self.slots.len());
        self.slots.push(Slot { entry, parent: Some(parent), children: BTreeMap::new(), live: true });
        self.slots[parent.0].children.insert(key, id);
        id
    }

    /// Remove the child `name` of `parent` together with its subtree.
    pub fn detach(&mut self, parent: NodeId, name: &str) -> Option<NodeId> {
        let id = self.slots[parent.0].children.remove(name)?;
        if self.slots[id.0].entry.is_dir() {
            let links = &mut self.slots[parent.0].entry.num_link;
            *links = links.saturating_sub(1);
        }
        self.kill(id);
        Some(id)
    }

    /// Remove every child of `dir`.
    pub fn clear_children(&mut self, dir: NodeId) -> Vec<NodeId> {
        let names: Vec<String> = self.slots[dir.0].children.keys().cloned().collect();
        names.iter().filter_map(|n| self.detach(dir, n)).collect()
    }

    fn kill(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            let slot = &mut self.slots[n.0];
            slot.live = false;
            stack.extend(slot.children.values().copied());
        }
    }

    /// Live entries in pre-order, parents before children.
    pub fn walk(&self) -> Vec<NodeId> {
        self.walk_from(self.root())
    }

    pub fn walk_from(&self, start: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.slots[id.0].children.values().rev().copied());
        }
        out
    }

    /// Locate an entry by its full path.
    pub fn find(&self, name: &str) -> Option<NodeId> {
        let name = super::record::normalize(name);
        if name == super::record::ROOT_NAME {
            return Some(self.root());
        }
        let mut cur = self.root();
        for part in name.split('/') {
            cur = self.child(cur, part)?;
        }
        Some(cur)
    }

    /// Full path of a live node, rebuilt from the parent links.
    pub fn path_of(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut cur = id;
        while let Some(parent) = self.slots[cur.0].parent {
            parts.push(base_name(&self.slots[cur.0].entry.name).to_string());
            cur = parent;
        }
        if parts.is_empty() {
            return super::record::ROOT_NAME.to_string();
        }
        parts.reverse();
        parts.join("/")
    }
}

fn depth(name: &str) -> usize {
    name.matches('/').count()
}
