use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use super::error::{ExtractError, ExtractResult};
use super::layer::LayerMeta;
use super::signal::Readiness;
use crate::entry::{Entry, EntryKind, ROOT_NAME, base_name, parent_name};
use crate::merger::Delta;
use crate::types::ImageRef;

/// Lifecycle of a client-side entry. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryState {
    /// Bytes have not arrived yet.
    Empty,
    /// Served from the shared extracted layer.
    ReadOnly,
    /// Copied into the instance's private directory.
    Writable,
}

#[derive(Debug, Clone)]
pub struct TemplateNode {
    pub entry: Entry,
    pub parent: Option<usize>,
    pub children: BTreeMap<String, usize>,
    pub state: EntryState,
    /// Where the read-only bytes live, for entries backed by a layer.
    pub location: Option<PathBuf>,
    pub readiness: Option<Arc<Readiness>>,
}

/// Filesystem tree of one target image, shared by all its instances.
#[derive(Debug)]
pub struct Template {
    image: ImageRef,
    config: Option<String>,
    nodes: Vec<TemplateNode>,
}

impl Template {
    pub fn image(&self) -> &ImageRef {
        &self.image
    }

    pub fn config(&self) -> Option<&str> {
        self.config.as_deref()
    }

    pub fn nodes(&self) -> &[TemplateNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        let name = crate::entry::normalize(name);
        if name == ROOT_NAME {
            return Some(0);
        }
        let mut cur = 0;
        for part in name.split('/') {
            cur = *self.nodes[cur].children.get(part)?;
        }
        Some(cur)
    }
}

/// A file the extractor has to materialise inside a layer directory.
#[derive(Debug, Clone)]
pub struct ExtractTarget {
    pub name: String,
    pub path: PathBuf,
    pub mode: u32,
    pub layer: Arc<LayerMeta>,
    pub readiness: Arc<Readiness>,
}

/// Builds templates and collects the extraction work they depend on.
///
/// Entries of the same layer and path share one readiness signal across
/// every template, so shared layers are extracted once.
pub(crate) struct TemplateBuilder<'a> {
    layers: &'a [Arc<LayerMeta>],
    signals: HashMap<(String, String), Arc<Readiness>>,
    pub zero: Vec<ExtractTarget>,
    pub by_offset: BTreeMap<u64, Vec<ExtractTarget>>,
}

impl<'a> TemplateBuilder<'a> {
    pub fn new(layers: &'a [Arc<LayerMeta>]) -> Self {
        Self { layers, signals: HashMap::new(), zero: Vec::new(), by_offset: BTreeMap::new() }
    }

    fn layer(&self, source: i32) -> ExtractResult<&Arc<LayerMeta>> {
        usize::try_from(source - 1)
            .ok()
            .and_then(|i| self.layers.get(i))
            .ok_or(ExtractError::UnknownLayer(source))
    }

    /// Shared signal for `entry` in `layer`; the target is queued the first
    /// time it is seen.
    fn signal(&mut self, layer: &Arc<LayerMeta>, entry: &Entry, offset: Option<u64>) -> Arc<Readiness> {
        let key = (layer.digest().digest.clone(), entry.name.clone());
        if let Some(existing) = self.signals.get(&key) {
            return existing.clone();
        }
        let readiness = Arc::new(Readiness::new());
        self.signals.insert(key, readiness.clone());

        let target = ExtractTarget {
            name: entry.name.clone(),
            path: layer.path().join(&entry.name),
            mode: entry.mode,
            layer: layer.clone(),
            readiness: readiness.clone(),
        };
        match offset {
            Some(o) => self.by_offset.entry(o).or_default().push(target),
            None => self.zero.push(target),
        }
        readiness
    }

    fn node_for(&mut self, entry: Entry) -> ExtractResult<TemplateNode> {
        let mut node = TemplateNode {
            entry,
            parent: None,
            children: BTreeMap::new(),
            state: EntryState::ReadOnly,
            location: None,
            readiness: None,
        };
        if node.entry.source <= 0 {
            return Ok(node);
        }

        let layer = self.layer(node.entry.source)?.clone();
        node.location = Some(layer.path().join(&node.entry.name));
        if !node.entry.is_data() || node.entry.update_meta || layer.is_complete() {
            return Ok(node);
        }

        if node.entry.size == 0 {
            node.readiness = Some(self.signal(&layer, &node.entry, None));
            node.state = EntryState::Empty;
        } else if let Some(first) = node.entry.delta_offset.as_ref().and_then(|d| d.first()).copied() {
            node.readiness = Some(self.signal(&layer, &node.entry, Some(first)));
            node.state = EntryState::Empty;
        }
        Ok(node)
    }

    pub fn build(&mut self, delta: &Delta) -> ExtractResult<Template> {
        let mut root = Entry::root();
        root.landmark = 0;
        let mut nodes = vec![TemplateNode {
            entry: root,
            parent: None,
            children: BTreeMap::new(),
            state: EntryState::Writable,
            location: None,
            readiness: None,
        }];

        // Later entries for the same path supersede earlier ones.
        let mut dirs: BTreeMap<String, Entry> = BTreeMap::new();
        let mut files: BTreeMap<String, Entry> = BTreeMap::new();
        for entry in delta.entries() {
            if entry.is_root() || entry.is_whiteout() {
                continue;
            }
            if entry.is_dir() {
                files.remove(&entry.name);
                dirs.insert(entry.name.clone(), entry.clone());
            } else {
                dirs.remove(&entry.name);
                files.insert(entry.name.clone(), entry.clone());
            }
        }

        let mut ordered: Vec<Entry> = dirs.into_values().collect();
        ordered.sort_by_key(|e| e.name.matches('/').count());
        ordered.extend(files.into_values());

        let mut index: HashMap<String, usize> = HashMap::new();
        index.insert(ROOT_NAME.to_string(), 0);
        for entry in ordered {
            let parent = *index
                .get(parent_name(&entry.name))
                .ok_or_else(|| ExtractError::OrphanNode(entry.name.clone()))?;
            if !nodes[parent].entry.is_dir() {
                return Err(ExtractError::OrphanNode(entry.name.clone()));
            }
            let name = entry.name.clone();
            let mut node = self.node_for(entry)?;
            node.parent = Some(parent);
            let id = nodes.len();
            nodes[parent].children.insert(base_name(&name).to_string(), id);
            nodes.push(node);
            index.insert(name, id);
        }

        for id in 0..nodes.len() {
            if nodes[id].entry.kind != EntryKind::Hardlink {
                continue;
            }
            match index.get(&nodes[id].entry.link_name).copied() {
                Some(target) => {
                    let (location, readiness, state) = {
                        let t = &nodes[target];
                        (t.location.clone(), t.readiness.clone(), t.state)
                    };
                    let node = &mut nodes[id];
                    node.location = location;
                    node.readiness = readiness;
                    node.state = state;
                }
                None => warn!(
                    name = %nodes[id].entry.name,
                    target = %nodes[id].entry.link_name,
                    "hard link target missing"
                ),
            }
        }

        Ok(Template { image: delta.image.clone(), config: delta.config.clone(), nodes })
    }
}
