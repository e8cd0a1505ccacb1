//! Overlay builder.
//!
//! Stacks layer tables on top of each other with union-mount semantics:
//! single-file whiteouts delete one lower entry, the opaque marker hides
//! every lower child of its directory, and identical content only refreshes
//! metadata.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use tracing::{debug, info};

use super::catalog::LayerCatalog;
use super::error::{MergeError, MergeResult};
use crate::entry::{Entry, EntryTree, NodeId, OPAQUE_WHITEOUT, WHITEOUT_PREFIX, normalize};
use crate::types::{BlobDigest, ImageRef, MAX_LANDMARK};

/// A merged filesystem tree plus the layers it was built from.
#[derive(Debug, Clone)]
pub struct Overlay {
    tree: EntryTree,
    index: HashMap<String, NodeId>,
    digests: Vec<BlobDigest>,
    image: Option<ImageRef>,
    config: Option<String>,
}

impl Default for Overlay {
    fn default() -> Self {
        Self::new()
    }
}

impl Overlay {
    pub fn new() -> Self {
        let tree = EntryTree::new();
        let mut index = HashMap::new();
        index.insert(tree.entry(tree.root()).name.clone(), tree.root());
        Self { tree, index, digests: Vec::new(), image: None, config: None }
    }

    /// Build the overlay of every layer of `image`, as recorded in `catalog`.
    pub async fn build(catalog: &dyn LayerCatalog, image: &ImageRef) -> MergeResult<Self> {
        let mut overlay = Self::new();
        overlay.add_image(catalog, image).await?;
        Ok(overlay)
    }

    /// Stack every layer of `image` on top of this overlay.
    pub async fn add_image(&mut self, catalog: &dyn LayerCatalog, image: &ImageRef) -> MergeResult<()> {
        info!(image = %image, "add image to overlay");

        let layers = catalog
            .image_layers(image)
            .await?
            .ok_or_else(|| MergeError::BucketNotFound(image.to_string()))?;

        for digest in layers {
            let blob = BlobDigest::new(digest, image.name.clone());
            let entries = catalog
                .layer_entries(&blob)
                .await?
                .ok_or_else(|| MergeError::LayerNotFound(blob.to_string()))?;
            self.add_layer(blob, entries)?;
        }

        self.config = catalog.image_config(image).await?;
        self.image = Some(image.clone());
        Ok(())
    }

    /// Merge one layer's entry table on top of the current tree.
    ///
    /// Entries of the layer get the layer's 1-based position as their source.
    /// A table with an entry whose parent directory is missing is rejected
    /// before anything is merged.
    pub fn add_layer(&mut self, layer: BlobDigest, entries: Vec<Entry>) -> MergeResult<()> {
        let source = self.digests.len() as i32 + 1;
        let entries: Vec<Entry> = entries
            .into_iter()
            .filter(|e| !e.is_prefetch_landmark())
            .map(|mut e| {
                e.name = normalize(&e.name);
                e.source = source;
                e.delta_offset = None;
                e.update_meta = false;
                e
            })
            .collect();
        let count = entries.len();

        let upper = EntryTree::from_entries(entries).map_err(|e| MergeError::EntryNotFound(e.0))?;

        debug!(layer = %layer, source, entries = count, "merge layer");
        self.digests.push(layer);
        let root = self.tree.root();
        self.merge_dir(root, &upper, upper.root());
        Ok(())
    }

    fn merge_dir(&mut self, lower: NodeId, upper: &EntryTree, udir: NodeId) {
        if upper.child(udir, OPAQUE_WHITEOUT).is_some() {
            let names: Vec<String> = self.tree.children(lower).map(|(n, _)| n.to_string()).collect();
            for name in names {
                self.remove_child(lower, &name);
            }
            for (_, uchild) in upper.children(udir) {
                if !upper.entry(uchild).is_whiteout() {
                    self.graft(lower, upper, uchild);
                }
            }
            return;
        }

        let lower_children: Vec<(String, NodeId)> =
            self.tree.children(lower).map(|(n, id)| (n.to_string(), id)).collect();
        for (name, lchild) in lower_children {
            if upper.child(udir, &format!("{WHITEOUT_PREFIX}{name}")).is_some() {
                self.remove_child(lower, &name);
                continue;
            }
            let Some(uchild) = upper.child(udir, &name) else {
                continue;
            };
            let upper_entry = upper.entry(uchild);
            if self.tree.entry(lchild).same_content(upper_entry) {
                self.tree.entry_mut(lchild).update_metadata_from(upper_entry);
                if upper_entry.is_dir() {
                    self.merge_dir(lchild, upper, uchild);
                }
            } else {
                self.remove_child(lower, &name);
                self.graft(lower, upper, uchild);
            }
        }

        for (name, uchild) in upper.children(udir) {
            if upper.entry(uchild).is_whiteout() || self.tree.child(lower, name).is_some() {
                continue;
            }
            self.graft(lower, upper, uchild);
        }
    }

    /// Copy `uchild` and its subtree from `upper` below `parent`.
    fn graft(&mut self, parent: NodeId, upper: &EntryTree, uchild: NodeId) {
        let mut entry = upper.entry(uchild).clone();
        if entry.is_dir() {
            entry.num_link = 2;
        }
        let name = entry.name.clone();
        let id = self.tree.attach(parent, entry);
        self.index.insert(name, id);

        for (_, grandchild) in upper.children(uchild) {
            if !upper.entry(grandchild).is_whiteout() {
                self.graft(id, upper, grandchild);
            }
        }
    }

    fn remove_child(&mut self, parent: NodeId, name: &str) {
        let Some(child) = self.tree.child(parent, name) else {
            return;
        };
        for id in self.tree.walk_from(child) {
            self.index.remove(&self.tree.entry(id).name);
        }
        self.tree.detach(parent, name);
    }

    /// Reassign priority tiers from an access-rank list.
    ///
    /// Traced entries land in tier `rank / tier_width`, capped at the last
    /// tier; untraced ones go to the last tier. Directories take the most
    /// urgent tier of their children.
    pub fn apply_ranks(&mut self, ranks: &AccessRanks, tier_width: usize) {
        let Some(image) = self.image.clone() else {
            return;
        };
        let width = tier_width.max(1);
        let root = self.tree.root();
        self.rank_subtree(root, &image.name, ranks, width);
    }

    fn rank_subtree(&mut self, id: NodeId, image: &str, ranks: &AccessRanks, width: usize) -> usize {
        let entry = self.tree.entry(id);
        if !entry.is_dir() {
            let tier = ranks
                .rank(image, &entry.name)
                .map(|r| (r / width).min(MAX_LANDMARK))
                .unwrap_or(MAX_LANDMARK);
            self.tree.entry_mut(id).landmark = tier;
            return tier;
        }
        let mut tier = MAX_LANDMARK;
        for child in self.tree.child_ids(id) {
            tier = tier.min(self.rank_subtree(child, image, ranks, width));
        }
        self.tree.entry_mut(id).landmark = tier;
        tier
    }

    pub fn tree(&self) -> &EntryTree {
        &self.tree
    }

    pub fn root(&self) -> NodeId {
        self.tree.root()
    }

    pub fn get(&self, name: &str) -> Option<&Entry> {
        self.index.get(&normalize(name)).map(|id| self.tree.entry(*id))
    }

    pub fn node(&self, name: &str) -> Option<NodeId> {
        self.index.get(&normalize(name)).copied()
    }

    pub fn digests(&self) -> &[BlobDigest] {
        &self.digests
    }

    pub fn image(&self) -> Option<&ImageRef> {
        self.image.as_ref()
    }

    pub fn set_image(&mut self, image: ImageRef) {
        self.image = Some(image);
    }

    pub fn config(&self) -> Option<&str> {
        self.config.as_deref()
    }

    pub fn set_config(&mut self, config: Option<String>) {
        self.config = config;
    }

    /// Number of entries in the merged tree, root included.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.len() <= 1
    }

    /// All entries keyed by path.
    pub fn entries(&self) -> BTreeMap<String, Entry> {
        self.tree
            .walk()
            .into_iter()
            .map(|id| {
                let e = self.tree.entry(id);
                (e.name.clone(), e.clone())
            })
            .collect()
    }

    /// Dump the merged index as indented JSON, for inspection.
    pub fn export_toc<W: Write>(&self, writer: W) -> MergeResult<()> {
        #[derive(Serialize)]
        struct Toc<'a> {
            #[serde(rename = "d")]
            digests: &'a [BlobDigest],
            #[serde(rename = "p")]
            entries: BTreeMap<String, Entry>,
        }
        serde_json::to_writer_pretty(writer, &Toc { digests: &self.digests, entries: self.entries() })?;
        Ok(())
    }
}

/// One line of an access trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankRecord {
    pub image: String,
    pub file: String,
    pub rank: usize,
}

/// Access ranks computed from traces, keyed by `(source image, file)`.
#[derive(Debug, Clone, Default)]
pub struct AccessRanks {
    ranks: HashMap<(String, String), usize>,
}

impl AccessRanks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = RankRecord>) -> Self {
        let mut ranks = Self::new();
        for r in records {
            ranks.insert(&r.image, &r.file, r.rank);
        }
        ranks
    }

    /// Record a rank; the earliest rank wins for repeated accesses.
    pub fn insert(&mut self, image: &str, file: &str, rank: usize) {
        let slot = self.ranks.entry((image.to_string(), normalize(file))).or_insert(rank);
        *slot = (*slot).min(rank);
    }

    pub fn rank(&self, image: &str, file: &str) -> Option<usize> {
        self.ranks.get(&(image.to_string(), normalize(file))).copied()
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }
}
