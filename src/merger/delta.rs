use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::info;

use super::error::{MergeError, MergeResult};
use super::overlay::Overlay;
use crate::entry::{Entry, NodeId};
use crate::types::{BlobDigest, ImageRef, TIER_COUNT};

/// Changes that turn one overlay ("have") into another ("want").
///
/// `pool[tier]` lists the entries to replay, grouped by priority tier.
/// Unchanged files are listed too, as metadata-only updates pointing at the
/// old layer, so the pool alone describes the complete target tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    #[serde(rename = "d", default)]
    pub digests: Vec<BlobDigest>,
    #[serde(rename = "p", default)]
    pub pool: Vec<Vec<Entry>>,
    #[serde(rename = "checkpoints", default)]
    pub checkpoints: Vec<u64>,
    pub image: ImageRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,

    #[serde(skip)]
    base_len: usize,
    #[serde(skip)]
    consolidated: bool,
}

impl Delta {
    fn empty(image: ImageRef) -> Self {
        Self {
            digests: Vec::new(),
            pool: vec![Vec::new(); TIER_COUNT],
            checkpoints: Vec::new(),
            image,
            config: None,
            base_len: 0,
            consolidated: false,
        }
    }

    /// Compute the delta from `have` to `want`.
    pub fn diff(have: &Overlay, want: &Overlay) -> Self {
        let image = want.image().cloned().unwrap_or_else(|| ImageRef::new("", ""));
        let mut delta = Self::empty(image);
        delta.digests = have.digests().iter().chain(want.digests()).cloned().collect();
        delta.base_len = have.digests().len();
        delta.config = want.config().map(str::to_string);

        delta.diff_dir(Some((have, have.root())), want, want.root());

        info!(
            image = %delta.image,
            layers = delta.digests.len(),
            entries = delta.len(),
            "delta prepared"
        );
        delta
    }

    fn emit(&mut self, mut entry: Entry) {
        if entry.is_root() {
            return;
        }
        let tier = entry.landmark.min(TIER_COUNT - 1);
        entry.landmark = tier;
        self.pool[tier].push(entry);
    }

    fn emit_new(&mut self, want: &Overlay, id: NodeId) {
        let mut entry = want.tree().entry(id).clone();
        entry.shift_source(self.base_len as i32);
        entry.update_meta = false;
        self.emit(entry);
    }

    fn diff_dir(&mut self, have: Option<(&Overlay, NodeId)>, want: &Overlay, bdir: NodeId) {
        let b = want.tree();
        let Some((have, adir)) = have else {
            for bchild in b.child_ids(bdir) {
                self.emit_new(want, bchild);
                if b.entry(bchild).is_dir() {
                    self.diff_dir(None, want, bchild);
                }
            }
            return;
        };
        let a = have.tree();

        let mut opaque = true;
        let mut pending_delete = Vec::new();
        let mut link_delta: i64 = 0;

        for (name, achild) in a.children(adir) {
            let Some(bchild) = b.child(bdir, name) else {
                pending_delete.push(name.to_string());
                if a.entry(achild).is_dir() {
                    link_delta -= 1;
                }
                continue;
            };
            opaque = false;

            let (ae, be) = (a.entry(achild), b.entry(bchild));
            if ae.same_content(be) {
                let mut entry = be.clone();
                entry.update_meta = true;
                entry.source = ae.source;
                entry.offset = ae.offset;
                entry.chunks = ae.chunks.clone();
                self.emit(entry);
                if be.is_dir() {
                    self.diff_dir(Some((have, achild)), want, bchild);
                }
            } else {
                self.emit_new(want, bchild);
                if be.is_dir() {
                    let lower = if ae.is_dir() { Some((have, achild)) } else { None };
                    self.diff_dir(lower, want, bchild);
                }
            }
        }

        let adir_entry = a.entry(adir);
        if opaque && a.has_children(adir) {
            let mut marker = Entry::opaque_whiteout(&adir_entry.name);
            marker.landmark = adir_entry.landmark;
            self.emit(marker);
        } else {
            for name in pending_delete {
                let mut marker = Entry::whiteout(&adir_entry.name, &name);
                marker.landmark = adir_entry.landmark;
                self.emit(marker);
            }
        }

        for (name, bchild) in b.children(bdir) {
            if a.child(adir, name).is_some() {
                continue;
            }
            self.emit_new(want, bchild);
            if b.entry(bchild).is_dir() {
                link_delta += 1;
                self.diff_dir(None, want, bchild);
            }
        }

        if link_delta != 0 {
            self.emit_new(want, bdir);
        }
    }

    /// Number of entries across every tier.
    pub fn len(&self) -> usize {
        self.pool.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of layers that belong to the base image.
    pub fn base_len(&self) -> usize {
        self.base_len
    }

    pub fn is_consolidated(&self) -> bool {
        self.consolidated
    }

    pub(crate) fn set_consolidated(&mut self) {
        self.consolidated = true;
    }

    /// Entries in replay order: tier by tier.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.pool.iter().flatten()
    }

    /// Entries whose content has to be shipped.
    pub fn carries_bytes(entry: &Entry) -> bool {
        entry.source > 0 && !entry.update_meta && entry.is_data() && entry.size > 0
    }

    /// Lay this delta out on its own, without deduplication.
    ///
    /// Content is placed tier by tier; each tier's checkpoint is the end
    /// offset reached once that tier is written.
    pub fn populate_offset(&mut self) -> MergeResult<()> {
        if self.consolidated {
            return Err(MergeError::AlreadyConsolidated);
        }

        let mut offset = 0u64;
        let mut checkpoints = Vec::with_capacity(TIER_COUNT);
        for tier in self.pool.iter_mut() {
            for entry in tier.iter_mut() {
                if !Self::carries_bytes(entry) {
                    continue;
                }
                let mut offsets = Vec::new();
                for (_, len) in entry.segments() {
                    offsets.push(offset);
                    offset += len;
                }
                entry.delta_offset = Some(offsets);
            }
            checkpoints.push(offset);
        }
        self.checkpoints = checkpoints;
        self.consolidated = true;
        Ok(())
    }

    /// Write the delta as JSON.
    ///
    /// The compact form needs final offsets and is refused before
    /// consolidation; the pretty form is for inspection and always allowed.
    pub fn export_toc<W: Write>(&self, writer: W, pretty: bool) -> MergeResult<()> {
        if !self.consolidated && !pretty {
            return Err(MergeError::NotConsolidated);
        }
        if pretty {
            serde_json::to_writer_pretty(writer, self)?;
        } else {
            serde_json::to_writer(writer, self)?;
        }
        Ok(())
    }
}
