use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::types::{BlobDigest, ImageRef};

/// One physical layer extracted on this node.
#[derive(Debug)]
pub struct LayerMeta {
    digest: BlobDigest,
    abs_path: PathBuf,
    complete: Mutex<bool>,
}

impl LayerMeta {
    pub fn digest(&self) -> &BlobDigest {
        &self.digest
    }

    pub fn path(&self) -> &Path {
        &self.abs_path
    }

    pub fn is_complete(&self) -> bool {
        *self.complete.lock()
    }

    /// Mark the layer fully extracted. Returns true only for the call that
    /// flipped the flag.
    pub fn set_complete(&self) -> bool {
        let mut complete = self.complete.lock();
        if *complete {
            return false;
        }
        *complete = true;
        true
    }
}

/// Registry of extracted layers and per-instance writable directories.
///
/// ```text
/// <work_dir>/layers/<digest hex>/   shared, read-only once extracted
/// <work_dir>/rw/<instance id>/      private writable copies
/// <work_dir>/configs/<image>.json   image configuration blobs
/// ```
#[derive(Debug)]
pub struct LayerStore {
    work_dir: PathBuf,
    layers: Mutex<HashMap<String, Arc<LayerMeta>>>,
}

impl LayerStore {
    pub fn new(work_dir: impl AsRef<Path>) -> io::Result<Self> {
        let work_dir = work_dir.as_ref().to_path_buf();
        for sub in ["layers", "rw", "configs"] {
            std::fs::create_dir_all(work_dir.join(sub))?;
        }
        Ok(Self { work_dir, layers: Mutex::new(HashMap::new()) })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn find(&self, digest: &str) -> Option<Arc<LayerMeta>> {
        self.layers.lock().get(digest).cloned()
    }

    /// Register a layer, or return the existing record for its digest.
    pub fn register(&self, layer: &BlobDigest, complete: bool) -> io::Result<Arc<LayerMeta>> {
        let mut layers = self.layers.lock();
        if let Some(existing) = layers.get(&layer.digest) {
            return Ok(existing.clone());
        }
        let abs_path = self.work_dir.join("layers").join(layer.hex());
        std::fs::create_dir_all(&abs_path)?;
        debug!(layer = %layer, path = %abs_path.display(), complete, "layer registered");

        let meta = Arc::new(LayerMeta { digest: layer.clone(), abs_path, complete: Mutex::new(complete) });
        layers.insert(layer.digest.clone(), meta.clone());
        Ok(meta)
    }

    pub fn layer_count(&self) -> usize {
        self.layers.lock().len()
    }

    /// Create an empty writable directory for one filesystem instance.
    pub fn new_rw_dir(&self, id: &str) -> io::Result<PathBuf> {
        let dir = self.work_dir.join("rw").join(id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn config_path(&self, image: &ImageRef) -> PathBuf {
        self.work_dir.join("configs").join(format!("{}.json", image.file_stem()))
    }
}
