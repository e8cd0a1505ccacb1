use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::types::BlobDigest;

/// Random access to compressed layer blobs on the server side.
pub trait BlobSource: Send + Sync {
    fn read_range(&self, layer: &BlobDigest, offset: u64, len: u64) -> Result<Vec<u8>>;
}

/// Blobs held in memory, keyed by digest.
#[derive(Debug, Default)]
pub struct MemoryBlobs {
    blobs: HashMap<String, Vec<u8>>,
}

impl MemoryBlobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, digest: impl Into<String>, bytes: Vec<u8>) {
        self.blobs.insert(digest.into(), bytes);
    }
}

impl BlobSource for MemoryBlobs {
    fn read_range(&self, layer: &BlobDigest, offset: u64, len: u64) -> Result<Vec<u8>> {
        let blob = self.blobs.get(&layer.digest).with_context(|| format!("unknown layer {layer}"))?;
        let start = offset as usize;
        let end = start + len as usize;
        if end > blob.len() {
            bail!("range {start}..{end} beyond layer {layer} ({} bytes)", blob.len());
        }
        Ok(blob[start..end].to_vec())
    }
}

/// One file per layer blob, named after the digest's hex part.
#[derive(Debug, Clone)]
pub struct DirBlobs {
    dir: PathBuf,
}

impl DirBlobs {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }

    pub fn path_of(&self, layer: &BlobDigest) -> PathBuf {
        self.dir.join(layer.hex())
    }
}

impl BlobSource for DirBlobs {
    fn read_range(&self, layer: &BlobDigest, offset: u64, len: u64) -> Result<Vec<u8>> {
        let path = self.path_of(layer);
        let mut file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).with_context(|| format!("read {len} bytes at {offset} of {layer}"))?;
        Ok(buf)
    }
}
