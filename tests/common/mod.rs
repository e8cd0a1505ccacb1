//! Shared fixtures: layers packed as one gzip member per file.
#![allow(dead_code)]

use deltabox::entry::{Entry, EntryKind};
use deltabox::extract::{ImageReader, LayerStore};
use deltabox::merger::{Consolidator, Delta, MemoryBlobs, MemoryCatalog, Overlay, PriorityPolicy};
use deltabox::types::{BlobDigest, ImageRef};
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::sync::Arc;

pub fn sha256(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// One image layer: its entry table plus the compressed blob.
#[derive(Debug, Clone)]
pub struct Layer {
    pub digest: String,
    pub entries: Vec<Entry>,
    pub blob: Vec<u8>,
}

#[derive(Default)]
pub struct LayerBuilder {
    entries: Vec<Entry>,
    blob: Vec<u8>,
}

impl LayerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dir(mut self, name: &str) -> Self {
        self.entries.push(Entry::dir(name));
        self
    }

    pub fn file(mut self, name: &str, content: &[u8]) -> Self {
        if content.is_empty() {
            self.entries.push(Entry::empty_file(name));
            return self;
        }
        let member = gzip(content);
        let entry = Entry::file(name, sha256(content), content.len() as u64, self.blob.len() as u64, member.len() as u64);
        self.blob.extend(member);
        self.entries.push(entry);
        self
    }

    pub fn file_at_tier(mut self, name: &str, content: &[u8], tier: usize) -> Self {
        self = self.file(name, content);
        if let Some(last) = self.entries.last_mut() {
            last.landmark = tier;
        }
        self
    }

    pub fn symlink(mut self, name: &str, target: &str) -> Self {
        self.entries.push(Entry::symlink(name, target));
        self
    }

    pub fn hardlink(mut self, name: &str, target: &str) -> Self {
        self.entries.push(Entry::hardlink(name, target));
        self
    }

    pub fn fifo(mut self, name: &str) -> Self {
        self.entries.push(Entry::device(name, EntryKind::Fifo, 0, 0));
        self
    }

    pub fn whiteout(mut self, parent: &str, base: &str) -> Self {
        self.entries.push(Entry::whiteout(parent, base));
        self
    }

    pub fn opaque(mut self, parent: &str) -> Self {
        self.entries.push(Entry::opaque_whiteout(parent));
        self
    }

    pub fn entry(mut self, entry: Entry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn build(self) -> Layer {
        let mut seed = self.blob.clone();
        for e in &self.entries {
            seed.extend_from_slice(e.name.as_bytes());
            seed.push(0);
        }
        Layer { digest: sha256(&seed), entries: self.entries, blob: self.blob }
    }
}

/// Catalog plus blob store for a handful of images.
#[derive(Default)]
pub struct Registry {
    pub catalog: MemoryCatalog,
    pub blobs: MemoryBlobs,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image(&mut self, image: &str, layers: &[Layer], config: Option<&str>) -> ImageRef {
        let image = ImageRef::parse(image);
        for layer in layers {
            self.blobs.insert(layer.digest.clone(), layer.blob.clone());
        }
        self.catalog.insert_image(
            image.clone(),
            layers.iter().map(|l| (l.digest.clone(), l.entries.clone())).collect(),
            config.map(str::to_string),
        );
        image
    }

    pub async fn overlay(&self, image: &ImageRef) -> Overlay {
        Overlay::build(&self.catalog, image).await.unwrap()
    }

    /// Diff `want` against `have` (or an empty base) and consolidate.
    pub async fn pack(&self, pairs: &[(Option<&ImageRef>, &ImageRef)]) -> Packed {
        let mut deltas = Vec::new();
        for (have, want) in pairs {
            let have = match have {
                Some(h) => self.overlay(h).await,
                None => Overlay::new(),
            };
            deltas.push(Delta::diff(&have, &self.overlay(want).await));
        }
        let consolidator = Consolidator::consolidate(deltas, PriorityPolicy::default(), false).unwrap();
        let mut header = Vec::new();
        consolidator.write_header(&mut header).unwrap();
        let mut body = Vec::new();
        consolidator.write_body(&self.blobs, &mut body).unwrap();
        Packed { header, body, consolidator }
    }
}

pub struct Packed {
    pub header: Vec<u8>,
    pub body: Vec<u8>,
    pub consolidator: Consolidator,
}

impl Packed {
    pub fn stream(&self) -> Vec<u8> {
        let mut all = self.header.clone();
        all.extend_from_slice(&self.body);
        all
    }

    pub fn open(&self, store: &Arc<LayerStore>) -> ImageReader {
        ImageReader::open(store.clone(), &self.header).unwrap()
    }
}

/// Register the layers of `image` as already extracted on this node.
pub fn preinstall(store: &LayerStore, layers: &[Layer], image: &str) {
    for layer in layers {
        let meta = store.register(&BlobDigest::new(layer.digest.clone(), image), true).unwrap();
        for entry in &layer.entries {
            let path = meta.path().join(&entry.name);
            match entry.kind {
                EntryKind::Dir => std::fs::create_dir_all(&path).unwrap(),
                EntryKind::Reg if !entry.is_whiteout() => {
                    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                    let bytes = if entry.size == 0 {
                        Vec::new()
                    } else {
                        let start = entry.offset as usize;
                        let member = &layer.blob[start..start + entry.compressed_size as usize];
                        let mut out = Vec::new();
                        std::io::Read::read_to_end(&mut flate2::read::GzDecoder::new(member), &mut out).unwrap();
                        out
                    };
                    std::fs::write(&path, bytes).unwrap();
                }
                _ => {}
            }
        }
    }
}
