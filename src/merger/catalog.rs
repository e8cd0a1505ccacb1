use anyhow::Result;
use async_trait::async_trait;
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::entry::Entry;
use crate::types::{BlobDigest, ImageRef};

/// Source of image and layer metadata for the overlay builder.
///
/// `Ok(None)` means the catalog is healthy but has no record for the key.
#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait LayerCatalog: Send + Sync {
    /// Layer digests of an image, lowest layer first.
    async fn image_layers(&self, image: &ImageRef) -> Result<Option<Vec<String>>>;

    /// Flat entry table of one layer.
    async fn layer_entries(&self, layer: &BlobDigest) -> Result<Option<Vec<Entry>>>;

    /// Raw image configuration blob.
    async fn image_config(&self, image: &ImageRef) -> Result<Option<String>>;
}

#[derive(Debug, Clone, Default)]
struct StoredImage {
    layers: Vec<String>,
    config: Option<String>,
}

/// In-process catalog, keyed the same way a persistent one would be.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    images: RwLock<HashMap<ImageRef, StoredImage>>,
    layers: RwLock<HashMap<BlobDigest, Vec<Entry>>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an image with its layers (lowest first) and their entry tables.
    pub fn insert_image(&self, image: ImageRef, layers: Vec<(String, Vec<Entry>)>, config: Option<String>) {
        let mut table = self.layers.write();
        let mut digests = Vec::with_capacity(layers.len());
        for (digest, entries) in layers {
            table.insert(BlobDigest::new(digest.clone(), image.name.clone()), entries);
            digests.push(digest);
        }
        self.images.write().insert(image, StoredImage { layers: digests, config });
    }
}

#[async_trait]
impl LayerCatalog for MemoryCatalog {
    async fn image_layers(&self, image: &ImageRef) -> Result<Option<Vec<String>>> {
        let images = self.images.read();
        Ok(images.get(image).map(|i| i.layers.clone()))
    }

    async fn layer_entries(&self, layer: &BlobDigest) -> Result<Option<Vec<Entry>>> {
        let layers = self.layers.read();
        Ok(layers.get(layer).cloned())
    }

    async fn image_config(&self, image: &ImageRef) -> Result<Option<String>> {
        let images = self.images.read();
        Ok(images.get(image).and_then(|i| i.config.clone()))
    }
}
