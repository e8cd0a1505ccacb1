// Server side: overlays, deltas and consolidation into a delta image.

pub mod blobs;
pub mod catalog;
pub mod consolidator;
pub mod delta;
pub mod error;
pub mod manifest;
pub mod overlay;

pub use blobs::{BlobSource, DirBlobs, MemoryBlobs};
pub use catalog::{LayerCatalog, MemoryCatalog};
pub use consolidator::{
    Consolidator, DEFAULT_PINNED_PATHS, OutputRange, PINNED_SCORE, PriorityPolicy,
};
pub use delta::Delta;
pub use error::{MergeError, MergeResult};
pub use manifest::Manifest;
pub use overlay::{AccessRanks, Overlay, RankRecord};

#[cfg(any(test, feature = "mockall"))]
pub use catalog::MockLayerCatalog;
