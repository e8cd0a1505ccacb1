use thiserror::Error;

/// Errors raised while building, diffing or consolidating delta images.
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    #[error("Layer not found: {0}")]
    LayerNotFound(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Delta image has already been consolidated")]
    AlreadyConsolidated,

    #[error("Delta image has not been consolidated yet")]
    NotConsolidated,

    #[error("Same digest with different sizes: {0}")]
    HashCollision(String),

    #[error("Source layer {0} out of range")]
    SourceOutOfRange(i32),

    #[error("Catalog error: {0}")]
    Catalog(#[from] anyhow::Error),

    #[error("Manifest encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type MergeResult<T> = Result<T, MergeError>;
