use thiserror::Error;

use crate::merger::MergeError;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Malformed manifest: {0}")]
    Manifest(#[from] MergeError),

    #[error("Orphan node, parent directory missing: {0}")]
    OrphanNode(String),

    #[error("Unknown source layer: {0}")]
    UnknownLayer(i32),

    #[error("Image not found in delta image: {0}")]
    ImageNotFound(String),

    #[error("Checkpoint not found: {0} tier {1}")]
    CheckpointNotFound(String, usize),

    #[error("Extraction already started")]
    AlreadyStarted,

    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ExtractResult<T> = Result<T, ExtractError>;
