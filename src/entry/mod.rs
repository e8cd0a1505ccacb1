pub mod record;
pub mod tree;

pub use record::{
    Chunk, EMPTY_FILE_DIGEST, Entry, EntryKind, OPAQUE_WHITEOUT, ROOT_NAME, WHITEOUT_PREFIX,
    base_name, join, normalize, parent_name,
};
pub use tree::{EntryTree, NodeId, OrphanError};
