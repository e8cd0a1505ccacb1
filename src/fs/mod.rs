//! Virtual filesystem node: per-entry state machine with copy-up on write.

pub mod attr;
pub mod error;
mod instance;
mod node;
mod promote;

pub use attr::{DirEntry, FileAttr, FileType, SetAttr};
pub use error::{FsError, FsResult};
pub use instance::{FsInstance, ROOT_INODE};
pub use node::{FsNode, NodeInner};
