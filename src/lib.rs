// Delta image engine and lazy filesystem
//
// Server side: merge layers into overlays, diff overlays into deltas and
// consolidate deltas into one deduplicated, priority-ordered stream.
// Client side: read that stream, extract files as they arrive and serve them
// through a copy-on-write virtual filesystem.

pub mod config;
pub mod entry;
pub mod extract;
pub mod fs;
pub mod fuse;
pub mod merger;
pub mod metrics;
pub mod types;
