// FUSE interface implementation
//
// Exposes a filesystem instance as a standard POSIX mount.

pub mod adapter;
pub mod mount;

pub use adapter::FuseAdapter;
pub use mount::{mount, mount_options, unmount};
