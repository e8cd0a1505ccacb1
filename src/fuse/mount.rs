// FUSE mount management
//
// Mounts one filesystem instance at a directory and unmounts it again.

use super::FuseAdapter;
use crate::config::FuseConfig;
use crate::fs::FsInstance;
use anyhow::{Context, Result};
use fuser::MountOption;
use std::path::Path;
use std::sync::Arc;

/// fuser options for a mount configured by `config`.
pub fn mount_options(config: &FuseConfig) -> Vec<MountOption> {
    let mut options = vec![MountOption::DefaultPermissions];
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }
    if config.allow_root {
        options.push(MountOption::AllowRoot);
    }
    if !config.fsname.is_empty() {
        options.push(MountOption::FSName(config.fsname.clone()));
    }
    if config.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }
    options
}

/// Mount a filesystem instance via FUSE.
///
/// The returned session keeps the filesystem mounted until dropped.
pub fn mount(
    fs: Arc<FsInstance>,
    mountpoint: impl AsRef<Path>,
    config: &FuseConfig,
) -> Result<fuser::BackgroundSession> {
    let mountpoint = mountpoint.as_ref();
    if !mountpoint.is_dir() {
        anyhow::bail!("Mount point is not a directory: {}", mountpoint.display());
    }

    let image = fs.image().clone();
    tracing::info!(image = %image, mountpoint = %mountpoint.display(), "mounting image");
    let session = fuser::spawn_mount2(FuseAdapter::new(fs), mountpoint, &mount_options(config))
        .with_context(|| format!("Failed to mount {image} at {}", mountpoint.display()))?;
    tracing::info!(image = %image, "filesystem mounted");
    Ok(session)
}

/// Unmount a mount whose session was lost; dropping the session does the
/// same for live ones.
pub fn unmount(mountpoint: impl AsRef<Path>) -> Result<()> {
    let mountpoint = mountpoint.as_ref();
    tracing::info!(mountpoint = %mountpoint.display(), "unmounting filesystem");

    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mountpoint)
        .output()
        .context("Failed to execute fusermount")?;
    if !output.status.success() {
        anyhow::bail!("Failed to unmount: {}", String::from_utf8_lossy(&output.stderr));
    }
    Ok(())
}
