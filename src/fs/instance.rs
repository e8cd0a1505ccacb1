use parking_lot::{Mutex, RwLock};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::attr::{DirEntry, FileAttr, FileType, SetAttr, check_name};
use super::error::{FsError, FsResult};
use super::node::{FsNode, NodeInner};
use super::promote;
use crate::entry::{Entry, EntryKind, ROOT_NAME, join};
use crate::extract::{EntryState, ReadyState, Template};
use crate::types::ImageRef;

pub const ROOT_INODE: u64 = 1;

/// A live, independently writable view of one target image.
///
/// Node `n` of the template becomes inode `n + 1`. Every node carries its
/// own lock. Operations that change the namespace (create, link, remove,
/// rename) hold the instance-wide namespace lock before any node lock, so at
/// most one of them holds several node locks at a time; every other
/// operation holds at most one node lock.
pub struct FsInstance {
    image: ImageRef,
    nodes: RwLock<Vec<Arc<FsNode>>>,
    rw_dir: PathBuf,
    wait_timeout: Option<Duration>,
    privileged: bool,
    namespace: Mutex<()>,
}

impl FsInstance {
    pub fn new(template: &Template, rw_dir: PathBuf, wait_timeout: Option<Duration>) -> Self {
        let mut nodes = Vec::with_capacity(template.len());
        for (i, t) in template.nodes().iter().enumerate() {
            let node = FsNode::from_template(t, t.parent.map(|p| p as u64 + 1), i != 0);
            if t.entry.kind == EntryKind::Hardlink {
                if let Some(target) = template.find(&t.entry.link_name) {
                    let target = &template.nodes()[target].entry;
                    let mut inner = node.lock();
                    inner.entry.size = target.size;
                    inner.entry.mode = target.mode;
                }
            }
            nodes.push(Arc::new(node));
        }
        Self {
            image: template.image().clone(),
            nodes: RwLock::new(nodes),
            rw_dir,
            wait_timeout,
            privileged: nix::unistd::geteuid().is_root(),
            namespace: Mutex::new(()),
        }
    }

    pub fn image(&self) -> &ImageRef {
        &self.image
    }

    pub fn rw_dir(&self) -> &Path {
        &self.rw_dir
    }

    fn node(&self, ino: u64) -> FsResult<Arc<FsNode>> {
        let nodes = self.nodes.read();
        ino.checked_sub(1)
            .and_then(|i| nodes.get(i as usize))
            .cloned()
            .ok_or_else(|| FsError::PathNotFound(format!("inode {ino}")))
    }

    fn live(&self, ino: u64) -> FsResult<Arc<FsNode>> {
        let node = self.node(ino)?;
        if node.lock().removed {
            return Err(FsError::PathNotFound(format!("inode {ino}")));
        }
        Ok(node)
    }

    fn insert(&self, node: FsNode) -> u64 {
        let mut nodes = self.nodes.write();
        nodes.push(Arc::new(node));
        nodes.len() as u64
    }

    fn rw_path(&self, name: &str) -> PathBuf {
        if name == ROOT_NAME { self.rw_dir.clone() } else { self.rw_dir.join(name) }
    }

    pub fn state(&self, ino: u64) -> FsResult<EntryState> {
        Ok(self.node(ino)?.state())
    }

    /// Every state `ino` has passed through, oldest first.
    pub fn state_history(&self, ino: u64) -> FsResult<Vec<EntryState>> {
        Ok(self.node(ino)?.lock().history().to_vec())
    }

    pub fn path_of(&self, ino: u64) -> FsResult<String> {
        Ok(self.live(ino)?.lock().entry.name.clone())
    }

    /// Inode of a slash-separated path relative to the root.
    pub fn resolve(&self, path: &str) -> FsResult<u64> {
        let mut ino = ROOT_INODE;
        for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
            ino = self.lookup_ino(ino, part)?;
        }
        Ok(ino)
    }

    pub fn lookup_ino(&self, parent: u64, name: &str) -> FsResult<u64> {
        let node = self.live(parent)?;
        let inner = node.lock();
        if !inner.entry.is_dir() {
            return Err(FsError::NotDirectory(inner.entry.name.clone()));
        }
        inner
            .children
            .get(name)
            .copied()
            .ok_or_else(|| FsError::PathNotFound(join(&inner.entry.name, name)))
    }

    pub fn lookup(&self, parent: u64, name: &str) -> FsResult<FileAttr> {
        let ino = self.lookup_ino(parent, name)?;
        self.getattr(ino)
    }

    /// Attributes never wait for extraction; an `Empty` entry answers from
    /// the image metadata.
    pub fn getattr(&self, ino: u64) -> FsResult<FileAttr> {
        let node = self.live(ino)?;
        let inner = node.lock();
        if inner.state() == EntryState::Writable {
            let meta = fs::symlink_metadata(self.rw_path(&inner.entry.name))?;
            return Ok(FileAttr::from_metadata(ino, &meta));
        }
        Ok(FileAttr::from_entry(ino, &inner.entry))
    }

    pub fn readdir(&self, ino: u64) -> FsResult<Vec<DirEntry>> {
        let children: Vec<(String, u64)> = {
            let node = self.live(ino)?;
            let inner = node.lock();
            if !inner.entry.is_dir() {
                return Err(FsError::NotDirectory(inner.entry.name.clone()));
            }
            inner.children.iter().map(|(n, &i)| (n.clone(), i)).collect()
        };
        let mut out = Vec::with_capacity(children.len());
        for (name, child) in children {
            let node = self.node(child)?;
            let inner = node.lock();
            if inner.removed {
                continue;
            }
            out.push(DirEntry { inode: child, name, kind: FileType::from(inner.entry.kind) });
        }
        Ok(out)
    }

    pub fn readlink(&self, ino: u64) -> FsResult<String> {
        let node = self.live(ino)?;
        let inner = node.lock();
        if inner.entry.kind != EntryKind::Symlink {
            return Err(FsError::InvalidPath(format!("not a symlink: {}", inner.entry.name)));
        }
        if inner.state() == EntryState::Writable {
            let target = fs::read_link(self.rw_path(&inner.entry.name))?;
            return Ok(target.to_string_lossy().into_owned());
        }
        Ok(inner.entry.link_name.clone())
    }

    pub fn getxattr(&self, ino: u64, name: &str) -> FsResult<Vec<u8>> {
        let node = self.live(ino)?;
        let inner = node.lock();
        inner.entry.xattrs.get(name).cloned().ok_or_else(|| FsError::NoData(name.to_string()))
    }

    pub fn listxattr(&self, ino: u64) -> FsResult<Vec<String>> {
        let node = self.live(ino)?;
        let inner = node.lock();
        Ok(inner.entry.xattrs.keys().cloned().collect())
    }

    /// Block until the bytes of an `Empty` entry are on disk.
    fn wait_ready(&self, node: &FsNode) -> FsResult<()> {
        let name = {
            let inner = node.lock();
            if inner.state() != EntryState::Empty {
                return Ok(());
            }
            inner.entry.name.clone()
        };
        trace!(image = %self.image, name = %name, "waiting for extraction");
        let state = match node.readiness() {
            None => ReadyState::Ready,
            Some(r) => match self.wait_timeout {
                Some(timeout) => r.wait_timeout(timeout),
                None => r.wait_blocking(),
            },
        };
        match state {
            ReadyState::Ready => {
                node.lock().advance(EntryState::ReadOnly);
                Ok(())
            }
            ReadyState::Failed => Err(FsError::ExtractionFailed(name)),
            ReadyState::Pending => Err(FsError::TimedOut(name)),
        }
    }

    /// Open a file for I/O. Opening for write promotes it first.
    pub fn open(&self, ino: u64, write: bool) -> FsResult<File> {
        let node = self.live(ino)?;
        self.wait_ready(&node)?;
        if write {
            self.promote(ino)?;
        }
        let inner = node.lock();
        if inner.entry.is_dir() {
            return Err(FsError::IsDirectory(inner.entry.name.clone()));
        }
        let path = if inner.state() == EntryState::Writable {
            self.rw_path(&inner.entry.name)
        } else {
            inner.location.clone().ok_or_else(|| FsError::PathNotFound(inner.entry.name.clone()))?
        };
        Ok(OpenOptions::new().read(true).write(write).open(path)?)
    }

    /// Copy `ino` and every non-writable ancestor into the writable
    /// directory, root-most first.
    pub fn promote(&self, ino: u64) -> FsResult<()> {
        let mut chain = Vec::new();
        let mut cur = Some(ino);
        while let Some(id) = cur {
            let node = self.live(id)?;
            let inner = node.lock();
            if inner.state() == EntryState::Writable {
                break;
            }
            chain.push(id);
            cur = inner.parent;
        }
        for id in chain.into_iter().rev() {
            self.promote_one(id)?;
        }
        Ok(())
    }

    fn promote_one(&self, ino: u64) -> FsResult<()> {
        let node = self.live(ino)?;
        self.wait_ready(&node)?;
        let mut inner = node.lock();
        // Another thread may have won the race.
        if inner.state() == EntryState::Writable {
            return Ok(());
        }
        let dst = self.rw_path(&inner.entry.name);
        promote::materialize(&inner.entry, inner.location.as_deref(), &dst, self.privileged)?;
        inner.advance(EntryState::Writable);
        debug!(image = %self.image, name = %inner.entry.name, "entry promoted");
        Ok(())
    }

    /// Shared prologue of create/mkdir/symlink/link: validate the name,
    /// promote the parent and check it has no such child yet.
    fn prepare_child(&self, parent: u64, name: &str) -> FsResult<Arc<FsNode>> {
        check_name(name)?;
        let pnode = self.live(parent)?;
        if !pnode.lock().entry.is_dir() {
            return Err(FsError::NotDirectory(self.path_of(parent)?));
        }
        self.promote(parent)?;
        Ok(pnode)
    }

    fn add_child(&self, parent: &mut NodeInner, parent_ino: u64, name: &str, entry: Entry) -> u64 {
        let is_dir = entry.is_dir();
        let ino = self.insert(FsNode::created(entry, parent_ino));
        parent.children.insert(name.to_string(), ino);
        if is_dir {
            parent.entry.num_link += 1;
        }
        ino
    }

    pub fn create(&self, parent: u64, name: &str, mode: u32) -> FsResult<(FileAttr, File)> {
        let pnode = self.prepare_child(parent, name)?;
        let _namespace = self.namespace.lock();
        let mut pinner = pnode.lock();
        let full = join(&pinner.entry.name, name);
        if pinner.children.contains_key(name) {
            return Err(FsError::AlreadyExists(full));
        }
        promote::clear_whiteout(&self.rw_path(&pinner.entry.name), name)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode & 0o7777)
            .open(self.rw_path(&full))?;
        let mut entry = Entry::empty_file(full);
        entry.mode = mode & 0o7777;
        let ino = self.add_child(&mut pinner, parent, name, entry);
        drop(pinner);
        debug!(image = %self.image, ino, "file created");
        Ok((self.getattr(ino)?, file))
    }

    pub fn mkdir(&self, parent: u64, name: &str, mode: u32) -> FsResult<FileAttr> {
        let pnode = self.prepare_child(parent, name)?;
        let _namespace = self.namespace.lock();
        let mut pinner = pnode.lock();
        let full = join(&pinner.entry.name, name);
        if pinner.children.contains_key(name) {
            return Err(FsError::AlreadyExists(full));
        }
        promote::clear_whiteout(&self.rw_path(&pinner.entry.name), name)?;
        fs::DirBuilder::new().mode(mode & 0o7777).create(self.rw_path(&full))?;
        let mut entry = Entry::dir(full);
        entry.mode = mode & 0o7777;
        let ino = self.add_child(&mut pinner, parent, name, entry);
        drop(pinner);
        self.getattr(ino)
    }

    pub fn symlink(&self, parent: u64, name: &str, target: &str) -> FsResult<FileAttr> {
        let pnode = self.prepare_child(parent, name)?;
        let _namespace = self.namespace.lock();
        let mut pinner = pnode.lock();
        let full = join(&pinner.entry.name, name);
        if pinner.children.contains_key(name) {
            return Err(FsError::AlreadyExists(full));
        }
        promote::clear_whiteout(&self.rw_path(&pinner.entry.name), name)?;
        std::os::unix::fs::symlink(target, self.rw_path(&full))?;
        let ino = self.add_child(&mut pinner, parent, name, Entry::symlink(full, target));
        drop(pinner);
        self.getattr(ino)
    }

    pub fn link(&self, ino: u64, new_parent: u64, new_name: &str) -> FsResult<FileAttr> {
        let pnode = self.prepare_child(new_parent, new_name)?;
        let source = self.live(ino)?;
        if source.lock().entry.is_dir() {
            return Err(FsError::NotPermitted(self.path_of(ino)?));
        }
        self.promote(ino)?;
        let _namespace = self.namespace.lock();
        let mut pinner = pnode.lock();
        let full = join(&pinner.entry.name, new_name);
        if pinner.children.contains_key(new_name) {
            return Err(FsError::AlreadyExists(full));
        }
        let mut entry = {
            let mut sinner = source.lock();
            sinner.entry.num_link += 1;
            fs::hard_link(self.rw_path(&sinner.entry.name), self.rw_path(&full))?;
            sinner.entry.clone()
        };
        entry.name = full;
        if entry.kind == EntryKind::Hardlink {
            entry.kind = EntryKind::Reg;
        }
        let new_ino = self.add_child(&mut pinner, new_parent, new_name, entry);
        drop(pinner);
        self.getattr(new_ino)
    }

    pub fn unlink(&self, parent: u64, name: &str) -> FsResult<()> {
        self.remove(parent, name, false)
    }

    pub fn rmdir(&self, parent: u64, name: &str) -> FsResult<()> {
        self.remove(parent, name, true)
    }

    fn remove(&self, parent: u64, name: &str, dir: bool) -> FsResult<()> {
        let child_ino = self.lookup_ino(parent, name)?;
        let child = self.live(child_ino)?;
        {
            let inner = child.lock();
            match (dir, inner.entry.is_dir()) {
                (false, true) => return Err(FsError::IsDirectory(inner.entry.name.clone())),
                (true, false) => return Err(FsError::NotDirectory(inner.entry.name.clone())),
                _ => {}
            }
        }
        self.promote(parent)?;

        let _namespace = self.namespace.lock();
        let pnode = self.live(parent)?;
        let mut pinner = pnode.lock();
        if pinner.children.get(name) != Some(&child_ino) {
            return Err(FsError::PathNotFound(join(&pinner.entry.name, name)));
        }
        let mut cinner = child.lock();
        if dir && !cinner.children.is_empty() {
            return Err(FsError::DirectoryNotEmpty(cinner.entry.name.clone()));
        }
        if cinner.state() == EntryState::Writable {
            remove_physical(&self.rw_path(&cinner.entry.name), dir)?;
        }
        if cinner.from_layer {
            promote::write_whiteout(&self.rw_path(&pinner.entry.name), name)?;
            debug!(image = %self.image, name = %cinner.entry.name, "whiteout recorded");
        }
        cinner.removed = true;
        pinner.children.remove(name);
        if dir {
            pinner.entry.num_link = pinner.entry.num_link.saturating_sub(1);
        }
        Ok(())
    }

    /// Move `name` of `parent` to `new_name` of `new_parent`.
    ///
    /// A directory moves as one writable directory. Descendants that were
    /// never promoted keep reading from their layer location and land under
    /// the new path when they are promoted later.
    pub fn rename(&self, parent: u64, name: &str, new_parent: u64, new_name: &str) -> FsResult<()> {
        check_name(new_name)?;
        let _namespace = self.namespace.lock();
        let child_ino = self.lookup_ino(parent, name)?;
        if parent == new_parent && name == new_name {
            return Ok(());
        }
        let mut cur = Some(new_parent);
        while let Some(id) = cur {
            if id == child_ino {
                return Err(FsError::InvalidPath(format!("cannot move {name} beneath itself")));
            }
            cur = self.live(id)?.lock().parent;
        }

        self.promote(child_ino)?;
        self.promote(new_parent)?;

        let child = self.live(child_ino)?;
        let old_dir = self.live(parent)?;
        let new_dir = self.live(new_parent)?;
        let (mut old_guard, mut new_guard) = if parent == new_parent {
            (old_dir.lock(), None)
        } else if parent < new_parent {
            let old = old_dir.lock();
            (old, Some(new_dir.lock()))
        } else {
            let new = new_dir.lock();
            (old_dir.lock(), Some(new))
        };

        if old_guard.children.get(name) != Some(&child_ino) {
            return Err(FsError::PathNotFound(join(&old_guard.entry.name, name)));
        }
        let old_dir_name = old_guard.entry.name.clone();
        let (new_dir_name, replaced) = match &new_guard {
            Some(g) => (g.entry.name.clone(), g.children.get(new_name).copied()),
            None => (old_dir_name.clone(), old_guard.children.get(new_name).copied()),
        };
        if !new_guard.as_ref().map_or(old_guard.entry.is_dir(), |g| g.entry.is_dir()) {
            return Err(FsError::NotDirectory(new_dir_name));
        }

        let mut cinner = child.lock();
        let is_dir = cinner.entry.is_dir();
        let new_full = join(&new_dir_name, new_name);

        let replaced_node = replaced.map(|ino| self.node(ino)).transpose()?;
        if let Some(node) = &replaced_node {
            let mut rinner = node.lock();
            match (is_dir, rinner.entry.is_dir()) {
                (true, false) => return Err(FsError::NotDirectory(new_full)),
                (false, true) => return Err(FsError::IsDirectory(new_full)),
                (true, true) if !rinner.children.is_empty() => return Err(FsError::DirectoryNotEmpty(new_full)),
                _ => {}
            }
            if rinner.state() == EntryState::Writable {
                remove_physical(&self.rw_path(&new_full), is_dir)?;
            }
            rinner.removed = true;
        }

        promote::clear_whiteout(&self.rw_path(&new_dir_name), new_name)?;
        fs::rename(self.rw_path(&cinner.entry.name), self.rw_path(&new_full))?;
        if cinner.from_layer {
            promote::write_whiteout(&self.rw_path(&old_dir_name), name)?;
        }

        old_guard.children.remove(name);
        let target_dir = match new_guard.as_mut() {
            Some(g) => &mut **g,
            None => &mut *old_guard,
        };
        target_dir.children.insert(new_name.to_string(), child_ino);
        if is_dir && parent != new_parent {
            target_dir.entry.num_link += 1;
            if replaced.is_some() {
                target_dir.entry.num_link -= 1;
            }
            old_guard.entry.num_link = old_guard.entry.num_link.saturating_sub(1);
        } else if is_dir && replaced.is_some() {
            old_guard.entry.num_link = old_guard.entry.num_link.saturating_sub(1);
        }

        cinner.parent = Some(new_parent);
        let old_full = std::mem::replace(&mut cinner.entry.name, new_full.clone());
        let descendants: Vec<u64> = cinner.children.values().copied().collect();
        drop(cinner);
        self.rename_subtree(descendants, &old_full, &new_full)?;
        debug!(image = %self.image, from = %old_full, to = %new_full, "entry renamed");
        Ok(())
    }

    fn rename_subtree(&self, mut pending: Vec<u64>, old: &str, new: &str) -> FsResult<()> {
        while let Some(ino) = pending.pop() {
            let node = self.node(ino)?;
            let mut inner = node.lock();
            if let Some(rest) = inner.entry.name.strip_prefix(old) {
                inner.entry.name = format!("{new}{rest}");
            }
            pending.extend(inner.children.values().copied());
        }
        Ok(())
    }

    /// Change attributes; waits for extraction and promotes first.
    pub fn setattr(&self, ino: u64, attr: &SetAttr) -> FsResult<FileAttr> {
        let node = self.live(ino)?;
        self.wait_ready(&node)?;
        if attr.is_empty() {
            return self.getattr(ino);
        }
        self.promote(ino)?;
        {
            let mut inner = node.lock();
            let path = self.rw_path(&inner.entry.name);
            if let Some(mode) = attr.mode {
                if inner.entry.kind != EntryKind::Symlink {
                    fs::set_permissions(&path, fs::Permissions::from_mode(mode & 0o7777))?;
                }
                inner.entry.mode = mode & 0o7777;
            }
            if attr.uid.is_some() || attr.gid.is_some() {
                std::os::unix::fs::lchown(&path, attr.uid, attr.gid)?;
                inner.entry.uid = attr.uid.unwrap_or(inner.entry.uid);
                inner.entry.gid = attr.gid.unwrap_or(inner.entry.gid);
            }
            if let Some(size) = attr.size {
                if inner.entry.is_dir() {
                    return Err(FsError::IsDirectory(inner.entry.name.clone()));
                }
                OpenOptions::new().write(true).open(&path)?.set_len(size)?;
                inner.entry.size = size;
            }
            if attr.atime.is_some() || attr.mtime.is_some() {
                promote::set_times(&path, attr.atime, attr.mtime)?;
                if attr.mtime.is_some() {
                    inner.entry.mod_time = attr.mtime;
                }
            }
        }
        self.getattr(ino)
    }

    pub fn setxattr(&self, ino: u64, name: &str, value: &[u8]) -> FsResult<()> {
        self.promote(ino)?;
        let node = self.live(ino)?;
        let mut inner = node.lock();
        promote::set_xattr(&self.rw_path(&inner.entry.name), name, value)?;
        inner.entry.xattrs.insert(name.to_string(), value.to_vec());
        Ok(())
    }

    pub fn removexattr(&self, ino: u64, name: &str) -> FsResult<()> {
        if !self.live(ino)?.lock().entry.xattrs.contains_key(name) {
            return Err(FsError::NoData(name.to_string()));
        }
        self.promote(ino)?;
        let node = self.live(ino)?;
        let mut inner = node.lock();
        promote::remove_xattr(&self.rw_path(&inner.entry.name), name)?;
        inner.entry.xattrs.remove(name);
        Ok(())
    }
}

fn remove_physical(path: &Path, dir: bool) -> FsResult<()> {
    // A writable directory only holds whiteout markers once its children are gone.
    let result = if dir { fs::remove_dir_all(path) } else { fs::remove_file(path) };
    match result {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}
