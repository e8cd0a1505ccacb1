use crate::types::{SOURCE_NONE, SOURCE_UNBOUND};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Digest of zero bytes, used by whiteout markers and empty files.
pub const EMPTY_FILE_DIGEST: &str =
    "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Estargz prefetch markers. They describe the source layer, not the image.
pub const PREFETCH_LANDMARKS: [&str; 2] = [".prefetch.landmark", ".no.prefetch.landmark"];

/// Name of the tree root.
pub const ROOT_NAME: &str = ".";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Dir,
    Reg,
    Symlink,
    Hardlink,
    Char,
    Block,
    Fifo,
}

/// One compressed piece of a large regular file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Chunk {
    /// Offset of the chunk's gzip member inside the source layer blob.
    pub offset: u64,
    #[serde(rename = "chunkOffset")]
    pub chunk_offset: u64,
    #[serde(rename = "chunkSize")]
    pub chunk_size: u64,
    #[serde(rename = "compressedSize")]
    pub compressed_size: u64,
    #[serde(rename = "chunkDigest", default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
}

/// A single filesystem object as recorded in a layer table or a delta.
///
/// The first block of fields describes the object itself. The trailing block
/// holds the annotations the merger adds while building and consolidating
/// deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub size: u64,
    #[serde(rename = "modtime", default, skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<DateTime<Utc>>,
    #[serde(rename = "linkName", default, skip_serializing_if = "String::is_empty")]
    pub link_name: String,
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(rename = "userName", default, skip_serializing_if = "String::is_empty")]
    pub user_name: String,
    #[serde(rename = "groupName", default, skip_serializing_if = "String::is_empty")]
    pub group_name: String,
    #[serde(rename = "devMajor", default, skip_serializing_if = "is_zero_u32")]
    pub dev_major: u32,
    #[serde(rename = "devMinor", default, skip_serializing_if = "is_zero_u32")]
    pub dev_minor: u32,
    #[serde(rename = "NumLink", default)]
    pub num_link: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub xattrs: BTreeMap<String, Vec<u8>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
    /// Offset of the file's gzip member inside the source layer blob.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub offset: u64,
    #[serde(rename = "compressedSize", default, skip_serializing_if = "is_zero_u64")]
    pub compressed_size: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<Chunk>,

    #[serde(rename = "lm", default, skip_serializing_if = "is_zero_usize")]
    pub landmark: usize,
    #[serde(rename = "s", default, skip_serializing_if = "is_zero_i32")]
    pub source: i32,
    #[serde(rename = "df", default, skip_serializing_if = "Option::is_none")]
    pub delta_offset: Option<Vec<u64>>,
    #[serde(rename = "md", default, skip_serializing_if = "is_false")]
    pub update_meta: bool,
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

fn is_zero_usize(v: &usize) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl Entry {
    fn bare(name: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            kind,
            size: 0,
            mod_time: None,
            link_name: String::new(),
            mode: 0,
            uid: 0,
            gid: 0,
            user_name: String::new(),
            group_name: String::new(),
            dev_major: 0,
            dev_minor: 0,
            num_link: 1,
            xattrs: BTreeMap::new(),
            digest: String::new(),
            offset: 0,
            compressed_size: 0,
            chunks: Vec::new(),
            landmark: 0,
            source: SOURCE_NONE,
            delta_offset: None,
            update_meta: false,
        }
    }

    pub fn root() -> Self {
        let mut e = Self::dir(ROOT_NAME);
        e.source = SOURCE_UNBOUND;
        e
    }

    pub fn dir(name: impl Into<String>) -> Self {
        let mut e = Self::bare(normalize(&name.into()), EntryKind::Dir);
        e.mode = 0o755;
        e.num_link = 2;
        e
    }

    /// Regular file whose content is stored as one gzip member at `offset`.
    pub fn file(
        name: impl Into<String>,
        digest: impl Into<String>,
        size: u64,
        offset: u64,
        compressed_size: u64,
    ) -> Self {
        let mut e = Self::bare(normalize(&name.into()), EntryKind::Reg);
        e.mode = 0o644;
        e.digest = digest.into();
        e.size = size;
        e.offset = offset;
        e.compressed_size = compressed_size;
        e
    }

    pub fn empty_file(name: impl Into<String>) -> Self {
        let mut e = Self::bare(normalize(&name.into()), EntryKind::Reg);
        e.digest = EMPTY_FILE_DIGEST.to_string();
        e
    }

    pub fn symlink(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut e = Self::bare(normalize(&name.into()), EntryKind::Symlink);
        e.mode = 0o777;
        e.link_name = target.into();
        e
    }

    pub fn hardlink(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut e = Self::bare(normalize(&name.into()), EntryKind::Hardlink);
        e.mode = 0o644;
        e.link_name = normalize(&target.into());
        e
    }

    pub fn device(name: impl Into<String>, kind: EntryKind, major: u32, minor: u32) -> Self {
        let mut e = Self::bare(normalize(&name.into()), kind);
        e.mode = 0o644;
        e.dev_major = major;
        e.dev_minor = minor;
        e
    }

    /// Marker hiding `base_name` inside `parent`.
    pub fn whiteout(parent: &str, base_name: &str) -> Self {
        Self::empty_file(join(parent, &format!("{WHITEOUT_PREFIX}{base_name}")))
    }

    /// Marker hiding every lower child of `parent`.
    pub fn opaque_whiteout(parent: &str) -> Self {
        Self::empty_file(join(parent, OPAQUE_WHITEOUT))
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    pub fn is_root(&self) -> bool {
        self.name == ROOT_NAME
    }

    /// Entries whose bytes live in a layer blob.
    pub fn is_data(&self) -> bool {
        self.kind == EntryKind::Reg
    }

    pub fn is_whiteout(&self) -> bool {
        self.base_name().starts_with(WHITEOUT_PREFIX)
    }

    pub fn is_opaque_whiteout(&self) -> bool {
        self.base_name() == OPAQUE_WHITEOUT
    }

    pub fn is_prefetch_landmark(&self) -> bool {
        PREFETCH_LANDMARKS.contains(&self.name.as_str())
    }

    pub fn base_name(&self) -> &str {
        base_name(&self.name)
    }

    pub fn parent_name(&self) -> &str {
        parent_name(&self.name)
    }

    /// Total compressed length of the entry's content, across chunks if any.
    pub fn content_length(&self) -> u64 {
        if self.chunks.is_empty() {
            self.compressed_size
        } else {
            self.chunks.iter().map(|c| c.compressed_size).sum()
        }
    }

    /// `(source offset, compressed length)` for each gzip member of the content.
    pub fn segments(&self) -> Vec<(u64, u64)> {
        if self.chunks.is_empty() {
            vec![(self.offset, self.compressed_size)]
        } else {
            self.chunks.iter().map(|c| (c.offset, c.compressed_size)).collect()
        }
    }

    pub fn same_content(&self, other: &Entry) -> bool {
        self.kind == other.kind && self.digest == other.digest
    }

    pub fn shift_source(&mut self, by: i32) {
        if self.source > 0 {
            self.source += by;
        }
    }

    /// Take metadata from `upper` while keeping this entry's content reference.
    ///
    /// Directories keep their own link count: it reflects the children that
    /// are actually attached in this tree.
    pub fn update_metadata_from(&mut self, upper: &Entry) {
        self.size = upper.size;
        self.mod_time = upper.mod_time;
        self.link_name = upper.link_name.clone();
        self.mode = upper.mode;
        self.uid = upper.uid;
        self.gid = upper.gid;
        self.user_name = upper.user_name.clone();
        self.group_name = upper.group_name.clone();
        self.dev_major = upper.dev_major;
        self.dev_minor = upper.dev_minor;
        self.xattrs = upper.xattrs.clone();
        if !self.is_dir() {
            self.num_link = upper.num_link;
        }
        self.landmark = self.landmark.min(upper.landmark);
    }
}

/// Strip leading `/`, `./` and trailing `/` so every path has one spelling.
pub fn normalize(name: &str) -> String {
    let trimmed = name.trim_start_matches("./").trim_matches('/');
    if trimmed.is_empty() || trimmed == "." { ROOT_NAME.to_string() } else { trimmed.to_string() }
}

pub fn base_name(name: &str) -> &str {
    name.rsplit_once('/').map(|(_, b)| b).unwrap_or(name)
}

pub fn parent_name(name: &str) -> &str {
    if name == ROOT_NAME {
        return ROOT_NAME;
    }
    name.rsplit_once('/').map(|(p, _)| p).unwrap_or(ROOT_NAME)
}

pub fn join(parent: &str, base: &str) -> String {
    if parent == ROOT_NAME || parent.is_empty() {
        base.to_string()
    } else {
        format!("{parent}/{base}")
    }
}
