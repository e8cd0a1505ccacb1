use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest priority tier index. Tiers run from 0 (most urgent) to `MAX_LANDMARK`.
pub const MAX_LANDMARK: usize = 2;

/// Number of priority tiers carried by every delta.
pub const TIER_COUNT: usize = MAX_LANDMARK + 1;

/// Source index for entries that do not come from any layer (the synthetic root).
pub const SOURCE_UNBOUND: i32 = -1;

/// Source index reserved for entries created locally.
pub const SOURCE_NONE: i32 = 0;

/// Reference to an image by name and tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageRef {
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self { name: name.into(), tag: tag.into() }
    }

    /// Parse `name:tag`; the tag defaults to `latest`.
    pub fn parse(s: &str) -> Self {
        match s.rsplit_once(':') {
            Some((name, tag)) if !name.is_empty() && !tag.contains('/') => Self::new(name, tag),
            _ => Self::new(s, "latest"),
        }
    }

    /// File-name friendly form used for on-disk artefacts.
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.name.replace('/', "_"), self.tag)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// A compressed layer blob together with the image it was pulled for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobDigest {
    #[serde(rename = "hash")]
    pub digest: String,
    #[serde(rename = "img")]
    pub image: String,
}

impl BlobDigest {
    pub fn new(digest: impl Into<String>, image: impl Into<String>) -> Self {
        Self { digest: digest.into(), image: image.into() }
    }

    /// Hex part of the digest (`sha256:abcd` -> `abcd`).
    pub fn hex(&self) -> &str {
        self.digest.split_once(':').map(|(_, h)| h).unwrap_or(&self.digest)
    }
}

impl fmt::Display for BlobDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.image, self.digest)
    }
}
