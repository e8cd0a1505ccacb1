use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use super::delta::Delta;
use super::error::MergeResult;
use crate::types::BlobDigest;

/// Table of contents at the head of a delta image.
///
/// `offsets` holds the start of every output range followed by the body
/// length, so range `i` spans `offsets[i]..offsets[i + 1]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "source", default)]
    pub sources: Vec<BlobDigest>,
    #[serde(rename = "delta", default)]
    pub deltas: Vec<Delta>,
    #[serde(default)]
    pub offsets: Vec<u64>,
}

impl Manifest {
    /// Gzip-compressed JSON, as written in front of the body.
    pub fn encode(&self) -> MergeResult<Vec<u8>> {
        let mut gz = GzEncoder::new(Vec::new(), Compression::best());
        serde_json::to_writer(&mut gz, self)?;
        Ok(gz.finish()?)
    }

    pub fn decode(bytes: &[u8]) -> MergeResult<Self> {
        let mut json = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut json)?;
        Ok(serde_json::from_slice(&json)?)
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> MergeResult<u64> {
        let bytes = self.encode()?;
        writer.write_all(&bytes)?;
        Ok(bytes.len() as u64)
    }

    /// Total length of the body that follows the manifest.
    pub fn body_len(&self) -> u64 {
        self.offsets.last().copied().unwrap_or(0)
    }

    /// `(start, end)` of every output range, in stream order.
    pub fn ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.offsets.windows(2).map(|w| (w[0], w[1]))
    }

    pub fn range_count(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }
}
