//! Consolidator.
//!
//! Folds several deltas into one body: identical content is stored once,
//! ordered by priority, and every referencing entry is pointed at that
//! single copy.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use tracing::{debug, info};

use super::blobs::BlobSource;
use super::delta::Delta;
use super::error::{MergeError, MergeResult};
use super::manifest::Manifest;
use crate::entry::Entry;
use crate::types::{BlobDigest, TIER_COUNT};

/// Paths whose content gates process start-up on common distributions.
pub const DEFAULT_PINNED_PATHS: [&str; 8] = [
    "etc/localtime",
    "etc/passwd",
    "etc/hosts",
    "etc/group",
    "etc/resolv.conf",
    "bin/dash",
    "bin/readlink",
    "etc/ld.so.cache",
];

/// Score given to pinned content; sorts ahead of every tier.
pub const PINNED_SCORE: f64 = -1.0;

/// Which paths skip the tier average and go first.
#[derive(Debug, Clone)]
pub struct PriorityPolicy {
    pinned: HashSet<String>,
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_PINNED_PATHS)
    }
}

impl PriorityPolicy {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self { pinned: paths.into_iter().map(|p| crate::entry::normalize(p.as_ref())).collect() }
    }

    pub fn is_pinned(&self, name: &str) -> bool {
        self.pinned.contains(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MemberRef {
    delta: usize,
    tier: usize,
    pos: usize,
}

/// Every entry sharing one content digest.
#[derive(Debug, Clone)]
struct Bucket {
    digest: String,
    members: Vec<MemberRef>,
    score: f64,
}

impl Bucket {
    fn new(digest: String, member: MemberRef, pinned: bool) -> Self {
        let score = if pinned { PINNED_SCORE } else { member.tier as f64 };
        Self { digest, members: vec![member], score }
    }

    fn add(&mut self, member: MemberRef, pinned: bool) {
        let count = self.members.len() as f64;
        self.members.push(member);
        if pinned {
            self.score = PINNED_SCORE;
        } else if self.score != PINNED_SCORE {
            self.score = (self.score * count + member.tier as f64) / (count + 1.0);
        }
    }
}

/// One contiguous piece of the output body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRange {
    /// 1-based index into the consolidated source list.
    pub source: i32,
    /// `(offset, length)` of each gzip member copied from the source blob.
    pub segments: Vec<(u64, u64)>,
    /// Start of the range in the body.
    pub offset: u64,
    pub compressed_size: u64,
}

impl OutputRange {
    pub fn end(&self) -> u64 {
        self.offset + self.compressed_size
    }
}

#[derive(Debug)]
pub struct Consolidator {
    sources: Vec<BlobDigest>,
    deltas: Vec<Delta>,
    buckets: Vec<Bucket>,
    by_digest: HashMap<String, usize>,
    policy: PriorityPolicy,
    strict_hash_check: bool,
    queue: Vec<OutputRange>,
    offsets: Vec<u64>,
    consolidated: bool,
}

impl Default for Consolidator {
    fn default() -> Self {
        Self::new(PriorityPolicy::default(), false)
    }
}

impl Consolidator {
    pub fn new(policy: PriorityPolicy, strict_hash_check: bool) -> Self {
        Self {
            sources: Vec::new(),
            deltas: Vec::new(),
            buckets: Vec::new(),
            by_digest: HashMap::new(),
            policy,
            strict_hash_check,
            queue: Vec::new(),
            offsets: Vec::new(),
            consolidated: false,
        }
    }

    /// Accumulate `deltas` and lay out the body in one go.
    pub fn consolidate(
        deltas: impl IntoIterator<Item = Delta>,
        policy: PriorityPolicy,
        strict_hash_check: bool,
    ) -> MergeResult<Self> {
        let mut c = Self::new(policy, strict_hash_check);
        for delta in deltas {
            c.add_delta(delta)?;
        }
        c.populate_offset()?;
        Ok(c)
    }

    /// Take ownership of a delta and index its content.
    ///
    /// Source indices are shifted past the layers of previously added deltas.
    /// Only entries that carry bytes join a dedup bucket.
    pub fn add_delta(&mut self, mut delta: Delta) -> MergeResult<()> {
        if self.consolidated || delta.is_consolidated() {
            return Err(MergeError::AlreadyConsolidated);
        }

        let shift = self.sources.len() as i32;
        let index = self.deltas.len();
        for (tier, entries) in delta.pool.iter_mut().enumerate() {
            for (pos, entry) in entries.iter_mut().enumerate() {
                entry.shift_source(shift);
                if !Delta::carries_bytes(entry) {
                    continue;
                }
                let member = MemberRef { delta: index, tier, pos };
                let pinned = self.policy.is_pinned(&entry.name);
                match self.by_digest.get(&entry.digest) {
                    Some(&b) => self.buckets[b].add(member, pinned),
                    None => {
                        self.by_digest.insert(entry.digest.clone(), self.buckets.len());
                        self.buckets.push(Bucket::new(entry.digest.clone(), member, pinned));
                    }
                }
            }
        }

        debug!(
            image = %delta.image,
            shift,
            layers = delta.digests.len(),
            unique = self.buckets.len(),
            "delta added to consolidator"
        );
        delta.set_consolidated();
        self.sources.extend(delta.digests.iter().cloned());
        self.deltas.push(delta);
        Ok(())
    }

    fn entry(&self, m: MemberRef) -> &Entry {
        &self.deltas[m.delta].pool[m.tier][m.pos]
    }

    fn compare(&self, a: &Bucket, b: &Bucket) -> Ordering {
        let (fa, fb) = (self.entry(a.members[0]), self.entry(b.members[0]));
        a.score
            .total_cmp(&b.score)
            .then_with(|| b.members.len().cmp(&a.members.len()))
            .then_with(|| fb.source.cmp(&fa.source))
            .then_with(|| fa.offset.cmp(&fb.offset))
            .then_with(|| a.digest.cmp(&b.digest))
    }

    /// Assign body offsets to every bucket and per-delta checkpoints.
    ///
    /// Checkpoint `t` of a delta is the end of the last range holding content
    /// of tier `t` or below for that delta. Runs once.
    pub fn populate_offset(&mut self) -> MergeResult<()> {
        if self.consolidated {
            return Err(MergeError::AlreadyConsolidated);
        }

        if self.strict_hash_check {
            for bucket in &self.buckets {
                let size = self.entry(bucket.members[0]).size;
                if bucket.members.iter().any(|m| self.entry(*m).size != size) {
                    return Err(MergeError::HashCollision(bucket.digest.clone()));
                }
            }
        }

        let mut order: Vec<usize> = (0..self.buckets.len()).collect();
        order.sort_by(|&a, &b| self.compare(&self.buckets[a], &self.buckets[b]));

        let mut checkpoints = vec![vec![0u64; TIER_COUNT]; self.deltas.len()];
        let mut queue = Vec::with_capacity(order.len());
        let mut offsets = Vec::with_capacity(order.len() + 1);
        let mut offset = 0u64;

        for b in order {
            let members = self.buckets[b].members.clone();
            let sample = self.entry(members[0]);
            let start = offset;
            let segments = sample.segments();
            let mut starts = Vec::with_capacity(segments.len());
            for (_, len) in &segments {
                starts.push(offset);
                offset += len;
            }
            queue.push(OutputRange {
                source: sample.source,
                segments,
                offset: start,
                compressed_size: offset - start,
            });
            offsets.push(start);

            for m in members {
                self.deltas[m.delta].pool[m.tier][m.pos].delta_offset = Some(starts.clone());
                let cp = &mut checkpoints[m.delta][m.tier];
                *cp = (*cp).max(offset);
            }
        }
        offsets.push(offset);

        for (delta, mut cps) in self.deltas.iter_mut().zip(checkpoints) {
            for t in 1..cps.len() {
                cps[t] = cps[t].max(cps[t - 1]);
            }
            delta.checkpoints = cps;
        }

        info!(
            deltas = self.deltas.len(),
            ranges = queue.len(),
            body_len = offset,
            "delta image consolidated"
        );
        self.queue = queue;
        self.offsets = offsets;
        self.consolidated = true;
        Ok(())
    }

    pub fn is_consolidated(&self) -> bool {
        self.consolidated
    }

    pub fn sources(&self) -> &[BlobDigest] {
        &self.sources
    }

    pub fn deltas(&self) -> &[Delta] {
        &self.deltas
    }

    pub fn queue(&self) -> &[OutputRange] {
        &self.queue
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// Dedup score of the content with `digest`, if any entry carries it.
    pub fn score(&self, digest: &str) -> Option<f64> {
        self.by_digest.get(digest).map(|&b| self.buckets[b].score)
    }

    pub fn unique_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn manifest(&self) -> MergeResult<Manifest> {
        if !self.consolidated {
            return Err(MergeError::NotConsolidated);
        }
        Ok(Manifest {
            sources: self.sources.clone(),
            deltas: self.deltas.clone(),
            offsets: self.offsets.clone(),
        })
    }

    /// Write the compressed manifest and return its size.
    pub fn write_header<W: Write>(&self, writer: W) -> MergeResult<u64> {
        let manifest = self.manifest()?;
        let size = manifest.write_to(writer)?;
        info!(header_size = size, "delta image header written");
        Ok(size)
    }

    /// Copy every output range from its source layer, in queue order.
    pub fn write_body<W: Write>(&self, blobs: &dyn BlobSource, mut writer: W) -> MergeResult<u64> {
        if !self.consolidated {
            return Err(MergeError::NotConsolidated);
        }
        let mut written = 0u64;
        for range in &self.queue {
            let layer = usize::try_from(range.source - 1)
                .ok()
                .and_then(|i| self.sources.get(i))
                .ok_or(MergeError::SourceOutOfRange(range.source))?;
            for &(offset, len) in &range.segments {
                let bytes = blobs.read_range(layer, offset, len)?;
                writer.write_all(&bytes)?;
                written += len;
            }
        }
        debug!(written, "delta image body written");
        Ok(written)
    }
}
