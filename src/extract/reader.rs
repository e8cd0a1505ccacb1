//! Stream reader.
//!
//! Parses the manifest at the head of a delta image, builds one template per
//! target image and then extracts the body range by range as it arrives.
//! Ranges decompress concurrently; their readiness signals are released
//! strictly in stream order so that checkpoint `t` of an image implies every
//! entry of tier `t` or below is on disk.

use flate2::read::MultiGzDecoder;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::error::{ExtractError, ExtractResult};
use super::layer::{LayerMeta, LayerStore};
use super::signal::{ReadyState, Readiness};
use super::template::{ExtractTarget, Template, TemplateBuilder};
use crate::fs::FsInstance;
use crate::merger::Manifest;
use crate::metrics::ExtractMetrics;
use crate::types::ImageRef;

#[derive(Debug, Clone)]
struct Landmark {
    image: ImageRef,
    tier: usize,
    checkpoint: u64,
    signal: Arc<Readiness>,
    /// Digests of every layer the image reads from.
    layers: Arc<HashSet<String>>,
}

impl Landmark {
    /// No layer of this image has a failed entry.
    fn intact(&self, failed_layers: &HashSet<String>) -> bool {
        self.layers.is_disjoint(failed_layers)
    }
}

/// Something released once the extraction pass reaches it.
#[derive(Debug, Clone)]
enum WaitPoint {
    Regular(ExtractTarget),
    Landmark(Landmark),
}

#[derive(Debug, Default)]
struct ExtractionPlan {
    zero: Vec<ExtractTarget>,
    early: Vec<Landmark>,
    ranges: Vec<Vec<WaitPoint>>,
    finals: Vec<Landmark>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Written(u64),
    Linked,
    Skipped,
}

type RangeResults = Vec<Result<Outcome, String>>;

enum Step {
    Range(usize, JoinHandle<RangeResults>),
    Abort(usize, String),
}

/// Counts from one extraction pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractSummary {
    pub written: usize,
    pub linked: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bytes: u64,
}

pub struct ImageReader {
    store: Arc<LayerStore>,
    manifest: Manifest,
    layers: Vec<Arc<LayerMeta>>,
    templates: Vec<Arc<Template>>,
    landmarks: HashMap<(ImageRef, usize), Arc<Readiness>>,
    plan: Mutex<Option<ExtractionPlan>>,
    done: Arc<Readiness>,
    metrics: Option<Arc<ExtractMetrics>>,
}

impl ImageReader {
    /// Parse a gzip-compressed manifest and prepare the templates.
    pub fn open(store: Arc<LayerStore>, manifest_gz: &[u8]) -> ExtractResult<Self> {
        let manifest = Manifest::decode(manifest_gz)?;
        Self::from_manifest(store, manifest)
    }

    /// Read exactly `header_size` bytes of manifest from the head of `reader`.
    ///
    /// The reader is left positioned at the start of the body.
    pub async fn from_stream<R>(store: Arc<LayerStore>, reader: &mut R, header_size: u64) -> ExtractResult<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = vec![0u8; header_size as usize];
        reader.read_exact(&mut header).await?;
        Self::open(store, &header)
    }

    pub fn from_manifest(store: Arc<LayerStore>, manifest: Manifest) -> ExtractResult<Self> {
        let mut layers = Vec::with_capacity(manifest.sources.len());
        for source in &manifest.sources {
            let layer = match store.find(&source.digest) {
                Some(layer) => layer,
                None => store.register(source, false)?,
            };
            layers.push(layer);
        }

        let mut builder = TemplateBuilder::new(&layers);
        let mut templates = Vec::with_capacity(manifest.deltas.len());
        for delta in &manifest.deltas {
            let template = builder.build(delta)?;
            if let Some(config) = template.config() {
                fs::write(store.config_path(template.image()), config)?;
            }
            templates.push(Arc::new(template));
        }

        let ranges: Vec<(u64, u64)> = manifest.ranges().collect();
        let mut plan = ExtractionPlan {
            zero: std::mem::take(&mut builder.zero),
            ranges: vec![Vec::new(); ranges.len()],
            ..Default::default()
        };
        for (offset, targets) in std::mem::take(&mut builder.by_offset) {
            let index = ranges
                .binary_search_by_key(&offset, |r| r.0)
                .map_err(|_| ExtractError::ExtractionFailed(format!("no output range starts at {offset}")))?;
            plan.ranges[index].extend(targets.into_iter().map(WaitPoint::Regular));
        }

        let mut landmarks = HashMap::new();
        for delta in &manifest.deltas {
            let image_layers: Arc<HashSet<String>> = Arc::new(
                delta
                    .entries()
                    .filter_map(|e| usize::try_from(e.source - 1).ok())
                    .filter_map(|i| manifest.sources.get(i))
                    .map(|d| d.digest.clone())
                    .collect(),
            );
            let last = delta.checkpoints.len().saturating_sub(1);
            for (tier, &checkpoint) in delta.checkpoints.iter().enumerate() {
                let landmark = Landmark {
                    image: delta.image.clone(),
                    tier,
                    checkpoint,
                    signal: Arc::new(Readiness::new()),
                    layers: image_layers.clone(),
                };
                landmarks.insert((delta.image.clone(), tier), landmark.signal.clone());

                if tier == last {
                    plan.finals.push(landmark);
                } else if checkpoint == 0 {
                    plan.early.push(landmark);
                } else if let Some(i) = ranges.iter().position(|r| r.1 >= checkpoint) {
                    plan.ranges[i].push(WaitPoint::Landmark(landmark));
                } else {
                    plan.finals.push(landmark);
                }
            }
        }

        info!(
            images = templates.len(),
            layers = layers.len(),
            ranges = ranges.len(),
            body_len = manifest.body_len(),
            "delta image received"
        );

        Ok(Self {
            store,
            manifest,
            layers,
            templates,
            landmarks,
            plan: Mutex::new(Some(plan)),
            done: Arc::new(Readiness::new()),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<ExtractMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn layers(&self) -> &[Arc<LayerMeta>] {
        &self.layers
    }

    pub fn images(&self) -> Vec<&ImageRef> {
        self.templates.iter().map(|t| t.image()).collect()
    }

    pub fn template(&self, image: &ImageRef) -> Option<Arc<Template>> {
        self.templates.iter().find(|t| t.image() == image).cloned()
    }

    pub fn image_config(&self, image: &ImageRef) -> Option<String> {
        self.template(image).and_then(|t| t.config().map(str::to_string))
    }

    /// Create an independent filesystem instance of `image` with its own
    /// writable directory.
    pub fn new_instance(&self, image: &ImageRef, id: &str, wait_timeout: Option<Duration>) -> ExtractResult<FsInstance> {
        let template = self.template(image).ok_or_else(|| ExtractError::ImageNotFound(image.to_string()))?;
        let rw_dir = self.store.new_rw_dir(id)?;
        debug!(image = %image, id, rw = %rw_dir.display(), "filesystem instance created");
        Ok(FsInstance::new(&template, rw_dir, wait_timeout))
    }

    /// Block until every entry of `tier` or below of `image` is on disk.
    pub async fn wait_checkpoint(&self, image: &ImageRef, tier: usize) -> ExtractResult<()> {
        let signal = self
            .landmarks
            .get(&(image.clone(), tier))
            .ok_or_else(|| ExtractError::CheckpointNotFound(image.to_string(), tier))?;
        match signal.wait().await {
            ReadyState::Ready => Ok(()),
            _ => Err(ExtractError::ExtractionFailed(format!("{image} tier {tier}"))),
        }
    }

    pub fn checkpoint_state(&self, image: &ImageRef, tier: usize) -> Option<ReadyState> {
        self.landmarks.get(&(image.clone(), tier)).map(|s| s.state())
    }

    pub async fn wait_complete(&self) -> ExtractResult<()> {
        match self.done.wait().await {
            ReadyState::Ready => Ok(()),
            _ => Err(ExtractError::ExtractionFailed("body incomplete".to_string())),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.done.state() == ReadyState::Ready
    }

    /// Consume the body and extract every range. Runs once per reader.
    ///
    /// Entries that cannot be written resolve their signal as failed; the
    /// rest of the pass carries on.
    pub async fn extract<R>(&self, mut body: R) -> ExtractResult<ExtractSummary>
    where
        R: AsyncRead + Unpin + Send,
    {
        let plan = self.plan.lock().take().ok_or(ExtractError::AlreadyStarted)?;
        let started = Instant::now();
        let mut summary = ExtractSummary::default();
        let mut failed_layers: HashSet<String> = HashSet::new();
        let mut aborted = false;

        let zero = plan.zero.clone();
        let zero_results = tokio::task::spawn_blocking(move || {
            zero.iter().map(|t| create_empty(t).map_err(|e| e.to_string())).collect::<RangeResults>()
        })
        .await
        .map_err(|e| ExtractError::ExtractionFailed(e.to_string()))?;
        for (target, result) in plan.zero.iter().zip(zero_results) {
            self.settle(target, result, &mut summary, &mut failed_layers);
        }
        for landmark in &plan.early {
            self.release(landmark, landmark.intact(&failed_layers));
        }

        let ranges: Vec<(u64, u64)> = self.manifest.ranges().collect();
        let mut work: Vec<Vec<ExtractTarget>> = plan
            .ranges
            .iter()
            .map(|points| {
                points
                    .iter()
                    .filter_map(|p| match p {
                        WaitPoint::Regular(t) => Some(t.clone()),
                        WaitPoint::Landmark(_) => None,
                    })
                    .collect()
            })
            .collect();

        let (tx, mut rx) = mpsc::channel::<Step>(16);

        let reading = async move {
            for (i, (start, end)) in ranges.into_iter().enumerate() {
                let mut buf = vec![0u8; (end - start) as usize];
                if let Err(e) = body.read_exact(&mut buf).await {
                    let _ = tx.send(Step::Abort(i, e.to_string())).await;
                    return;
                }
                let targets = std::mem::take(&mut work[i]);
                let task = tokio::task::spawn_blocking(move || extract_range(&buf, &targets));
                if tx.send(Step::Range(i, task)).await.is_err() {
                    return;
                }
            }
        };

        let releasing = async {
            while let Some(step) = rx.recv().await {
                match step {
                    Step::Range(i, task) => {
                        let points = &plan.ranges[i];
                        let results = task.await.unwrap_or_else(|e| {
                            let n = points.iter().filter(|p| matches!(p, WaitPoint::Regular(_))).count();
                            vec![Err(e.to_string()); n]
                        });
                        let mut results = results.into_iter();
                        for point in points {
                            match point {
                                WaitPoint::Regular(target) => {
                                    let result = results.next().unwrap_or_else(|| Err("no result".to_string()));
                                    self.settle(target, result, &mut summary, &mut failed_layers);
                                }
                                WaitPoint::Landmark(landmark) => {
                                    self.release(landmark, landmark.intact(&failed_layers))
                                }
                            }
                        }
                        if let Some(m) = &self.metrics {
                            m.ranges_total.inc();
                        }
                    }
                    Step::Abort(from, reason) => {
                        warn!(range = from, reason = %reason, "body stream ended early");
                        aborted = true;
                        for point in plan.ranges[from..].iter().flatten() {
                            match point {
                                WaitPoint::Regular(target) => {
                                    self.settle(target, Err(reason.clone()), &mut summary, &mut failed_layers)
                                }
                                WaitPoint::Landmark(landmark) => self.release(landmark, false),
                            }
                        }
                    }
                }
            }
        };

        tokio::join!(reading, releasing);

        let clean = summary.failed == 0 && !aborted;
        let mut seen = HashSet::new();
        for layer in &self.layers {
            let digest = &layer.digest().digest;
            if !seen.insert(digest.clone()) || failed_layers.contains(digest) {
                continue;
            }
            if layer.set_complete() {
                debug!(layer = %layer.digest(), "layer complete");
            }
        }
        // Each image's final tier depends only on its own layers.
        for landmark in &plan.finals {
            self.release(landmark, landmark.intact(&failed_layers));
        }
        self.done.resolve(clean);

        let elapsed = started.elapsed();
        if let Some(m) = &self.metrics {
            m.extraction_duration.observe(elapsed.as_secs_f64());
        }
        info!(
            written = summary.written,
            linked = summary.linked,
            skipped = summary.skipped,
            failed = summary.failed,
            bytes = summary.bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            "delta image extracted"
        );
        Ok(summary)
    }

    fn settle(
        &self,
        target: &ExtractTarget,
        result: Result<Outcome, String>,
        summary: &mut ExtractSummary,
        failed_layers: &mut HashSet<String>,
    ) {
        let outcome = match &result {
            Ok(Outcome::Written(bytes)) => {
                summary.written += 1;
                summary.bytes += bytes;
                if let Some(m) = &self.metrics {
                    m.bytes_total.inc_by(*bytes);
                }
                "written"
            }
            Ok(Outcome::Linked) => {
                summary.linked += 1;
                "linked"
            }
            Ok(Outcome::Skipped) => {
                summary.skipped += 1;
                "skipped"
            }
            Err(reason) => {
                warn!(name = %target.name, layer = %target.layer.digest(), reason = %reason, "extraction failed");
                summary.failed += 1;
                failed_layers.insert(target.layer.digest().digest.clone());
                "failed"
            }
        };
        if let Some(m) = &self.metrics {
            m.record_entry(outcome);
        }
        target.readiness.resolve(result.is_ok());
        trace!(name = %target.name, outcome, "entry settled");
    }

    fn release(&self, landmark: &Landmark, ok: bool) {
        if landmark.signal.resolve(ok) {
            info!(
                image = %landmark.image,
                tier = landmark.tier,
                checkpoint = landmark.checkpoint,
                ok,
                "checkpoint released"
            );
            if let Some(m) = &self.metrics {
                m.checkpoints_total.inc();
            }
        }
    }
}

/// Decompress one range and place it at every target that references it.
///
/// The first target gets the bytes; the others are hard links to it.
/// Targets in layers that are already complete are left alone.
fn extract_range(compressed: &[u8], targets: &[ExtractTarget]) -> RangeResults {
    let mut content: Option<Vec<u8>> = None;
    let mut first: Option<PathBuf> = None;
    targets
        .iter()
        .map(|t| place(compressed, t, &mut content, &mut first).map_err(|e| e.to_string()))
        .collect()
}

fn place(
    compressed: &[u8],
    target: &ExtractTarget,
    content: &mut Option<Vec<u8>>,
    first: &mut Option<PathBuf>,
) -> io::Result<Outcome> {
    if target.layer.is_complete() {
        if first.is_none() && target.path.is_file() {
            *first = Some(target.path.clone());
        }
        return Ok(Outcome::Skipped);
    }

    if let Some(source) = first.as_ref() {
        prepare(&target.path)?;
        fs::hard_link(source, &target.path)?;
        return Ok(Outcome::Linked);
    }

    if content.is_none() {
        let mut out = Vec::new();
        MultiGzDecoder::new(compressed).read_to_end(&mut out)?;
        *content = Some(out);
    }
    let data = content.as_deref().unwrap_or_default();
    write_file(&target.path, data, target.mode)?;
    *first = Some(target.path.clone());
    Ok(Outcome::Written(data.len() as u64))
}

fn create_empty(target: &ExtractTarget) -> io::Result<Outcome> {
    if target.layer.is_complete() {
        return Ok(Outcome::Skipped);
    }
    write_file(&target.path, &[], target.mode)?;
    Ok(Outcome::Written(0))
}

/// Make sure the parent exists and nothing occupies `path`.
fn prepare(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::symlink_metadata(path).is_ok() {
        fs::remove_file(path)?;
    }
    Ok(())
}

fn write_file(path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
    prepare(path)?;
    let mut file = fs::File::create(path)?;
    file.write_all(data)?;
    let mode = if mode & 0o7777 == 0 { 0o644 } else { mode & 0o7777 };
    file.set_permissions(fs::Permissions::from_mode(mode))?;
    Ok(())
}
