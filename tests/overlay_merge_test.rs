//! Integration tests for stacking layers into an overlay
//!
//! Layers come from an in-memory catalog, the same way a registry-backed
//! catalog would hand them out.

mod common;

use common::{LayerBuilder, Registry};
use deltabox::entry::{Entry, EntryKind};
use deltabox::merger::{MemoryCatalog, MergeError, Overlay};
use deltabox::types::{BlobDigest, ImageRef};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

#[tokio::test]
async fn test_whiteout_removes_lower_file() {
    let mut registry = Registry::new();
    let base = LayerBuilder::new()
        .dir("etc")
        .file("etc/hosts", b"127.0.0.1 localhost\n")
        .file("etc/motd", b"hello\n")
        .build();
    let upper = LayerBuilder::new().dir("etc").whiteout("etc", "motd").build();
    let image = registry.add_image("app:1", &[base, upper], None);

    let overlay = registry.overlay(&image).await;

    assert!(overlay.get("etc/hosts").is_some());
    assert!(overlay.get("etc/motd").is_none());
    assert!(overlay.get("etc/.wh.motd").is_none());
    assert_eq!(overlay.digests().len(), 2);
}

#[tokio::test]
async fn test_whiteout_of_directory_removes_subtree() {
    let mut registry = Registry::new();
    let base = LayerBuilder::new()
        .dir("var")
        .dir("var/log")
        .file("var/log/boot.log", b"booted\n")
        .dir("var/log/apt")
        .file("var/log/apt/history.log", b"install\n")
        .build();
    let upper = LayerBuilder::new().dir("var").whiteout("var", "log").build();
    let image = registry.add_image("app:1", &[base, upper], None);

    let overlay = registry.overlay(&image).await;
    let names: Vec<String> = overlay.entries().into_keys().collect();

    assert_eq!(names, vec![".".to_string(), "var".to_string()]);
}

#[tokio::test]
async fn test_opaque_marker_hides_lower_children() {
    let mut registry = Registry::new();
    let base = LayerBuilder::new()
        .dir("var")
        .dir("var/cache")
        .file("var/cache/a", b"old a\n")
        .file("var/cache/b", b"old b\n")
        .build();
    let upper = LayerBuilder::new()
        .dir("var")
        .dir("var/cache")
        .opaque("var/cache")
        .file("var/cache/c", b"fresh c\n")
        .build();
    let image = registry.add_image("app:1", &[base, upper], None);

    let overlay = registry.overlay(&image).await;

    assert!(overlay.get("var/cache").is_some());
    assert!(overlay.get("var/cache/a").is_none());
    assert!(overlay.get("var/cache/b").is_none());
    assert_eq!(overlay.get("var/cache/c").unwrap().source, 2);
    assert!(overlay.get("var/cache/.wh..wh..opq").is_none());
}

#[tokio::test]
async fn test_type_change_replaces_subtree() {
    let mut registry = Registry::new();
    let base = LayerBuilder::new().dir("opt").dir("opt/tool").file("opt/tool/bin", b"#!/bin/sh\n").build();
    let upper = LayerBuilder::new().dir("opt").symlink("opt/tool", "/usr/local/tool").build();
    let image = registry.add_image("app:1", &[base, upper], None);

    let overlay = registry.overlay(&image).await;

    let tool = overlay.get("opt/tool").unwrap();
    assert_eq!(tool.kind, EntryKind::Symlink);
    assert_eq!(tool.link_name, "/usr/local/tool");
    assert!(overlay.get("opt/tool/bin").is_none());
}

#[tokio::test]
async fn test_same_content_only_refreshes_metadata() {
    let mut registry = Registry::new();
    let base = LayerBuilder::new().dir("etc").file("etc/hosts", b"127.0.0.1 localhost\n").build();
    let mut chmod = base.entries[1].clone();
    chmod.mode = 0o600;
    chmod.offset = 0;
    chmod.compressed_size = 0;
    let upper = LayerBuilder::new().dir("etc").entry(chmod).build();
    let image = registry.add_image("app:1", &[base.clone(), upper], None);

    let overlay = registry.overlay(&image).await;
    let hosts = overlay.get("etc/hosts").unwrap();

    assert_eq!(hosts.mode, 0o600);
    assert_eq!(hosts.source, 1);
    assert_eq!(hosts.offset, base.entries[1].offset);
    assert_eq!(hosts.compressed_size, base.entries[1].compressed_size);
}

#[tokio::test]
async fn test_prefetch_landmarks_are_skipped() {
    let mut registry = Registry::new();
    let layer = LayerBuilder::new()
        .file(".prefetch.landmark", b"x")
        .file(".no.prefetch.landmark", b"y")
        .dir("bin")
        .build();
    let image = registry.add_image("app:1", &[layer], None);

    let overlay = registry.overlay(&image).await;

    assert!(overlay.get(".prefetch.landmark").is_none());
    assert!(overlay.get(".no.prefetch.landmark").is_none());
    assert!(overlay.get("bin").is_some());
}

#[tokio::test]
async fn test_config_passthrough() {
    let mut registry = Registry::new();
    let layer = LayerBuilder::new().dir("bin").build();
    let config = r#"{"config":{"Entrypoint":["/bin/sh"]}}"#;
    let image = registry.add_image("app:1", &[layer], Some(config));

    let overlay = registry.overlay(&image).await;

    assert_eq!(overlay.config(), Some(config));
    assert_eq!(overlay.image(), Some(&image));
}

#[tokio::test]
async fn test_missing_image_is_bucket_not_found() {
    let catalog = MemoryCatalog::new();
    let err = Overlay::build(&catalog, &ImageRef::parse("ghost:1")).await.unwrap_err();
    assert!(matches!(err, MergeError::BucketNotFound(ref name) if name == "ghost:1"));
}

#[tokio::test]
async fn test_orphan_entry_rejects_whole_layer() {
    let mut registry = Registry::new();
    let image = registry.add_image("app:1", &[LayerBuilder::new().dir("bin").build()], None);
    let mut overlay = registry.overlay(&image).await;
    let before = overlay.entries();

    let err = overlay
        .add_layer(
            BlobDigest::new("sha256:dd", "app"),
            vec![Entry::dir("lib"), Entry::file("missing/parent/x", "sha256:1", 1, 0, 1)],
        )
        .unwrap_err();

    assert!(matches!(err, MergeError::EntryNotFound(_)));
    assert_eq!(overlay.digests().len(), 1);
    assert_eq!(overlay.entries(), before);
}

#[tokio::test]
async fn test_layer_missing_from_catalog() {
    use async_trait::async_trait;
    use deltabox::merger::LayerCatalog;

    struct HalfCatalog;

    #[async_trait]
    impl LayerCatalog for HalfCatalog {
        async fn image_layers(&self, _image: &ImageRef) -> anyhow::Result<Option<Vec<String>>> {
            Ok(Some(vec!["sha256:gone".to_string()]))
        }

        async fn layer_entries(&self, _layer: &BlobDigest) -> anyhow::Result<Option<Vec<Entry>>> {
            Ok(None)
        }

        async fn image_config(&self, _image: &ImageRef) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
    }

    let err = Overlay::build(&HalfCatalog, &ImageRef::parse("app:1")).await.unwrap_err();
    assert!(matches!(err, MergeError::LayerNotFound(ref l) if l.contains("sha256:gone")));
}

#[tokio::test]
async fn test_two_images_stack_on_one_overlay() {
    let mut registry = Registry::new();
    let base = registry.add_image(
        "base:1",
        &[LayerBuilder::new().dir("etc").file("etc/os-release", b"ID=base\n").build()],
        None,
    );
    let app = registry.add_image(
        "app:1",
        &[LayerBuilder::new().dir("srv").file("srv/app", b"binary").build()],
        None,
    );

    let mut overlay = registry.overlay(&base).await;
    overlay.add_image(&registry.catalog, &app).await.unwrap();

    assert_eq!(overlay.get("etc/os-release").unwrap().source, 1);
    assert_eq!(overlay.get("srv/app").unwrap().source, 2);
    assert_eq!(overlay.image(), Some(&app));
}

/// The `p` section of the TOC dump with layer indices dropped.
fn toc_without_sources(overlay: &Overlay) -> serde_json::Value {
    let mut toc = Vec::new();
    overlay.export_toc(&mut toc).unwrap();
    let mut value: serde_json::Value = serde_json::from_slice(&toc).unwrap();
    let mut entries = value["p"].take();
    for entry in entries.as_object_mut().unwrap().values_mut() {
        entry.as_object_mut().unwrap().remove("s");
    }
    entries
}

#[test]
fn test_opaque_layer_merged_twice_matches_once() {
    let base = LayerBuilder::new()
        .dir("var")
        .dir("var/cache")
        .file("var/cache/a", b"old a\n")
        .file("var/cache/b", b"old b\n")
        .build();
    let upper = LayerBuilder::new()
        .dir("var")
        .dir("var/cache")
        .opaque("var/cache")
        .file("var/cache/c", b"fresh c\n")
        .dir("var/cache/sub")
        .file("var/cache/sub/d", b"fresh d\n")
        .build();

    let mut overlay = Overlay::new();
    overlay.add_layer(BlobDigest::new(base.digest.clone(), "app"), base.entries.clone()).unwrap();
    overlay.add_layer(BlobDigest::new(upper.digest.clone(), "app"), upper.entries.clone()).unwrap();
    let once = overlay.clone();
    overlay.add_layer(BlobDigest::new(upper.digest.clone(), "app"), upper.entries.clone()).unwrap();

    assert_eq!(toc_without_sources(&overlay), toc_without_sources(&once));
    assert!(overlay.get("var/cache/a").is_none());
    assert_eq!(overlay.get("var/cache/c").unwrap().source, 3);
    assert_eq!(overlay.get("var/cache").unwrap().num_link, 3);
}

fn ensure_dirs(table: &mut BTreeMap<String, Entry>, path: &str) {
    let mut prefix = String::new();
    for part in path.split('/') {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(part);
        table.entry(prefix.clone()).or_insert_with(|| Entry::dir(prefix.clone()));
    }
}

const DIRS: [&str; 3] = ["a", "a/b", "c"];
const FILES: [&str; 5] = ["a/f1", "a/b/f2", "c/f3", "f4", "a/b/f5"];

/// One layer operation: `(target, variant)`.
///
/// Files (targets 0..5): variant 0/1 writes one of two contents, 2 whites it out.
/// Directories (targets 5..8): 0 creates it, 1 marks it opaque, 2 whites it out.
fn layer_entries(ops: &[(usize, u8)]) -> Vec<Entry> {
    let mut table: BTreeMap<String, Entry> = BTreeMap::new();
    for &(target, variant) in ops {
        if target < FILES.len() {
            let path = FILES[target];
            let (parent, base) = path.rsplit_once('/').unwrap_or((".", path));
            if parent != "." {
                ensure_dirs(&mut table, parent);
            }
            let entry = match variant {
                0 | 1 => Entry::file(path, format!("sha256:v{variant}"), 2, 0, 2),
                _ => Entry::whiteout(parent, base),
            };
            table.insert(entry.name.clone(), entry);
        } else {
            let dir = DIRS[target - FILES.len()];
            match variant {
                0 => ensure_dirs(&mut table, dir),
                1 => {
                    ensure_dirs(&mut table, dir);
                    let marker = Entry::opaque_whiteout(dir);
                    table.insert(marker.name.clone(), marker);
                }
                _ => {
                    let (parent, base) = dir.rsplit_once('/').unwrap_or((".", dir));
                    if parent != "." {
                        ensure_dirs(&mut table, parent);
                    }
                    let marker = Entry::whiteout(parent, base);
                    table.insert(marker.name.clone(), marker);
                }
            }
        }
    }
    table.into_values().collect()
}

fn build(layers: &[Vec<Entry>]) -> Overlay {
    let mut overlay = Overlay::new();
    for (i, entries) in layers.iter().enumerate() {
        overlay.add_layer(BlobDigest::new(format!("sha256:l{i}"), "prop"), entries.clone()).unwrap();
    }
    overlay
}

fn layers_strategy() -> impl Strategy<Value = Vec<Vec<Entry>>> {
    prop::collection::vec(prop::collection::vec((0usize..8, 0u8..3), 1..6), 1..5)
        .prop_map(|layers| layers.iter().map(|ops| layer_entries(ops)).collect())
}

proptest! {
    #[test]
    fn prop_merge_is_deterministic(layers in layers_strategy()) {
        let first = build(&layers).entries();
        let second = build(&layers).entries();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_reapplying_top_layer_changes_nothing(layers in layers_strategy()) {
        let once = build(&layers);
        let mut twice = once.clone();
        let top = layers.last().unwrap().clone();
        twice.add_layer(BlobDigest::new("sha256:again", "prop"), top).unwrap();
        prop_assert_eq!(toc_without_sources(&twice), toc_without_sources(&once));
    }

    #[test]
    fn prop_merged_tree_is_closed(layers in layers_strategy()) {
        let entries = build(&layers).entries();
        let names: BTreeSet<&String> = entries.keys().collect();
        for (name, entry) in &entries {
            prop_assert!(!entry.is_whiteout(), "whiteout {} leaked into the tree", name);
            if name != "." {
                let parent = entry.parent_name().to_string();
                prop_assert!(names.contains(&parent), "{} has no parent", name);
                prop_assert!(entries[&parent].is_dir());
            }
        }
    }
}
