//! Integration tests for consolidating deltas into one delta image

mod common;

use common::{LayerBuilder, Registry, gzip};
use deltabox::entry::Entry;
use deltabox::merger::{Consolidator, Delta, DirBlobs, Manifest, Overlay, PINNED_SCORE, PriorityPolicy};
use deltabox::types::{BlobDigest, ImageRef};
use flate2::read::GzDecoder;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Read;

fn gunzip(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut out).unwrap();
    out
}

#[tokio::test]
async fn test_shared_content_is_shipped_once() {
    let mut registry = Registry::new();
    let web = registry.add_image(
        "web:1",
        &[LayerBuilder::new()
            .dir("usr")
            .file("usr/libc.so", b"shared libc bytes")
            .file("usr/nginx", b"nginx binary")
            .build()],
        None,
    );
    let api = registry.add_image(
        "api:1",
        &[LayerBuilder::new()
            .dir("lib")
            .file("lib/libc.so", b"shared libc bytes")
            .file("lib/api", b"api binary")
            .build()],
        None,
    );

    let packed = registry.pack(&[(None, &web), (None, &api)]).await;
    let c = &packed.consolidator;

    assert_eq!(c.sources().len(), 2);
    assert_eq!(c.unique_count(), 3);
    assert_eq!(c.queue().len(), 3);

    let manifest = Manifest::decode(&packed.header).unwrap();
    assert_eq!(manifest.body_len(), packed.body.len() as u64);

    let shipped: BTreeSet<Vec<u8>> =
        manifest.ranges().map(|(s, e)| gunzip(&packed.body[s as usize..e as usize])).collect();
    let expected: BTreeSet<Vec<u8>> =
        [&b"shared libc bytes"[..], b"nginx binary", b"api binary"].iter().map(|b| b.to_vec()).collect();
    assert_eq!(shipped, expected);

    let web_libc = c.deltas()[0].entries().find(|e| e.name == "usr/libc.so").unwrap();
    let api_libc = c.deltas()[1].entries().find(|e| e.name == "lib/libc.so").unwrap();
    assert_eq!(web_libc.delta_offset, api_libc.delta_offset);
    assert_eq!(api_libc.source, 2);
}

#[tokio::test]
async fn test_pinned_content_leads_the_body() {
    let mut registry = Registry::new();
    let image = registry.add_image(
        "app:1",
        &[LayerBuilder::new()
            .dir("bin")
            .file_at_tier("bin/app", b"hot binary", 0)
            .dir("etc")
            .file_at_tier("etc/passwd", b"root:x:0:0::/root:/bin/sh\n", 2)
            .build()],
        None,
    );

    let packed = registry.pack(&[(None, &image)]).await;
    let c = &packed.consolidator;
    let passwd = c.deltas()[0].entries().find(|e| e.name == "etc/passwd").unwrap();

    assert_eq!(c.score(&passwd.digest), Some(PINNED_SCORE));
    assert_eq!(passwd.delta_offset, Some(vec![0]));
    assert_eq!(gunzip(&packed.body[..c.offsets()[1] as usize]), b"root:x:0:0::/root:/bin/sh\n");
}

#[tokio::test]
async fn test_tier_average_orders_shared_content() {
    let mut registry = Registry::new();
    // Shared by a tier-0 and a tier-2 entry: average 1.0, behind a pure tier-0 file.
    let a = registry.add_image(
        "a:1",
        &[LayerBuilder::new().file_at_tier("shared", b"shared", 0).file_at_tier("urgent", b"urgent", 0).build()],
        None,
    );
    let b = registry.add_image("b:1", &[LayerBuilder::new().file_at_tier("copy", b"shared", 2).build()], None);

    let packed = registry.pack(&[(None, &a), (None, &b)]).await;
    let c = &packed.consolidator;
    let shared = c.deltas()[0].entries().find(|e| e.name == "shared").unwrap();
    let urgent = c.deltas()[0].entries().find(|e| e.name == "urgent").unwrap();

    assert_eq!(c.score(&shared.digest), Some(1.0));
    assert_eq!(urgent.delta_offset, Some(vec![0]));
    assert!(shared.delta_offset.as_ref().unwrap()[0] > 0);

    let a_cps = &c.deltas()[0].checkpoints;
    let b_cps = &c.deltas()[1].checkpoints;
    assert_eq!(a_cps[0], c.offsets()[2]);
    assert_eq!(b_cps[0], 0);
    assert_eq!(b_cps[2], c.offsets()[2]);
}

#[tokio::test]
async fn test_upgrade_ships_only_new_content() {
    let mut registry = Registry::new();
    let base_layer = LayerBuilder::new().dir("etc").file("etc/os-release", b"ID=debian\n").build();
    let base = registry.add_image("debian:12", &[base_layer.clone()], None);
    let app = registry.add_image(
        "app:1",
        &[base_layer, LayerBuilder::new().dir("srv").file("srv/app", b"app").build()],
        Some(r#"{"Cmd":["/srv/app"]}"#),
    );

    let packed = registry.pack(&[(Some(&base), &app)]).await;
    let manifest = Manifest::decode(&packed.header).unwrap();

    assert_eq!(manifest.range_count(), 1);
    assert_eq!(gunzip(&packed.body), b"app");
    assert_eq!(manifest.deltas[0].config.as_deref(), Some(r#"{"Cmd":["/srv/app"]}"#));
    assert_eq!(manifest.sources.len(), 3);
}

#[test]
fn test_body_from_layer_directory() {
    let dir = tempfile::tempdir().unwrap();
    let member = gzip(b"from disk");
    std::fs::write(dir.path().join("abcd"), &member).unwrap();

    let mut overlay = Overlay::new();
    overlay
        .add_layer(
            BlobDigest::new("sha256:abcd", "disk"),
            vec![Entry::file("f", "sha256:f", 9, 0, member.len() as u64)],
        )
        .unwrap();
    overlay.set_image(ImageRef::new("disk", "1"));

    let c = Consolidator::consolidate([Delta::diff(&Overlay::new(), &overlay)], PriorityPolicy::default(), false)
        .unwrap();
    let mut body = Vec::new();
    let written = c.write_body(&DirBlobs::new(dir.path()), &mut body).unwrap();

    assert_eq!(written, member.len() as u64);
    assert_eq!(gunzip(&body), b"from disk");
}

#[test]
fn test_missing_layer_blob_fails_body() {
    let dir = tempfile::tempdir().unwrap();
    let mut overlay = Overlay::new();
    overlay.add_layer(BlobDigest::new("sha256:gone", "disk"), vec![Entry::file("f", "sha256:f", 1, 0, 21)]).unwrap();

    let c = Consolidator::consolidate([Delta::diff(&Overlay::new(), &overlay)], PriorityPolicy::default(), false)
        .unwrap();
    assert!(c.write_body(&DirBlobs::new(dir.path()), Vec::new()).is_err());
}

/// `(path index, content index, tier)` per file of one image.
fn images_strategy() -> impl Strategy<Value = Vec<Vec<(usize, usize, usize)>>> {
    prop::collection::vec(prop::collection::vec((0usize..6, 0usize..5, 0usize..3), 0..6), 1..4)
}

fn deltas_from(images: &[Vec<(usize, usize, usize)>]) -> Vec<Delta> {
    images
        .iter()
        .enumerate()
        .map(|(i, files)| {
            let mut table: BTreeMap<usize, Entry> = BTreeMap::new();
            let mut offset = 0;
            for &(path, content, tier) in files {
                let size = 10 + content as u64;
                let mut e = Entry::file(format!("f{path}"), format!("sha256:c{content}"), content as u64 + 1, offset, size);
                e.landmark = tier;
                offset += size;
                table.insert(path, e);
            }
            let mut overlay = Overlay::new();
            overlay.add_layer(BlobDigest::new(format!("sha256:l{i}"), format!("img{i}")), table.into_values().collect()).unwrap();
            overlay.set_image(ImageRef::new(format!("img{i}"), "1"));
            Delta::diff(&Overlay::new(), &overlay)
        })
        .collect()
}

proptest! {
    #[test]
    fn prop_each_digest_is_stored_once(images in images_strategy()) {
        let c = Consolidator::consolidate(deltas_from(&images), PriorityPolicy::new(["f0"]), true).unwrap();

        let digests: BTreeSet<&str> = c
            .deltas()
            .iter()
            .flat_map(|d| d.entries())
            .filter(|e| Delta::carries_bytes(e))
            .map(|e| e.digest.as_str())
            .collect();
        prop_assert_eq!(c.unique_count(), digests.len());
        prop_assert_eq!(c.queue().len(), digests.len());

        let mut placed: HashMap<&str, &Option<Vec<u64>>> = HashMap::new();
        for e in c.deltas().iter().flat_map(|d| d.entries()).filter(|e| Delta::carries_bytes(e)) {
            prop_assert!(e.delta_offset.is_some());
            let first = *placed.entry(e.digest.as_str()).or_insert(&e.delta_offset);
            prop_assert_eq!(first, &e.delta_offset);
        }
    }

    #[test]
    fn prop_layout_is_contiguous_and_checkpoints_monotonic(images in images_strategy()) {
        let c = Consolidator::consolidate(deltas_from(&images), PriorityPolicy::default(), false).unwrap();

        let offsets = c.offsets();
        prop_assert_eq!(offsets.len(), c.queue().len() + 1);
        prop_assert_eq!(offsets[0], 0);
        for (range, next) in c.queue().iter().zip(&offsets[1..]) {
            prop_assert_eq!(range.end(), *next);
        }

        let body_len = *offsets.last().unwrap();
        for delta in c.deltas() {
            prop_assert_eq!(delta.checkpoints.len(), 3);
            prop_assert!(delta.checkpoints.windows(2).all(|w| w[0] <= w[1]));
            prop_assert!(delta.checkpoints[2] <= body_len);
            for (tier, entries) in delta.pool.iter().enumerate() {
                for e in entries.iter().filter(|e| Delta::carries_bytes(e)) {
                    let start = e.delta_offset.as_ref().unwrap()[0];
                    prop_assert!(start + e.content_length() <= delta.checkpoints[tier]);
                }
            }
        }
    }
}
