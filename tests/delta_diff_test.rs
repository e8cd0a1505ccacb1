//! Integration tests for diffing two overlays
//!
//! The property at the bottom replays a delta on top of its base tree and
//! checks that the result is exactly the target tree.

mod common;

use common::{LayerBuilder, Registry};
use deltabox::entry::{Entry, EntryKind, OPAQUE_WHITEOUT, WHITEOUT_PREFIX, join};
use deltabox::merger::{AccessRanks, Delta, Overlay};
use deltabox::types::BlobDigest;
use proptest::prelude::*;
use std::collections::BTreeMap;

fn by_name<'a>(delta: &'a Delta, name: &str) -> Vec<&'a Entry> {
    delta.entries().filter(|e| e.name == name).collect()
}

#[tokio::test]
async fn test_upgrade_keeps_unchanged_files_as_metadata() {
    let mut registry = Registry::new();
    let base_layer = LayerBuilder::new()
        .dir("etc")
        .file("etc/hosts", b"127.0.0.1 localhost\n")
        .file("etc/issue", b"Debian 12\n")
        .build();
    let app_layer = LayerBuilder::new().dir("srv").file("srv/server", b"\x7fELF server").build();
    let base = registry.add_image("debian:12", &[base_layer.clone()], None);
    let app = registry.add_image("server:1", &[base_layer, app_layer], None);

    let delta = Delta::diff(&registry.overlay(&base).await, &registry.overlay(&app).await);

    assert_eq!(delta.digests.len(), 3);
    assert_eq!(delta.base_len(), 1);

    let hosts = by_name(&delta, "etc/hosts");
    assert_eq!(hosts.len(), 1);
    assert!(hosts[0].update_meta);
    assert_eq!(hosts[0].source, 1);
    assert!(!Delta::carries_bytes(hosts[0]));

    let server = by_name(&delta, "srv/server");
    assert_eq!(server.len(), 1);
    assert!(!server[0].update_meta);
    assert_eq!(server[0].source, 3);
    assert!(Delta::carries_bytes(server[0]));

    assert!(delta.entries().all(|e| e.name != "."));
    assert!(delta.entries().all(|e| !e.is_whiteout()));
}

#[tokio::test]
async fn test_emptied_cache_ships_one_opaque_marker() {
    let mut registry = Registry::new();
    let old = registry.add_image(
        "app:1",
        &[LayerBuilder::new()
            .dir("var")
            .dir("var/cache")
            .file("var/cache/pkg1", b"one")
            .file("var/cache/pkg2", b"two")
            .build()],
        None,
    );
    let new = registry.add_image("app:2", &[LayerBuilder::new().dir("var").dir("var/cache").build()], None);

    let delta = Delta::diff(&registry.overlay(&old).await, &registry.overlay(&new).await);
    let markers: Vec<&str> = delta.entries().filter(|e| e.is_whiteout()).map(|e| e.name.as_str()).collect();

    assert_eq!(markers, vec![format!("var/cache/{OPAQUE_WHITEOUT}")]);
}

#[tokio::test]
async fn test_dir_replaced_by_file_ships_only_the_file() {
    let mut registry = Registry::new();
    let old = registry.add_image(
        "app:1",
        &[LayerBuilder::new().dir("conf").file("conf/a", b"a").file("conf/b", b"b").build()],
        None,
    );
    let new = registry.add_image("app:2", &[LayerBuilder::new().file("conf", b"flat config").build()], None);

    let delta = Delta::diff(&registry.overlay(&old).await, &registry.overlay(&new).await);

    let conf = by_name(&delta, "conf");
    assert_eq!(conf.len(), 1);
    assert_eq!(conf[0].kind, EntryKind::Reg);
    assert!(delta.entries().all(|e| !e.is_whiteout()));
    assert!(delta.entries().all(|e| !e.name.starts_with("conf/")));
}

#[tokio::test]
async fn test_removed_subdirectory_reemits_parent_link_count() {
    let mut registry = Registry::new();
    let old = registry.add_image(
        "app:1",
        &[LayerBuilder::new().dir("usr").dir("usr/lib").dir("usr/share").file("usr/lib/x", b"x").build()],
        None,
    );
    let new = registry.add_image("app:2", &[LayerBuilder::new().dir("usr").dir("usr/share").build()], None);

    let delta = Delta::diff(&registry.overlay(&old).await, &registry.overlay(&new).await);

    assert_eq!(by_name(&delta, "usr/.wh.lib").len(), 1);
    let usr = by_name(&delta, "usr");
    assert_eq!(usr.len(), 2);
    assert!(usr[0].update_meta);
    assert!(!usr[1].update_meta);
}

#[tokio::test]
async fn test_access_ranks_drive_tiers() {
    let mut registry = Registry::new();
    let image = registry.add_image(
        "app:1",
        &[LayerBuilder::new()
            .dir("bin")
            .file("bin/sh", b"shell")
            .dir("usr")
            .file("usr/readme", b"docs")
            .file("usr/tool", b"tool")
            .build()],
        None,
    );
    let mut ranks = AccessRanks::new();
    ranks.insert("app", "bin/sh", 3);
    ranks.insert("app", "/usr/tool", 150);

    let mut want = registry.overlay(&image).await;
    want.apply_ranks(&ranks, 100);
    let delta = Delta::diff(&Overlay::new(), &want);

    let tier_of = |name: &str| by_name(&delta, name)[0].landmark;
    assert_eq!(tier_of("bin/sh"), 0);
    assert_eq!(tier_of("bin"), 0);
    assert_eq!(tier_of("usr/tool"), 1);
    assert_eq!(tier_of("usr"), 1);
    assert_eq!(tier_of("usr/readme"), 2);
    assert_eq!(delta.pool[0].len(), 2);
}

#[tokio::test]
async fn test_toc_export_roundtrips_after_layout() {
    let mut registry = Registry::new();
    let image = registry.add_image(
        "app:1",
        &[LayerBuilder::new().dir("bin").file("bin/a", b"aaaa").file("bin/b", b"bbbbbbbb").build()],
        Some("{}"),
    );
    let mut delta = Delta::diff(&Overlay::new(), &registry.overlay(&image).await);
    delta.populate_offset().unwrap();

    let mut toc = Vec::new();
    delta.export_toc(&mut toc, false).unwrap();
    let back: Delta = serde_json::from_slice(&toc).unwrap();

    assert_eq!(back.image, delta.image);
    assert_eq!(back.config.as_deref(), Some("{}"));
    assert_eq!(back.checkpoints, delta.checkpoints);
    assert_eq!(by_name(&back, "bin/b")[0].delta_offset, by_name(&delta, "bin/b")[0].delta_offset);
}

// Replay model: whiteouts first, then every listed entry in order.

fn remove_below(tree: &mut BTreeMap<String, Entry>, dir: &str) {
    if dir == "." {
        tree.retain(|k, _| k == ".");
        return;
    }
    let prefix = format!("{dir}/");
    tree.retain(|k, _| !k.starts_with(&prefix));
}

fn remove_subtree(tree: &mut BTreeMap<String, Entry>, name: &str) {
    tree.remove(name);
    remove_below(tree, name);
}

fn replay(base: &BTreeMap<String, Entry>, delta: &Delta) -> BTreeMap<String, Entry> {
    let mut tree = base.clone();
    let (markers, adds): (Vec<&Entry>, Vec<&Entry>) = delta.entries().partition(|e| e.is_whiteout());
    for marker in markers {
        let parent = marker.parent_name();
        if marker.is_opaque_whiteout() {
            remove_below(&mut tree, parent);
        } else {
            let victim = join(parent, &marker.base_name()[WHITEOUT_PREFIX.len()..]);
            remove_subtree(&mut tree, &victim);
        }
    }
    for entry in adds {
        if !entry.is_dir() {
            remove_below(&mut tree, &entry.name);
        }
        tree.insert(entry.name.clone(), entry.clone());
    }
    tree
}

type Shape = BTreeMap<String, (EntryKind, String, u64, String)>;

fn shape(tree: &BTreeMap<String, Entry>) -> Shape {
    tree.iter()
        .filter(|(k, _)| k.as_str() != ".")
        .map(|(k, e)| (k.clone(), (e.kind, e.digest.clone(), e.size, e.link_name.clone())))
        .collect()
}

const PATHS: [&str; 8] = ["a", "a/x", "a/y", "a/b", "a/b/z", "c", "c/w", "d"];

/// Build one single-layer overlay. Each slot is absent (0), a directory (1),
/// or a file with one of two contents (2, 3). Parents are forced to
/// directories so the table is always well formed.
fn overlay_from(slots: &[u8], tag: &str) -> Overlay {
    let mut table: BTreeMap<&str, Entry> = BTreeMap::new();
    for (path, &slot) in PATHS.iter().zip(slots) {
        let parent = path.rsplit_once('/').map(|(p, _)| p);
        if let Some(p) = parent {
            if !table.get(p).is_some_and(Entry::is_dir) {
                continue;
            }
        }
        match slot {
            1 => {
                table.insert(path, Entry::dir(*path));
            }
            2 | 3 => {
                table.insert(path, Entry::file(*path, format!("sha256:c{slot}"), 3, 0, 23));
            }
            _ => {}
        }
    }
    let mut overlay = Overlay::new();
    overlay.add_layer(BlobDigest::new(format!("sha256:{tag}"), tag), table.into_values().collect()).unwrap();
    overlay
}

proptest! {
    #[test]
    fn prop_replaying_delta_reproduces_target(
        have in prop::collection::vec(0u8..4, PATHS.len()),
        want in prop::collection::vec(0u8..4, PATHS.len()),
    ) {
        let a = overlay_from(&have, "have");
        let b = overlay_from(&want, "want");
        let delta = Delta::diff(&a, &b);

        prop_assert!(delta.entries().all(|e| e.name != "."));
        let rebuilt = replay(&a.entries(), &delta);
        prop_assert_eq!(shape(&rebuilt), shape(&b.entries()));
    }

    #[test]
    fn prop_every_target_entry_is_listed(
        have in prop::collection::vec(0u8..4, PATHS.len()),
        want in prop::collection::vec(0u8..4, PATHS.len()),
    ) {
        let a = overlay_from(&have, "have");
        let b = overlay_from(&want, "want");
        let delta = Delta::diff(&a, &b);

        for name in b.entries().keys().filter(|k| k.as_str() != ".") {
            prop_assert!(delta.entries().any(|e| &e.name == name), "{} missing from delta", name);
        }
    }
}
