//! Integration tests for the persistent DDS cache.
//!
//! These exercise the full store → load → invalidate → scan_existing
//! cycle through the public API only, against a real temp directory.
//!
//! Run with: `cargo test --test cache_lifecycle_integration`

use scenedds::dds::DdsLayout;
use scenedds::{CacheConfig, DdsCache, TileHints, TileIdentity};

fn rgba_fixture(width: u32, height: u32) -> Vec<u8> {
    (0..(width * height * 4) as usize).map(|i| (i % 251) as u8).collect()
}

fn dds_bytes(identity: &TileIdentity, config: &CacheConfig, width: u32, height: u32) -> Vec<u8> {
    let layout = DdsLayout::new(width, height, config.format);
    let rgba = rgba_fixture(width, height);
    let mut out = vec![0u8; layout.total_size as usize];
    out[0..128].copy_from_slice(&scenedds::dds::build_header(&layout));
    for mm in &layout.mipmaps {
        let compressed = scenedds::compress::compress_rgba_to_blocks(&rgba, width, height, config.format)
            .unwrap_or_default();
        let start = mm.startpos as usize;
        let end = (mm.startpos + mm.length) as usize;
        if mm.index == 0 && compressed.len() == mm.length as usize {
            out[start..end].copy_from_slice(&compressed);
        }
    }
    out
}

#[test]
fn store_then_load_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig::new(dir.path());
    let cache = DdsCache::new(config.clone());
    let identity = TileIdentity::new(10, 20, "BI", 16);
    let bytes = dds_bytes(&identity, &config, 64, 64);

    let stored = cache.store(&identity, 16, 64, 64, &bytes, 0, &[]);
    assert!(stored);

    let mut hints = TileHints::default();
    let loaded = cache.load(&identity, 16, Some(0), &mut hints);
    assert!(loaded.is_some());
    assert!(!hints.needs_healing);
    assert_eq!(cache.stats().hits, 1);
}

#[test]
fn missing_tile_is_a_clean_miss() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig::new(dir.path());
    let cache = DdsCache::new(config);
    let identity = TileIdentity::new(1, 1, "BI", 16);

    let mut hints = TileHints::default();
    let loaded = cache.load(&identity, 16, Some(0), &mut hints);
    assert!(loaded.is_none());
    assert_eq!(cache.stats().misses, 1);
}

#[test]
fn invalidate_removes_entry_and_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig::new(dir.path());
    let cache = DdsCache::new(config.clone());
    let identity = TileIdentity::new(3, 4, "BI", 16);
    let bytes = dds_bytes(&identity, &config, 64, 64);
    cache.store(&identity, 16, 64, 64, &bytes, 0, &[]);
    assert!(cache.contains(&identity, 16));

    assert!(cache.invalidate(&identity, 16));
    assert!(!cache.contains(&identity, 16));

    let mut hints = TileHints::default();
    assert!(cache.load(&identity, 16, Some(0), &mut hints).is_none());
}

#[test]
fn scan_existing_rediscovers_entries_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig::new(dir.path());
    let identity = TileIdentity::new(5, 6, "BI", 16);
    let bytes = dds_bytes(&identity, &config, 64, 64);

    {
        let cache = DdsCache::new(config.clone());
        cache.store(&identity, 16, 64, 64, &bytes, 0, &[]);
    }

    let restarted = DdsCache::new(config);
    let discovered = restarted.scan_existing();
    assert_eq!(discovered, 1);
    assert!(restarted.contains(&identity, 16));
}

#[test]
fn stale_entry_is_evicted_on_load_when_bundle_mtime_advances() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig::new(dir.path());
    let cache = DdsCache::new(config.clone());
    let identity = TileIdentity::new(7, 8, "BI", 16);
    let bytes = dds_bytes(&identity, &config, 64, 64);
    cache.store(&identity, 16, 64, 64, &bytes, 100, &[]);

    let mut hints = TileHints::default();
    // Bundle mtime moved forward since this DDS was built: stale.
    let loaded = cache.load(&identity, 16, Some(200), &mut hints);
    assert!(loaded.is_none());
}
