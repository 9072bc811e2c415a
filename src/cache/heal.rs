//! C7's in-place patching half: `patch_missing_chunks`.
//!
//! Grounded verbatim on `_do_patch` in the original. One simplification
//! from the Design Notes' "owning buffer vs file-offset writer, behind
//! a common sink" guidance: this crate always patches through a single
//! owning buffer (read-decompress-patch-recompress-replace), rather
//! than also special-casing an in-place file-offset writer for the
//! uncompressed case. The uncompressed case is already cheap (no
//! decompression step), so the extra code path would only save one
//! `fs::write` of bytes already resident in memory — noted in
//! DESIGN.md rather than built.

use std::collections::HashMap;

use image::imageops::FilterType;
use image::GenericImageView;

use super::DdsCache;
use crate::dds::{build_header, DdsLayout};
use crate::ddm::MipmapRecord;
use crate::path as resolver;
use crate::tile::{TileIdentity, TileKey};

/// Standard source-chunk edge length at mm0.
const CHUNK_PX: u32 = 256;

impl DdsCache {
    /// `chunks`: mm0 chunk index -> JPEG bytes. `chunks_per_row`: the
    /// mm0 chunk grid dimension for this tile. Returns `false` (no
    /// partial patch applied) on any decode/compress/write failure, or
    /// if another healer already holds the guard for this key.
    pub fn patch_missing_chunks(
        &self,
        identity: &TileIdentity,
        max_zoom: u8,
        chunks: &HashMap<u32, Vec<u8>>,
        chunks_per_row: u32,
    ) -> bool {
        let key = TileKey::new(identity.clone(), max_zoom);
        {
            let mut state = self.state.lock();
            if state.healing_in_progress.contains(&key) {
                return false;
            }
            state.healing_in_progress.insert(key.clone());
        }
        let result = self.do_patch(identity, max_zoom, chunks, chunks_per_row);
        let mut state = self.state.lock();
        state.healing_in_progress.remove(&key);
        if result {
            state.stats.heals += 1;
        }
        result
    }

    fn do_patch(
        &self,
        identity: &TileIdentity,
        max_zoom: u8,
        chunks: &HashMap<u32, Vec<u8>>,
        chunks_per_row: u32,
    ) -> bool {
        let (dds_path, ddm_path) = resolver::dds_cache_paths(&self.config.cache_root, identity, max_zoom);
        let Some(ddm) = self.read_ddm(&ddm_path) else { return false };
        let layout = DdsLayout::new(ddm.w, ddm.h, self.config.format);
        let Ok(mut raw) = self.read_uncompressed(&dds_path, &ddm) else {
            return false;
        };
        if raw.len() as u64 != layout.total_size {
            return false;
        }

        let mut remaining: std::collections::HashSet<u32> = ddm.missing_indices.iter().copied().collect();

        for (&idx, jpeg_bytes) in chunks {
            let Ok(img) = image::load_from_memory(jpeg_bytes) else {
                continue;
            };
            let (decoded_w, decoded_h) = img.dimensions();
            if decoded_w != CHUNK_PX || decoded_h != CHUNK_PX {
                continue;
            }
            let rgba = img.to_rgba8();
            let cx = idx % chunks_per_row;
            let cy = idx / chunks_per_row;

            let mut ok = true;
            for mm in &layout.mipmaps {
                let i = mm.index;
                let s = CHUNK_PX >> i;
                if s < 4 {
                    break;
                }
                let chunk_rgba = if i == 0 {
                    rgba.clone()
                } else {
                    image::imageops::resize(&rgba, s, s, FilterType::Lanczos3)
                };
                let Ok(compressed) =
                    crate::compress::compress_rgba_to_blocks(&chunk_rgba, s, s, self.config.format)
                else {
                    ok = false;
                    break;
                };
                let blocksize = self.config.format.block_size();
                let blocks_per_chunk_row = (s / 4) as u64;
                let blocks_per_image_row = (mm.width / 4) as u64;
                let block_x = (cx as u64) * blocks_per_chunk_row;
                let block_y = (cy as u64) * blocks_per_chunk_row;
                let row_bytes = (blocks_per_chunk_row * blocksize) as usize;

                for k in 0..blocks_per_chunk_row {
                    let offset = mm.startpos
                        + (block_y + k) * blocks_per_image_row * blocksize
                        + block_x * blocksize;
                    let start = offset as usize;
                    let end = start + row_bytes;
                    if end > raw.len() {
                        ok = false;
                        break;
                    }
                    let src_start = (k as usize) * row_bytes;
                    raw[start..end].copy_from_slice(&compressed[src_start..src_start + row_bytes]);
                }
                if !ok {
                    break;
                }
            }
            if ok {
                remaining.remove(&idx);
            }
        }

        raw[0..128].copy_from_slice(&build_header(&layout));

        let (disk_bytes, compression) = self.encode_disk_bytes(&raw);
        let comp_level = (compression == crate::ddm::DiskCompression::Zstd)
            .then_some(self.config.disk_compression_level as u8);

        let mut missing_sorted: Vec<u32> = remaining.into_iter().collect();
        missing_sorted.sort_unstable();
        let mut new_ddm = ddm.clone();
        new_ddm.needs_healing = !missing_sorted.is_empty();
        new_ddm.healing_chunks = missing_sorted.len() as u32;
        if missing_sorted.is_empty() {
            new_ddm.mipmaps[0] = MipmapRecord {
                zl: new_ddm.mipmaps[0].zl,
                complete: true,
                total: new_ddm.mipmaps[0].total,
                valid: new_ddm.mipmaps[0].total,
            };
            if !new_ddm.populated_mipmaps.contains(&0) {
                new_ddm.populated_mipmaps.push(0);
                new_ddm.populated_mipmaps.sort_unstable();
            }
        } else if let Some(total) = new_ddm.mipmaps[0].total {
            new_ddm.mipmaps[0].valid = Some(total.saturating_sub(missing_sorted.len() as u32));
        }
        new_ddm.missing_indices = missing_sorted;
        new_ddm.disk_compression = compression;
        new_ddm.comp_level = comp_level;

        self.store_pair(&dds_path, &ddm_path, &disk_bytes, &new_ddm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::dds::DdsFormat;
    use crate::ddm::DdmRecord;

    fn store_incomplete_tile(cache: &DdsCache, identity: &TileIdentity, max_zoom: u8, width: u32, height: u32) {
        let layout = DdsLayout::new(width, height, cache.config.format);
        let mut bytes = vec![0u8; layout.total_size as usize];
        bytes[0..128].copy_from_slice(&build_header(&layout));
        // Every mm0 chunk is missing — store as fully incomplete.
        let missing: Vec<u32> = (0..(width / CHUNK_PX).max(1) * (height / CHUNK_PX).max(1)).collect();
        assert!(cache.store(identity, max_zoom, width, height, &bytes, 0, &missing));
    }

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba([10, 20, 30, 255]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Jpeg)
            .unwrap();
        buf
    }

    #[test]
    fn second_healer_for_same_key_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DdsCache::new(CacheConfig::new(dir.path()));
        let identity = TileIdentity::new(1, 1, "BI", 16);
        store_incomplete_tile(&cache, &identity, 16, 256, 256);

        let key = TileKey::new(identity.clone(), 16);
        cache.state.lock().healing_in_progress.insert(key.clone());

        let chunks = HashMap::new();
        assert!(!cache.patch_missing_chunks(&identity, 16, &chunks, 1));
        assert!(cache.state.lock().healing_in_progress.contains(&key));
    }

    #[test]
    fn patch_full_coverage_clears_needs_healing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DdsCache::new(CacheConfig::new(dir.path()));
        let identity = TileIdentity::new(2, 2, "BI", 16);
        store_incomplete_tile(&cache, &identity, 16, 256, 256);

        let mut chunks = HashMap::new();
        chunks.insert(0, jpeg_bytes(256, 256));
        let healed = cache.patch_missing_chunks(&identity, 16, &chunks, 1);
        assert!(healed);

        let ddm = cache.load_metadata(&identity, 16).unwrap();
        assert!(!ddm.needs_healing);
        assert!(ddm.missing_indices.is_empty());
        assert_eq!(cache.stats().heals, 1);
    }

    #[test]
    fn patch_rejects_wrong_size_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DdsCache::new(CacheConfig::new(dir.path()));
        let identity = TileIdentity::new(3, 3, "BI", 16);
        store_incomplete_tile(&cache, &identity, 16, 256, 256);

        let mut chunks = HashMap::new();
        chunks.insert(0, jpeg_bytes(128, 128));
        cache.patch_missing_chunks(&identity, 16, &chunks, 1);

        let ddm: DdmRecord = cache.load_metadata(&identity, 16).unwrap();
        // The wrong-sized chunk is skipped, so index 0 stays missing.
        assert!(ddm.needs_healing);
        assert_eq!(ddm.missing_indices, vec![0]);
    }

    #[test]
    fn chunk_px_matches_standard_edge_length() {
        assert_eq!(CHUNK_PX, 256);
        let _ = DdsFormat::Bc1;
    }
}
