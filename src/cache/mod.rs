//! C5 — the persistent DDS cache, the core of this crate.
//!
//! Grounded verbatim (method-by-method) on the original's
//! `DynamicDDSCache`. The mutex here protects only LRU bookkeeping,
//! usage totals, and the healing guard set; all file I/O and
//! compression happen with the lock released (spec.md §5).

pub mod heal;
mod state;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::config::CacheConfig;
use crate::dds::{build_header, DdsFormat, DdsLayout};
use crate::ddm::{DdmRecord, DiskCompression, MipmapRecord};
use crate::path as resolver;
use crate::tile::{TileHints, TileIdentity, TileKey, ZoomCandidate};
use crate::worker::BackgroundPool;

pub use state::Stats;
use state::{CacheState, Entry};

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct DdsCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
    pool: BackgroundPool,
}

impl DdsCache {
    pub fn new(config: CacheConfig) -> Self {
        let pool = BackgroundPool::new(config.background_workers);
        Self {
            config,
            state: Mutex::new(CacheState::default()),
            pool,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Dispatches `reaper::cleanup_source_jpegs` on the background pool
    /// once a tile's DDS no longer needs its source JPEGs, matching the
    /// original's `_cleanup_jpegs_async` call from `store`/
    /// `store_incremental`. A no-op when no JPEG cache directory is
    /// configured.
    fn schedule_jpeg_reap(&self, identity: &TileIdentity, max_zoom: u8, width: u32, height: u32) {
        let Some(jpeg_cache_dir) = self.config.jpeg_cache_dir.clone() else {
            return;
        };
        let col = identity.col;
        let row = identity.row;
        let tilename_zoom = identity.tilename_zoom;
        let min_zoom = self.config.jpeg_min_zoom;
        let maptype = identity.maptype.clone();
        self.pool.spawn(move || {
            crate::reaper::cleanup_source_jpegs(
                &jpeg_cache_dir,
                col,
                row,
                tilename_zoom,
                max_zoom,
                min_zoom,
                width,
                height,
                &maptype,
            );
        });
    }

    // ---- atomic write protocol (spec.md §4.4) ----------------------

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension(format!(
            "{}.tmp.{}",
            path.extension().and_then(|e| e.to_str()).unwrap_or(""),
            std::process::id()
        ));
        let write_result = fs::write(&tmp, bytes);
        if write_result.is_err() {
            let _ = fs::remove_file(&tmp);
            return write_result;
        }
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(())
    }

    /// Writes DDS bytes then DDM, in that order (I6): if the DDM write
    /// fails after the DDS rename succeeds, a later `scan_existing`
    /// finds the orphan DDS and deletes it — no special rollback here.
    fn store_pair(&self, dds_path: &Path, ddm_path: &Path, dds_bytes: &[u8], ddm: &DdmRecord) -> bool {
        if self.write_atomic(dds_path, dds_bytes).is_err() {
            tracing::debug!(?dds_path, "failed to write dds");
            return false;
        }
        let ddm_bytes = match ddm.to_json() {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(?e, "failed to serialize ddm");
                return false;
            }
        };
        if self.write_atomic(ddm_path, &ddm_bytes).is_err() {
            tracing::debug!(?ddm_path, "failed to write ddm, dds is now an orphan");
            return false;
        }
        true
    }

    fn encode_disk_bytes(&self, raw: &[u8]) -> (Vec<u8>, DiskCompression) {
        match self.config.disk_compression {
            DiskCompression::None => (raw.to_vec(), DiskCompression::None),
            DiskCompression::Zstd => {
                match zstd::encode_all(raw, self.config.disk_compression_level) {
                    Ok(compressed) => (compressed, DiskCompression::Zstd),
                    Err(e) => {
                        tracing::warn!(?e, "zstd encode failed, falling back to raw");
                        (raw.to_vec(), DiskCompression::None)
                    }
                }
            }
        }
    }

    fn decode_disk_bytes(&self, on_disk: &[u8], compression: DiskCompression) -> crate::error::Result<Vec<u8>> {
        match compression {
            DiskCompression::None => Ok(on_disk.to_vec()),
            DiskCompression::Zstd => zstd::decode_all(on_disk)
                .map_err(|e| crate::error::CacheError::Corruption(e.to_string())),
        }
    }

    // ---- staleness (spec.md §4.4 rule set) -------------------------

    fn is_stale(&self, ddm: &DdmRecord, expected_total_size: u64, actual_file_size: u64, bundle_mtime: Option<u64>) -> bool {
        if ddm.format() != Some(self.config.format) {
            return true;
        }
        if ddm.comp != self.config.compressor.tag() {
            return true;
        }
        if ddm.disk_compression == DiskCompression::None && actual_file_size != expected_total_size {
            return true;
        }
        if ddm.bundle_mtime > 0 {
            if let Some(mtime) = bundle_mtime {
                if mtime > ddm.bundle_mtime {
                    return true;
                }
            }
        }
        false
    }

    fn delete_pair(&self, dds_path: &Path, ddm_path: &Path) {
        let _ = fs::remove_file(dds_path);
        let _ = fs::remove_file(ddm_path);
    }

    fn read_ddm(&self, ddm_path: &Path) -> Option<DdmRecord> {
        let bytes = fs::read(ddm_path).ok()?;
        DdmRecord::from_json(&bytes).ok()
    }

    // ---- public contract --------------------------------------------

    pub fn contains(&self, identity: &TileIdentity, max_zoom: u8) -> bool {
        let (dds_path, ddm_path) = resolver::dds_cache_paths(&self.config.cache_root, identity, max_zoom);
        dds_path.is_file() && ddm_path.is_file()
    }

    pub fn load_metadata(&self, identity: &TileIdentity, max_zoom: u8) -> Option<DdmRecord> {
        let (_, ddm_path) = resolver::dds_cache_paths(&self.config.cache_root, identity, max_zoom);
        self.read_ddm(&ddm_path)
    }

    pub fn get_staging_path(&self, identity: &TileIdentity, max_zoom: u8) -> PathBuf {
        resolver::staging_path(&self.config.cache_root, identity, max_zoom)
    }

    /// Returns complete, uncompressed DDS bytes on a hit; `None` on
    /// miss, stale entry, or ZL mismatch (the latter is surfaced via
    /// `hints` instead, per spec.md §4.4).
    pub fn load(
        &self,
        identity: &TileIdentity,
        max_zoom: u8,
        bundle_mtime: Option<u64>,
        hints: &mut TileHints,
    ) -> Option<Vec<u8>> {
        hints.reset();
        let key = TileKey::new(identity.clone(), max_zoom);
        let (dds_path, ddm_path) = resolver::dds_cache_paths(&self.config.cache_root, identity, max_zoom);

        if !dds_path.is_file() || !ddm_path.is_file() {
            self.state.lock().stats.misses += 1;
            self.surface_zoom_candidate(identity, max_zoom, hints);
            return None;
        }

        let Some(ddm) = self.read_ddm(&ddm_path) else {
            self.delete_pair(&dds_path, &ddm_path);
            self.state.lock().remove(&key);
            return None;
        };

        let file_size = fs::metadata(&dds_path).map(|m| m.len()).unwrap_or(0);
        let expected_layout = DdsLayout::new(ddm.w, ddm.h, self.config.format);
        if self.is_stale(&ddm, expected_layout.total_size, file_size, bundle_mtime) {
            self.delete_pair(&dds_path, &ddm_path);
            self.state.lock().remove(&key);
            return None;
        }

        let on_disk = match fs::read(&dds_path) {
            Ok(b) => b,
            Err(_) => return None,
        };
        let bytes = match self.decode_disk_bytes(&on_disk, ddm.disk_compression) {
            Ok(b) => b,
            Err(_) => {
                self.delete_pair(&dds_path, &ddm_path);
                self.state.lock().remove(&key);
                return None;
            }
        };

        {
            let mut state = self.state.lock();
            state.touch(&key);
            state.stats.hits += 1;
        }

        hints.needs_healing = ddm.needs_healing;
        hints.missing_indices = ddm.missing_indices.clone();
        hints.populated_mipmaps = ddm.populated_mipmaps.clone();

        Some(bytes)
    }

    fn surface_zoom_candidate(&self, identity: &TileIdentity, max_zoom: u8, hints: &mut TileHints) {
        let up_exists = max_zoom < u8::MAX && self.contains(identity, max_zoom + 1);
        let down_exists = max_zoom > 0 && self.contains(identity, max_zoom - 1);
        if up_exists {
            hints.zoom_candidate = Some(ZoomCandidate::Upgrade(max_zoom + 1));
        } else if down_exists {
            hints.zoom_candidate = Some(ZoomCandidate::Downgrade(max_zoom - 1));
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &self,
        identity: &TileIdentity,
        max_zoom: u8,
        width: u32,
        height: u32,
        bytes: &[u8],
        bundle_mtime: u64,
        missing_indices: &[u32],
    ) -> bool {
        let layout = DdsLayout::new(width, height, self.config.format);
        if bytes.len() as u64 != layout.total_size {
            tracing::warn!(expected = layout.total_size, actual = bytes.len(), "store size mismatch");
            return false;
        }
        let (dds_path, ddm_path) = resolver::dds_cache_paths(&self.config.cache_root, identity, max_zoom);
        let (disk_bytes, compression) = self.encode_disk_bytes(bytes);
        let comp_level = (compression == DiskCompression::Zstd).then_some(self.config.disk_compression_level as u8);
        let ddm = DdmRecord::for_store(
            identity,
            max_zoom,
            &layout,
            self.config.compressor.tag(),
            bundle_mtime,
            now_unix(),
            missing_indices,
            compression,
            comp_level,
        );

        if !self.store_pair(&dds_path, &ddm_path, &disk_bytes, &ddm) {
            return false;
        }

        let key = TileKey::new(identity.clone(), max_zoom);
        let mut state = self.state.lock();
        state.insert(
            key,
            Entry {
                dds_path,
                ddm_path,
                size: disk_bytes.len() as u64,
                last_access: state.tick(),
            },
        );
        state.stats.stores += 1;
        drop(state);

        if missing_indices.is_empty() {
            self.schedule_jpeg_reap(identity, max_zoom, width, height);
        }
        true
    }

    /// Hard-link the externally built file into place, falling back
    /// to a byte copy on cross-device rejection (spec.md §4.4/§5 —
    /// "durable-place capability with two strategies").
    #[allow(clippy::too_many_arguments)]
    pub fn store_from_file(
        &self,
        identity: &TileIdentity,
        max_zoom: u8,
        width: u32,
        height: u32,
        source_path: &Path,
        bundle_mtime: u64,
        missing_indices: &[u32],
    ) -> bool {
        let bytes = match fs::read(source_path) {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!(?e, ?source_path, "store_from_file: read failed");
                return false;
            }
        };
        // The raw bytes are re-encoded (and re-written atomically) by
        // `store`; this gives identical crash-safety to a freshly
        // compressed write without special-casing the hard-link path
        // for the compressed case. A true zero-copy hard-link is only
        // valid for the uncompressed, raw-bytes-on-disk case.
        if self.config.disk_compression == DiskCompression::None {
            let (dds_path, ddm_path) = resolver::dds_cache_paths(&self.config.cache_root, identity, max_zoom);
            if let Some(parent) = dds_path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            let placed = fs::hard_link(source_path, &dds_path)
                .or_else(|_| fs::copy(source_path, &dds_path).map(|_| ()));
            if placed.is_err() {
                return false;
            }
            let layout = DdsLayout::new(width, height, self.config.format);
            let ddm = DdmRecord::for_store(
                identity,
                max_zoom,
                &layout,
                self.config.compressor.tag(),
                bundle_mtime,
                now_unix(),
                missing_indices,
                DiskCompression::None,
                None,
            );
            let Ok(ddm_bytes) = ddm.to_json() else { return false };
            if self.write_atomic(&ddm_path, &ddm_bytes).is_err() {
                return false;
            }
            let key = TileKey::new(identity.clone(), max_zoom);
            let mut state = self.state.lock();
            let size = fs::metadata(&dds_path).map(|m| m.len()).unwrap_or(bytes.len() as u64);
            state.insert(
                key,
                Entry {
                    dds_path,
                    ddm_path,
                    size,
                    last_access: state.tick(),
                },
            );
            state.stats.stores += 1;
            drop(state);

            if missing_indices.is_empty() {
                self.schedule_jpeg_reap(identity, max_zoom, width, height);
            }
            true
        } else {
            self.store(identity, max_zoom, width, height, &bytes, bundle_mtime, missing_indices)
        }
    }

    /// Writes the mipmaps given in `mipmap_bytes` into the artifact,
    /// creating it (zero-filled skeleton) if absent. Already-populated
    /// indices are skipped so concurrent partial writers converge
    /// (spec.md §5 / P2).
    pub fn store_incremental(
        &self,
        identity: &TileIdentity,
        max_zoom: u8,
        width: u32,
        height: u32,
        mipmap_bytes: &HashMap<u32, Vec<u8>>,
        bundle_mtime: u64,
    ) -> bool {
        let layout = DdsLayout::new(width, height, self.config.format);
        let (dds_path, ddm_path) = resolver::dds_cache_paths(&self.config.cache_root, identity, max_zoom);

        let prior_ddm = self.read_ddm(&ddm_path);
        let mut raw = if dds_path.is_file() {
            match fs::read(&dds_path) {
                Ok(on_disk) => {
                    let compression = prior_ddm.as_ref().map(|d| d.disk_compression).unwrap_or(DiskCompression::None);
                    match self.decode_disk_bytes(&on_disk, compression) {
                        Ok(b) if b.len() as u64 == layout.total_size => b,
                        _ => self.skeleton(&layout),
                    }
                }
                Err(_) => self.skeleton(&layout),
            }
        } else {
            self.skeleton(&layout)
        };

        let mut populated: std::collections::HashSet<u32> = prior_ddm
            .as_ref()
            .map(|d| d.populated_mipmaps.iter().copied().collect())
            .unwrap_or_default();

        for (&index, bytes) in mipmap_bytes {
            if populated.contains(&index) {
                continue;
            }
            let Some(slot) = layout.mipmap(index) else { continue };
            if bytes.len() as u64 != slot.length {
                tracing::warn!(index, expected = slot.length, actual = bytes.len(), "mipmap length mismatch");
                continue;
            }
            let start = slot.startpos as usize;
            raw[start..start + bytes.len()].copy_from_slice(bytes);
            populated.insert(index);
        }

        // header is always kept current with the final layout
        raw[0..128].copy_from_slice(&build_header(&layout));

        let (disk_bytes, compression) = self.encode_disk_bytes(&raw);
        let comp_level = (compression == DiskCompression::Zstd).then_some(self.config.disk_compression_level as u8);

        let mut populated_sorted: Vec<u32> = populated.into_iter().collect();
        populated_sorted.sort_unstable();
        let mipmaps = (0..layout.mipmap_count())
            .map(|i| {
                let zl = crate::ddm::mipmap_zoom_level(max_zoom, i);
                let complete = populated_sorted.contains(&i);
                MipmapRecord { zl, complete, total: None, valid: None }
            })
            .collect();

        let (needs_healing, healing_chunks, missing_indices) = prior_ddm
            .as_ref()
            .map(|d| (d.needs_healing, d.healing_chunks, d.missing_indices.clone()))
            .unwrap_or((false, 0, Vec::new()));

        // The artifact is ready to serve as a rebuild source of truth
        // (no further JPEG-derived patching needed) once every mipmap
        // is populated and no chunk-level healing is outstanding.
        let fully_built = populated_sorted.len() as u32 == layout.mipmap_count() && missing_indices.is_empty();

        let ddm = DdmRecord {
            v: crate::ddm::DDM_VERSION,
            w: layout.width,
            h: layout.height,
            mm: layout.mipmap_count(),
            zl: identity.tilename_zoom,
            max_zl: max_zoom,
            fmt: layout.format.tag().to_string(),
            comp: self.config.compressor.tag().to_string(),
            map: identity.maptype.clone(),
            tile_row: identity.row,
            tile_col: identity.col,
            bundle_mtime,
            built: now_unix(),
            mipmaps,
            populated_mipmaps: populated_sorted,
            needs_healing,
            healing_chunks,
            missing_indices,
            disk_compression: compression,
            comp_level,
        };

        if !self.store_pair(&dds_path, &ddm_path, &disk_bytes, &ddm) {
            return false;
        }

        let key = TileKey::new(identity.clone(), max_zoom);
        let mut state = self.state.lock();
        state.insert(
            key,
            Entry {
                dds_path,
                ddm_path,
                size: disk_bytes.len() as u64,
                last_access: state.tick(),
            },
        );
        drop(state);

        if fully_built {
            self.schedule_jpeg_reap(identity, max_zoom, width, height);
        }
        true
    }

    fn skeleton(&self, layout: &DdsLayout) -> Vec<u8> {
        let mut buf = vec![0u8; layout.total_size as usize];
        buf[0..128].copy_from_slice(&build_header(layout));
        buf
    }

    pub fn invalidate(&self, identity: &TileIdentity, max_zoom: u8) -> bool {
        let key = TileKey::new(identity.clone(), max_zoom);
        let entry = self.state.lock().remove(&key);
        match entry {
            Some(e) => {
                self.delete_pair(&e.dds_path, &e.ddm_path);
                true
            }
            None => {
                let (dds_path, ddm_path) = resolver::dds_cache_paths(&self.config.cache_root, identity, max_zoom);
                let existed = dds_path.is_file() || ddm_path.is_file();
                self.delete_pair(&dds_path, &ddm_path);
                existed
            }
        }
    }

    /// Pops oldest entries until `bytes_to_free` have been reclaimed;
    /// file deletion happens after releasing the lock (spec.md §4.4).
    pub fn evict_lru(&self, bytes_to_free: u64) -> u64 {
        let popped = self.state.lock().pop_oldest_until(bytes_to_free);
        let mut freed = 0u64;
        for (_, entry) in popped {
            self.delete_pair(&entry.dds_path, &entry.ddm_path);
            freed += entry.size;
        }
        freed
    }

    pub fn get_disk_usage(&self) -> u64 {
        self.state.lock().total_bytes
    }

    pub fn stats(&self) -> Stats {
        self.state.lock().stats
    }

    /// Walks the cache tree; for each `.dds` requires a paired `.ddm`,
    /// parses it, and enters the LRU using file mtime as recency.
    /// Orphan DDS files (no DDM, or an unparseable DDM) are deleted.
    pub fn scan_existing(&self) -> usize {
        let root = self.config.cache_root.join("dds_cache");
        if !root.is_dir() {
            return 0;
        }
        let mut found = 0usize;
        let mut stack = vec![root];
        let mut discovered: Vec<(TileKey, Entry)> = Vec::new();

        while let Some(dir) = stack.pop() {
            let Ok(entries) = fs::read_dir(&dir) else { continue };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("dds") {
                    continue;
                }
                let ddm_path = path.with_extension("ddm");
                let Some(ddm) = self.read_ddm(&ddm_path) else {
                    let _ = fs::remove_file(&path);
                    let _ = fs::remove_file(&ddm_path);
                    continue;
                };
                let Ok(meta) = fs::metadata(&path) else { continue };
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                let identity = TileIdentity::new(ddm.tile_row, ddm.tile_col, ddm.map.clone(), ddm.zl);
                let key = TileKey::new(identity, ddm.max_zl);
                discovered.push((
                    key,
                    Entry {
                        dds_path: path,
                        ddm_path,
                        size: meta.len(),
                        last_access: mtime,
                    },
                ));
                found += 1;
            }
        }

        let mut state = self.state.lock();
        for (key, entry) in discovered {
            state.insert(key, entry);
        }
        state.resort_by_recency();
        found
    }

    /// Rewrites older, uncompressed entries under the current
    /// configured compression mode. Returns the count migrated.
    pub fn migrate_uncompressed(&self) -> usize {
        if self.config.disk_compression == DiskCompression::None {
            return 0;
        }
        let keys: Vec<TileKey> = self.state.lock().entries.keys().cloned().collect();
        let mut migrated = 0;
        for key in keys {
            let entry = { self.state.lock().entries.get(&key).cloned() };
            let Some(entry) = entry else { continue };
            let Some(ddm) = self.read_ddm(&entry.ddm_path) else { continue };
            if ddm.disk_compression != DiskCompression::None {
                continue;
            }
            let Ok(raw) = fs::read(&entry.dds_path) else { continue };
            let (disk_bytes, compression) = self.encode_disk_bytes(&raw);
            if compression == DiskCompression::None {
                continue;
            }
            let comp_level = Some(self.config.disk_compression_level as u8);
            let mut new_ddm = ddm;
            new_ddm.disk_compression = compression;
            new_ddm.comp_level = comp_level;
            if self.store_pair(&entry.dds_path, &entry.ddm_path, &disk_bytes, &new_ddm) {
                let mut state = self.state.lock();
                if let Some(e) = state.entries.get_mut(&key) {
                    e.size = disk_bytes.len() as u64;
                }
                migrated += 1;
            }
        }
        migrated
    }

    fn read_uncompressed(&self, dds_path: &Path, ddm: &DdmRecord) -> crate::error::Result<Vec<u8>> {
        let on_disk = fs::read(dds_path)?;
        self.decode_disk_bytes(&on_disk, ddm.disk_compression)
    }

    /// Only `z_new = z_old + 1` is allowed. Copies old mipmap `i` into
    /// new mipmap slot `i+1` verbatim; `new_mm0_bytes` becomes the new
    /// mm0. The old pair is deleted only after the new pair is durable
    /// (I7).
    pub fn upgrade_zl(&self, identity: &TileIdentity, z_old: u8, new_mm0_bytes: &[u8]) -> Option<Vec<u8>> {
        let z_new = z_old.checked_add(1)?;
        let (old_dds, old_ddm_path) = resolver::dds_cache_paths(&self.config.cache_root, identity, z_old);
        let ddm = self.read_ddm(&old_ddm_path)?;
        let old_layout = DdsLayout::new(ddm.w, ddm.h, self.config.format);
        let old_bytes = self.read_uncompressed(&old_dds, &ddm).ok()?;
        if old_bytes.len() as u64 != old_layout.total_size {
            return None;
        }

        let new_layout = DdsLayout::new(ddm.w * 2, ddm.h * 2, self.config.format);
        let new_mm0_slot = new_layout.mipmap(0)?;
        if new_mm0_bytes.len() as u64 != new_mm0_slot.length {
            return None;
        }
        let mut new_bytes = vec![0u8; new_layout.total_size as usize];
        new_bytes[0..128].copy_from_slice(&build_header(&new_layout));
        let dst = new_mm0_slot;
        new_bytes[dst.startpos as usize..dst.endpos as usize].copy_from_slice(new_mm0_bytes);

        for old_slot in &old_layout.mipmaps {
            let Some(new_slot) = new_layout.mipmap(old_slot.index + 1) else { continue };
            if new_slot.length != old_slot.length {
                return None;
            }
            let src = &old_bytes[old_slot.startpos as usize..old_slot.endpos as usize];
            new_bytes[new_slot.startpos as usize..new_slot.endpos as usize].copy_from_slice(src);
        }

        if !self.store(identity, z_new, new_layout.width, new_layout.height, &new_bytes, ddm.bundle_mtime, &[]) {
            return None;
        }
        self.invalidate(identity, z_old);
        Some(new_bytes)
    }

    /// Inverse of `upgrade_zl`: drops old mm0, shifts mm[i+1] -> mm[i].
    /// Rejects if the resulting mm0 would be smaller than 4x4 blocks.
    pub fn downgrade_zl(&self, identity: &TileIdentity, z_old: u8) -> Option<Vec<u8>> {
        let z_new = z_old.checked_sub(1)?;
        let (old_dds, old_ddm_path) = resolver::dds_cache_paths(&self.config.cache_root, identity, z_old);
        let ddm = self.read_ddm(&old_ddm_path)?;
        let old_layout = DdsLayout::new(ddm.w, ddm.h, self.config.format);
        let old_bytes = self.read_uncompressed(&old_dds, &ddm).ok()?;
        if old_bytes.len() as u64 != old_layout.total_size {
            return None;
        }

        let new_w = ddm.w / 2;
        let new_h = ddm.h / 2;
        if new_w < 4 || new_h < 4 {
            return None;
        }
        let new_layout = DdsLayout::new(new_w, new_h, self.config.format);
        let mut new_bytes = vec![0u8; new_layout.total_size as usize];
        new_bytes[0..128].copy_from_slice(&build_header(&new_layout));

        for new_slot in &new_layout.mipmaps {
            let Some(old_slot) = old_layout.mipmap(new_slot.index + 1) else { continue };
            if old_slot.length != new_slot.length {
                return None;
            }
            let src = &old_bytes[old_slot.startpos as usize..old_slot.endpos as usize];
            new_bytes[new_slot.startpos as usize..new_slot.endpos as usize].copy_from_slice(src);
        }

        if !self.store(identity, z_new, new_layout.width, new_layout.height, &new_bytes, ddm.bundle_mtime, &[]) {
            return None;
        }
        self.invalidate(identity, z_old);
        Some(new_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dds::DdsFormat;

    fn fixture_bytes(layout: &DdsLayout) -> Vec<u8> {
        let mut buf = vec![0u8; layout.total_size as usize];
        buf[0..128].copy_from_slice(&build_header(layout));
        buf
    }

    #[test]
    fn store_rejects_wrong_size_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DdsCache::new(CacheConfig::new(dir.path()));
        let identity = TileIdentity::new(1, 1, "BI", 16);
        let stored = cache.store(&identity, 16, 64, 64, &[0u8; 4], 0, &[]);
        assert!(!stored);
    }

    #[test]
    fn upgrade_zl_rejects_non_adjacent_step() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DdsCache::new(CacheConfig::new(dir.path()));
        let identity = TileIdentity::new(1, 1, "BI", 16);
        let layout = DdsLayout::new(64, 64, DdsFormat::Bc1);
        let bytes = fixture_bytes(&layout);
        cache.store(&identity, 16, 64, 64, &bytes, 0, &[]);

        let new_mm0 = vec![0u8; layout.mipmap(0).unwrap().length as usize];
        // z_old + 1 must equal the stored tile's zoom; here we simply
        // confirm a non-existent lower ZL yields None rather than
        // fabricating a migration out of thin air.
        assert!(cache.upgrade_zl(&identity, 200, &new_mm0).is_none());
    }

    #[test]
    fn downgrade_zl_rejects_below_minimum_size() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DdsCache::new(CacheConfig::new(dir.path()));
        let identity = TileIdentity::new(1, 1, "BI", 16);
        // 4x4 is already the smallest legal mm0; downgrading would
        // produce a 2x2 mm0, which is rejected.
        let layout = DdsLayout::new(4, 4, DdsFormat::Bc1);
        let bytes = fixture_bytes(&layout);
        cache.store(&identity, 16, 4, 4, &bytes, 0, &[]);
        assert!(cache.downgrade_zl(&identity, 16).is_none());
    }

    #[test]
    fn store_incremental_merges_without_clobbering_populated_indices() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DdsCache::new(CacheConfig::new(dir.path()));
        let identity = TileIdentity::new(2, 2, "BI", 16);
        let layout = DdsLayout::new(64, 64, DdsFormat::Bc1);

        let mut first = HashMap::new();
        first.insert(0, vec![0xABu8; layout.mipmap(0).unwrap().length as usize]);
        assert!(cache.store_incremental(&identity, 16, 64, 64, &first, 0));

        let mut second = HashMap::new();
        // Attempt to overwrite index 0 with different bytes, plus add index 1.
        second.insert(0, vec![0xCDu8; layout.mipmap(0).unwrap().length as usize]);
        second.insert(1, vec![0xEFu8; layout.mipmap(1).unwrap().length as usize]);
        assert!(cache.store_incremental(&identity, 16, 64, 64, &second, 0));

        let ddm = cache.load_metadata(&identity, 16).unwrap();
        assert!(ddm.populated_mipmaps.contains(&0));
        assert!(ddm.populated_mipmaps.contains(&1));

        let (dds_path, _) = resolver::dds_cache_paths(&cache.config.cache_root, &identity, 16);
        let on_disk = fs::read(dds_path).unwrap();
        let slot0 = layout.mipmap(0).unwrap();
        assert_eq!(
            &on_disk[slot0.startpos as usize..slot0.endpos as usize],
            &vec![0xABu8; slot0.length as usize][..]
        );
    }

    #[test]
    fn evict_lru_frees_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DdsCache::new(CacheConfig::new(dir.path()));
        let layout = DdsLayout::new(64, 64, DdsFormat::Bc1);
        let bytes = fixture_bytes(&layout);
        for i in 0..3u32 {
            let identity = TileIdentity::new(i, i, "BI", 16);
            cache.store(&identity, 16, 64, 64, &bytes, 0, &[]);
        }
        let freed = cache.evict_lru(bytes.len() as u64);
        assert!(freed >= bytes.len() as u64);
        // The first-stored tile (row 0) should be the one evicted.
        assert!(!cache.contains(&TileIdentity::new(0, 0, "BI", 16), 16));
        assert!(cache.contains(&TileIdentity::new(2, 2, "BI", 16), 16));
    }

    #[test]
    fn upgrade_zl_is_byte_exact_for_shifted_mipmaps_and_new_mm0() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DdsCache::new(CacheConfig::new(dir.path()));
        let identity = TileIdentity::new(1, 1, "BI", 16);
        let old_layout = DdsLayout::new(64, 64, DdsFormat::Bc1);
        let mut old_bytes = vec![0u8; old_layout.total_size as usize];
        old_bytes[0..128].copy_from_slice(&build_header(&old_layout));
        for mm in &old_layout.mipmaps {
            old_bytes[mm.startpos as usize..mm.endpos as usize].fill(mm.index as u8);
        }
        assert!(cache.store(&identity, 16, 64, 64, &old_bytes, 0, &[]));

        let new_layout = DdsLayout::new(128, 128, DdsFormat::Bc1);
        let new_mm0 = vec![0xAAu8; new_layout.mipmap(0).unwrap().length as usize];
        let upgraded = cache.upgrade_zl(&identity, 16, &new_mm0).unwrap();

        assert_eq!(
            &upgraded[new_layout.mipmap(0).unwrap().startpos as usize..new_layout.mipmap(0).unwrap().endpos as usize],
            &new_mm0[..]
        );
        for old_mm in &old_layout.mipmaps {
            let Some(new_mm) = new_layout.mipmap(old_mm.index + 1) else { continue };
            assert_eq!(
                &upgraded[new_mm.startpos as usize..new_mm.endpos as usize],
                &old_bytes[old_mm.startpos as usize..old_mm.endpos as usize]
            );
        }
        // The old ZL is gone; the new one is live.
        assert!(!cache.contains(&identity, 16));
        assert!(cache.contains(&identity, 17));
    }

    #[test]
    fn downgrade_zl_is_byte_exact_for_shifted_mipmaps() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DdsCache::new(CacheConfig::new(dir.path()));
        let identity = TileIdentity::new(2, 2, "BI", 16);
        let old_layout = DdsLayout::new(64, 64, DdsFormat::Bc1);
        let mut old_bytes = vec![0u8; old_layout.total_size as usize];
        old_bytes[0..128].copy_from_slice(&build_header(&old_layout));
        for mm in &old_layout.mipmaps {
            old_bytes[mm.startpos as usize..mm.endpos as usize].fill(mm.index as u8);
        }
        assert!(cache.store(&identity, 16, 64, 64, &old_bytes, 0, &[]));

        let new_layout = DdsLayout::new(32, 32, DdsFormat::Bc1);
        let downgraded = cache.downgrade_zl(&identity, 16).unwrap();

        for new_mm in &new_layout.mipmaps {
            let Some(old_mm) = old_layout.mipmap(new_mm.index + 1) else { continue };
            assert_eq!(
                &downgraded[new_mm.startpos as usize..new_mm.endpos as usize],
                &old_bytes[old_mm.startpos as usize..old_mm.endpos as usize]
            );
        }
        assert!(!cache.contains(&identity, 16));
        assert!(cache.contains(&identity, 15));
    }

    #[test]
    fn scan_existing_deletes_orphan_dds_with_no_ddm() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::new(dir.path());
        let cache = DdsCache::new(config.clone());
        let identity = TileIdentity::new(9, 9, "BI", 16);
        let (dds_path, _ddm_path) = resolver::dds_cache_paths(&config.cache_root, &identity, 16);

        // Simulate a crash between the DDS rename and the DDM write:
        // the DDS exists, its DDM does not.
        fs::create_dir_all(dds_path.parent().unwrap()).unwrap();
        fs::write(&dds_path, vec![0u8; 1024]).unwrap();
        assert!(dds_path.is_file());

        let discovered = cache.scan_existing();
        assert_eq!(discovered, 0);
        assert!(!dds_path.is_file());
        assert!(!cache.contains(&identity, 16));
    }

    // Property-based tests covering spec.md §8's P1/P2/P7.
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn wh_strategy() -> impl Strategy<Value = (u32, u32)> {
            (1u32..=8, 1u32..=8).prop_map(|(w, h)| (w * 4, h * 4))
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(24))]

            /// P1: store/load round-trips the exact bytes given, across
            /// both on-disk compression modes.
            #[test]
            fn store_load_round_trips_arbitrary_bytes(
                (width, height) in wh_strategy(),
                use_zstd in any::<bool>(),
                fill in any::<u8>(),
            ) {
                let dir = tempfile::tempdir().unwrap();
                let mut config = CacheConfig::new(dir.path());
                if use_zstd {
                    config = config.with_disk_compression(DiskCompression::Zstd, 3);
                }
                let cache = DdsCache::new(config.clone());
                let layout = DdsLayout::new(width, height, config.format);
                let identity = TileIdentity::new(1, 1, "BI", 16);

                let mut bytes = vec![fill; layout.total_size as usize];
                bytes[0..128].copy_from_slice(&build_header(&layout));

                prop_assert!(cache.store(&identity, 16, width, height, &bytes, 0, &[]));
                let mut hints = TileHints::default();
                let loaded = cache.load(&identity, 16, Some(0), &mut hints);
                prop_assert_eq!(loaded, Some(bytes));
            }

            /// P2: `store_incremental` is insensitive to how the mipmap
            /// set is partitioned across calls — the final on-disk
            /// bytes match a single incremental call with everything.
            #[test]
            fn store_incremental_partition_independent(
                (width, height) in wh_strategy(),
                split_after_first in any::<bool>(),
            ) {
                let dir = tempfile::tempdir().unwrap();
                let config = CacheConfig::new(dir.path());
                let layout = DdsLayout::new(width, height, config.format);
                let identity = TileIdentity::new(2, 3, "BI", 16);

                let mut full = vec![0u8; layout.total_size as usize];
                full[0..128].copy_from_slice(&build_header(&layout));
                for mm in &layout.mipmaps {
                    let fill = (mm.index as u8).wrapping_add(1);
                    full[mm.startpos as usize..mm.endpos as usize].fill(fill);
                }

                let mut mipmap_bytes: HashMap<u32, Vec<u8>> = layout
                    .mipmaps
                    .iter()
                    .map(|mm| (mm.index, full[mm.startpos as usize..mm.endpos as usize].to_vec()))
                    .collect();

                let cache = DdsCache::new(config.clone());
                if split_after_first && layout.mipmaps.len() > 1 {
                    let first_index = layout.mipmaps[0].index;
                    let mut first = HashMap::new();
                    first.insert(first_index, mipmap_bytes.remove(&first_index).unwrap());
                    prop_assert!(cache.store_incremental(&identity, 16, width, height, &first, 0));
                    prop_assert!(cache.store_incremental(&identity, 16, width, height, &mipmap_bytes, 0));
                } else {
                    prop_assert!(cache.store_incremental(&identity, 16, width, height, &mipmap_bytes, 0));
                }

                let (dds_path, _) = resolver::dds_cache_paths(&cache.config.cache_root, &identity, 16);
                let on_disk = fs::read(dds_path).unwrap();
                prop_assert_eq!(on_disk, full);
            }

            /// P7: after `evict_lru(n)`, remaining usage is bounded by
            /// `prior_total - freed`, and exactly the oldest entries
            /// (by insertion order) are the ones gone.
            #[test]
            fn evict_lru_is_monotone_and_oldest_first(
                count in 2usize..6,
                free_rank in 0usize..5,
            ) {
                let free_rank = free_rank % count;
                let dir = tempfile::tempdir().unwrap();
                let cache = DdsCache::new(CacheConfig::new(dir.path()));
                let layout = DdsLayout::new(64, 64, DdsFormat::Bc1);
                let bytes = fixture_bytes(&layout);
                let entry_size = bytes.len() as u64;

                for i in 0..count as u32 {
                    let identity = TileIdentity::new(i, i, "BI", 16);
                    cache.store(&identity, 16, 64, 64, &bytes, 0, &[]);
                }
                let prior_total = cache.get_disk_usage();

                let to_free = entry_size * (free_rank as u64 + 1);
                let freed = cache.evict_lru(to_free);
                prop_assert!(freed >= to_free.min(prior_total));
                prop_assert!(cache.get_disk_usage() <= prior_total.saturating_sub(freed));

                for i in 0..=free_rank as u32 {
                    prop_assert!(!cache.contains(&TileIdentity::new(i, i, "BI", 16), 16));
                }
                for i in (free_rank as u32 + 1)..count as u32 {
                    prop_assert!(cache.contains(&TileIdentity::new(i, i, "BI", 16), 16));
                }
            }
        }
    }
}
