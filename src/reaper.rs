//! C8 — source-JPEG reaping, plus C7's caller-facing healing dispatch.
//!
//! Grounded verbatim on the original's module-level `cleanup_source_jpegs`
//! and `_try_heal_from_disk_cache`/`_heal_from_disk`.

use std::path::Path;

use tracing::{debug, warn};

use crate::cache::DdsCache;
use crate::tile::TileIdentity;

/// Delete source JPEG chunks at every zoom level spanned by a tile's
/// mipmap pyramid (`max_zoom` down to `min_zoom`), after its DDS has
/// been fully built and no longer needs them as a rebuild source.
///
/// Coordinate scaling mirrors the quick-zoom helper the original keeps
/// alongside this function: each mipmap level's source chunk grid is
/// the tile's own grid shifted by the zoom delta between that level
/// and `tilename_zoom`.
///
/// Returns the number of files actually deleted. Filesystem errors
/// (other than "not found") for an individual file are logged and
/// otherwise ignored — a wholesale reap failure would be worse than a
/// partial one, since these are purely disposable, regenerable files.
pub fn cleanup_source_jpegs(
    jpeg_cache_dir: &Path,
    col: u32,
    row: u32,
    tilename_zoom: u8,
    max_zoom: u8,
    min_zoom: u8,
    width: u32,
    height: u32,
    maptype: &str,
) -> usize {
    let mut deleted = 0usize;
    let mut zoom = max_zoom as i32;
    while zoom >= min_zoom as i32 {
        let zoom_diff = tilename_zoom as i32 - zoom;
        let (scaled_col, scaled_row, scaled_width, scaled_height) = if zoom_diff >= 0 {
            (
                col >> zoom_diff,
                row >> zoom_diff,
                (width >> zoom_diff).max(1),
                (height >> zoom_diff).max(1),
            )
        } else {
            let shift = (-zoom_diff) as u32;
            (col << shift, row << shift, width << shift, height << shift)
        };

        for r in scaled_row..scaled_row + scaled_height {
            for c in scaled_col..scaled_col + scaled_width {
                let jpeg_path =
                    jpeg_cache_dir.join(format!("{c}_{r}_{zoom}_{maptype}.jpg"));
                if remove_file_with_retry(&jpeg_path) {
                    deleted += 1;
                }
            }
        }
        zoom -= 1;
    }

    if deleted > 0 {
        debug!("reaper: cleaned up {deleted} source JPEGs for {col}_{row}_{maptype} z{max_zoom}");
    }
    deleted
}

/// Best-effort delete with up to 3 attempts and a 10ms back-off on
/// transient lock contention (e.g. another process holding the file
/// open on a network share). `NotFound` counts as immediate success —
/// the file is already gone, which is the desired end state.
fn remove_file_with_retry(path: &std::path::Path) -> bool {
    const ATTEMPTS: u32 = 3;
    for attempt in 1..=ATTEMPTS {
        match std::fs::remove_file(path) {
            Ok(()) => return true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return false,
            Err(e) if attempt < ATTEMPTS => {
                debug!("reaper: remove {} failed (attempt {attempt}): {e}", path.display());
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            Err(e) => {
                warn!("reaper: failed to remove {} after {ATTEMPTS} attempts: {e}", path.display());
            }
        }
    }
    false
}

/// Resolve a missing mm0 chunk index to the on-disk path of its source
/// JPEG, given the tile's own origin and chunk-grid width.
fn chunk_jpeg_path(
    jpeg_cache_dir: &Path,
    identity: &TileIdentity,
    max_zoom: u8,
    chunks_per_row: u32,
    index: u32,
) -> std::path::PathBuf {
    let cx = index % chunks_per_row;
    let cy = index / chunks_per_row;
    let col = identity.col + cx;
    let row = identity.row + cy;
    jpeg_cache_dir.join(format!("{col}_{row}_{max_zoom}_{}.jpg", identity.maptype))
}

/// If every JPEG backing `missing` is present on disk, read them and
/// apply an in-place patch via `DdsCache::patch_missing_chunks`.
///
/// Returns `true` if healing was attempted (regardless of whether it
/// fully or only partially succeeded — see `patch_missing_chunks`'s own
/// return value for that distinction), `false` if dispatch did not
/// happen at all (nothing missing, or some source JPEG absent).
///
/// This is synchronous; callers that want the original's
/// fire-and-forget behavior should submit it to a `worker::BackgroundPool`.
pub fn try_heal_from_disk_cache(
    cache: &DdsCache,
    jpeg_cache_dir: &Path,
    identity: &TileIdentity,
    max_zoom: u8,
    missing: &[u32],
    chunks_per_row: u32,
) -> bool {
    if missing.is_empty() || chunks_per_row == 0 {
        return false;
    }

    let paths: Vec<_> = missing
        .iter()
        .map(|&idx| (idx, chunk_jpeg_path(jpeg_cache_dir, identity, max_zoom, chunks_per_row, idx)))
        .collect();
    if !paths.iter().all(|(_, p)| p.exists()) {
        return false;
    }

    let mut chunk_jpegs = std::collections::HashMap::with_capacity(paths.len());
    for (idx, path) in &paths {
        match std::fs::read(path) {
            Ok(bytes) => {
                chunk_jpegs.insert(*idx, bytes);
            }
            Err(e) => {
                debug!("reaper: healing JPEG missing for chunk {idx} of {identity:?}: {e}");
                return false;
            }
        }
    }

    cache.patch_missing_chunks(identity, max_zoom, &chunk_jpegs, chunks_per_row);
    true
}
