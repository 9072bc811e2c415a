//! C3 — path resolver. Pure function from tile identity to the
//! canonical `.dds`/`.ddm` path pair.

use std::path::{Path, PathBuf};

use crate::tile::TileIdentity;

/// Signed, zero-padded coordinate block used for the two directory
/// levels beneath `dds_cache/`, mirroring the bundle layer's own
/// `<10 degree>/<1 degree>` bucketing so both trees read the same way.
fn degree_block(value: i64, width: usize) -> String {
    if value >= 0 {
        format!("+{:0width$}", value, width = width)
    } else {
        format!("-{:0width$}", -value, width = width)
    }
}

/// Derive the signed 10-degree and 1-degree bucket labels for a tile
/// from its row/col at `tilename_zoom`. Rows/cols are treated as a
/// simple linear coordinate space scaled down to "degrees" by the
/// tile geometry's zoom; the exact scale is irrelevant to uniqueness
/// as long as it is deterministic and matches the bundle layer.
fn bucket_labels(identity: &TileIdentity) -> (String, String) {
    let scale = 1u64 << identity.tilename_zoom.min(30);
    let lat = (identity.row as i64 * 360) / scale.max(1) as i64 - 180;
    let lon = (identity.col as i64 * 360) / scale.max(1) as i64 - 180;
    let block10 = degree_block((lat / 10) * 10, 3);
    let block1 = degree_block(lat, 3);
    let _ = lon; // maptype + row/col already disambiguate the basename
    (block10, block1)
}

fn base_name(identity: &TileIdentity, max_zoom: u8) -> String {
    format!("{}_{}_z{}", identity.row, identity.col, max_zoom)
}

/// Directory containing the DDS/DDM pair for this tile at `max_zoom`.
pub fn dds_cache_dir(cache_root: &Path, identity: &TileIdentity) -> PathBuf {
    let (block10, block1) = bucket_labels(identity);
    cache_root
        .join("dds_cache")
        .join(block10)
        .join(block1)
        .join(&identity.maptype)
}

/// Canonical `(dds_path, ddm_path)` pair. Pure: same inputs always
/// produce the same paths; different `max_zoom` produces different
/// paths.
pub fn dds_cache_paths(
    cache_root: &Path,
    identity: &TileIdentity,
    max_zoom: u8,
) -> (PathBuf, PathBuf) {
    let dir = dds_cache_dir(cache_root, identity);
    let base = base_name(identity, max_zoom);
    (
        dir.join(format!("{base}.dds")),
        dir.join(format!("{base}.ddm")),
    )
}

/// A PID-qualified staging path inside the destination directory, for
/// an external builder to write to before handing it to
/// `store_from_file`.
pub fn staging_path(cache_root: &Path, identity: &TileIdentity, max_zoom: u8) -> PathBuf {
    let dir = dds_cache_dir(cache_root, identity);
    let base = base_name(identity, max_zoom);
    dir.join(format!("{base}.dds.tmp.{}", std::process::id()))
}
