//! C4 — DDM v3 metadata sidecar.

use serde::{Deserialize, Serialize};

use crate::dds::{DdsFormat, DdsLayout};
use crate::tile::TileIdentity;

pub const DDM_VERSION: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MipmapRecord {
    pub zl: u8,
    pub complete: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub total: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub valid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskCompression {
    None,
    Zstd,
}

impl DiskCompression {
    pub fn as_tag(self) -> &'static str {
        match self {
            DiskCompression::None => "none",
            DiskCompression::Zstd => "zstd",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdmRecord {
    pub v: u8,
    pub w: u32,
    pub h: u32,
    pub mm: u32,
    pub zl: u8,
    pub max_zl: u8,
    pub fmt: String,
    pub comp: String,
    pub map: String,
    pub tile_row: u32,
    pub tile_col: u32,
    pub bundle_mtime: u64,
    pub built: u64,
    pub mipmaps: Vec<MipmapRecord>,
    #[serde(default = "all_indices_default_marker")]
    pub populated_mipmaps: Vec<u32>,
    #[serde(default)]
    pub needs_healing: bool,
    #[serde(default)]
    pub healing_chunks: u32,
    #[serde(default)]
    pub missing_indices: Vec<u32>,
    #[serde(default = "disk_compression_none")]
    pub disk_compression: DiskCompression,
    /// Not present in the original schema; recorded here so a
    /// compressed artifact's on-disk size is reproducible without
    /// consulting whatever the current config happens to be (see
    /// DESIGN.md Open Question decisions).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub comp_level: Option<u8>,
}

fn disk_compression_none() -> DiskCompression {
    DiskCompression::None
}

// Sentinel used only to detect "field absent" during v2 upgrade in
// `DdmRecord::from_json`; real records always carry an explicit list.
fn all_indices_default_marker() -> Vec<u32> {
    Vec::new()
}

/// Preserved verbatim from the source: the intent of the split at
/// `max_zoom - 11` is not explained there either (see spec Open
/// Questions); do not silently redefine it.
pub fn mipmap_zoom_level(max_zoom: u8, mipmap_index: u32) -> u8 {
    let max_zoom = max_zoom as i32;
    let i = mipmap_index as i32;
    if i < max_zoom - 11 {
        (max_zoom - i).max(0) as u8
    } else {
        12
    }
}

impl DdmRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn for_store(
        identity: &TileIdentity,
        max_zoom: u8,
        layout: &DdsLayout,
        compressor: &str,
        bundle_mtime: u64,
        built: u64,
        missing_indices: &[u32],
        disk_compression: DiskCompression,
        comp_level: Option<u8>,
    ) -> Self {
        let total_mm0 = layout
            .mipmap(0)
            .map(|m| (m.length / layout.format.block_size()) as u32)
            .unwrap_or(0);
        let missing_set: std::collections::HashSet<u32> = missing_indices.iter().copied().collect();
        let mipmaps = (0..layout.mipmap_count())
            .map(|i| {
                let zl = mipmap_zoom_level(max_zoom, i);
                if i == 0 {
                    let valid = total_mm0.saturating_sub(missing_set.len() as u32);
                    MipmapRecord {
                        zl,
                        complete: missing_set.is_empty(),
                        total: Some(total_mm0),
                        valid: Some(valid),
                    }
                } else {
                    MipmapRecord {
                        zl,
                        complete: true,
                        total: None,
                        valid: None,
                    }
                }
            })
            .collect();
        let populated_mipmaps: Vec<u32> = if missing_set.is_empty() {
            (0..layout.mipmap_count()).collect()
        } else {
            (1..layout.mipmap_count()).collect()
        };
        Self {
            v: DDM_VERSION,
            w: layout.width,
            h: layout.height,
            mm: layout.mipmap_count(),
            zl: identity.tilename_zoom,
            max_zl: max_zoom,
            fmt: layout.format.tag().to_string(),
            comp: compressor.to_string(),
            map: identity.maptype.clone(),
            tile_row: identity.row,
            tile_col: identity.col,
            bundle_mtime,
            built,
            mipmaps,
            populated_mipmaps,
            needs_healing: !missing_set.is_empty(),
            healing_chunks: missing_set.len() as u32,
            missing_indices: {
                let mut v: Vec<u32> = missing_set.into_iter().collect();
                v.sort_unstable();
                v
            },
            disk_compression,
            comp_level,
        }
    }

    pub fn format(&self) -> Option<DdsFormat> {
        DdsFormat::from_tag(&self.fmt)
    }

    /// Accepts schema versions <= current; defaults v3-only fields
    /// when reading an older record (Design Notes: "partial JSON
    /// upward-compatibility").
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        let mut value: serde_json::Value = serde_json::from_slice(bytes)?;
        let schema_version = value.get("v").and_then(|v| v.as_u64()).unwrap_or(1);
        if schema_version < DDM_VERSION as u64 {
            if value.get("populated_mipmaps").is_none() {
                let mm = value.get("mm").and_then(|v| v.as_u64()).unwrap_or(0);
                let all: Vec<u32> = (0..mm as u32).collect();
                value["populated_mipmaps"] = serde_json::json!(all);
            }
            if value.get("needs_healing").is_none() {
                value["needs_healing"] = serde_json::json!(false);
            }
        }
        serde_json::from_value(value)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dds::DdsFormat;

    #[test]
    fn zoom_level_formula_is_preserved_verbatim() {
        assert_eq!(mipmap_zoom_level(16, 0), 16);
        assert_eq!(mipmap_zoom_level(16, 4), 12);
        assert_eq!(mipmap_zoom_level(16, 5), 12);
    }

    #[test]
    fn for_store_with_no_missing_is_fully_populated() {
        let identity = TileIdentity::new(1, 2, "BI", 12);
        let layout = DdsLayout::new(256, 256, DdsFormat::Bc1);
        let ddm = DdmRecord::for_store(&identity, 16, &layout, "ISPC", 0, 0, &[], DiskCompression::None, None);
        assert!(!ddm.needs_healing);
        assert_eq!(ddm.healing_chunks, 0);
        assert_eq!(ddm.populated_mipmaps.len(), layout.mipmap_count() as usize);
        assert!(ddm.mipmaps[0].complete);
    }

    #[test]
    fn for_store_with_missing_marks_mm0_incomplete() {
        let identity = TileIdentity::new(1, 2, "BI", 12);
        let layout = DdsLayout::new(256, 256, DdsFormat::Bc1);
        let ddm = DdmRecord::for_store(&identity, 16, &layout, "ISPC", 0, 0, &[0, 3, 7], DiskCompression::None, None);
        assert!(ddm.needs_healing);
        assert_eq!(ddm.healing_chunks, 3);
        assert!(!ddm.mipmaps[0].complete);
        assert_eq!(ddm.missing_indices, vec![0, 3, 7]);
        assert!(!ddm.populated_mipmaps.contains(&0));
    }

    #[test]
    fn json_round_trips() {
        let identity = TileIdentity::new(1, 2, "BI", 12);
        let layout = DdsLayout::new(64, 64, DdsFormat::Bc1);
        let ddm = DdmRecord::for_store(&identity, 16, &layout, "ISPC", 123, 456, &[], DiskCompression::Zstd, Some(3));
        let bytes = ddm.to_json().unwrap();
        let parsed = DdmRecord::from_json(&bytes).unwrap();
        assert_eq!(parsed.tile_row, 1);
        assert_eq!(parsed.comp_level, Some(3));
        assert_eq!(parsed.disk_compression, DiskCompression::Zstd);
    }

    #[test]
    fn v2_record_defaults_v3_only_fields() {
        let v2 = serde_json::json!({
            "v": 2, "w": 64, "h": 64, "mm": 7, "zl": 12, "max_zl": 16,
            "fmt": "BC1", "comp": "ISPC", "map": "BI",
            "tile_row": 1, "tile_col": 2, "bundle_mtime": 0, "built": 0,
            "mipmaps": [],
        });
        let bytes = serde_json::to_vec(&v2).unwrap();
        let parsed = DdmRecord::from_json(&bytes).unwrap();
        assert_eq!(parsed.populated_mipmaps.len(), 7);
        assert!(!parsed.needs_healing);
        assert_eq!(parsed.disk_compression, DiskCompression::None);
    }
}
