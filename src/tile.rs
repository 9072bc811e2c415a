//! Tile identity and the per-call hint structure C5 writes into.

use serde::{Deserialize, Serialize};

/// Identifies a tile independent of the zoom it was built at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileIdentity {
    pub row: u32,
    pub col: u32,
    pub maptype: String,
    pub tilename_zoom: u8,
}

impl TileIdentity {
    pub fn new(row: u32, col: u32, maptype: impl Into<String>, tilename_zoom: u8) -> Self {
        Self {
            row,
            col,
            maptype: maptype.into(),
            tilename_zoom,
        }
    }
}

/// LRU entry key: a tile identity plus the zoom it was built at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub identity: TileIdentity,
    pub max_zoom: u8,
}

impl TileKey {
    pub fn new(identity: TileIdentity, max_zoom: u8) -> Self {
        Self { identity, max_zoom }
    }
}

/// A candidate zoom-level migration surfaced by `load` on a ±1 ZL miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoomCandidate {
    Upgrade(u8),
    Downgrade(u8),
}

/// Out-parameter a caller passes to `load`/`patch_missing_chunks` to
/// receive the side information the original implementation stashed
/// directly on a mutable tile object. Reset at the start of every call
/// that accepts it.
#[derive(Debug, Clone, Default)]
pub struct TileHints {
    pub zoom_candidate: Option<ZoomCandidate>,
    pub needs_healing: bool,
    pub missing_indices: Vec<u32>,
    pub populated_mipmaps: Vec<u32>,
}

impl TileHints {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
