//! scenedds - persistent DDS texture cache for flight-sim scenery
//!
//! Sits between a tile source and a renderer as a compiled-output
//! cache: on a warm hit, a pre-built block-compressed DDS is served
//! straight from disk instead of being rebuilt from source imagery.

pub mod budget;
pub mod cache;
pub mod compress;
pub mod config;
pub mod dds;
pub mod ddm;
pub mod error;
pub mod path;
pub mod reaper;
pub mod tile;
pub mod worker;

pub use cache::DdsCache;
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use tile::{TileHints, TileIdentity, TileKey, ZoomCandidate};
