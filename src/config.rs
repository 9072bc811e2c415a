//! Ambient — typed cache configuration, replacing the original's
//! INI-backed, process-wide `CFG` singleton with one explicit value
//! threaded through constructors (§9 Design Notes).

use std::path::PathBuf;

use crate::ddm::DiskCompression;

pub const DEFAULT_DISK_COMPRESSION_LEVEL: i32 = 3;
const DEFAULT_TOTAL_BUDGET_MB: u64 = 20_000;
const DDS_PCT_RANGE: (f64, f64) = (10.0, 60.0);
const BUNDLE_PCT_RANGE: (f64, f64) = (30.0, 80.0);
const JPEG_PCT_RANGE: (f64, f64) = (1.0, 20.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    Ispc,
}

impl Compressor {
    pub fn tag(self) -> &'static str {
        match self {
            Compressor::Ispc => "ISPC",
        }
    }
}

/// Validated budget allocation across the three disk categories.
/// Percentages are clamped to their allowed ranges and renormalized
/// to sum to 1.0 at construction time, per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetShares {
    pub dds_pct: f64,
    pub bundle_pct: f64,
    pub jpeg_pct: f64,
}

impl BudgetShares {
    pub fn new(dds_pct: f64, bundle_pct: f64, jpeg_pct: f64) -> Self {
        let dds = dds_pct.clamp(DDS_PCT_RANGE.0, DDS_PCT_RANGE.1);
        let bundle = bundle_pct.clamp(BUNDLE_PCT_RANGE.0, BUNDLE_PCT_RANGE.1);
        let jpeg = jpeg_pct.clamp(JPEG_PCT_RANGE.0, JPEG_PCT_RANGE.1);
        let sum = dds + bundle + jpeg;
        Self {
            dds_pct: dds / sum,
            bundle_pct: bundle / sum,
            jpeg_pct: jpeg / sum,
        }
    }
}

impl Default for BudgetShares {
    fn default() -> Self {
        Self::new(40.0, 55.0, 5.0)
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub cache_root: PathBuf,
    pub format: crate::dds::DdsFormat,
    pub compressor: Compressor,
    pub disk_compression: DiskCompression,
    pub disk_compression_level: i32,
    pub total_budget_mb: u64,
    pub budget_shares: BudgetShares,
    pub stripe_height_px: u32,
    pub max_concurrent_compress_jobs: usize,
    pub background_workers: usize,
    /// Source-JPEG chunk directory to reap once a tile's DDS no longer
    /// needs it as a rebuild source. `None` disables reaping entirely
    /// (e.g. when this crate is driving a cache with no local JPEG
    /// source, as in most test setups).
    pub jpeg_cache_dir: Option<PathBuf>,
    /// Lowest zoom level whose source JPEGs are also reaped alongside
    /// `max_zoom`. Matches the original's `getattr(tile, 'min_zoom', 12)`.
    pub jpeg_min_zoom: u8,
}

impl CacheConfig {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            format: crate::dds::DdsFormat::Bc1,
            compressor: Compressor::Ispc,
            disk_compression: DiskCompression::None,
            disk_compression_level: DEFAULT_DISK_COMPRESSION_LEVEL,
            total_budget_mb: DEFAULT_TOTAL_BUDGET_MB,
            budget_shares: BudgetShares::default(),
            stripe_height_px: crate::compress::DEFAULT_STRIPE_HEIGHT_PX,
            max_concurrent_compress_jobs: 1,
            background_workers: 2,
            jpeg_cache_dir: None,
            jpeg_min_zoom: 12,
        }
    }

    pub fn with_format(mut self, format: crate::dds::DdsFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_disk_compression(mut self, mode: DiskCompression, level: i32) -> Self {
        self.disk_compression = mode;
        self.disk_compression_level = level.clamp(1, 19);
        self
    }

    pub fn with_total_budget_mb(mut self, mb: u64) -> Self {
        self.total_budget_mb = mb;
        self
    }

    pub fn with_budget_shares(mut self, dds_pct: f64, bundle_pct: f64, jpeg_pct: f64) -> Self {
        self.budget_shares = BudgetShares::new(dds_pct, bundle_pct, jpeg_pct);
        self
    }

    pub fn with_background_workers(mut self, n: usize) -> Self {
        self.background_workers = n.max(1);
        self
    }

    pub fn with_jpeg_cache_dir(mut self, dir: impl Into<PathBuf>, min_zoom: u8) -> Self {
        self.jpeg_cache_dir = Some(dir.into());
        self.jpeg_min_zoom = min_zoom;
        self
    }

    pub fn dds_budget_bytes(&self) -> u64 {
        ((self.total_budget_mb as f64) * self.budget_shares.dds_pct * 1_000_000.0) as u64
    }

    pub fn bundle_budget_bytes(&self) -> u64 {
        ((self.total_budget_mb as f64) * self.budget_shares.bundle_pct * 1_000_000.0) as u64
    }

    pub fn jpeg_budget_bytes(&self) -> u64 {
        ((self.total_budget_mb as f64) * self.budget_shares.jpeg_pct * 1_000_000.0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_shares_renormalize_to_one() {
        let shares = BudgetShares::new(40.0, 55.0, 5.0);
        let sum = shares.dds_pct + shares.bundle_pct + shares.jpeg_pct;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn out_of_range_shares_are_clamped_before_renormalizing() {
        // dds requested at 90 (max is 60); bundle at 20 (min is 30).
        let shares = BudgetShares::new(90.0, 20.0, 5.0);
        assert!(shares.dds_pct > 0.0);
        let sum = shares.dds_pct + shares.bundle_pct + shares.jpeg_pct;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn concrete_thousand_mb_scenario_matches_spec_example() {
        let config = CacheConfig::new("/cache").with_total_budget_mb(1000).with_budget_shares(40.0, 55.0, 5.0);
        let dds_mb = config.dds_budget_bytes() as f64 / 1_000_000.0;
        let bundle_mb = config.bundle_budget_bytes() as f64 / 1_000_000.0;
        let jpeg_mb = config.jpeg_budget_bytes() as f64 / 1_000_000.0;
        assert!((dds_mb - 400.0).abs() < 1.0);
        assert!((bundle_mb - 550.0).abs() < 1.0);
        assert!((jpeg_mb - 50.0).abs() < 1.0);
    }
}
