//! C2 — RGBA -> BC1/BC3 block compression.
//!
//! Sequential and stripe-parallel entry points, grounded on the
//! stripe-partition math used to distribute work across a process
//! pool over shared memory. Here the "shared memory" is just a single
//! `Vec<u8>` cut into disjoint mutable slices across OS threads, which
//! Rust can do safely without an IPC layer.

use intel_tex_2::{bc1, bc3, RgbaSurface};

use crate::dds::DdsFormat;
use crate::error::{CacheError, Result};

pub const DEFAULT_STRIPE_HEIGHT_PX: u32 = 128;

/// Compress a full RGBA surface to BC1/BC3 blocks on the calling thread.
pub fn compress_rgba_to_blocks(
    rgba: &[u8],
    width: u32,
    height: u32,
    format: DdsFormat,
) -> Result<Vec<u8>> {
    if width % 4 != 0 || height % 4 != 0 {
        return Err(CacheError::InvariantViolation(format!(
            "dimensions must be multiples of 4, got {width}x{height}"
        )));
    }
    let expected_len = (width as usize) * (height as usize) * 4;
    if rgba.len() != expected_len {
        return Err(CacheError::InvariantViolation(format!(
            "rgba buffer length {} does not match {}x{} surface",
            rgba.len(),
            width,
            height
        )));
    }
    let surface = RgbaSurface {
        data: rgba,
        width,
        height,
        stride: width * 4,
    };
    Ok(match format {
        DdsFormat::Bc1 => bc1::compress_blocks(&surface),
        DdsFormat::Bc3 => bc3::compress_blocks(&surface),
    })
}

struct Stripe {
    start_row_px: u32,
    height_px: u32,
    byte_len: usize,
}

/// Partitions `height` rows into stripes of `stripe_height_px` (rounded
/// up to a multiple of 4, default 128), each stripe's length in output
/// bytes computed from its own row count — since `height` and every
/// stripe height are multiples of 4, stripes tile the output buffer
/// contiguously with no gaps or lookahead needed.
fn plan_stripes(width: u32, height: u32, stripe_height_px: u32, blocksize: u64) -> Vec<Stripe> {
    let stripe_height_px = if stripe_height_px < 4 || stripe_height_px % 4 != 0 {
        DEFAULT_STRIPE_HEIGHT_PX
    } else {
        stripe_height_px
    };
    let blocks_per_row = (width / 4) as u64;
    let mut stripes = Vec::new();
    let mut start = 0u32;
    while start < height {
        let hh = (height - start).min(stripe_height_px);
        let byte_len = ((hh / 4) as u64 * blocks_per_row * blocksize) as usize;
        stripes.push(Stripe {
            start_row_px: start,
            height_px: hh,
            byte_len,
        });
        start += hh;
    }
    stripes
}

fn compress_stripe(
    rgba: &[u8],
    stride: u32,
    width: u32,
    format: DdsFormat,
    stripe: &Stripe,
    dst: &mut [u8],
) -> Result<()> {
    let start_byte = stripe.start_row_px as usize * stride as usize;
    let end_byte = start_byte + stripe.height_px as usize * stride as usize;
    if end_byte > rgba.len() {
        return Err(CacheError::InvariantViolation(
            "stripe reads past end of source buffer".into(),
        ));
    }
    let src = &rgba[start_byte..end_byte];
    let surface = RgbaSurface {
        data: src,
        width,
        height: stripe.height_px,
        stride,
    };
    let blocks = match format {
        DdsFormat::Bc1 => bc1::compress_blocks(&surface),
        DdsFormat::Bc3 => bc3::compress_blocks(&surface),
    };
    if blocks.len() != dst.len() {
        return Err(CacheError::InvariantViolation(format!(
            "stripe produced {} bytes, expected {}",
            blocks.len(),
            dst.len()
        )));
    }
    dst.copy_from_slice(&blocks);
    Ok(())
}

/// Stripe-parallel compression across a rayon scope. Any stripe
/// failing fails the whole call — no partial output is ever returned.
pub fn compress_rgba_to_blocks_parallel(
    rgba: &[u8],
    width: u32,
    height: u32,
    format: DdsFormat,
    stripe_height_px: u32,
) -> Result<Vec<u8>> {
    if width % 4 != 0 || height % 4 != 0 {
        return Err(CacheError::InvariantViolation(format!(
            "dimensions must be multiples of 4, got {width}x{height}"
        )));
    }
    let blocksize = format.block_size();
    let stride = width * 4;
    let stripes = plan_stripes(width, height, stripe_height_px, blocksize);
    let total_blocks = ((width as u64) * (height as u64)) >> 4;
    let mut out = vec![0u8; (total_blocks.max(1) * blocksize) as usize];

    // Split the output buffer into disjoint mutable slices, one per
    // stripe, up front — each thread below only ever touches its own
    // slice, so no locking is needed on the output buffer itself.
    let mut chunks: Vec<&mut [u8]> = Vec::with_capacity(stripes.len());
    let mut rest = out.as_mut_slice();
    for s in &stripes {
        let (chunk, remainder) = rest.split_at_mut(s.byte_len);
        chunks.push(chunk);
        rest = remainder;
    }

    let results: Vec<Result<()>> = rayon::scope(|scope| {
        let (tx, rx) = std::sync::mpsc::channel();
        for (stripe, dst) in stripes.iter().zip(chunks.into_iter()) {
            let tx = tx.clone();
            scope.spawn(move |_| {
                let r = compress_stripe(rgba, stride, width, format, stripe, dst);
                let _ = tx.send(r);
            });
        }
        drop(tx);
        rx.into_iter().collect()
    });

    for r in results {
        r?;
    }
    Ok(out)
}

/// A bounded concurrency gate for large compression jobs, standing in
/// for the original's persistent worker pool with a job semaphore.
/// Bounds how many big `compress_rgba_to_blocks_parallel` calls run at
/// once; rayon's own thread pool still parallelizes within each call.
pub struct StripeCompressor {
    gate: parking_lot::Mutex<usize>,
    max_jobs: usize,
    cvar: parking_lot::Condvar,
}

impl StripeCompressor {
    pub fn new(max_jobs: usize) -> Self {
        Self {
            gate: parking_lot::Mutex::new(0),
            max_jobs: max_jobs.max(1),
            cvar: parking_lot::Condvar::new(),
        }
    }

    pub fn compress(
        &self,
        rgba: &[u8],
        width: u32,
        height: u32,
        format: DdsFormat,
        stripe_height_px: u32,
    ) -> Result<Vec<u8>> {
        let mut inflight = self.gate.lock();
        while *inflight >= self.max_jobs {
            self.cvar.wait(&mut inflight);
        }
        *inflight += 1;
        drop(inflight);

        let result = compress_rgba_to_blocks_parallel(rgba, width, height, format, stripe_height_px);

        *self.gate.lock() -= 1;
        self.cvar.notify_one();
        result
    }
}
